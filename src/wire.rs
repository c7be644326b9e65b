use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use serde::Serialize;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::{acting_user, ApiKeyAuthSource};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, EventTypeFilter, RowShape, SqlError};
use crate::tenant::TenantManager;
use crate::time::format_instant;

pub struct SlotdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotdQueryParser>,
}

impl SlotdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotdQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Parse and run one statement, recording the RED metrics.
    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let actor = acting_user(client.metadata().get("user").map(String::as_str));
        let cmd = sql::parse_sql(query).map_err(sql_err)?;

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = execute_command(&engine, cmd, actor).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        if let Err(e) = &result {
            tracing::debug!(command = label, "statement failed: {e}");
        }
        result
    }
}

fn done(tag: &str) -> Response {
    Response::Execution(Tag::new(tag).with_rows(1))
}

async fn execute_command(engine: &Engine, cmd: Command, actor: Option<Ulid>) -> PgWireResult<Response> {
    match cmd {
        // ── Users ─────────────────────────────────────────────
        Command::InsertUser(user) => {
            engine.create_user(user).await.map_err(engine_err)?;
            Ok(done("INSERT"))
        }
        Command::UpdateUser { id, set } => {
            let stored = engine.get_user(id).map_err(engine_err)?;
            let user = sql::build_user(&set, Some(&stored)).map_err(sql_err)?;
            engine.update_user(user).await.map_err(engine_err)?;
            Ok(done("UPDATE"))
        }
        Command::DeleteUser { id } => {
            engine.delete_user(id).await.map_err(engine_err)?;
            Ok(done("DELETE"))
        }
        Command::SelectUsers { id } => {
            let users = engine
                .list_users()
                .into_iter()
                .filter(|u| id.is_none_or(|id| u.id == id));
            rows(RowShape::Users, users, |enc, u| {
                enc.encode_field(&u.id.to_string())?;
                enc.encode_field(&u.username)?;
                enc.encode_field(&u.default_schedule_id.map(|s| s.to_string()))
            })
        }

        // ── Teams ─────────────────────────────────────────────
        Command::InsertTeam(team) => {
            engine.create_team(team).await.map_err(engine_err)?;
            Ok(done("INSERT"))
        }
        Command::DeleteTeam { id } => {
            engine.delete_team(id).await.map_err(engine_err)?;
            Ok(done("DELETE"))
        }
        Command::SelectTeams => rows(RowShape::Teams, engine.list_teams(), |enc, t| {
            enc.encode_field(&t.id.to_string())?;
            enc.encode_field(&t.parent_id.map(|p| p.to_string()))?;
            enc.encode_field(&t.name)
        }),

        // ── Memberships ───────────────────────────────────────
        Command::InsertMembership(membership) => {
            engine.set_membership(membership).await.map_err(engine_err)?;
            Ok(done("INSERT"))
        }
        Command::DeleteMembership { user_id, team_id } => {
            engine
                .remove_membership(user_id, team_id)
                .await
                .map_err(engine_err)?;
            Ok(done("DELETE"))
        }
        Command::SelectMemberships { team_id } => {
            rows(RowShape::Memberships, engine.list_memberships(team_id), |enc, m| {
                enc.encode_field(&m.user_id.to_string())?;
                enc.encode_field(&m.team_id.to_string())?;
                enc.encode_field(&m.accepted)
            })
        }

        // ── Schedules ─────────────────────────────────────────
        Command::InsertSchedule(schedule) => {
            engine.create_schedule(schedule).await.map_err(engine_err)?;
            Ok(done("INSERT"))
        }
        Command::UpdateSchedule { id, set } => {
            let stored = engine.get_schedule(id).map_err(engine_err)?;
            let schedule = sql::build_schedule(&set, Some(&stored)).map_err(sql_err)?;
            engine.update_schedule(schedule).await.map_err(engine_err)?;
            Ok(done("UPDATE"))
        }
        Command::DeleteSchedule { id } => {
            engine.delete_schedule(id).await.map_err(engine_err)?;
            Ok(done("DELETE"))
        }
        Command::SelectSchedules { id, user_id } => {
            let schedules = engine
                .list_schedules(user_id)
                .into_iter()
                .filter(|s| id.is_none_or(|id| s.id == id));
            rows(RowShape::Schedules, schedules, |enc, s| {
                enc.encode_field(&s.id.to_string())?;
                enc.encode_field(&s.user_id.to_string())?;
                enc.encode_field(&s.name)?;
                enc.encode_field(&s.time_zone.name())?;
                enc.encode_field(&json(&s.availability)?)?;
                enc.encode_field(&json(&s.overrides)?)
            })
        }

        // ── Event types ───────────────────────────────────────
        Command::InsertEventType(event_type) => {
            engine.create_event_type(event_type).await.map_err(engine_err)?;
            Ok(done("INSERT"))
        }
        Command::UpdateEventType { id, set } => {
            let stored = engine.get_event_type(id).map_err(engine_err)?;
            let event_type = sql::build_event_type(&set, Some(&stored)).map_err(sql_err)?;
            engine.update_event_type(event_type).await.map_err(engine_err)?;
            Ok(done("UPDATE"))
        }
        Command::DeleteEventType { id } => {
            engine.delete_event_type(id).await.map_err(engine_err)?;
            Ok(done("DELETE"))
        }
        Command::SelectEventTypes { filter } => {
            let event_types = match filter {
                EventTypeFilter::All => engine.list_event_types(None),
                EventTypeFilter::Owner(owner) => engine.list_event_types(Some(owner)),
                EventTypeFilter::Id(id) => engine.get_event_type(id).ok().into_iter().collect(),
                EventTypeFilter::Slug { username, slug } => engine
                    .event_type_by_slug(&username, &slug)
                    .ok()
                    .into_iter()
                    .collect(),
            };
            rows(RowShape::EventTypes, event_types, encode_event_type)
        }

        // ── Slots ─────────────────────────────────────────────
        Command::SelectSlots { query, format } => {
            let by_date = engine.get_available_slots(&query).await.map_err(engine_err)?;
            let tz = by_date.time_zone;
            let slots = by_date
                .days
                .into_iter()
                .flat_map(|(date, slots)| slots.into_iter().map(move |slot| (date, slot)));
            rows(RowShape::Slots, slots, |enc, (date, slot)| {
                enc.encode_field(&date.to_string())?;
                enc.encode_field(&format_instant(tz, slot.start))?;
                let end = match format {
                    SlotFormat::Range => Some(format_instant(tz, slot.end)),
                    SlotFormat::Time => None,
                };
                enc.encode_field(&end)?;
                enc.encode_field(&slot.seats.map(|s| s.booked as i64))?;
                enc.encode_field(&slot.seats.map(|s| s.remaining() as i64))?;
                enc.encode_field(&slot.seats.map(|s| s.total as i64))?;
                enc.encode_field(&slot.seats.and_then(|s| s.booking_id).map(|b| b.to_string()))
            })
        }

        // ── Reservations ──────────────────────────────────────
        Command::InsertReservation(input) => {
            let reservation = engine.reserve_slot(input, actor).await.map_err(engine_err)?;
            rows(RowShape::Reservations, [reservation], encode_reservation)
        }
        Command::SelectReservation { uid } => {
            let reservation = engine.get_reservation(uid).map_err(engine_err)?;
            rows(RowShape::Reservations, [reservation], encode_reservation)
        }
        Command::UpdateReservation { uid, patch } => {
            let reservation = engine
                .update_reservation(uid, patch, actor)
                .await
                .map_err(engine_err)?;
            rows(RowShape::Reservations, [reservation], encode_reservation)
        }
        Command::DeleteReservation { uid } => {
            engine.release_reservation(uid).await.map_err(engine_err)?;
            Ok(done("DELETE"))
        }

        // ── Bookings ──────────────────────────────────────────
        Command::InsertBooking(input) => {
            let booking = engine.confirm_booking(input).await.map_err(engine_err)?;
            rows(RowShape::Bookings, [booking], encode_booking)
        }
        Command::SelectBookings {
            id,
            event_type_id,
            status,
        } => {
            let bookings = engine
                .list_bookings(event_type_id, status)
                .into_iter()
                .filter(|b| id.is_none_or(|id| b.id == id));
            rows(RowShape::Bookings, bookings, encode_booking)
        }
        Command::RescheduleBooking { id, start } => {
            let booking = engine.reschedule_booking(id, start).await.map_err(engine_err)?;
            rows(RowShape::Bookings, [booking], encode_booking)
        }
        Command::CancelBooking { id } => {
            engine.cancel_booking(id).await.map_err(engine_err)?;
            Ok(done("DELETE"))
        }
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn rows<T>(
    shape: RowShape,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema(shape));
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn json(value: &impl Serialize) -> PgWireResult<String> {
    serde_json::to_string(value).map_err(|e| PgWireError::ApiError(Box::new(e)))
}

fn utc(ms: Ms) -> String {
    format_instant(chrono_tz::UTC, ms)
}

fn ids(ids: &[Ulid]) -> PgWireResult<String> {
    json(&ids.iter().map(Ulid::to_string).collect::<Vec<_>>())
}

fn encode_event_type(enc: &mut DataRowEncoder, et: EventType) -> PgWireResult<()> {
    let (user_id, team_id) = match et.owner {
        Owner::User(id) => (Some(id.to_string()), None),
        Owner::Team(id) => (None, Some(id.to_string())),
    };
    enc.encode_field(&et.id.to_string())?;
    enc.encode_field(&et.slug)?;
    enc.encode_field(&user_id)?;
    enc.encode_field(&team_id)?;
    enc.encode_field(&(et.length as i64))?;
    enc.encode_field(&et.slot_interval.map(i64::from))?;
    enc.encode_field(&(et.minimum_booking_notice as i64))?;
    enc.encode_field(&(et.before_event_buffer as i64))?;
    enc.encode_field(&(et.after_event_buffer as i64))?;
    enc.encode_field(&et.seats_per_time_slot.map(i64::from))?;
    enc.encode_field(&et.multiple_duration.as_ref().map(json).transpose()?)?;
    enc.encode_field(&et.schedule_id.map(|s| s.to_string()))?;
    enc.encode_field(&ids(&et.hosts)?)?;
    enc.encode_field(&et.scheduling_type.as_str())?;
    enc.encode_field(&json(&et.booking_limits)?)?;
    enc.encode_field(&et.period.to_string())
}

fn encode_reservation(enc: &mut DataRowEncoder, r: SlotReservation) -> PgWireResult<()> {
    enc.encode_field(&r.uid.to_string())?;
    enc.encode_field(&r.event_type_id.to_string())?;
    enc.encode_field(&ids(&r.host_ids)?)?;
    enc.encode_field(&utc(r.span.start))?;
    enc.encode_field(&utc(r.span.end))?;
    enc.encode_field(&(r.reservation_duration as i64))?;
    enc.encode_field(&utc(r.release_at))?;
    enc.encode_field(&r.is_seat)
}

fn encode_booking(enc: &mut DataRowEncoder, b: Booking) -> PgWireResult<()> {
    enc.encode_field(&b.id.to_string())?;
    enc.encode_field(&b.event_type_id.to_string())?;
    enc.encode_field(&ids(&b.host_ids)?)?;
    enc.encode_field(&utc(b.span.start))?;
    enc.encode_field(&utc(b.span.end))?;
    enc.encode_field(&(b.attendees as i64))?;
    enc.encode_field(&b.status.as_str())?;
    enc.encode_field(&utc(b.created_at))
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn text_fields(names: &[&str]) -> Vec<FieldInfo> {
    names.iter().map(|n| field(n, Type::VARCHAR)).collect()
}

fn schema(shape: RowShape) -> Vec<FieldInfo> {
    match shape {
        RowShape::Users => text_fields(&["id", "username", "default_schedule_id"]),
        RowShape::Teams => text_fields(&["id", "parent_id", "name"]),
        RowShape::Memberships => {
            let mut fields = text_fields(&["user_id", "team_id"]);
            fields.push(field("accepted", Type::BOOL));
            fields
        }
        RowShape::Schedules => text_fields(&["id", "user_id", "name", "time_zone", "availability", "overrides"]),
        RowShape::EventTypes => {
            let mut fields = text_fields(&["id", "slug", "user_id", "team_id"]);
            for name in [
                "length",
                "slot_interval",
                "minimum_booking_notice",
                "before_event_buffer",
                "after_event_buffer",
                "seats_per_time_slot",
            ] {
                fields.push(field(name, Type::INT8));
            }
            fields.extend(text_fields(&[
                "multiple_duration",
                "schedule_id",
                "hosts",
                "scheduling_type",
                "booking_limits",
                "period",
            ]));
            fields
        }
        RowShape::Slots => {
            let mut fields = text_fields(&["date", "start", "end"]);
            for name in ["seats_booked", "seats_remaining", "seats_total"] {
                fields.push(field(name, Type::INT8));
            }
            fields.push(field("booking_uid", Type::VARCHAR));
            fields
        }
        RowShape::Reservations => {
            let mut fields = text_fields(&["uid", "event_type_id", "host_ids", "slot_start", "slot_end"]);
            fields.push(field("reservation_duration", Type::INT8));
            fields.push(field("release_at", Type::VARCHAR));
            fields.push(field("is_seat", Type::BOOL));
            fields
        }
        RowShape::Bookings => {
            let mut fields = text_fields(&["id", "event_type_id", "host_ids", "start", "end"]);
            fields.push(field("attendees", Type::INT8));
            fields.extend(text_fields(&["status", "created_at"]));
            fields
        }
    }
}

fn describe(sql: &str) -> Vec<FieldInfo> {
    sql::row_shape_of(sql).map(schema).unwrap_or_default()
}

#[async_trait]
impl SimpleQueryHandler for SlotdHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotdQueryParser;

#[async_trait]
impl QueryParser for SlotdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(describe(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotdHandler {
    type Statement = String;
    type QueryParser = SlotdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(client, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(param_types, describe(&target.statement)))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(describe(&target.statement.statement)))
    }
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Replace `$1, $2, ...` with the bound values as quoted text literals.
/// Highest index first, so `$1` never clobbers the prefix of `$10`.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotdFactory {
    handler: Arc<SlotdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ApiKeyAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, api_key: String) -> Self {
        Self {
            handler: Arc::new(SlotdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                ApiKeyAuthSource::new(api_key),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotdFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    api_key: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(SlotdFactory::new(tenant_manager, api_key));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}
