use std::collections::BTreeMap;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject,
    Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;
use crate::time::{parse_instant, parse_time_zone};

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser(User),
    UpdateUser { id: Ulid, set: Row },
    DeleteUser { id: Ulid },
    SelectUsers { id: Option<Ulid> },

    InsertTeam(Team),
    DeleteTeam { id: Ulid },
    SelectTeams,

    InsertMembership(Membership),
    DeleteMembership { user_id: Ulid, team_id: Ulid },
    SelectMemberships { team_id: Option<Ulid> },

    InsertSchedule(Schedule),
    UpdateSchedule { id: Ulid, set: Row },
    DeleteSchedule { id: Ulid },
    SelectSchedules { id: Option<Ulid>, user_id: Option<Ulid> },

    InsertEventType(EventType),
    UpdateEventType { id: Ulid, set: Row },
    DeleteEventType { id: Ulid },
    SelectEventTypes { filter: EventTypeFilter },

    SelectSlots { query: SlotsQuery, format: SlotFormat },

    InsertReservation(ReserveSlotInput),
    SelectReservation { uid: Ulid },
    UpdateReservation { uid: Ulid, patch: ReservationPatch },
    DeleteReservation { uid: Ulid },

    InsertBooking(BookingInput),
    SelectBookings {
        id: Option<Ulid>,
        event_type_id: Option<Ulid>,
        status: Option<BookingStatus>,
    },
    RescheduleBooking { id: Ulid, start: Ms },
    CancelBooking { id: Ulid },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventTypeFilter {
    All,
    Id(Ulid),
    Owner(Owner),
    Slug { username: String, slug: String },
}

/// The columns a statement's result rows carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowShape {
    Users,
    Teams,
    Memberships,
    Schedules,
    EventTypes,
    Slots,
    Reservations,
    Bookings,
}

impl RowShape {
    fn of_table(table: &str) -> Option<Self> {
        Some(match table {
            "users" => RowShape::Users,
            "teams" => RowShape::Teams,
            "memberships" => RowShape::Memberships,
            "schedules" => RowShape::Schedules,
            "event_types" => RowShape::EventTypes,
            "slots" => RowShape::Slots,
            "reservations" => RowShape::Reservations,
            "bookings" => RowShape::Bookings,
            _ => return None,
        })
    }
}

impl Command {
    /// Shape of the rows this command answers with, if any.
    pub fn row_shape(&self) -> Option<RowShape> {
        match self {
            Command::SelectUsers { .. } => Some(RowShape::Users),
            Command::SelectTeams => Some(RowShape::Teams),
            Command::SelectMemberships { .. } => Some(RowShape::Memberships),
            Command::SelectSchedules { .. } => Some(RowShape::Schedules),
            Command::SelectEventTypes { .. } => Some(RowShape::EventTypes),
            Command::SelectSlots { .. } => Some(RowShape::Slots),
            Command::InsertReservation(_)
            | Command::SelectReservation { .. }
            | Command::UpdateReservation { .. } => Some(RowShape::Reservations),
            Command::InsertBooking(_) | Command::SelectBookings { .. } | Command::RescheduleBooking { .. } => {
                Some(RowShape::Bookings)
            }
            _ => None,
        }
    }
}

// ── Literals ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Number(String),
    Text(String),
}

/// Column values by lower-cased column name, from an INSERT row, an UPDATE
/// SET list or the equality filters of a WHERE clause.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    cols: BTreeMap<String, Literal>,
}

fn bad(column: &str, reason: impl Into<String>) -> SqlError {
    SqlError::BadValue {
        column: column.to_string(),
        reason: reason.into(),
    }
}

impl Row {
    fn insert(&mut self, column: String, value: Literal) -> Result<(), SqlError> {
        if self.cols.insert(column.clone(), value).is_some() {
            return Err(bad(&column, "given twice"));
        }
        Ok(())
    }

    pub fn has(&self, column: &str) -> bool {
        self.cols.contains_key(column)
    }

    pub fn is_empty(&self) -> bool {
        self.cols.is_empty()
    }

    fn columns(&self) -> impl Iterator<Item = &str> {
        self.cols.keys().map(String::as_str)
    }

    /// Absent and NULL both read as `None`.
    pub fn text(&self, column: &str) -> Result<Option<String>, SqlError> {
        match self.cols.get(column) {
            None | Some(Literal::Null) => Ok(None),
            Some(Literal::Text(s)) | Some(Literal::Number(s)) => Ok(Some(s.clone())),
            Some(Literal::Bool(_)) => Err(bad(column, "expected text")),
        }
    }

    pub fn parsed<T: FromStr<Err = String>>(&self, column: &str) -> Result<Option<T>, SqlError> {
        self.text(column)?
            .map(|s| s.trim().parse().map_err(|e: String| bad(column, e)))
            .transpose()
    }

    pub fn ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.text(column)?
            .map(|s| Ulid::from_string(s.trim()).map_err(|e| bad(column, format!("bad ULID: {e}"))))
            .transpose()
    }

    pub fn u32(&self, column: &str) -> Result<Option<u32>, SqlError> {
        self.text(column)?
            .map(|s| s.trim().parse().map_err(|_| bad(column, format!("expected a non-negative integer, got {s}"))))
            .transpose()
    }

    /// Unix milliseconds or an ISO 8601 timestamp.
    pub fn instant(&self, column: &str) -> Result<Option<Ms>, SqlError> {
        self.text(column)?
            .map(|s| parse_instant(&s).map_err(|e| bad(column, e)))
            .transpose()
    }

    pub fn bool(&self, column: &str) -> Result<Option<bool>, SqlError> {
        match self.cols.get(column) {
            None | Some(Literal::Null) => Ok(None),
            Some(Literal::Bool(b)) => Ok(Some(*b)),
            Some(Literal::Text(s)) | Some(Literal::Number(s)) => match s.to_ascii_lowercase().as_str() {
                "true" | "t" | "1" => Ok(Some(true)),
                "false" | "f" | "0" => Ok(Some(false)),
                _ => Err(bad(column, format!("bad bool: {s}"))),
            },
        }
    }

    pub fn json<T: DeserializeOwned>(&self, column: &str) -> Result<Option<T>, SqlError> {
        self.text(column)?
            .map(|s| serde_json::from_str(&s).map_err(|e| bad(column, format!("bad JSON: {e}"))))
            .transpose()
    }

    pub fn tz(&self, column: &str) -> Result<Option<chrono_tz::Tz>, SqlError> {
        self.text(column)?
            .map(|s| parse_time_zone(&s).map_err(|e| bad(column, e)))
            .transpose()
    }

    fn reject(&self, columns: &[&str]) -> Result<(), SqlError> {
        match columns.iter().find(|c| self.has(c)) {
            Some(c) => Err(bad(c, "cannot be changed")),
            None => Ok(()),
        }
    }

    /// Fail on any column outside `known`.
    fn only(&self, table: &str, known: &[&str]) -> Result<(), SqlError> {
        match self.columns().find(|c| !known.contains(c)) {
            Some(c) => Err(SqlError::UnknownColumn(format!("{table}.{c}"))),
            None => Ok(()),
        }
    }
}

fn required<T>(value: Option<T>, column: &'static str) -> Result<T, SqlError> {
    value.ok_or(SqlError::MissingColumn(column))
}

// ── Entity builders ───────────────────────────────────────────
//
// Each builder reads the columns present in `row` and falls back to `base`
// (the stored entity, for UPDATE) or the defaults (for INSERT).

const USER_COLUMNS: &[&str] = &["id", "username", "default_schedule_id"];
const TEAM_COLUMNS: &[&str] = &["id", "parent_id", "name"];
const MEMBERSHIP_COLUMNS: &[&str] = &["user_id", "team_id", "accepted"];
const SCHEDULE_COLUMNS: &[&str] = &["id", "user_id", "name", "time_zone", "availability", "overrides"];
const EVENT_TYPE_COLUMNS: &[&str] = &[
    "id",
    "slug",
    "user_id",
    "team_id",
    "length",
    "slot_interval",
    "minimum_booking_notice",
    "before_event_buffer",
    "after_event_buffer",
    "seats_per_time_slot",
    "multiple_duration",
    "schedule_id",
    "hosts",
    "scheduling_type",
    "booking_limits",
    "period",
];
const RESERVATION_COLUMNS: &[&str] = &["event_type_id", "slot_start", "slot_duration", "reservation_duration"];
const BOOKING_COLUMNS: &[&str] = &["event_type_id", "start", "duration", "reservation_uid"];

pub fn build_user(row: &Row, base: Option<&User>) -> Result<User, SqlError> {
    row.only("users", USER_COLUMNS)?;
    let Some(base) = base else {
        return Ok(User {
            id: required(row.ulid("id")?, "id")?,
            username: required(row.text("username")?, "username")?,
            default_schedule_id: row.ulid("default_schedule_id")?,
        });
    };
    row.reject(&["id"])?;
    Ok(User {
        id: base.id,
        username: match row.text("username")? {
            Some(name) => name,
            None => base.username.clone(),
        },
        default_schedule_id: if row.has("default_schedule_id") {
            row.ulid("default_schedule_id")?
        } else {
            base.default_schedule_id
        },
    })
}

fn build_team(row: &Row) -> Result<Team, SqlError> {
    row.only("teams", TEAM_COLUMNS)?;
    Ok(Team {
        id: required(row.ulid("id")?, "id")?,
        parent_id: row.ulid("parent_id")?,
        name: row.text("name")?,
    })
}

fn build_membership(row: &Row) -> Result<Membership, SqlError> {
    row.only("memberships", MEMBERSHIP_COLUMNS)?;
    Ok(Membership {
        user_id: required(row.ulid("user_id")?, "user_id")?,
        team_id: required(row.ulid("team_id")?, "team_id")?,
        accepted: row.bool("accepted")?.unwrap_or(false),
    })
}

pub fn build_schedule(row: &Row, base: Option<&Schedule>) -> Result<Schedule, SqlError> {
    row.only("schedules", SCHEDULE_COLUMNS)?;
    let Some(base) = base else {
        return Ok(Schedule {
            id: required(row.ulid("id")?, "id")?,
            user_id: required(row.ulid("user_id")?, "user_id")?,
            name: row.text("name")?,
            time_zone: required(row.tz("time_zone")?, "time_zone")?,
            availability: row.json("availability")?.unwrap_or_default(),
            overrides: row.json("overrides")?.unwrap_or_default(),
        });
    };
    row.reject(&["id", "user_id"])?;
    Ok(Schedule {
        id: base.id,
        user_id: base.user_id,
        name: if row.has("name") { row.text("name")? } else { base.name.clone() },
        time_zone: row.tz("time_zone")?.unwrap_or(base.time_zone),
        availability: match row.json("availability")? {
            Some(a) => a,
            None => base.availability.clone(),
        },
        overrides: match row.json("overrides")? {
            Some(o) => o,
            None => base.overrides.clone(),
        },
    })
}

fn owner_of(row: &Row) -> Result<Owner, SqlError> {
    match (row.ulid("user_id")?, row.ulid("team_id")?) {
        (Some(uid), None) => Ok(Owner::User(uid)),
        (None, Some(tid)) => Ok(Owner::Team(tid)),
        (Some(_), Some(_)) => Err(bad("team_id", "an event type has either user_id or team_id, not both")),
        (None, None) => Err(SqlError::MissingColumn("user_id")),
    }
}

pub fn build_event_type(row: &Row, base: Option<&EventType>) -> Result<EventType, SqlError> {
    row.only("event_types", EVENT_TYPE_COLUMNS)?;
    let et = match base {
        Some(base) => {
            row.reject(&["id", "user_id", "team_id"])?;
            base.clone()
        }
        None => EventType::new(
            required(row.ulid("id")?, "id")?,
            required(row.text("slug")?, "slug")?,
            owner_of(row)?,
            required(row.u32("length")?, "length")?,
        ),
    };
    // Nullable columns: present-and-NULL clears the setting.
    let nullable_u32 = |column: &str, current: Option<u32>| -> Result<Option<u32>, SqlError> {
        if row.has(column) { row.u32(column) } else { Ok(current) }
    };
    Ok(EventType {
        slug: row.text("slug")?.unwrap_or(et.slug),
        length: row.u32("length")?.unwrap_or(et.length),
        slot_interval: nullable_u32("slot_interval", et.slot_interval)?,
        minimum_booking_notice: row.u32("minimum_booking_notice")?.unwrap_or(et.minimum_booking_notice),
        before_event_buffer: row.u32("before_event_buffer")?.unwrap_or(et.before_event_buffer),
        after_event_buffer: row.u32("after_event_buffer")?.unwrap_or(et.after_event_buffer),
        seats_per_time_slot: nullable_u32("seats_per_time_slot", et.seats_per_time_slot)?,
        multiple_duration: if row.has("multiple_duration") {
            row.json("multiple_duration")?
        } else {
            et.multiple_duration
        },
        schedule_id: if row.has("schedule_id") {
            row.ulid("schedule_id")?
        } else {
            et.schedule_id
        },
        hosts: row.json("hosts")?.unwrap_or(et.hosts),
        scheduling_type: row.parsed("scheduling_type")?.unwrap_or(et.scheduling_type),
        booking_limits: row.json("booking_limits")?.unwrap_or(et.booking_limits),
        period: row.parsed("period")?.unwrap_or(et.period),
        ..et
    })
}

fn build_reservation(row: &Row) -> Result<ReserveSlotInput, SqlError> {
    row.only("reservations", RESERVATION_COLUMNS)?;
    Ok(ReserveSlotInput {
        event_type_id: required(row.ulid("event_type_id")?, "event_type_id")?,
        slot_start: required(row.instant("slot_start")?, "slot_start")?,
        slot_duration: row.u32("slot_duration")?,
        reservation_duration: row.u32("reservation_duration")?,
    })
}

fn build_reservation_patch(row: &Row) -> Result<ReservationPatch, SqlError> {
    row.only("reservations", RESERVATION_COLUMNS)?;
    row.reject(&["event_type_id"])?;
    Ok(ReservationPatch {
        slot_start: row.instant("slot_start")?,
        slot_duration: row.u32("slot_duration")?,
        reservation_duration: row.u32("reservation_duration")?,
    })
}

fn build_booking(row: &Row) -> Result<BookingInput, SqlError> {
    row.only("bookings", BOOKING_COLUMNS)?;
    Ok(BookingInput {
        event_type_id: required(row.ulid("event_type_id")?, "event_type_id")?,
        start: required(row.instant("start")?, "start")?,
        duration: row.u32("duration")?,
        reservation_uid: row.ulid("reservation_uid")?,
    })
}

// ── Statements ────────────────────────────────────────────────

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("one statement per query".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Result shape of a statement without evaluating its values, so `$n`
/// placeholders may still be unbound.
pub fn row_shape_of(sql: &str) -> Option<RowShape> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let (table, is_select) = match stmts.first()? {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => (table_factor_name(&select.from.first()?.relation).ok()?, true),
            _ => return None,
        },
        Statement::Insert(insert) => (insert_table_name(insert).ok()?, false),
        Statement::Update { table, .. } => (table_factor_name(&table.relation).ok()?, false),
        _ => return None,
    };
    let shape = RowShape::of_table(&table)?;
    // Writes answer with the affected row only for holds and bookings.
    (is_select || matches!(shape, RowShape::Reservations | RowShape::Bookings)).then_some(shape)
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = insert_row(insert)?;

    match table.as_str() {
        "users" => Ok(Command::InsertUser(build_user(&row, None)?)),
        "teams" => Ok(Command::InsertTeam(build_team(&row)?)),
        "memberships" => Ok(Command::InsertMembership(build_membership(&row)?)),
        "schedules" => Ok(Command::InsertSchedule(build_schedule(&row, None)?)),
        "event_types" => Ok(Command::InsertEventType(build_event_type(&row, None)?)),
        "reservations" => Ok(Command::InsertReservation(build_reservation(&row)?)),
        "bookings" => Ok(Command::InsertBooking(build_booking(&row)?)),
        "slots" => Err(SqlError::Unsupported("slots are read-only".into())),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let mut set = Row::default();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            _ => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        set.insert(column, literal(&assignment.value)?)?;
    }
    if set.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }
    let filters = Filters::from_where(selection)?;

    match table.as_str() {
        "users" => Ok(Command::UpdateUser {
            id: filters.require_id("id")?,
            set,
        }),
        "schedules" => Ok(Command::UpdateSchedule {
            id: filters.require_id("id")?,
            set,
        }),
        "event_types" => Ok(Command::UpdateEventType {
            id: filters.require_id("id")?,
            set,
        }),
        "reservations" => Ok(Command::UpdateReservation {
            uid: filters.require_id("uid")?,
            patch: build_reservation_patch(&set)?,
        }),
        "bookings" => {
            set.only("bookings", &["start"])?;
            Ok(Command::RescheduleBooking {
                id: filters.require_id("id")?,
                start: required(set.instant("start")?, "start")?,
            })
        }
        "teams" | "memberships" | "slots" => Err(SqlError::Unsupported(format!("UPDATE {table}"))),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_where(delete.selection.as_ref())?;

    match table.as_str() {
        "users" => Ok(Command::DeleteUser {
            id: filters.require_id("id")?,
        }),
        "teams" => Ok(Command::DeleteTeam {
            id: filters.require_id("id")?,
        }),
        "memberships" => Ok(Command::DeleteMembership {
            user_id: filters.require_id("user_id")?,
            team_id: filters.require_id("team_id")?,
        }),
        "schedules" => Ok(Command::DeleteSchedule {
            id: filters.require_id("id")?,
        }),
        "event_types" => Ok(Command::DeleteEventType {
            id: filters.require_id("id")?,
        }),
        "reservations" => Ok(Command::DeleteReservation {
            uid: filters.require_id("uid")?,
        }),
        "bookings" => Ok(Command::CancelBooking {
            id: filters.require_id("id")?,
        }),
        "slots" => Err(SqlError::Unsupported("slots are read-only".into())),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::from_where(select.selection.as_ref())?;
    let eq = &filters.eq;

    match table.as_str() {
        "users" => Ok(Command::SelectUsers { id: eq.ulid("id")? }),
        "teams" => Ok(Command::SelectTeams),
        "memberships" => Ok(Command::SelectMemberships {
            team_id: eq.ulid("team_id")?,
        }),
        "schedules" => Ok(Command::SelectSchedules {
            id: eq.ulid("id")?,
            user_id: eq.ulid("user_id")?,
        }),
        "event_types" => {
            let filter = if let Some(id) = eq.ulid("id")? {
                EventTypeFilter::Id(id)
            } else if let (Some(username), Some(slug)) = (eq.text("username")?, eq.text("slug")?) {
                EventTypeFilter::Slug { username, slug }
            } else if let Some(uid) = eq.ulid("user_id")? {
                EventTypeFilter::Owner(Owner::User(uid))
            } else if let Some(tid) = eq.ulid("team_id")? {
                EventTypeFilter::Owner(Owner::Team(tid))
            } else {
                EventTypeFilter::All
            };
            Ok(Command::SelectEventTypes { filter })
        }
        "slots" => parse_slots(&filters),
        "reservations" => Ok(Command::SelectReservation {
            uid: filters.require_id("uid")?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            id: eq.ulid("id")?,
            event_type_id: eq.ulid("event_type_id")?,
            status: eq.parsed("status")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_slots(filters: &Filters) -> Result<Command, SqlError> {
    let eq = &filters.eq;
    let target = if let Some(id) = eq.ulid("event_type_id")? {
        SlotTarget::EventType(id)
    } else if let Some(usernames) = eq.text("usernames")? {
        SlotTarget::Dynamic {
            usernames: usernames
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(String::from)
                .collect(),
        }
    } else {
        match (eq.text("username")?, eq.text("event_type_slug")?) {
            (Some(username), Some(slug)) => SlotTarget::Slug { username, slug },
            (Some(_), None) => return Err(SqlError::MissingFilter("event_type_slug")),
            _ => return Err(SqlError::MissingFilter("event_type_id")),
        }
    };

    let query = SlotsQuery {
        target,
        start: filters.ge.instant("start")?.ok_or(SqlError::MissingFilter("start"))?,
        end: filters.le.instant("end")?.ok_or(SqlError::MissingFilter("end"))?,
        // Zero means no duration was asked for.
        duration: eq.u32("duration")?.filter(|&d| d != 0),
        time_zone: eq.tz("time_zone")?,
    };
    Ok(Command::SelectSlots {
        query,
        format: eq.parsed("format")?.unwrap_or_default(),
    })
}

/// Conjunctive WHERE clause, split by comparison operator.
#[derive(Debug, Default)]
struct Filters {
    eq: Row,
    ge: Row,
    le: Row,
}

impl Filters {
    fn from_where(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut filters = Filters::default();
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp { left, op, right } => {
                let target = match op {
                    ast::BinaryOperator::And => {
                        self.collect(left)?;
                        return self.collect(right);
                    }
                    ast::BinaryOperator::Eq => &mut self.eq,
                    ast::BinaryOperator::GtEq => &mut self.ge,
                    ast::BinaryOperator::LtEq => &mut self.le,
                    other => return Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
                };
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("WHERE {left}: expected a column")))?;
                target.insert(column, literal(right)?)
            }
            other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
        }
    }

    fn require_id(&self, column: &'static str) -> Result<Ulid, SqlError> {
        self.eq.ulid(column)?.ok_or(SqlError::MissingFilter(column))
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// The single VALUES row of an INSERT, keyed by the named columns.
fn insert_row(insert: &ast::Insert) -> Result<Row, SqlError> {
    if insert.columns.is_empty() {
        return Err(SqlError::Parse("INSERT must name its columns".into()));
    }
    let body = insert
        .source
        .as_ref()
        .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => return Err(SqlError::Parse("empty VALUES".into())),
            [row] => row,
            _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    if values.len() != insert.columns.len() {
        return Err(SqlError::WrongArity(insert.columns.len(), values.len()));
    }

    let mut row = Row::default();
    for (column, value) in insert.columns.iter().zip(values) {
        row.insert(column.value.to_lowercase(), literal(value)?)?;
    }
    Ok(row)
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn literal(expr: &Expr) -> Result<Literal, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::Null => Ok(Literal::Null),
            Value::Boolean(b) => Ok(Literal::Bool(*b)),
            Value::Number(n, _) => Ok(Literal::Number(n.to_string())),
            Value::SingleQuotedString(s) | Value::EscapedStringLiteral(s) => Ok(Literal::Text(s.clone())),
            Value::Placeholder(p) => Err(SqlError::Parse(format!("unbound parameter {p}"))),
            other => Err(SqlError::Parse(format!("unsupported literal {other}"))),
        },
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => match literal(expr)? {
            Literal::Number(n) => Ok(Literal::Number(format!("-{n}"))),
            other => Err(SqlError::Parse(format!("cannot negate {other:?}"))),
        },
        Expr::Nested(inner) => literal(inner),
        // '...'::jsonb and friends: the text is what matters.
        Expr::Cast { expr, .. } => literal(expr),
        other => Err(SqlError::Parse(format!("expected a literal, got {other}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("expected {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid value for {column}: {reason}")]
    BadValue { column: String, reason: String },
}

impl SqlError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::Parse(_) | SqlError::Empty | SqlError::WrongArity(..) => "42601",
            SqlError::Unsupported(_) => "0A000",
            SqlError::UnknownTable(_) => "42P01",
            SqlError::UnknownColumn(_) => "42703",
            SqlError::MissingColumn(_) => "23502",
            SqlError::MissingFilter(_) => "42601",
            SqlError::BadValue { .. } => "22023",
        }
    }
}
