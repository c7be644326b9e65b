use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotd_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotd_query_duration_seconds";

/// Counter: slots returned by availability queries.
pub const SLOTS_SERVED_TOTAL: &str = "slotd_slots_served_total";

/// Counter: reservation holds placed.
pub const RESERVATIONS_CREATED_TOTAL: &str = "slotd_reservations_created_total";

/// Counter: reservation requests refused (conflict, permission, bad input).
pub const RESERVATIONS_REJECTED_TOTAL: &str = "slotd_reservations_rejected_total";

/// Counter: expired holds removed by the sweeper.
pub const RESERVATIONS_SWEPT_TOTAL: &str = "slotd_reservations_swept_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: open client connections.
pub const CONNECTIONS_ACTIVE: &str = "slotd_connections_active";

/// Counter: connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotd_connections_total";

/// Counter: connections turned away at the limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotd_connections_rejected_total";

/// Gauge: loaded tenant engines.
pub const TENANTS_ACTIVE: &str = "slotd_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotd_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotd_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotd_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> anyhow::Result<()> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a command, used on the RED metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertUser(_) => "insert_user",
        Command::UpdateUser { .. } => "update_user",
        Command::DeleteUser { .. } => "delete_user",
        Command::SelectUsers { .. } => "select_users",
        Command::InsertTeam(_) => "insert_team",
        Command::DeleteTeam { .. } => "delete_team",
        Command::SelectTeams => "select_teams",
        Command::InsertMembership(_) => "insert_membership",
        Command::DeleteMembership { .. } => "delete_membership",
        Command::SelectMemberships { .. } => "select_memberships",
        Command::InsertSchedule(_) => "insert_schedule",
        Command::UpdateSchedule { .. } => "update_schedule",
        Command::DeleteSchedule { .. } => "delete_schedule",
        Command::SelectSchedules { .. } => "select_schedules",
        Command::InsertEventType(_) => "insert_event_type",
        Command::UpdateEventType { .. } => "update_event_type",
        Command::DeleteEventType { .. } => "delete_event_type",
        Command::SelectEventTypes { .. } => "select_event_types",
        Command::SelectSlots { .. } => "select_slots",
        Command::InsertReservation(_) => "insert_reservation",
        Command::SelectReservation { .. } => "select_reservation",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::InsertBooking(_) => "insert_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::RescheduleBooking { .. } => "reschedule_booking",
        Command::CancelBooking { .. } => "cancel_booking",
    }
}
