use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total commands executed. Labels: command, status.
pub const COMMANDS_TOTAL: &str = "parkslot_commands_total";

/// Histogram: command latency in seconds. Labels: command.
pub const COMMAND_DURATION_SECONDS: &str = "parkslot_command_duration_seconds";

// ── Inventory metrics ───────────────────────────────────────────

/// Counter: conditional ticket decrements. Labels: outcome (ok, capacity, conflict).
pub const RESERVATIONS_TOTAL: &str = "parkslot_reservations_total";

/// Counter: tickets returned to instances.
pub const RELEASED_TICKETS_TOTAL: &str = "parkslot_released_tickets_total";

/// Counter: instances created. Labels: source (template, autofill).
pub const INSTANCES_MATERIALIZED_TOTAL: &str = "parkslot_instances_materialized_total";

/// Counter: holds released by the expiry sweep.
pub const HOLDS_EXPIRED_TOTAL: &str = "parkslot_holds_expired_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "parkslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "parkslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "parkslot_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkslot_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertPark { .. } => "insert_park",
        Command::SelectParks { .. } => "select_parks",
        Command::InsertTemplate { .. } => "insert_template",
        Command::DeleteTemplate { .. } => "delete_template",
        Command::SelectTemplates { .. } => "select_templates",
        Command::InsertPrice { .. } => "insert_price",
        Command::DeletePrice { .. } => "delete_price",
        Command::SelectHours { .. } => "select_hours",
        Command::Materialize { .. } => "materialize",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectInstances { .. } => "select_instances",
        Command::SelectAvailability { .. } => "select_availability",
        Command::Reserve { .. } => "reserve",
        Command::Release { .. } => "release",
        Command::InsertLine { .. } => "insert_line",
        Command::ResizeLine { .. } => "resize_line",
        Command::DeleteLine { .. } => "delete_line",
        Command::SelectLines { .. } => "select_lines",
        Command::ConfirmLine { .. } => "confirm_line",
        Command::Checkout { .. } => "checkout",
        Command::CancelLine { .. } => "cancel_line",
        Command::UseLine { .. } => "use_line",
        Command::AbandonCart { .. } => "abandon_cart",
        Command::ExpireHolds => "expire_holds",
    }
}
