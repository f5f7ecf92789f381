use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "lanehold_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "lanehold_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "lanehold_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "lanehold_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "lanehold_connections_rejected_total";

/// Gauge: number of loaded facility engines.
pub const FACILITIES_ACTIVE: &str = "lanehold_facilities_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "lanehold_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "lanehold_wal_flush_batch_size";

// ── Booking flow ────────────────────────────────────────────────

/// Counter: holds placed.
pub const HOLDS_CREATED_TOTAL: &str = "lanehold_holds_created_total";

/// Counter: holds refused for lack of capacity.
pub const HOLD_REJECTIONS_TOTAL: &str = "lanehold_hold_rejections_total";

pub const HOLDS_RENEWED_TOTAL: &str = "lanehold_holds_renewed_total";

pub const HOLDS_RELEASED_TOTAL: &str = "lanehold_holds_released_total";

/// Counter: holds closed by expiry (sweeper or on contact).
pub const HOLDS_EXPIRED_TOTAL: &str = "lanehold_holds_expired_total";

/// Counter: bookings created by confirmation.
pub const BOOKINGS_CONFIRMED_TOTAL: &str = "lanehold_bookings_confirmed_total";

/// Counter: bookings cancelled. Labels: source.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "lanehold_bookings_cancelled_total";

/// Counter: confirmations undone by compensation.
pub const BOOKING_ROLLBACKS_TOTAL: &str = "lanehold_booking_rollbacks_total";

/// Counter: compensation steps that themselves failed.
pub const COMPENSATION_FAILURES_TOTAL: &str = "lanehold_compensation_failures_total";

// ── Ledger ──────────────────────────────────────────────────────

pub const LEDGER_EXHAUSTED_TOTAL: &str = "lanehold_ledger_exhausted_total";

pub const RENEWAL_SIGNALS_TOTAL: &str = "lanehold_renewal_signals_total";

pub const PO_EXPIRED_TOTAL: &str = "lanehold_po_expired_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertSession { .. } => "insert_session",
        Command::CancelSession { .. } => "cancel_session",
        Command::CompleteSession { .. } => "complete_session",
        Command::MarkNoShow { .. } => "mark_no_show",
        Command::InsertHold { .. } => "insert_hold",
        Command::ReleaseHold { .. } => "release_hold",
        Command::RenewHold { .. } => "renew_hold",
        Command::ConfirmBooking { .. } => "confirm_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::InsertPurchaseOrder { .. } => "insert_purchase_order",
        Command::InsertAssessmentPair { .. } => "insert_assessment_pair",
        Command::RenewPurchaseOrder { .. } => "renew_purchase_order",
        Command::CancelPurchaseOrder { .. } => "cancel_purchase_order",
        Command::ApprovePurchaseOrder { .. } => "approve_purchase_order",
        Command::AttachAuthorization { .. } => "attach_authorization",
        Command::RecordBilling { .. } => "record_billing",
        Command::RecordPayment { .. } => "record_payment",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectHolds { .. } => "select_holds",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectPurchaseOrders { .. } => "select_purchase_orders",
        Command::SelectRecurrence { .. } => "select_recurrence",
        Command::SelectRecurrencePlan { .. } => "select_recurrence_plan",
    }
}
