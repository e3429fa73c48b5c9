use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "libreserve_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "libreserve_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "libreserve_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "libreserve_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "libreserve_connections_rejected_total";

/// Gauge: books in the catalog.
pub const BOOKS_TOTAL: &str = "libreserve_books_total";

/// Counter: WAL compactions run. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "libreserve_wal_compactions_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "libreserve_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "libreserve_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
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
        Command::ListBooks => "list_books",
        Command::GetBook { .. } => "get_book",
        Command::InsertBook { .. } => "add_book",
        Command::DeleteBook { .. } => "delete_book",
        Command::InsertReservation { .. } => "reserve",
        Command::ListReservations { .. } => "list_reservations",
        Command::InsertCheckout { .. } => "checkout",
        Command::CheckoutReservation { .. } => "checkout_reservation",
        Command::DeleteCheckout { .. } => "return",
        Command::Search { .. } => "search",
    }
}
