use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: service operations handled. Labels: operation, outcome.
pub const REQUESTS_TOTAL: &str = "roomledger_requests_total";

/// Histogram: service operation latency in seconds. Labels: operation.
pub const REQUEST_DURATION_SECONDS: &str = "roomledger_request_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: hold requests. Labels: outcome (created, extended, rejected).
pub const HOLDS_TOTAL: &str = "roomledger_holds_total";

/// Counter: booking status transitions. Labels: to.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "roomledger_booking_transitions_total";

/// Counter: reservations refused for lack of units. Labels: room_type.
pub const INVENTORY_CONFLICTS_TOTAL: &str = "roomledger_inventory_conflicts_total";

// ── Sweepers ────────────────────────────────────────────────────

/// Counter: sweeper runs. Labels: job, status.
pub const SWEEP_RUNS_TOTAL: &str = "roomledger_sweep_runs_total";

/// Histogram: sweeper run duration in seconds. Labels: job.
pub const SWEEP_DURATION_SECONDS: &str = "roomledger_sweep_duration_seconds";

/// Counter: rows touched by sweeper runs. Labels: job.
pub const SWEEP_AFFECTED_TOTAL: &str = "roomledger_sweep_affected_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Counter: commits appended to the WAL and applied.
pub const COMMITS_TOTAL: &str = "roomledger_commits_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomledger_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomledger_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
