use std::net::SocketAddr;

use crate::wire::Op;

// ── Admission ───────────────────────────────────────────────────

/// Counter: evaluations. Labels: outcome (admitted|rejected).
pub const EVALUATIONS_TOTAL: &str = "roomgate_evaluations_total";

/// Counter: commit attempts. Labels: outcome (committed|rejected|conflict|...).
pub const COMMITS_TOTAL: &str = "roomgate_commits_total";

/// Histogram: commit latency in seconds, lock wait and fsync included.
pub const COMMIT_DURATION_SECONDS: &str = "roomgate_commit_duration_seconds";

/// Counter: room lock waits that hit the timeout.
pub const LOCK_TIMEOUTS_TOTAL: &str = "roomgate_lock_timeouts_total";

/// Counter: cache entries dropped by writes. Labels: cache (policy|availability).
pub const CACHE_INVALIDATIONS_TOTAL: &str = "roomgate_cache_invalidations_total";

// ── Requests ────────────────────────────────────────────────────

/// Counter: wire requests. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "roomgate_requests_total";

/// Histogram: wire request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "roomgate_request_duration_seconds";

// ── Resources ───────────────────────────────────────────────────

/// Gauge: open client connections.
pub const CONNECTIONS_ACTIVE: &str = "roomgate_connections_active";

/// Counter: connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roomgate_connections_total";

/// Counter: connections turned away at the limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roomgate_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomgate_wal_flush_duration_seconds";

/// Histogram: events per WAL group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomgate_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if unset.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a request, for metrics and logs.
pub fn op_label(op: &Op) -> &'static str {
    match op {
        Op::Evaluate { .. } => "evaluate",
        Op::Commit { .. } => "commit",
        Op::UpdateBooking { .. } => "update_booking",
        Op::CancelBooking { .. } => "cancel_booking",
        Op::ListAvailable { .. } => "list_available",
        Op::CreateRoom { .. } => "create_room",
        Op::UpdateRoom { .. } => "update_room",
        Op::SetRoomActive { .. } => "set_room_active",
        Op::GetRoom { .. } => "get_room",
        Op::ListRooms { .. } => "list_rooms",
        Op::GetBooking { .. } => "get_booking",
        Op::ListBookings { .. } => "list_bookings",
        Op::SetSetting { .. } => "set_setting",
        Op::GetSetting { .. } => "get_setting",
        Op::ListSettings { .. } => "list_settings",
        Op::GetPolicy => "get_policy",
        Op::AddFavorite { .. } => "add_favorite",
        Op::RemoveFavorite { .. } => "remove_favorite",
        Op::ListFavorites { .. } => "list_favorites",
    }
}
