//! Lightweight Prometheus-compatible metrics for the chat server.
//!
//! Uses atomic counters so a snapshot can be rendered from any thread. Renders
//! in Prometheus text exposition format; the server logs the rendering at
//! shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lightweight Prometheus-compatible metrics for the chat server.
pub struct Metrics {
    /// Currently occupied slots (gauge)
    pub connected_clients: AtomicU64,
    /// Connections accepted into a slot (counter)
    pub connections_accepted_total: AtomicU64,
    /// Connections turned away with SERVER_FULL (counter)
    pub connections_rejected_full_total: AtomicU64,
    /// Successful logins (counter)
    pub logins_total: AtomicU64,
    /// Handshakes ending in BAD_USERNAME or NOT_ALLOWED (counter)
    pub handshake_rejections_total: AtomicU64,
    /// Global broadcasts routed (counter)
    pub broadcasts_total: AtomicU64,
    /// Direct messages delivered (counter)
    pub direct_messages_total: AtomicU64,
    /// Group messages routed to a known group (counter)
    pub group_messages_total: AtomicU64,
    /// System notices for bad commands or unknown targets (counter)
    pub command_errors_total: AtomicU64,
    /// Connections closed after occupying a slot (counter)
    pub disconnects_total: AtomicU64,
    /// Server start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connected_clients: AtomicU64::new(0),
            connections_accepted_total: AtomicU64::new(0),
            connections_rejected_full_total: AtomicU64::new(0),
            logins_total: AtomicU64::new(0),
            handshake_rejections_total: AtomicU64::new(0),
            broadcasts_total: AtomicU64::new(0),
            direct_messages_total: AtomicU64::new(0),
            group_messages_total: AtomicU64::new(0),
            command_errors_total: AtomicU64::new(0),
            disconnects_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr(gauge: &AtomicU64) {
        // Saturating: a stray decrement must not wrap the gauge
        let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP tincan_connected_clients Currently occupied connection slots\n\
             # TYPE tincan_connected_clients gauge\n\
             tincan_connected_clients {}\n\
             # HELP tincan_connections_accepted_total Connections accepted into a slot\n\
             # TYPE tincan_connections_accepted_total counter\n\
             tincan_connections_accepted_total {}\n\
             # HELP tincan_connections_rejected_full_total Connections rejected with SERVER_FULL\n\
             # TYPE tincan_connections_rejected_full_total counter\n\
             tincan_connections_rejected_full_total {}\n\
             # HELP tincan_logins_total Successful username handshakes\n\
             # TYPE tincan_logins_total counter\n\
             tincan_logins_total {}\n\
             # HELP tincan_handshake_rejections_total Refused username handshakes\n\
             # TYPE tincan_handshake_rejections_total counter\n\
             tincan_handshake_rejections_total {}\n\
             # HELP tincan_broadcasts_total Global messages broadcast\n\
             # TYPE tincan_broadcasts_total counter\n\
             tincan_broadcasts_total {}\n\
             # HELP tincan_direct_messages_total Direct messages delivered\n\
             # TYPE tincan_direct_messages_total counter\n\
             tincan_direct_messages_total {}\n\
             # HELP tincan_group_messages_total Group messages routed\n\
             # TYPE tincan_group_messages_total counter\n\
             tincan_group_messages_total {}\n\
             # HELP tincan_command_errors_total Commands answered with a system notice\n\
             # TYPE tincan_command_errors_total counter\n\
             tincan_command_errors_total {}\n\
             # HELP tincan_disconnects_total Connections closed after occupying a slot\n\
             # TYPE tincan_disconnects_total counter\n\
             tincan_disconnects_total {}\n\
             # HELP tincan_uptime_seconds Server uptime in seconds\n\
             # TYPE tincan_uptime_seconds gauge\n\
             tincan_uptime_seconds {}\n",
            self.connected_clients.load(Ordering::Relaxed),
            self.connections_accepted_total.load(Ordering::Relaxed),
            self.connections_rejected_full_total.load(Ordering::Relaxed),
            self.logins_total.load(Ordering::Relaxed),
            self.handshake_rejections_total.load(Ordering::Relaxed),
            self.broadcasts_total.load(Ordering::Relaxed),
            self.direct_messages_total.load(Ordering::Relaxed),
            self.group_messages_total.load(Ordering::Relaxed),
            self.command_errors_total.load(Ordering::Relaxed),
            self.disconnects_total.load(Ordering::Relaxed),
            uptime,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
