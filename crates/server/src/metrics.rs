use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

pub struct ServerMetrics {
    ws_event_duration_count: Mutex<HashMap<String, u64>>,
    ws_event_duration_sum_ms: Mutex<HashMap<String, u64>>,
    ws_event_errors_total: Mutex<HashMap<String, u64>>,
    ws_event_rate_total: Mutex<HashMap<String, u64>>,
    broadcast_fanout_total: AtomicU64,
    connected_connections: AtomicU64,
}

static GLOBAL_METRICS: OnceLock<Arc<ServerMetrics>> = OnceLock::new();

impl Default for ServerMetrics {
    fn default() -> Self {
        Self {
            ws_event_duration_count: Mutex::new(HashMap::new()),
            ws_event_duration_sum_ms: Mutex::new(HashMap::new()),
            ws_event_errors_total: Mutex::new(HashMap::new()),
            ws_event_rate_total: Mutex::new(HashMap::new()),
            broadcast_fanout_total: AtomicU64::new(0),
            connected_connections: AtomicU64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<ServerMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<ServerMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_ws_event(event: &str, is_error: bool, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_event(event, is_error, latency_ms);
    }
}

pub fn add_broadcast_fanout(delivered: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.add_broadcast_fanout(delivered);
    }
}

pub fn set_connected_connections(count: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.set_connected_connections(count);
    }
}

/// Render the global registry, or an empty default when none is installed.
pub fn render_global() -> String {
    match global_metrics() {
        Some(metrics) => metrics.render_prometheus(),
        None => ServerMetrics::default().render_prometheus(),
    }
}

impl ServerMetrics {
    pub fn record_ws_event(&self, event: &str, is_error: bool, latency_ms: u64) {
        let label = normalize_event_label(event);
        increment_label_counter(&self.ws_event_rate_total, &label, 1);
        increment_label_counter(&self.ws_event_duration_sum_ms, &label, latency_ms);
        increment_label_counter(&self.ws_event_duration_count, &label, 1);
        if is_error {
            increment_label_counter(&self.ws_event_errors_total, &label, 1);
        }
    }

    pub fn add_broadcast_fanout(&self, delivered: u64) {
        self.broadcast_fanout_total.fetch_add(delivered, Ordering::SeqCst);
    }

    pub fn set_connected_connections(&self, count: u64) {
        self.connected_connections.store(count, Ordering::SeqCst);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP codehive_ws_event_rate_total Total websocket events by name.\n");
        output.push_str("# TYPE codehive_ws_event_rate_total counter\n");
        append_label_counter_lines(
            &mut output,
            "codehive_ws_event_rate_total",
            &self.ws_event_rate_total,
        );

        output.push_str(
            "# HELP codehive_ws_event_errors_total Total websocket event errors by name.\n",
        );
        output.push_str("# TYPE codehive_ws_event_errors_total counter\n");
        append_label_counter_lines(
            &mut output,
            "codehive_ws_event_errors_total",
            &self.ws_event_errors_total,
        );

        output.push_str("# HELP codehive_ws_event_duration_ms_sum Sum of websocket event handling latency in milliseconds by name.\n");
        output.push_str("# TYPE codehive_ws_event_duration_ms_sum counter\n");
        append_label_counter_lines(
            &mut output,
            "codehive_ws_event_duration_ms_sum",
            &self.ws_event_duration_sum_ms,
        );

        output.push_str(
            "# HELP codehive_ws_event_duration_ms_count Count of websocket event latency samples by name.\n",
        );
        output.push_str("# TYPE codehive_ws_event_duration_ms_count counter\n");
        append_label_counter_lines(
            &mut output,
            "codehive_ws_event_duration_ms_count",
            &self.ws_event_duration_count,
        );

        output.push_str(
            "# HELP codehive_broadcast_fanout_total Total broadcast deliveries across all sessions.\n",
        );
        output.push_str("# TYPE codehive_broadcast_fanout_total counter\n");
        output.push_str(&format!(
            "codehive_broadcast_fanout_total {}\n",
            self.broadcast_fanout_total.load(Ordering::SeqCst)
        ));

        output.push_str(
            "# HELP codehive_connected_connections Currently registered websocket connections.\n",
        );
        output.push_str("# TYPE codehive_connected_connections gauge\n");
        output.push_str(&format!(
            "codehive_connected_connections {}\n",
            self.connected_connections.load(Ordering::SeqCst)
        ));

        output
    }
}

fn normalize_event_label(event: &str) -> String {
    let normalized = event.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    if guard.is_empty() {
        return;
    }

    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{event=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::ServerMetrics;

    #[test]
    fn render_prometheus_includes_event_and_fanout_metrics() {
        let metrics = ServerMetrics::default();
        metrics.record_ws_event("code-change", false, 3);
        metrics.record_ws_event("code-change", true, 9);
        metrics.record_ws_event("chat-message", false, 1);
        metrics.add_broadcast_fanout(4);
        metrics.set_connected_connections(7);

        let rendered = metrics.render_prometheus();

        assert!(rendered.contains("codehive_ws_event_rate_total{event=\"code-change\"} 2"));
        assert!(rendered.contains("codehive_ws_event_errors_total{event=\"code-change\"} 1"));
        assert!(rendered.contains("codehive_ws_event_duration_ms_sum{event=\"code-change\"} 12"));
        assert!(rendered.contains("codehive_ws_event_duration_ms_count{event=\"chat-message\"} 1"));
        assert!(rendered.contains("codehive_broadcast_fanout_total 4"));
        assert!(rendered.contains("codehive_connected_connections 7"));
    }

    #[test]
    fn empty_event_name_is_normalized_to_unknown() {
        let metrics = ServerMetrics::default();
        metrics.record_ws_event("  ", false, 1);
        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("codehive_ws_event_rate_total{event=\"unknown\"} 1"));
    }

    #[test]
    fn render_without_samples_emits_gauges_only() {
        let rendered = ServerMetrics::default().render_prometheus();
        assert!(rendered.contains("codehive_broadcast_fanout_total 0"));
        assert!(rendered.contains("codehive_connected_connections 0"));
        assert!(!rendered.contains("event=\""));
    }
}
