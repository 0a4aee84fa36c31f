use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

/// Outbound message class used to label drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Presence,
    Control,
    Data,
}

impl MessageClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Presence => "presence",
            Self::Control => "control",
            Self::Data => "data",
        }
    }
}

pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    connections_opened_total: Mutex<HashMap<String, u64>>,
    connections_closed_total: Mutex<HashMap<String, u64>>,
    messages_dropped_total: Mutex<HashMap<String, u64>>,
    teardown_total: Mutex<HashMap<String, u64>>,
    upgrades_rejected_total: Mutex<HashMap<String, u64>>,
    live_sessions: AtomicI64,
}

const ROLE_LABELS: [&str; 2] = ["owner", "member"];
const MESSAGE_CLASS_LABELS: [&str; 3] = ["presence", "control", "data"];
static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

fn seeded(labels: &[&str]) -> Mutex<HashMap<String, u64>> {
    Mutex::new(labels.iter().map(|label| (label.to_string(), 0)).collect())
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self {
            request_duration_count: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_rate_total: Mutex::new(HashMap::new()),
            connections_opened_total: seeded(&ROLE_LABELS),
            connections_closed_total: seeded(&ROLE_LABELS),
            messages_dropped_total: seeded(&MESSAGE_CLASS_LABELS),
            teardown_total: Mutex::new(HashMap::new()),
            upgrades_rejected_total: Mutex::new(HashMap::new()),
            live_sessions: AtomicI64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_connection_opened(role: &str) {
    if let Some(metrics) = global_metrics() {
        increment_label_counter(&metrics.connections_opened_total, role, 1);
    }
}

pub fn record_connection_closed(role: &str) {
    if let Some(metrics) = global_metrics() {
        increment_label_counter(&metrics.connections_closed_total, role, 1);
    }
}

pub fn record_message_dropped(class: MessageClass) {
    if let Some(metrics) = global_metrics() {
        metrics.record_message_dropped(class);
    }
}

pub fn record_teardown(outcome: &str) {
    if let Some(metrics) = global_metrics() {
        increment_label_counter(&metrics.teardown_total, outcome, 1);
    }
}

pub fn record_upgrade_rejected(reason: &str) {
    if let Some(metrics) = global_metrics() {
        increment_label_counter(&metrics.upgrades_rejected_total, reason, 1);
    }
}

pub fn set_live_sessions(count: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.set_live_sessions(count);
    }
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_message_dropped(&self, class: MessageClass) {
        increment_label_counter(&self.messages_dropped_total, class.as_str(), 1);
    }

    pub fn set_live_sessions(&self, count: usize) {
        self.live_sessions.store(count as i64, Ordering::SeqCst);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str(
            "# HELP hub_connections_opened_total WebSocket connections attached by role.\n",
        );
        output.push_str("# TYPE hub_connections_opened_total counter\n");
        append_label_counter_lines(
            &mut output,
            "hub_connections_opened_total",
            "role",
            &self.connections_opened_total,
        );

        output.push_str(
            "# HELP hub_connections_closed_total WebSocket connections closed by role.\n",
        );
        output.push_str("# TYPE hub_connections_closed_total counter\n");
        append_label_counter_lines(
            &mut output,
            "hub_connections_closed_total",
            "role",
            &self.connections_closed_total,
        );

        output.push_str(
            "# HELP hub_messages_dropped_total Outbound messages dropped on a full queue.\n",
        );
        output.push_str("# TYPE hub_messages_dropped_total counter\n");
        append_label_counter_lines(
            &mut output,
            "hub_messages_dropped_total",
            "class",
            &self.messages_dropped_total,
        );

        output.push_str("# HELP hub_teardown_total Connection teardowns by outcome.\n");
        output.push_str("# TYPE hub_teardown_total counter\n");
        append_label_counter_lines(&mut output, "hub_teardown_total", "outcome", &self.teardown_total);

        output.push_str("# HELP hub_upgrades_rejected_total Refused upgrade attempts by reason.\n");
        output.push_str("# TYPE hub_upgrades_rejected_total counter\n");
        append_label_counter_lines(
            &mut output,
            "hub_upgrades_rejected_total",
            "reason",
            &self.upgrades_rejected_total,
        );

        output.push_str("# HELP hub_live_sessions Sessions currently held by the hub.\n");
        output.push_str("# TYPE hub_live_sessions gauge\n");
        output.push_str(&format!(
            "hub_live_sessions {}\n",
            self.live_sessions.load(Ordering::SeqCst)
        ));

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut normalized_segments = Vec::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        if uuid::Uuid::parse_str(segment).is_ok() {
            normalized_segments.push("{uuid}".to_string());
            continue;
        }

        if segment.chars().all(|character| character.is_ascii_digit()) {
            normalized_segments.push("{number}".to_string());
            continue;
        }

        normalized_segments.push(segment.to_string());
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let normalized = label.trim().to_ascii_lowercase();
    let label = if normalized.is_empty() { "unknown".to_string() } else { normalized };
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(label).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::{increment_label_counter, MessageClass, RelayMetrics};

    #[test]
    fn render_prometheus_includes_http_and_hub_metrics() {
        let metrics = RelayMetrics::default();
        metrics.record_http_request("post", "/v1/sessions/123/join", 200, 15);
        metrics.record_http_request(
            "GET",
            "/v1/sessions/6f1c2a8e-4c1b-4b4e-9a55-2f0d1c1e9a01",
            404,
            25,
        );
        increment_label_counter(&metrics.connections_opened_total, "owner", 1);
        increment_label_counter(&metrics.connections_opened_total, "member", 2);
        increment_label_counter(&metrics.teardown_total, "owner_cascade", 1);
        metrics.record_message_dropped(MessageClass::Presence);
        metrics.record_message_dropped(MessageClass::Presence);
        metrics.record_message_dropped(MessageClass::Data);
        metrics.set_live_sessions(3);

        let rendered = metrics.render_prometheus();

        assert!(rendered.contains(
            "relay_request_rate_total{method=\"POST\",endpoint=\"/v1/sessions/{number}/join\"} 1"
        ));
        assert!(rendered.contains(
            "relay_request_errors_total{method=\"GET\",endpoint=\"/v1/sessions/{uuid}\"} 1"
        ));
        assert!(rendered.contains("hub_connections_opened_total{role=\"owner\"} 1"));
        assert!(rendered.contains("hub_connections_opened_total{role=\"member\"} 2"));
        assert!(rendered.contains("hub_connections_closed_total{role=\"owner\"} 0"));
        assert!(rendered.contains("hub_messages_dropped_total{class=\"presence\"} 2"));
        assert!(rendered.contains("hub_messages_dropped_total{class=\"control\"} 0"));
        assert!(rendered.contains("hub_messages_dropped_total{class=\"data\"} 1"));
        assert!(rendered.contains("hub_teardown_total{outcome=\"owner_cascade\"} 1"));
        assert!(rendered.contains("hub_live_sessions 3"));
    }

    #[test]
    fn blank_labels_are_bucketed_as_unknown() {
        let metrics = RelayMetrics::default();
        increment_label_counter(&metrics.upgrades_rejected_total, "  ", 1);
        assert!(metrics
            .render_prometheus()
            .contains("hub_upgrades_rejected_total{reason=\"unknown\"} 1"));
    }
}
