use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Latency samples kept per series; older samples are dropped first
const MAX_SAMPLES: usize = 1000;

/// Application-wide metrics collector.
///
/// Tracks remote API usage, per-item outcomes, detector throughput and
/// endpoint traffic. Cloning shares the same counters.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Remote API
    api_calls_total: AtomicUsize,
    api_calls_success: AtomicUsize,
    api_calls_failed: AtomicUsize,
    api_tokens_input: AtomicU64,
    api_tokens_output: AtomicU64,
    api_latency_ms: RwLock<VecDeque<u64>>,

    // Pipeline
    requests_processed: AtomicUsize,
    detections_total: AtomicUsize,
    items_succeeded: AtomicUsize,
    items_failed: AtomicUsize,
    perishable_fallbacks: AtomicUsize,
    detection_duration_ms: RwLock<VecDeque<u64>>,
    batch_duration_ms: RwLock<VecDeque<u64>>,

    endpoint_counters: DashMap<String, AtomicUsize>,
    item_errors_by_kind: DashMap<String, AtomicUsize>,

    circuit_breaker_trips: AtomicUsize,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                api_calls_total: AtomicUsize::new(0),
                api_calls_success: AtomicUsize::new(0),
                api_calls_failed: AtomicUsize::new(0),
                api_tokens_input: AtomicU64::new(0),
                api_tokens_output: AtomicU64::new(0),
                api_latency_ms: RwLock::new(VecDeque::with_capacity(MAX_SAMPLES)),
                requests_processed: AtomicUsize::new(0),
                detections_total: AtomicUsize::new(0),
                items_succeeded: AtomicUsize::new(0),
                items_failed: AtomicUsize::new(0),
                perishable_fallbacks: AtomicUsize::new(0),
                detection_duration_ms: RwLock::new(VecDeque::with_capacity(MAX_SAMPLES)),
                batch_duration_ms: RwLock::new(VecDeque::with_capacity(MAX_SAMPLES)),
                endpoint_counters: DashMap::new(),
                item_errors_by_kind: DashMap::new(),
                circuit_breaker_trips: AtomicUsize::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn record_api_call(&self, success: bool, duration: Duration, input_tokens: u64, output_tokens: u64) {
        self.inner.api_calls_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.inner.api_calls_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.api_calls_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.api_tokens_input.fetch_add(input_tokens, Ordering::Relaxed);
        self.inner.api_tokens_output.fetch_add(output_tokens, Ordering::Relaxed);
        push_sample(&self.inner.api_latency_ms, duration);
    }

    pub fn record_detection(&self, detections: usize, duration: Duration) {
        self.inner.requests_processed.fetch_add(1, Ordering::Relaxed);
        self.inner.detections_total.fetch_add(detections, Ordering::Relaxed);
        push_sample(&self.inner.detection_duration_ms, duration);
    }

    pub fn record_batch(&self, duration: Duration) {
        push_sample(&self.inner.batch_duration_ms, duration);
    }

    pub fn record_item_success(&self) {
        self.inner.items_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_item_failure(&self, kind: &str) {
        self.inner.items_failed.fetch_add(1, Ordering::Relaxed);
        self.inner
            .item_errors_by_kind
            .entry(kind.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.inner.perishable_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_endpoint_request(&self, endpoint: &str) {
        self.inner
            .endpoint_counters
            .entry(endpoint.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_breaker_trip(&self) {
        self.inner.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let api_latency = self.inner.api_latency_ms.read();
        let api_latency_avg = avg(&api_latency);
        let api_latency_p50 = percentile(&api_latency, 0.5);
        let api_latency_p95 = percentile(&api_latency, 0.95);
        let api_latency_p99 = percentile(&api_latency, 0.99);
        drop(api_latency);

        let detection_avg = avg(&self.inner.detection_duration_ms.read());
        let batch_avg = avg(&self.inner.batch_duration_ms.read());

        let items_succeeded = self.inner.items_succeeded.load(Ordering::Relaxed);
        let items_failed = self.inner.items_failed.load(Ordering::Relaxed);
        let items_total = items_succeeded + items_failed;
        let item_success_rate = if items_total > 0 {
            items_succeeded as f64 / items_total as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            api_calls_total: self.inner.api_calls_total.load(Ordering::Relaxed),
            api_calls_success: self.inner.api_calls_success.load(Ordering::Relaxed),
            api_calls_failed: self.inner.api_calls_failed.load(Ordering::Relaxed),
            api_tokens_input: self.inner.api_tokens_input.load(Ordering::Relaxed),
            api_tokens_output: self.inner.api_tokens_output.load(Ordering::Relaxed),
            api_latency_avg_ms: api_latency_avg,
            api_latency_p50_ms: api_latency_p50,
            api_latency_p95_ms: api_latency_p95,
            api_latency_p99_ms: api_latency_p99,
            requests_processed: self.inner.requests_processed.load(Ordering::Relaxed),
            detections_total: self.inner.detections_total.load(Ordering::Relaxed),
            items_succeeded,
            items_failed,
            item_success_rate,
            perishable_fallbacks: self.inner.perishable_fallbacks.load(Ordering::Relaxed),
            detection_avg_ms: detection_avg,
            batch_avg_ms: batch_avg,
            item_errors_by_kind: collect_counters(&self.inner.item_errors_by_kind),
            endpoint_requests: collect_counters(&self.inner.endpoint_counters),
            circuit_breaker_trips: self.inner.circuit_breaker_trips.load(Ordering::Relaxed),
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = format!(
            r#"# HELP api_calls_total Total number of remote vision API calls
# TYPE api_calls_total counter
api_calls_total {{}} {}

# HELP api_calls_failed Number of failed remote vision API calls
# TYPE api_calls_failed counter
api_calls_failed {{}} {}

# HELP api_tokens_input_total Total prompt tokens consumed
# TYPE api_tokens_input_total counter
api_tokens_input_total {{}} {}

# HELP api_tokens_output_total Total completion tokens generated
# TYPE api_tokens_output_total counter
api_tokens_output_total {{}} {}

# HELP api_latency_p95_ms 95th percentile remote API latency in milliseconds
# TYPE api_latency_p95_ms gauge
api_latency_p95_ms {{}} {}

# HELP detections_total Total objects detected
# TYPE detections_total counter
detections_total {{}} {}

# HELP items_total Analysed items by outcome
# TYPE items_total counter
items_total {{outcome="success"}} {}
items_total {{outcome="error"}} {}

# HELP perishable_fallbacks_total Perishable items re-analysed as packaged products
# TYPE perishable_fallbacks_total counter
perishable_fallbacks_total {{}} {}

# HELP batch_avg_duration_ms Average dispatch duration in milliseconds
# TYPE batch_avg_duration_ms gauge
batch_avg_duration_ms {{}} {}

# HELP circuit_breaker_trips_total Total circuit breaker trips
# TYPE circuit_breaker_trips_total counter
circuit_breaker_trips_total {{}} {}

# HELP uptime_seconds Application uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {{}} {}
"#,
            snapshot.api_calls_total,
            snapshot.api_calls_failed,
            snapshot.api_tokens_input,
            snapshot.api_tokens_output,
            snapshot.api_latency_p95_ms,
            snapshot.detections_total,
            snapshot.items_succeeded,
            snapshot.items_failed,
            snapshot.perishable_fallbacks,
            snapshot.batch_avg_ms,
            snapshot.circuit_breaker_trips,
            snapshot.uptime_seconds,
        );

        if !snapshot.endpoint_requests.is_empty() {
            out.push_str("\n# HELP endpoint_requests_total Requests per endpoint\n");
            out.push_str("# TYPE endpoint_requests_total counter\n");
            for (endpoint, count) in &snapshot.endpoint_requests {
                out.push_str(&format!(
                    "endpoint_requests_total {{endpoint=\"{}\"}} {}\n",
                    endpoint, count
                ));
            }
        }

        if !snapshot.item_errors_by_kind.is_empty() {
            out.push_str("\n# HELP item_errors_total Failed items by error kind\n");
            out.push_str("# TYPE item_errors_total counter\n");
            for (kind, count) in &snapshot.item_errors_by_kind {
                out.push_str(&format!("item_errors_total {{kind=\"{}\"}} {}\n", kind, count));
            }
        }

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub api_calls_total: usize,
    pub api_calls_success: usize,
    pub api_calls_failed: usize,
    pub api_tokens_input: u64,
    pub api_tokens_output: u64,
    pub api_latency_avg_ms: u64,
    pub api_latency_p50_ms: u64,
    pub api_latency_p95_ms: u64,
    pub api_latency_p99_ms: u64,
    pub requests_processed: usize,
    pub detections_total: usize,
    pub items_succeeded: usize,
    pub items_failed: usize,
    pub item_success_rate: f64,
    pub perishable_fallbacks: usize,
    pub detection_avg_ms: u64,
    pub batch_avg_ms: u64,
    pub item_errors_by_kind: BTreeMap<String, usize>,
    pub endpoint_requests: BTreeMap<String, usize>,
    pub circuit_breaker_trips: usize,
    pub uptime_seconds: u64,
}

fn collect_counters(counters: &DashMap<String, AtomicUsize>) -> BTreeMap<String, usize> {
    counters
        .iter()
        .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
        .collect()
}

fn push_sample(samples: &RwLock<VecDeque<u64>>, duration: Duration) {
    let mut samples = samples.write();
    if samples.len() >= MAX_SAMPLES {
        samples.pop_front();
    }
    samples.push_back(duration.as_millis() as u64);
}

fn percentile(values: &VecDeque<u64>, p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted: Vec<u64> = values.iter().copied().collect();
    sorted.sort_unstable();
    let idx = ((values.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &VecDeque<u64>) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();

        metrics.record_api_call(true, Duration::from_millis(100), 500, 200);
        metrics.record_api_call(false, Duration::from_millis(50), 0, 0);
        metrics.record_detection(3, Duration::from_millis(40));
        metrics.record_item_success();
        metrics.record_item_success();
        metrics.record_item_failure("unsupported_class");
        metrics.record_fallback();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.api_calls_total, 2);
        assert_eq!(snapshot.api_calls_success, 1);
        assert_eq!(snapshot.api_calls_failed, 1);
        assert_eq!(snapshot.api_tokens_input, 500);
        assert_eq!(snapshot.detections_total, 3);
        assert_eq!(snapshot.items_succeeded, 2);
        assert_eq!(snapshot.items_failed, 1);
        assert_eq!(snapshot.item_errors_by_kind["unsupported_class"], 1);
        assert_eq!(snapshot.perishable_fallbacks, 1);
        assert!((snapshot.item_success_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_endpoint_counters() {
        let metrics = Metrics::new();
        metrics.record_endpoint_request("analyze_group");
        metrics.record_endpoint_request("analyze_group");
        metrics.record_endpoint_request("multi_image_ocr");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.endpoint_requests["analyze_group"], 2);
        assert_eq!(snapshot.endpoint_requests["multi_image_ocr"], 1);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.record_api_call(true, Duration::from_millis(100), 500, 200);
        metrics.record_item_failure("remote_analysis");
        metrics.record_endpoint_request("analyze_group");

        let prometheus = metrics.to_prometheus();
        assert!(prometheus.contains("api_calls_total {} 1"));
        assert!(prometheus.contains("api_tokens_input_total {} 500"));
        assert!(prometheus.contains("items_total {outcome=\"error\"} 1"));
        assert!(prometheus.contains("endpoint_requests_total {endpoint=\"analyze_group\"} 1"));
        assert!(prometheus.contains("item_errors_total {kind=\"remote_analysis\"} 1"));
    }

    #[test]
    fn test_latency_samples_are_bounded() {
        let metrics = Metrics::new();
        for i in 0..(MAX_SAMPLES + 500) {
            metrics.record_api_call(true, Duration::from_millis(i as u64), 0, 0);
            metrics.record_detection(1, Duration::from_millis(5));
            metrics.record_batch(Duration::from_millis(7));
        }

        assert_eq!(metrics.inner.api_latency_ms.read().len(), MAX_SAMPLES);
        assert_eq!(metrics.inner.detection_duration_ms.read().len(), MAX_SAMPLES);
        assert_eq!(metrics.inner.batch_duration_ms.read().len(), MAX_SAMPLES);
        // Oldest samples went first
        assert_eq!(metrics.inner.api_latency_ms.read().front(), Some(&500));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.api_calls_total, MAX_SAMPLES + 500);
        assert_eq!(snapshot.detections_total, MAX_SAMPLES + 500);
        assert_eq!(snapshot.api_latency_p50_ms, 999);
        assert_eq!(snapshot.batch_avg_ms, 7);
    }
}
