use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rate_limited_responses: u64,
    pub retries: u64,
    pub avg_response_time_ms: f64,
    pub rate_limiter_wait_time_ms: f64,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct MetricsCollector {
    metrics: Arc<Mutex<ClientMetrics>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(Mutex::new(ClientMetrics::default())),
        }
    }

    pub fn record_request_start(&self) -> RequestTracker {
        RequestTracker {
            start_time: Instant::now(),
            collector: self.clone(),
        }
    }

    pub fn record_rate_limit_wait(&self, duration: Duration) {
        let mut metrics = self.lock();
        metrics.rate_limiter_wait_time_ms += duration.as_secs_f64() * 1000.0;
    }

    pub fn record_rate_limited(&self) {
        self.lock().rate_limited_responses += 1;
    }

    pub fn record_retry(&self) {
        self.lock().retries += 1;
    }

    pub fn record_error(&self, error: String) {
        let mut metrics = self.lock();
        metrics.last_error = Some(error);
        metrics.last_error_time = Some(Utc::now());
    }

    pub fn get_metrics(&self) -> ClientMetrics {
        self.lock().clone()
    }

    pub fn log_summary(&self) {
        let metrics = self.get_metrics();
        info!(
            "API requests: {} total, {} ok, {} failed, {} rate limited, {} retries, avg {:.1} ms, limiter wait {:.0} ms",
            metrics.total_requests,
            metrics.successful_requests,
            metrics.failed_requests,
            metrics.rate_limited_responses,
            metrics.retries,
            metrics.avg_response_time_ms,
            metrics.rate_limiter_wait_time_ms
        );
        if let (Some(error), Some(at)) = (&metrics.last_error, metrics.last_error_time) {
            info!("Last API error at {}: {}", at.to_rfc3339(), error);
        }
    }

    // Counters survive a poisoned lock.
    fn lock(&self) -> std::sync::MutexGuard<'_, ClientMetrics> {
        self.metrics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct RequestTracker {
    start_time: Instant,
    collector: MetricsCollector,
}

impl RequestTracker {
    pub fn finish(self, success: bool) {
        let duration = self.start_time.elapsed();
        let mut metrics = self.collector.lock();

        metrics.total_requests += 1;
        if success {
            metrics.successful_requests += 1;
        } else {
            metrics.failed_requests += 1;
        }

        // Exponential moving average; the first sample seeds it.
        let sample = duration.as_secs_f64() * 1000.0;
        metrics.avg_response_time_ms = if metrics.total_requests == 1 {
            sample
        } else {
            let alpha = 0.1;
            metrics.avg_response_time_ms * (1.0 - alpha) + sample * alpha
        };
    }
}
