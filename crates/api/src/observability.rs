use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use axum::http::StatusCode;
use metrics::{Label, counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

const HTTP_REQUESTS_TOTAL: &str = "reverie_api_http_requests_total";
const HTTP_REQUEST_DURATION_SECONDS: &str = "reverie_api_http_request_duration_seconds";
const HTTP_SERVER_ERRORS_TOTAL: &str = "reverie_api_http_server_errors_total";
const AUTH_REJECTIONS_TOTAL: &str = "reverie_api_auth_rejections_total";

static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the process-wide Prometheus recorder. Domain counters such as
/// idempotency outcomes land in the same registry.
pub fn init_metrics() -> Result<()> {
    if RECORDER.get().is_some() {
        return Ok(());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = RECORDER.set(handle);
    Ok(())
}

pub fn render_metrics() -> Option<String> {
    RECORDER.get().map(PrometheusHandle::render)
}

/// Per-request dimensions. `keyed` marks requests that carried a client
/// idempotency key.
#[derive(Debug, Clone)]
pub struct RequestLabels {
    pub method: String,
    pub route: String,
    pub keyed: bool,
}

impl RequestLabels {
    fn with_status(&self, status: StatusCode) -> Vec<Label> {
        vec![
            Label::new("method", self.method.clone()),
            Label::new("route", self.route.clone()),
            Label::new("status", status.as_u16().to_string()),
            Label::new("keyed", if self.keyed { "true" } else { "false" }),
        ]
    }
}

pub fn register_http_request(labels: &RequestLabels, status: StatusCode, elapsed: Duration) {
    let labels = labels.with_status(status);
    counter!(HTTP_REQUESTS_TOTAL, labels.clone()).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, labels.clone()).record(elapsed.as_secs_f64());
    if status.is_server_error() {
        counter!(HTTP_SERVER_ERRORS_TOTAL, labels).increment(1);
    }
}

pub fn register_auth_rejection(reason: &'static str) {
    counter!(AUTH_REJECTIONS_TOTAL, "reason" => reason).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_carry_status_and_key_presence() {
        let labels = RequestLabels {
            method: "POST".into(),
            route: "/v1/journal-entries".into(),
            keyed: true,
        }
        .with_status(StatusCode::CONFLICT);
        let pairs: Vec<(&str, &str)> = labels.iter().map(|l| (l.key(), l.value())).collect();
        assert_eq!(
            pairs,
            vec![
                ("method", "POST"),
                ("route", "/v1/journal-entries"),
                ("status", "409"),
                ("keyed", "true"),
            ]
        );
    }
}
