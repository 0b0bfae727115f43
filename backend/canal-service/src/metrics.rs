use actix_web::{HttpResponse, Responder};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, TextEncoder};
use tracing::warn;

/// Counters for the consume loop, registered in the default registry.
pub struct CanalMetrics {
    /// Messages handed to the dispatcher, by stream
    pub messages_received_total: IntCounterVec,
    /// Messages acknowledged after successful handling, by stream
    pub messages_acked_total: IntCounterVec,
    /// Messages whose handler returned an error
    pub messages_failed_total: IntCounter,
    /// Malformed transport entries acknowledged and skipped
    pub messages_dropped_total: IntCounter,
    /// Fetch/read errors retried by the consume loop
    pub read_errors_total: IntCounter,
    /// Change events routed to a handler, by table and op
    pub change_events_total: IntCounterVec,
}

impl CanalMetrics {
    fn new() -> Self {
        let registry = prometheus::default_registry();

        let messages_received_total = IntCounterVec::new(
            Opts::new(
                "canal_messages_received_total",
                "Total number of change stream messages received",
            ),
            &["stream"],
        )
        .expect("valid metric for canal_messages_received_total");

        let messages_acked_total = IntCounterVec::new(
            Opts::new(
                "canal_messages_acked_total",
                "Total number of change stream messages acknowledged",
            ),
            &["stream"],
        )
        .expect("valid metric for canal_messages_acked_total");

        let messages_failed_total = IntCounter::new(
            "canal_messages_failed_total",
            "Total number of messages whose handler failed",
        )
        .expect("valid metric for canal_messages_failed_total");

        let messages_dropped_total = IntCounter::new(
            "canal_messages_dropped_total",
            "Total number of malformed messages acknowledged and skipped",
        )
        .expect("valid metric for canal_messages_dropped_total");

        let read_errors_total = IntCounter::new(
            "canal_read_errors_total",
            "Total number of transport read errors",
        )
        .expect("valid metric for canal_read_errors_total");

        let change_events_total = IntCounterVec::new(
            Opts::new(
                "canal_change_events_total",
                "Total number of change events dispatched to a table handler",
            ),
            &["table", "op"],
        )
        .expect("valid metric for canal_change_events_total");

        for metric in [
            Box::new(messages_received_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(messages_acked_total.clone()),
            Box::new(messages_failed_total.clone()),
            Box::new(messages_dropped_total.clone()),
            Box::new(read_errors_total.clone()),
            Box::new(change_events_total.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!(error = %e, "failed to register canal metric");
            }
        }

        Self {
            messages_received_total,
            messages_acked_total,
            messages_failed_total,
            messages_dropped_total,
            read_errors_total,
            change_events_total,
        }
    }
}

static METRICS: Lazy<CanalMetrics> = Lazy::new(CanalMetrics::new);

pub fn metrics() -> &'static CanalMetrics {
    &METRICS
}

/// Handler that serialises Prometheus metrics in text format.
pub async fn metrics_handler() -> impl Responder {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => HttpResponse::Ok()
            .content_type(encoder.format_type())
            .body(buffer),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

pub async fn health_handler() -> impl Responder {
    HttpResponse::Ok().body("ok")
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, web, App};

    #[actix_web::test]
    async fn test_metrics_endpoint_exposes_canal_counters() {
        metrics().read_errors_total.inc();
        metrics()
            .change_events_total
            .with_label_values(&["chii_members", "u"])
            .inc();

        let app = test::init_service(
            App::new().route("/metrics", web::get().to(metrics_handler)),
        )
        .await;
        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body = test::call_and_read_body(&app, req).await;
        let text = String::from_utf8(body.to_vec()).expect("utf8");

        assert!(text.contains("canal_read_errors_total"));
        assert!(text.contains("canal_change_events_total{op=\"u\",table=\"chii_members\"}"));
    }

    #[actix_web::test]
    async fn test_health_endpoint() {
        let app =
            test::init_service(App::new().route("/health", web::get().to(health_handler))).await;
        let req = test::TestRequest::get().uri("/health").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
    }

    #[::core::prelude::v1::test]
    fn test_duplicate_registration_is_not_fatal() {
        metrics().messages_dropped_total.inc();

        let duplicate = CanalMetrics::new();
        duplicate.messages_dropped_total.inc();
        assert_eq!(duplicate.messages_dropped_total.get(), 1);
    }
}
