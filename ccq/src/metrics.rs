use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram},
};
use opentelemetry_semantic_conventions::attribute::ERROR_TYPE;

use crate::chain::ChainId;

/// Instruments recorded by the query handler and publisher. Purely observational; nothing reads them back.
#[derive(Debug, Clone)]
pub struct QueryMetrics {
    requests_received: Counter<u64>,
    invalid_requests: Counter<u64>,
    requests_aborted: Counter<u64>,
    leg_dispatches: Counter<u64>,
    leg_retries: Counter<u64>,
    responses_completed: Counter<u64>,
    publication_retries: Counter<u64>,
    query_duration: Histogram<f64>,
}

fn chain_attribute(chain_id: ChainId) -> KeyValue {
    KeyValue::new("ccq.chain_id", i64::from(chain_id.0))
}

impl QueryMetrics {
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("ccq");
        QueryMetrics {
            requests_received: meter
                .u64_counter("ccq.requests.received")
                .with_description("Signed query requests received")
                .build(),
            invalid_requests: meter
                .u64_counter("ccq.requests.invalid")
                .with_description("Signed query requests rejected at admission")
                .build(),
            requests_aborted: meter
                .u64_counter("ccq.requests.aborted")
                .with_description("Admitted requests abandoned without a response")
                .build(),
            leg_dispatches: meter
                .u64_counter("ccq.legs.dispatched")
                .with_description("Per chain queries sent to watchers")
                .build(),
            leg_retries: meter
                .u64_counter("ccq.legs.retries")
                .with_description("Per chain queries which needed a retry")
                .build(),
            responses_completed: meter
                .u64_counter("ccq.responses.completed")
                .with_description("Requests fully answered and handed to the publisher")
                .build(),
            publication_retries: meter
                .u64_counter("ccq.responses.publication_retries")
                .with_description("Failed attempts to hand a response to the publication channel")
                .build(),
            query_duration: meter
                .f64_histogram("ccq.requests.duration")
                .with_unit("s")
                .with_boundaries(vec![
                    0.05, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0, 30.0, 60.0,
                ])
                .build(),
        }
    }

    pub fn request_received(&self) {
        self.requests_received.add(1, &[]);
    }

    pub fn request_rejected(&self, reason: &'static str) {
        self.invalid_requests
            .add(1, &[KeyValue::new(ERROR_TYPE, reason)]);
    }

    pub fn request_aborted(&self, reason: &'static str) {
        self.requests_aborted
            .add(1, &[KeyValue::new(ERROR_TYPE, reason)]);
    }

    pub fn leg_dispatched(&self, chain_id: ChainId) {
        self.leg_dispatches.add(1, &[chain_attribute(chain_id)]);
    }

    pub fn leg_retry(&self, chain_id: ChainId) {
        self.leg_retries.add(1, &[chain_attribute(chain_id)]);
    }

    pub fn response_completed(&self, elapsed_secs: f64) {
        self.responses_completed.add(1, &[]);
        self.query_duration.record(elapsed_secs, &[]);
    }

    pub fn publication_retry(&self) {
        self.publication_retries.add(1, &[]);
    }
}

impl Default for QueryMetrics {
    fn default() -> Self {
        Self::new()
    }
}
