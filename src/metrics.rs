//! Migration metrics and tracing helpers.
//!
//! With the `metrics` feature, [`METRICS`] records applied/reverted/failed
//! migration counts and per-version durations through OpenTelemetry, exported
//! for Prometheus scraping. With the `tracing` feature, [`tracing_helpers`]
//! provides the spans the runners and the PostgreSQL store enter.

#[cfg(feature = "metrics")]
pub use self::otel::{MigrationMetrics, METRICS};

#[cfg(feature = "metrics")]
mod otel {
    use once_cell::sync::Lazy;
    use opentelemetry::{
        global,
        metrics::{Counter, Histogram, Meter, MeterProvider},
        KeyValue,
    };
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use prometheus::{Registry, TextEncoder};
    use std::time::Duration;

    pub static METRICS: Lazy<MigrationMetrics> = Lazy::new(MigrationMetrics::init);

    pub struct MigrationMetrics {
        pub registry: Registry,
        pub provider: Option<SdkMeterProvider>,
        pub applied_total: Counter<u64>,
        pub reverted_total: Counter<u64>,
        pub failures_total: Counter<u64>,
        pub duration: Histogram<f64>,
    }

    impl MigrationMetrics {
        pub fn init() -> Self {
            let registry = Registry::new();
            let provider = match opentelemetry_prometheus::exporter()
                .with_registry(registry.clone())
                .build()
            {
                Ok(exporter) => Some(SdkMeterProvider::builder().with_reader(exporter).build()),
                Err(e) => {
                    log::warn!("failed to build prometheus exporter: {e}");
                    None
                }
            };
            let meter: Meter = match &provider {
                Some(provider) => provider.meter("driftguard"),
                None => global::meter("driftguard"),
            };

            let applied_total = meter
                .u64_counter("driftguard_migrations_applied_total")
                .with_description("Migration versions applied")
                .build();

            let reverted_total = meter
                .u64_counter("driftguard_migrations_reverted_total")
                .with_description("Migration versions reverted")
                .build();

            let failures_total = meter
                .u64_counter("driftguard_migration_failures_total")
                .with_description("Migration steps that failed")
                .build();

            let duration = meter
                .f64_histogram("driftguard_migration_duration_seconds")
                .with_description("Duration of a single migration step")
                .build();

            Self {
                registry,
                provider,
                applied_total,
                reverted_total,
                failures_total,
                duration,
            }
        }

        pub fn record_applied(&self, backend: &'static str, elapsed: Duration) {
            let attrs = [KeyValue::new("backend", backend)];
            self.applied_total.add(1, &attrs);
            self.duration.record(elapsed.as_secs_f64(), &attrs);
        }

        pub fn record_reverted(&self, backend: &'static str, elapsed: Duration) {
            let attrs = [KeyValue::new("backend", backend)];
            self.reverted_total.add(1, &attrs);
            self.duration.record(elapsed.as_secs_f64(), &attrs);
        }

        pub fn record_failure(&self, backend: &'static str, direction: &'static str) {
            self.failures_total.add(
                1,
                &[
                    KeyValue::new("backend", backend),
                    KeyValue::new("direction", direction),
                ],
            );
        }

        /// Prometheus text exposition of everything recorded so far
        pub fn render(&self) -> String {
            TextEncoder::new()
                .encode_to_string(&self.registry.gather())
                .unwrap_or_else(|e| {
                    log::warn!("failed to encode metrics: {e}");
                    String::new()
                })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_recorded_metrics_are_exported() {
            METRICS.record_applied("postgres", Duration::from_millis(5));
            METRICS.record_failure("document", "up");
            if METRICS.provider.is_some() {
                let text = METRICS.render();
                assert!(text.contains("driftguard_migrations_applied"), "{text}");
            }
        }
    }
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{info_span, Span};

    pub fn migration_span(backend: &'static str, direction: &'static str, version: i64) -> Span {
        info_span!("driftguard.migration", backend, direction, version)
    }

    pub fn execute_query_span(query: &str) -> Span {
        // Scripts can be long; keep the first line only
        let statement = query.trim().lines().next().unwrap_or_default();
        info_span!("driftguard.execute", db.statement = statement)
    }

    pub fn acquire_connection_span() -> Span {
        info_span!("driftguard.connect")
    }

    pub fn begin_transaction_span() -> Span {
        info_span!("driftguard.transaction.begin")
    }

    pub fn commit_transaction_span() -> Span {
        info_span!("driftguard.transaction.commit")
    }

    pub fn rollback_transaction_span() -> Span {
        info_span!("driftguard.transaction.rollback")
    }
}
