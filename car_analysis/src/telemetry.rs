use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;

pub struct Metrics {
    request_counter: Counter<u64>,
    analysis_duration: Histogram<u64>,
    cars_detected: Counter<u64>,
    red_cars_detected: Counter<u64>,
    _provider: SdkMeterProvider,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = SdkMeterProvider::builder().with_reader(exporter).build();

        let meter = provider.meter("car_analysis");
        global::set_meter_provider(provider.clone());

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of requests")
            .build();

        let analysis_duration = meter
            .u64_histogram("analysis_duration_ms")
            .with_boundaries(exponential_boundaries(25.0, 2.0, 12))
            .with_description("Duration of image analysis in milliseconds")
            .build();

        let cars_detected = meter
            .u64_counter("cars_detected_total")
            .with_description("Cars found across all analysed images")
            .build();

        let red_cars_detected = meter
            .u64_counter("red_cars_detected_total")
            .with_description("Red cars found across all analysed images")
            .build();

        Ok(Metrics {
            request_counter,
            analysis_duration,
            cars_detected,
            red_cars_detected,
            _provider: provider,
            registry,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_analysis_duration(&self, duration_ms: u64, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.analysis_duration.record(duration_ms, &attributes);
    }

    pub fn record_cars(&self, total_cars: u32, red_cars: u32) {
        self.cars_detected.add(total_cars as u64, &[]);
        self.red_cars_detected.add(red_cars as u64, &[]);
    }
}

/// `count` bucket boundaries starting at `start`, each `factor` times the previous.
fn exponential_boundaries(start: f64, factor: f64, count: usize) -> Vec<f64> {
    std::iter::successors(Some(start), |previous| Some(previous * factor))
        .take(count)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_boundaries() {
        let get = exponential_boundaries(25.0, 2.0, 5);
        let expected = vec![25.0, 50.0, 100.0, 200.0, 400.0];

        assert_eq!(get, expected);
        assert!(exponential_boundaries(1.0, 3.0, 0).is_empty());
    }

    #[test]
    fn test_metrics_are_exported() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request("/analyze-image/");
        metrics.record_analysis_duration(120, "/analyze-image/");
        metrics.record_cars(3, 1);

        let families = metrics.registry.gather();

        assert!(families
            .iter()
            .any(|family| family.get_name().starts_with("requests_total")));
    }
}
