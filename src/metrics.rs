//! Process-wide Prometheus metrics registry, rendered as text exposition
//! at `/internal/metrics`.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

#[derive(Clone)]
pub struct MetricsExporter {
    handle: PrometheusHandle,
}

impl MetricsExporter {
    pub fn install() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus recorder")?;
        Ok(Self { handle })
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Adapter-call signals recorded by the router around every upstream call.
pub fn record_adapter_call(provider: &str, model: &str, status: &str, duration_secs: f64) {
    metrics::counter!("lkg_adapter_requests_total", "provider" => provider.to_string(), "model" => model.to_string(), "status" => status.to_string())
        .increment(1);
    metrics::histogram!("lkg_adapter_duration_seconds", "provider" => provider.to_string(), "model" => model.to_string())
        .record(duration_secs);
}

pub fn record_tokens(provider: &str, model: &str, kind: &str, count: u64) {
    metrics::counter!("lkg_adapter_tokens_total", "provider" => provider.to_string(), "model" => model.to_string(), "kind" => kind.to_string())
        .increment(count);
}

pub fn record_cost(provider: &str, model: &str, usd: f64) {
    metrics::gauge!("lkg_adapter_cost_usd_total", "provider" => provider.to_string(), "model" => model.to_string()).increment(usd);
}

pub fn record_auth_outcome(outcome: &str) {
    metrics::counter!("lkg_auth_requests_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn record_auth_cache_hit(hit: bool) {
    if hit {
        metrics::counter!("lkg_auth_cache_hits_total").increment(1);
    }
}

pub fn record_circuit_open(provider: &str) {
    metrics::counter!("lkg_circuit_open_total", "provider" => provider.to_string()).increment(1);
}

pub fn record_response_cache_outcome(hit: bool) {
    let label = if hit { "hit" } else { "miss" };
    metrics::counter!("lkg_response_cache_total", "outcome" => label).increment(1);
}
