use std::sync::OnceLock;

use anyhow::Result;
use metrics::gauge;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tapglue_domain::distributor::DistributorState;

const STATE_GAUGE: &str = "tapglue_distributor_state";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_metrics() -> Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = METRICS_HANDLE.set(handle);
    Ok(())
}

pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

/// One series per state, 1 for the current one.
pub fn set_state(current: DistributorState) {
    for state in [
        DistributorState::Init,
        DistributorState::Resolve,
        DistributorState::Consuming,
        DistributorState::Draining,
        DistributorState::Terminated,
    ] {
        let value = if state == current { 1.0 } else { 0.0 };
        gauge!(STATE_GAUGE, "state" => state.as_str()).set(value);
    }
}
