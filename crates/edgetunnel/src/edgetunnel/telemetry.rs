use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const PACKETS_FORWARDED: &str = "edgetunnel_packets_forwarded_total";
pub const FORWARD_ERRORS: &str = "edgetunnel_forward_errors_total";
pub const PACKETS_DROPPED: &str = "edgetunnel_packets_dropped_total";
pub const CIRCUITS_OPENED: &str = "edgetunnel_circuits_opened_total";
pub const ACTIVE_CIRCUITS: &str = "edgetunnel_active_circuits";
pub const NEIGHBORS: &str = "edgetunnel_neighbors";

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")?;
    describe();
    Ok(handle)
}

fn describe() {
    metrics::describe_counter!(
        PACKETS_FORWARDED,
        "Packets relayed to another neighbor."
    );
    metrics::describe_counter!(
        FORWARD_ERRORS,
        "Packets that could not be relayed toward their destination."
    );
    metrics::describe_counter!(
        PACKETS_DROPPED,
        "Packets dropped because a circuit inbox was full."
    );
    metrics::describe_counter!(CIRCUITS_OPENED, "Circuits opened or accepted locally.");
    metrics::describe_gauge!(ACTIVE_CIRCUITS, "Circuits currently terminating at this peer.");
    metrics::describe_gauge!(NEIGHBORS, "Directly connected neighbors.");
}

pub type SharedPrometheusHandle = std::sync::Arc<PrometheusHandle>;
