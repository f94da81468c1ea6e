//! Prometheus metrics exporter.

use crate::{Error, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Metrics configuration.
#[derive(Debug, Clone, Copy)]
pub struct MetricsConfig {
    /// Whether metrics are recorded at all.
    pub enabled: bool,
    /// Address of the scrape listener.
    pub listen_addr: SocketAddr,
}

impl MetricsConfig {
    /// Creates a configuration listening on all interfaces at `port`.
    #[must_use]
    pub const fn new(enabled: bool, port: u16) -> Self {
        Self {
            enabled,
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self::new(false, 9090)
    }
}

/// Installs the Prometheus recorder, with a scrape listener when `expose` is set.
///
/// Returns `None` when metrics are disabled; `metrics` macros are then no-ops.
pub fn install_prometheus(config: &MetricsConfig, expose: bool) -> Result<Option<PrometheusHandle>> {
    if !config.enabled {
        return Ok(None);
    }

    let builder = PrometheusBuilder::new();
    if !expose {
        return builder
            .install_recorder()
            .map(Some)
            .map_err(|e| Error::operation("metrics_recorder_install", e));
    }

    // The scrape listener binds a tokio socket, so it must be built inside the runtime.
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|e| Error::operation("metrics_listener_install", e))?;
    let (recorder, exporter) = {
        let _guard = runtime.enter();
        builder
            .with_http_listener(config.listen_addr)
            .build()
            .map_err(|e| Error::operation("metrics_exporter_build", e))?
    };
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|e| Error::operation("metrics_recorder_install", e))?;
    runtime.spawn(async move {
        if let Err(e) = exporter.await {
            tracing::error!(error = ?e, "Metrics listener stopped");
        }
    });
    tracing::info!(addr = %config.listen_addr, "Prometheus metrics listener started");
    Ok(Some(handle))
}
