//! Transport selection.

use std::sync::Arc;

use vitalbridge_core::{DaemonConfig, SimulatedTransport, Transport};

use crate::simulation;

/// The transport the daemon runs on.
pub enum SelectedTransport {
    /// Demo peripherals; the handle drives the measurement emitter.
    Simulated(SimulatedTransport),
    /// A real radio.
    Hardware(Arc<dyn Transport>),
}

impl SelectedTransport {
    /// The transport as the integration layer sees it.
    #[must_use]
    pub fn as_transport(&self) -> Arc<dyn Transport> {
        match self {
            Self::Simulated(simulated) => Arc::new(simulated.clone()),
            Self::Hardware(transport) => Arc::clone(transport),
        }
    }

    /// The simulated transport, in demo mode.
    #[must_use]
    pub const fn simulated(&self) -> Option<&SimulatedTransport> {
        match self {
            Self::Simulated(simulated) => Some(simulated),
            Self::Hardware(_) => None,
        }
    }
}

/// Pick a transport according to `daemon.simulate`.
///
/// # Errors
///
/// Returns an error if hardware is requested but the adapter is unavailable,
/// or if the daemon was built without the `bluetooth` feature.
pub async fn select(config: &DaemonConfig) -> anyhow::Result<SelectedTransport> {
    if config.simulate {
        tracing::info!("Using simulated demo devices");
        return Ok(SelectedTransport::Simulated(simulation::demo_transport()));
    }
    hardware().await
}

#[cfg(feature = "bluetooth")]
async fn hardware() -> anyhow::Result<SelectedTransport> {
    let transport = vitalbridge_core::BluezTransport::new().await?;
    tracing::info!("Using BlueZ transport");
    Ok(SelectedTransport::Hardware(Arc::new(transport)))
}

#[cfg(not(feature = "bluetooth"))]
#[allow(clippy::unused_async)]
async fn hardware() -> anyhow::Result<SelectedTransport> {
    anyhow::bail!(
        "daemon.simulate is false but this build has no Bluetooth support; \
         rebuild with --features bluetooth"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulate_selects_demo_devices() {
        let config = DaemonConfig {
            simulate: true,
            ..DaemonConfig::default()
        };
        let selected = select(&config).await.unwrap();
        assert!(selected.simulated().is_some());
    }

    #[cfg(not(feature = "bluetooth"))]
    #[tokio::test]
    async fn test_hardware_requires_bluetooth_feature() {
        let config = DaemonConfig {
            simulate: false,
            ..DaemonConfig::default()
        };
        assert!(select(&config).await.is_err());
    }
}
