//! netforge: multi-port network traffic generator and impairment emulator.
//!
//! The whole runtime hangs off one [`Core`] value with an explicit
//! lifecycle (`start → adapter → shutdown`); there is no module-level
//! singleton state. External control surfaces talk to the core only
//! through [`ControlAdapter`].

pub mod bench;
pub mod clock;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod frame;
pub mod model;
pub mod persist;
pub mod ports;
pub mod probe;
pub mod registry;
pub mod transmit;

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use bench::BenchDriver;
use engine::Engine;
use persist::ConfigStore;
use probe::Prober;
use registry::Registry;
use transmit::endpoint::RawEndpoint;
use transmit::Transmitter;

pub use control::{Command, ControlAdapter, Reply};
pub use error::CoreError;
pub use model::{PortInfo, ProfileConfig};

/// Opens a raw endpoint bound to one named port. The core calls it once
/// per port for the transmitter and again for benchmark receive sockets.
pub type EndpointProvider = Arc<dyn Fn(&str) -> anyhow::Result<Arc<dyn RawEndpoint>> + Send + Sync>;

/// The default provider: an `AF_PACKET` socket per port.
#[cfg(target_os = "linux")]
pub fn afpacket_provider() -> EndpointProvider {
    Arc::new(|device| {
        Ok(Arc::new(transmit::endpoint::AfPacketEndpoint::open(device)?) as Arc<dyn RawEndpoint>)
    })
}

#[derive(Debug, Clone, Default)]
pub struct CoreOptions {
    /// Persisted configuration file; `None` disables persistence.
    pub config_path: Option<PathBuf>,
}

/// The assembled traffic core.
pub struct Core {
    registry: Arc<Registry>,
    transmitters: Arc<DashMap<String, Transmitter>>,
    adapter: ControlAdapter,
    prober_task: tokio::task::JoinHandle<()>,
}

impl Core {
    /// Enumerate host ports and bring the core up.
    pub async fn start(options: CoreOptions, provider: EndpointProvider) -> anyhow::Result<Core> {
        let lldp = Prober::sense_lldp().await;
        Self::start_with_ports(options, provider, ports::enumerate(), lldp).await
    }

    /// Bring the core up over an explicit port list. Used directly by
    /// tests and embedders with their own enumeration.
    pub async fn start_with_ports(
        options: CoreOptions,
        provider: EndpointProvider,
        port_infos: Vec<PortInfo>,
        lldp_available: bool,
    ) -> anyhow::Result<Core> {
        let registry = Arc::new(Registry::new());
        let transmitters: Arc<DashMap<String, Transmitter>> = Arc::new(DashMap::new());

        for info in port_infos {
            let name = info.name.clone();
            let mtu = info.mtu;
            let entry = registry.add_port(info);
            match provider(&name) {
                Ok(ep) => {
                    transmitters.insert(
                        name.clone(),
                        Transmitter::spawn(
                            &name,
                            ep,
                            Arc::clone(&entry.counters),
                            Arc::clone(&entry.link_up),
                            mtu,
                        ),
                    );
                }
                Err(e) => {
                    // The port stays listed; enabling a profile on it
                    // reports PortUnavailable.
                    tracing::warn!("no raw endpoint on {name}: {e:#}");
                }
            }
        }

        let engine = Arc::new(Engine::new(Arc::clone(&registry), Arc::clone(&transmitters)));
        let prober = Arc::new(Prober::new(Arc::clone(&registry), lldp_available));
        let bench = Arc::new(BenchDriver::new(
            Arc::clone(&registry),
            Arc::clone(&transmitters),
            Arc::clone(&provider),
        ));
        let store = options.config_path.map(|p| Arc::new(ConfigStore::new(p)));

        let adapter = ControlAdapter::new(
            Arc::clone(&registry),
            engine,
            Arc::clone(&prober),
            bench,
            store.clone(),
        );

        if let Some(store) = &store {
            let persisted = store.load()?;
            adapter.restore(persisted).await;
        }

        let prober_task = prober.spawn();
        tracing::info!("core started");
        Ok(Core { registry, transmitters, adapter, prober_task })
    }

    /// The control boundary handed to external surfaces.
    pub fn adapter(&self) -> ControlAdapter {
        self.adapter.clone()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Disable all running profiles within their grace periods, stop the
    /// transmitters, and halt background tasks.
    pub async fn shutdown(self) {
        tracing::info!("core shutting down");
        self.adapter.quiesce().await;
        for entry in self.transmitters.iter() {
            entry.value().shutdown().await;
        }
        self.prober_task.abort();
        tracing::info!("core stopped");
    }
}
