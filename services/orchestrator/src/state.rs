//! Application state shared across request handlers.

use std::sync::Arc;

use anyhow::Context;

use crate::bus::EventBus;
use crate::config::{Config, Isolation};
use crate::lease::LeaseManager;
use crate::planner::CapacityPlanner;
use crate::provisioner::Provisioner;
use crate::registry::{self, Registry, SharedRegistry};
use crate::runner::GroupRunner;
use crate::scheduler::{GroupLauncher, PoolScheduler, ProcessLauncher, TaskLauncher};

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    registry: SharedRegistry,
    bus: EventBus,
    planner: CapacityPlanner,
    scheduler: PoolScheduler,
    leases: Arc<LeaseManager>,
}

impl AppState {
    /// Wire the orchestrator around an opened registry and a launcher.
    pub fn new(
        config: Config,
        registry: SharedRegistry,
        leases: Arc<LeaseManager>,
        launcher: Arc<dyn GroupLauncher>,
    ) -> anyhow::Result<Self> {
        let bus = EventBus::default();
        let provisioner =
            Provisioner::new(&config.provisioner).context("invalid template name pattern")?;
        let planner = CapacityPlanner::new(registry.clone(), provisioner, bus.clone());
        let scheduler =
            PoolScheduler::new(registry.clone(), bus.clone(), launcher).with_slots(config.slots);
        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                registry,
                bus,
                planner,
                scheduler,
                leases,
            }),
        })
    }

    /// Open the registry file and pick the launcher for the configured
    /// isolation mode.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let registry = Registry::open(&config.database_path).with_context(|| {
            format!("opening registry {}", config.database_path.display())
        })?;
        let leases = Arc::new(LeaseManager::from_config(&config)?);
        let launcher: Arc<dyn GroupLauncher> = match config.isolation {
            Isolation::Process => Arc::new(ProcessLauncher::current_exe()?),
            Isolation::Task => Arc::new(TaskLauncher::new(Arc::new(GroupRunner::from_config(
                &config,
                leases.clone(),
            )?))),
        };
        Self::new(config, registry::shared(registry), leases, launcher)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.inner.registry
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn planner(&self) -> &CapacityPlanner {
        &self.inner.planner
    }

    pub fn scheduler(&self) -> &PoolScheduler {
        &self.inner.scheduler
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.inner.leases
    }
}
