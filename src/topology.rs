//! Machine layout and construction of the orchestration tree.
//!
//! The layout is plain data (and part of [`SetupConfig`]); [`Topology::build`]
//! turns it into an owned tree of orchestrators that callers pass around by
//! reference. There is no process-wide registry.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::allocator::AmplitudeAllocator;
use crate::cavity::{CavityId, PipelineSettings, SetupCavity};
use crate::config::SetupConfig;
use crate::control_point::{LocalTransport, PvValue, Transport};
use crate::driver::sim::SimulatedCavity;
use crate::driver::CavityDriver;
use crate::error::{AppResult, SetupError, SetupFault};
use crate::naming;
use crate::orchestrator::{Cryomodule, DeviceOrchestrator, Linac, Machine};
use crate::pool::WorkerPool;

/// Cavities in every cryomodule.
pub const CAVITIES_PER_CRYOMODULE: u8 = 8;

/// One linac section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinacLayout {
    /// Section name, e.g. "L1B"
    pub name: String,
    /// Index used in control-point names
    pub index: u8,
    /// Cryomodule names in launch order
    pub cryomodules: Vec<String>,
    /// Harmonic linearizer section; shares its index with L1B
    #[serde(default)]
    pub harmonic_linearizer: bool,
}

impl LinacLayout {
    fn new(name: &str, index: u8, cryomodules: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            index,
            cryomodules,
            harmonic_linearizer: false,
        }
    }
}

/// The deployed machine: L0B, L1B, the harmonic linearizer, L2B and L3B.
pub fn deployed_linacs() -> Vec<LinacLayout> {
    let numbered = |range: std::ops::RangeInclusive<u8>| -> Vec<String> {
        range.map(|n| format!("{n:02}")).collect()
    };

    vec![
        LinacLayout::new("L0B", 0, vec!["01".into()]),
        LinacLayout::new("L1B", 1, vec!["02".into(), "03".into()]),
        LinacLayout {
            harmonic_linearizer: true,
            ..LinacLayout::new("L1BHL", 1, vec!["H1".into(), "H2".into()])
        },
        LinacLayout::new("L2B", 2, numbered(4..=15)),
        LinacLayout::new("L3B", 3, numbered(16..=35)),
    ]
}

/// Constructs the driver for one cavity.
pub type DriverFactory<'a> =
    dyn Fn(&CavityId) -> Result<Arc<dyn CavityDriver>, SetupFault> + 'a;

/// The built orchestration tree.
#[derive(Debug)]
pub struct Topology {
    machine: Arc<Machine>,
    pool: WorkerPool,
}

impl Topology {
    /// Build the tree described by `config`.
    ///
    /// Every cavity binds its control points through `transport`; `drivers`
    /// supplies the hardware side of each cavity.
    pub fn build(
        config: &SetupConfig,
        transport: &dyn Transport,
        drivers: &DriverFactory<'_>,
    ) -> AppResult<Self> {
        let pool = WorkerPool::new(config.worker_threads);
        let allocator = AmplitudeAllocator::new(config.amplitude_tolerance);
        let stagger = config.launch_stagger();
        let settings = PipelineSettings {
            ramp_step: config.ramp_step,
            initial_amplitude_cap: config.initial_amplitude_cap,
        };

        let mut linacs = Vec::with_capacity(config.linacs.len());
        for layout in &config.linacs {
            let mut cryomodules = Vec::with_capacity(layout.cryomodules.len());
            for cm in &layout.cryomodules {
                let mut devices = Vec::with_capacity(usize::from(CAVITIES_PER_CRYOMODULE));
                for number in 1..=CAVITIES_PER_CRYOMODULE {
                    let id = CavityId {
                        linac_index: layout.index,
                        cryomodule: cm.clone(),
                        number,
                    };
                    let driver = drivers(&id)?;
                    let cavity = SetupCavity::bind(id, transport, driver, settings)?;
                    devices.push(Arc::new(DeviceOrchestrator::new(
                        Arc::new(cavity),
                        pool.clone(),
                    )));
                }
                cryomodules.push(Arc::new(Cryomodule::bind(
                    format!("CM{cm}"),
                    &naming::cryomodule_prefix(layout.index, cm),
                    transport,
                    devices,
                    allocator,
                    stagger,
                )?));
            }
            linacs.push(Arc::new(Linac::bind(
                layout.name.clone(),
                &naming::linac_prefix(layout.index, layout.harmonic_linearizer),
                transport,
                cryomodules,
                allocator,
                stagger,
            )?));
        }

        let machine = Arc::new(Machine::bind(
            "Machine",
            naming::MACHINE_PREFIX,
            transport,
            linacs,
            allocator,
            stagger,
        )?);

        tracing::info!(
            linacs = config.linacs.len(),
            workers = pool.max_workers(),
            "orchestration tree built"
        );
        Ok(Self { machine, pool })
    }

    /// Build the tree on simulated cavities.
    ///
    /// Cavity ceilings not already present on `transport` are seeded from
    /// `config.cavity_amplitude_max`.
    pub fn simulated(config: &SetupConfig, transport: &LocalTransport) -> AppResult<Self> {
        let factory = |id: &CavityId| -> Result<Arc<dyn CavityDriver>, SetupFault> {
            let prefix = id.prefix();
            let ceiling = format!("{prefix}{}", naming::AMPLITUDE_MAX);
            if transport.peek(&ceiling).is_none() {
                transport.seed(&ceiling, PvValue::Float(config.cavity_amplitude_max));
            }
            Ok(Arc::new(SimulatedCavity::new(transport, &prefix)?))
        };
        Self::build(config, transport, &factory)
    }

    /// Root of the tree.
    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// Shared worker pool.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Linac section by name, e.g. "L2B".
    pub fn linac(&self, name: &str) -> AppResult<&Arc<Linac>> {
        self.machine
            .child(name)
            .ok_or_else(|| SetupError::UnknownLinac(name.to_string()))
    }

    /// Cryomodule by name, with or without the "CM" prefix.
    pub fn cryomodule(&self, name: &str) -> AppResult<&Arc<Cryomodule>> {
        let wanted = format!("CM{}", name.trim_start_matches("CM"));
        self.machine
            .children()
            .iter()
            .find_map(|linac| linac.child(&wanted))
            .ok_or_else(|| SetupError::UnknownCryomodule(name.to_string()))
    }

    /// Cavity `number` of cryomodule `cryomodule`.
    pub fn cavity(&self, cryomodule: &str, number: u8) -> AppResult<&Arc<DeviceOrchestrator>> {
        self.cryomodule(cryomodule)?
            .children()
            .iter()
            .find(|d| d.cavity().id().number == number)
            .ok_or_else(|| SetupError::UnknownCavity {
                cryomodule: cryomodule.to_string(),
                cavity: number,
            })
    }

    /// Every cavity in launch order.
    pub fn devices(&self) -> impl Iterator<Item = &Arc<DeviceOrchestrator>> {
        self.machine
            .children()
            .iter()
            .flat_map(|linac| linac.children())
            .flat_map(|cm| cm.children())
    }
}
