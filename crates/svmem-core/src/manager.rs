//! Process-scoped SVM state

use crate::catalog::{Catalog, Platform};
use crate::config::Config;
use crate::context::SvmContext;
use crate::registry::{Registry, ResourceSnapshot};
use crate::report::{ExportFormat, Report};
use crate::runtime::{DeviceId, DeviceRuntime, PlatformId};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Owns the runtime, the resource registry and the configuration.
///
/// Create one per process (or per test) and pass it by reference; there is
/// no global instance. Contexts keep their own handles to the runtime and
/// registry, so the manager may be dropped before them.
pub struct SvmManager {
    runtime: Arc<dyn DeviceRuntime>,
    registry: Arc<Registry>,
    config: Config,
}

impl SvmManager {
    pub fn new(runtime: Arc<dyn DeviceRuntime>) -> Self {
        Self {
            runtime,
            registry: Arc::new(Registry::new()),
            config: Config::default(),
        }
    }

    pub fn with_config(runtime: Arc<dyn DeviceRuntime>, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            runtime,
            registry: Arc::new(Registry::new()),
            config,
        })
    }

    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.runtime
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Query every platform and device and record the result
    pub fn discover(&self) -> Result<Vec<Platform>> {
        let platforms = Catalog::discover(self.runtime.as_ref())?;
        let devices: usize = platforms.iter().map(|p| p.devices.len()).sum();
        info!(platforms = platforms.len(), devices, "devices discovered");
        self.registry.record_platforms(platforms.clone());
        Ok(platforms)
    }

    /// Bind a new context to `device` of `platform`.
    ///
    /// Runs discovery first if it has not happened yet.
    pub fn create_context(&self, platform: PlatformId, device: DeviceId) -> Result<SvmContext> {
        if !self.registry.has_platforms() {
            self.discover()?;
        }
        let device = self
            .registry
            .find_device(platform, device)
            .ok_or_else(|| Error::ContextCreation {
                reason: format!("device {} does not belong to platform {}", device, platform),
                status: None,
            })?;
        SvmContext::create(
            self.runtime.clone(),
            self.registry.clone(),
            device,
            &self.config,
        )
    }

    /// Context on the first device of the first platform that has one
    pub fn create_default_context(&self) -> Result<SvmContext> {
        if !self.registry.has_platforms() {
            self.discover()?;
        }
        let (platform, device) = self
            .registry
            .platforms()
            .iter()
            .find_map(|p| p.devices.first().map(|d| (p.id, d.id)))
            .ok_or_else(|| Error::ContextCreation {
                reason: "no device available".to_string(),
                status: None,
            })?;
        self.create_context(platform, device)
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        self.registry.snapshot()
    }

    pub fn report(&self) -> Report {
        Report::from_snapshot(&self.snapshot())
    }

    /// Serialized report; a degraded report (`ok = false`) is still returned
    pub fn export(&self, format: ExportFormat) -> Result<Vec<u8>> {
        let report = self.report();
        if !report.ok {
            debug!(errors = report.errors.len(), "exporting partial report");
        }
        report.to_bytes(format)
    }

    /// Teardown check: every context must be destroyed by now
    pub fn shutdown(self) -> Result<()> {
        let contexts = self.registry.context_count();
        if contexts > 0 {
            return Err(Error::ResourceLeak {
                owner: "registry".to_string(),
                live: contexts + self.registry.region_count(),
            });
        }
        info!("SVM manager shut down");
        Ok(())
    }
}
