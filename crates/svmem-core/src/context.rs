//! SVM context and region allocation

use crate::arena::{Arena, SlotId};
use crate::caps::{CapabilityRecord, RegionFlags, SvmCapabilities};
use crate::catalog::Device;
use crate::config::{Config, DestroyPolicy};
use crate::registry::{ContextId, ContextStats, Region, Registry};
use crate::runtime::{DeviceRuntime, NativeContext, NativeQueue, SvmAddr};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Owned bookkeeping for one live region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    pub addr: SvmAddr,
    /// Size after alignment rounding
    pub size: usize,
    pub requested_size: usize,
    /// Normalized flags the region was allocated with
    pub flags: RegionFlags,
}

/// Binding of one native context and queue to one device.
///
/// `allocate`/`free`/`destroy` take `&mut self`: a context is not safe for
/// concurrent use from several threads without external synchronization.
pub struct SvmContext {
    id: ContextId,
    runtime: Arc<dyn DeviceRuntime>,
    registry: Arc<Registry>,
    device: Device,
    native: NativeContext,
    queue: NativeQueue,
    alignment: usize,
    policy: DestroyPolicy,
    regions: Arena<RegionInfo>,
    /// Slots with a live host mapping
    mapped: Mutex<BTreeSet<SlotId>>,
    destroyed: bool,
}

impl SvmContext {
    pub(crate) fn create(
        runtime: Arc<dyn DeviceRuntime>,
        registry: Arc<Registry>,
        device: Device,
        config: &Config,
    ) -> Result<Self> {
        let native = runtime
            .create_context(device.platform, device.id)
            .map_err(|e| Error::ContextCreation {
                reason: format!("{} rejected device {}", e.call, device.name),
                status: Some(e.status),
            })?;
        let queue = match runtime.create_queue(native, device.id) {
            Ok(queue) => queue,
            Err(e) => {
                if let Err(release) = runtime.release_context(native) {
                    warn!(status = release.status, "release after failed queue creation failed");
                }
                return Err(Error::ContextCreation {
                    reason: format!("{} failed for device {}", e.call, device.name),
                    status: Some(e.status),
                });
            }
        };

        let id = registry.register_context(device.platform, device.id);
        let alignment = device.alignment(config.default_alignment);
        info!(
            context = %id,
            device = %device.name,
            capabilities = %device.record.capabilities(),
            atomics = device.record.capabilities().contains(SvmCapabilities::ATOMICS),
            alignment,
            max_alloc = device.max_alloc_size,
            "SVM context created"
        );

        Ok(Self {
            id,
            runtime,
            registry,
            device,
            native,
            queue,
            alignment,
            policy: config.destroy_policy,
            regions: Arena::with_capacity(config.region_capacity),
            mapped: Mutex::new(BTreeSet::new()),
            destroyed: false,
        })
    }

    /// Registry id of this context
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Device the context was created on
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Capability record of the device
    pub fn record(&self) -> &CapabilityRecord {
        &self.device.record
    }

    /// Allocation alignment in bytes
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Whether destroy has completed
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Number of live regions owned by this context
    pub fn live_regions(&self) -> usize {
        self.regions.len()
    }

    /// Handles of all live regions
    pub fn regions(&self) -> Vec<Region> {
        self.regions
            .ids()
            .into_iter()
            .map(|slot| Region { context: self.id, slot })
            .collect()
    }

    /// Allocation statistics
    pub fn stats(&self) -> ContextStats {
        self.registry.stats(self.id).unwrap_or_default()
    }

    /// Bookkeeping for a live region of this context
    pub fn region_info(&self, region: Region) -> Result<RegionInfo> {
        self.ensure_live()?;
        self.lookup(region).copied()
    }

    /// Allocate a region.
    ///
    /// Flags are checked against the device's capability record before the
    /// runtime is called; a rejected request never reaches the driver.
    pub fn allocate(&mut self, size: usize, flags: RegionFlags) -> Result<Region> {
        self.ensure_live()?;
        if size == 0 {
            return Err(Error::InvalidArgument("allocation size must be > 0".to_string()));
        }
        let flags = self.device.record.validate(flags)?;
        if self.device.max_alloc_size > 0 && size as u64 > self.device.max_alloc_size {
            return Err(Error::InvalidArgument(format!(
                "size {} exceeds device max allocation {}",
                size, self.device.max_alloc_size
            )));
        }
        if self.regions.len() >= self.regions.capacity() {
            return Err(Error::InvalidArgument(format!(
                "context {} region capacity {} reached",
                self.id,
                self.regions.capacity()
            )));
        }
        let aligned = size
            .checked_add(self.alignment - 1)
            .map(|s| s & !(self.alignment - 1))
            .ok_or_else(|| Error::InvalidArgument(format!("size {} overflows alignment", size)))?;

        let addr = self.runtime.svm_alloc(self.native, aligned, self.alignment, flags)?;
        let info = RegionInfo {
            addr,
            size: aligned,
            requested_size: size,
            flags,
        };
        let slot = match self.regions.insert(info) {
            Ok(slot) => slot,
            Err(e) => {
                if let Err(free) = self.runtime.svm_free(self.native, addr) {
                    warn!(status = free.status, "free after failed bookkeeping failed");
                }
                return Err(e);
            }
        };
        let region = Region { context: self.id, slot };
        self.registry.register_region(region, addr, aligned, size, flags);
        debug!(region = %region, addr = %addr, size = aligned, flags = %flags, "region allocated");
        Ok(region)
    }

    /// Free a region; freeing it twice is `UseAfterFree`
    pub fn free(&mut self, region: Region) -> Result<()> {
        self.ensure_live()?;
        let addr = self.lookup(region)?.addr;
        self.runtime.svm_free(self.native, addr)?;
        self.registry.deregister_region(region);
        self.regions.remove(region.slot);
        debug!(region = %region, addr = %addr, "region freed");
        Ok(())
    }

    /// Destroy the context, exactly once.
    ///
    /// Live regions are handled per [`DestroyPolicy`]: `Strict` refuses with
    /// `ResourceLeak` and leaves the context usable, `Cascade` frees them first.
    pub fn destroy(&mut self) -> Result<()> {
        self.ensure_live()?;
        let live = self.regions.len();
        if live > 0 {
            match self.policy {
                DestroyPolicy::Strict => {
                    return Err(Error::ResourceLeak {
                        owner: self.id.to_string(),
                        live,
                    })
                }
                DestroyPolicy::Cascade => {
                    for region in self.regions() {
                        self.free(region)?;
                    }
                }
            }
        }
        self.release()
    }

    pub(crate) fn queue(&self) -> NativeQueue {
        self.queue
    }

    pub(crate) fn runtime(&self) -> &dyn DeviceRuntime {
        self.runtime.as_ref()
    }

    /// Mark a region as mapped; false if it already is
    pub(crate) fn claim_mapping(&self, region: Region) -> bool {
        self.mapped.lock().insert(region.slot)
    }

    pub(crate) fn release_mapping(&self, region: Region) {
        self.mapped.lock().remove(&region.slot);
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.destroyed {
            return Err(Error::UseAfterFree(format!("context {} already destroyed", self.id)));
        }
        Ok(())
    }

    pub(crate) fn lookup(&self, region: Region) -> Result<&RegionInfo> {
        if region.context != self.id {
            return Err(Error::InvalidArgument(format!(
                "region {} does not belong to context {}",
                region, self.id
            )));
        }
        self.regions
            .get(region.slot)
            .ok_or_else(|| Error::UseAfterFree(format!("region {} already freed", region)))
    }

    fn release(&mut self) -> Result<()> {
        self.destroyed = true;
        let stats = self.stats();
        self.registry.deregister_context(self.id);
        let queue = self.runtime.release_queue(self.queue);
        let context = self.runtime.release_context(self.native);
        info!(
            context = %self.id,
            allocations = stats.alloc_count,
            frees = stats.free_count,
            peak_bytes = stats.peak_bytes,
            "SVM context destroyed"
        );
        queue?;
        context?;
        Ok(())
    }
}

impl std::fmt::Debug for SvmContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SvmContext")
            .field("id", &self.id)
            .field("device", &self.device.name)
            .field("alignment", &self.alignment)
            .field("live_regions", &self.regions.len())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

impl Drop for SvmContext {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        let live = self.regions.len();
        if live > 0 {
            self.registry.note_dropped_regions(live);
            match self.policy {
                DestroyPolicy::Strict => error!(
                    context = %self.id,
                    live,
                    "context dropped with live regions under strict policy, freeing them"
                ),
                DestroyPolicy::Cascade => warn!(
                    context = %self.id,
                    live,
                    "context dropped with live regions, freeing them"
                ),
            }
        }
        for region in self.regions() {
            if let Err(e) = self.free(region) {
                warn!(region = %region, error = %e, "free during drop failed");
            }
        }
        if let Err(e) = self.release() {
            warn!(context = %self.id, error = %e, "release during drop failed");
        }
    }
}
