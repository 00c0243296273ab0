//! Process-scoped resource registry
//!
//! Mirrors every platform, context and region by non-owning id. All
//! mutations and snapshot reads go through one lock, so a snapshot never
//! observes a half-applied allocate or free.

use crate::arena::SlotId;
use crate::caps::RegionFlags;
use crate::catalog::{Device, NativeString, Platform};
use crate::runtime::{DeviceId, NativeError, PlatformId, SvmAddr};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Registry-assigned context id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Handle to one live region: owning context plus a generation-checked slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Region {
    pub(crate) context: ContextId,
    pub(crate) slot: SlotId,
}

impl Region {
    /// Get owning context
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Get slot index
    pub fn index(&self) -> u32 {
        self.slot.index
    }

    /// Get slot generation
    pub fn generation(&self) -> u32 {
        self.slot.generation
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/region#{}.{}", self.context, self.slot.index, self.slot.generation)
    }
}

/// Per-context allocation statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextStats {
    pub live_bytes: u64,
    pub peak_bytes: u64,
    pub alloc_count: u64,
    pub free_count: u64,
}

impl ContextStats {
    fn on_alloc(&mut self, size: usize) {
        self.live_bytes += size as u64;
        self.peak_bytes = self.peak_bytes.max(self.live_bytes);
        self.alloc_count += 1;
    }

    fn on_free(&mut self, size: usize) {
        self.live_bytes = self.live_bytes.saturating_sub(size as u64);
        self.free_count += 1;
    }
}

/// Registry view of one region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSnapshot {
    pub region: Region,
    pub addr: SvmAddr,
    /// Size after alignment rounding
    pub size: usize,
    pub requested_size: usize,
    pub flags: RegionFlags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSnapshot {
    pub id: ContextId,
    pub platform: PlatformId,
    pub device: DeviceId,
    pub stats: ContextStats,
    pub regions: Vec<RegionSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub device: Device,
    pub contexts: Vec<ContextSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformSnapshot {
    pub id: PlatformId,
    pub name: NativeString,
    pub vendor: NativeString,
    pub version: String,
    pub devices: Vec<DeviceSnapshot>,
    /// Device enumeration failure recorded at discovery
    pub device_error: Option<NativeError>,
}

/// Immutable point-in-time copy of the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSnapshot {
    /// Registry mutation counter at the time of the copy
    pub sequence: u64,
    pub platforms: Vec<PlatformSnapshot>,
    /// Contexts whose device is absent from the latest discovery
    pub detached: Vec<ContextSnapshot>,
}

impl ResourceSnapshot {
    pub fn device_count(&self) -> usize {
        self.platforms.iter().map(|p| p.devices.len()).sum()
    }

    pub fn contexts(&self) -> impl Iterator<Item = &ContextSnapshot> {
        self.platforms
            .iter()
            .flat_map(|p| p.devices.iter())
            .flat_map(|d| d.contexts.iter())
            .chain(self.detached.iter())
    }

    /// Contexts in the snapshot, detached ones included
    pub fn context_count(&self) -> usize {
        self.contexts().count()
    }

    pub fn regions(&self) -> impl Iterator<Item = &RegionSnapshot> {
        self.contexts().flat_map(|c| c.regions.iter())
    }

    pub fn region_count(&self) -> usize {
        self.regions().count()
    }

    pub fn contains(&self, region: Region) -> bool {
        self.regions().any(|r| r.region == region)
    }

    /// Devices in platform order, flattened
    pub fn devices(&self) -> impl Iterator<Item = &DeviceSnapshot> {
        self.platforms.iter().flat_map(|p| p.devices.iter())
    }
}

struct RegionEntry {
    addr: SvmAddr,
    size: usize,
    requested_size: usize,
    flags: RegionFlags,
}

struct ContextEntry {
    platform: PlatformId,
    device: DeviceId,
    stats: ContextStats,
    regions: BTreeMap<SlotId, RegionEntry>,
}

impl ContextEntry {
    fn snapshot(&self, id: ContextId) -> ContextSnapshot {
        ContextSnapshot {
            id,
            platform: self.platform,
            device: self.device,
            stats: self.stats,
            regions: self
                .regions
                .iter()
                .map(|(slot, r)| RegionSnapshot {
                    region: Region {
                        context: id,
                        slot: *slot,
                    },
                    addr: r.addr,
                    size: r.size,
                    requested_size: r.requested_size,
                    flags: r.flags,
                })
                .collect(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    sequence: u64,
    next_context: u64,
    platforms: Vec<Platform>,
    contexts: BTreeMap<ContextId, ContextEntry>,
    dropped_regions: u64,
}

/// Lock-protected index of live resources
#[derive(Default)]
pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the discovered platform list
    pub fn record_platforms(&self, platforms: Vec<Platform>) {
        let mut state = self.state.lock();
        state.platforms = platforms;
        state.sequence += 1;
    }

    pub fn platforms(&self) -> Vec<Platform> {
        self.state.lock().platforms.clone()
    }

    pub fn has_platforms(&self) -> bool {
        !self.state.lock().platforms.is_empty()
    }

    /// Device `device` if it belongs to platform `platform`
    pub fn find_device(&self, platform: PlatformId, device: DeviceId) -> Option<Device> {
        let state = self.state.lock();
        state
            .platforms
            .iter()
            .find(|p| p.id == platform)
            .and_then(|p| p.device(device))
            .cloned()
    }

    pub(crate) fn register_context(&self, platform: PlatformId, device: DeviceId) -> ContextId {
        let mut state = self.state.lock();
        state.next_context += 1;
        let id = ContextId(state.next_context);
        state.contexts.insert(
            id,
            ContextEntry {
                platform,
                device,
                stats: ContextStats::default(),
                regions: BTreeMap::new(),
            },
        );
        state.sequence += 1;
        id
    }

    /// Remove a context and any regions still mirrored under it
    pub(crate) fn deregister_context(&self, id: ContextId) -> bool {
        let mut state = self.state.lock();
        let removed = state.contexts.remove(&id).is_some();
        if removed {
            state.sequence += 1;
        }
        removed
    }

    pub(crate) fn register_region(
        &self,
        region: Region,
        addr: SvmAddr,
        size: usize,
        requested_size: usize,
        flags: RegionFlags,
    ) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.contexts.get_mut(&region.context) else {
            return false;
        };
        entry.stats.on_alloc(size);
        entry.regions.insert(
            region.slot,
            RegionEntry {
                addr,
                size,
                requested_size,
                flags,
            },
        );
        state.sequence += 1;
        true
    }

    pub(crate) fn deregister_region(&self, region: Region) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.contexts.get_mut(&region.context) else {
            return false;
        };
        let Some(removed) = entry.regions.remove(&region.slot) else {
            return false;
        };
        entry.stats.on_free(removed.size);
        state.sequence += 1;
        true
    }

    /// Statistics of a registered context
    pub fn stats(&self, id: ContextId) -> Option<ContextStats> {
        self.state.lock().contexts.get(&id).map(|c| c.stats)
    }

    /// Number of registered contexts
    pub fn context_count(&self) -> usize {
        self.state.lock().contexts.len()
    }

    /// Number of registered regions across all contexts
    pub fn region_count(&self) -> usize {
        self.state
            .lock()
            .contexts
            .values()
            .map(|c| c.regions.len())
            .sum()
    }

    /// Count regions released by dropping their context instead of freeing them
    pub fn note_dropped_regions(&self, count: usize) {
        self.state.lock().dropped_regions += count as u64;
    }

    /// Regions released by a context drop since the registry was created
    pub fn dropped_regions(&self) -> u64 {
        self.state.lock().dropped_regions
    }

    /// True when no context (and hence no region) is registered
    pub fn is_empty(&self) -> bool {
        self.state.lock().contexts.is_empty()
    }

    /// Deep copy of the current state
    pub fn snapshot(&self) -> ResourceSnapshot {
        let state = self.state.lock();
        let mut attached = Vec::new();
        let platforms = state
            .platforms
            .iter()
            .map(|p| PlatformSnapshot {
                id: p.id,
                name: p.name.clone(),
                vendor: p.vendor.clone(),
                version: p.version.clone(),
                devices: p
                    .devices
                    .iter()
                    .map(|d| DeviceSnapshot {
                        device: d.clone(),
                        contexts: state
                            .contexts
                            .iter()
                            .filter(|(_, c)| c.platform == p.id && c.device == d.id)
                            .map(|(id, c)| {
                                attached.push(*id);
                                c.snapshot(*id)
                            })
                            .collect(),
                    })
                    .collect(),
                device_error: p.device_error,
            })
            .collect();
        let detached = state
            .contexts
            .iter()
            .filter(|(id, _)| !attached.contains(id))
            .map(|(id, c)| c.snapshot(*id))
            .collect();
        ResourceSnapshot {
            sequence: state.sequence,
            platforms,
            detached,
        }
    }
}
