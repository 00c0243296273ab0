//! svmem - Shared virtual memory resource manager
//!
//! Negotiates SVM region flags against device capabilities, owns contexts
//! and regions, and keeps a snapshot-able registry of everything live.

pub mod arena;
pub mod caps;
pub mod catalog;
pub mod config;
pub mod context;
pub mod error;
pub mod host;
pub mod manager;
pub mod map;
pub mod probe;
pub mod registry;
pub mod report;
pub mod runtime;

pub use caps::{ApiVersion, CapabilityRecord, Granularity, RegionFlags, SvmCapabilities, SvmSupport};
pub use catalog::{Catalog, Device, NativeString, Platform};
pub use config::{Config, DestroyPolicy};
pub use context::{RegionInfo, SvmContext};
pub use error::{Error, Result};
pub use host::HostRuntime;
pub use manager::SvmManager;
pub use map::MappedRegion;
pub use probe::{run_atomic_probe, ProbeReport};
pub use registry::{ContextId, ContextStats, Region, Registry, ResourceSnapshot};
pub use report::{ExportFormat, Report};
pub use runtime::{AccessMode, DeviceId, DeviceRuntime, DeviceType, PlatformId};

use std::sync::Arc;

/// Runtime used when no hardware backend is linked
pub fn default_runtime() -> Arc<dyn DeviceRuntime> {
    Arc::new(HostRuntime::cpu())
}
