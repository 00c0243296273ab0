//! Atomic capability probe
//!
//! Confirms that a device advertising fine-grained atomics actually honors
//! them: `N` device-side increments of one shared counter must add up to `N`.

use crate::caps::RegionFlags;
use crate::context::SvmContext;
use crate::registry::Region;
use crate::runtime::AccessMode;
use crate::{Error, Result};
use serde::Serialize;
use tracing::{info, warn};

const COUNTER_BYTES: usize = std::mem::size_of::<u32>();

/// Flags of the probe counter region
pub const PROBE_FLAGS: RegionFlags = RegionFlags::FINE_GRAIN.union(RegionFlags::ATOMIC);

/// Outcome of a passing probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub device: String,
    pub work_items: usize,
    pub observed: u64,
}

/// Run the probe on `context`.
///
/// The counter region is freed on every path. A wrong final count is
/// `CapabilityMismatch`; a device that cannot even allocate the counter
/// fails validation with `UnsupportedCapability` instead.
pub fn run_atomic_probe(context: &mut SvmContext, work_items: usize) -> Result<ProbeReport> {
    if work_items == 0 || work_items > u32::MAX as usize {
        return Err(Error::InvalidArgument(format!(
            "work_items must be in 1..={}, got {}",
            u32::MAX,
            work_items
        )));
    }

    let region = context.allocate(COUNTER_BYTES, PROBE_FLAGS)?;
    let counted = count(context, region, work_items);
    let freed = context.free(region);
    let observed = counted?;
    freed?;

    let device = context.device().name.to_string();
    let expected = work_items as u64;
    if observed != expected {
        warn!(device = %device, expected, observed, "atomic probe mismatch");
        return Err(Error::CapabilityMismatch {
            device,
            expected,
            observed,
        });
    }
    info!(device = %device, work_items, "atomic probe passed");
    Ok(ProbeReport {
        device,
        work_items,
        observed,
    })
}

fn count(context: &SvmContext, region: Region, work_items: usize) -> Result<u64> {
    context.with_mapped(region, AccessMode::WriteOnly, |m| {
        m.as_mut_slice()?.fill(0);
        Ok(())
    })?;

    let addr = context.region_info(region)?.addr;
    context
        .runtime()
        .atomic_increment(context.queue(), addr, work_items)?;

    context.with_mapped(region, AccessMode::ReadOnly, |m| {
        let bytes: [u8; COUNTER_BYTES] = m
            .as_slice()?
            .try_into()
            .map_err(|_| Error::InvalidArgument("probe counter has wrong size".to_string()))?;
        Ok(u64::from(u32::from_ne_bytes(bytes)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::SvmCapabilities;
    use crate::host::{DeviceFaults, HostDevice, HostPlatform, HostRuntime};
    use crate::SvmManager;
    use std::sync::Arc;

    fn manager(device: HostDevice) -> (Arc<HostRuntime>, SvmManager) {
        let rt = Arc::new(HostRuntime::new(vec![HostPlatform::new("p", "v").with_device(device)]));
        (rt.clone(), SvmManager::new(rt))
    }

    #[test]
    fn test_probe_counts_exactly() {
        let (rt, manager) = manager(HostDevice::cpu("cpu"));
        let mut ctx = manager.create_default_context().unwrap();
        let report = run_atomic_probe(&mut ctx, 1000).unwrap();
        assert_eq!(report.observed, 1000);
        assert_eq!(report.device, "cpu");
        assert_eq!(rt.live_allocations(), 0);
        ctx.destroy().unwrap();
    }

    #[test]
    fn test_probe_detects_lossy_atomics() {
        let device = HostDevice::cpu("liar").with_faults(DeviceFaults {
            lossy_atomics: true,
            ..DeviceFaults::default()
        });
        let (rt, manager) = manager(device);
        let mut ctx = manager.create_default_context().unwrap();
        let err = run_atomic_probe(&mut ctx, 1000).unwrap_err();
        match err {
            Error::CapabilityMismatch {
                expected, observed, ..
            } => {
                assert_eq!(expected, 1000);
                assert!(observed < 1000);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(rt.live_allocations(), 0);
        ctx.destroy().unwrap();
    }

    #[test]
    fn test_probe_without_atomics_fails_validation() {
        let device = HostDevice::gpu(
            "plain",
            SvmCapabilities::COARSE_GRAIN_BUFFER | SvmCapabilities::FINE_GRAIN_BUFFER,
        );
        let (rt, manager) = manager(device);
        let mut ctx = manager.create_default_context().unwrap();
        assert!(matches!(
            run_atomic_probe(&mut ctx, 1000),
            Err(Error::UnsupportedCapability { .. })
        ));
        assert_eq!(rt.calls().svm_alloc, 0);
        assert_eq!(rt.calls().atomic_increment, 0);
        ctx.destroy().unwrap();
    }

    #[test]
    fn test_probe_rejects_zero_work_items() {
        let (_rt, manager) = manager(HostDevice::cpu("cpu"));
        let mut ctx = manager.create_default_context().unwrap();
        assert!(matches!(
            run_atomic_probe(&mut ctx, 0),
            Err(Error::InvalidArgument(_))
        ));
        ctx.destroy().unwrap();
    }
}
