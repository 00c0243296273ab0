//! Device runtime boundary
//!
//! The core never talks to a driver directly. Everything it needs from the
//! compute API goes through [`DeviceRuntime`], with native handles kept
//! opaque as `u64` newtypes.

use crate::caps::RegionFlags;
use std::fmt;

macro_rules! native_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    };
}

native_handle!(
    /// Native platform id
    PlatformId
);
native_handle!(
    /// Native device id
    DeviceId
);
native_handle!(
    /// Native compute-API context
    NativeContext
);
native_handle!(
    /// Native command queue
    NativeQueue
);
native_handle!(
    /// Address of an SVM allocation
    SvmAddr
);

/// Failure reported by a native call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeError {
    pub call: &'static str,
    pub status: i32,
}

impl NativeError {
    pub fn new(call: &'static str, status: i32) -> Self {
        Self { call, status }
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} returned {}", self.call, self.status)
    }
}

impl std::error::Error for NativeError {}

pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Native device type values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum DeviceType {
    Default = 1,
    Cpu = 2,
    Gpu = 4,
    Accelerator = 8,
}

impl DeviceType {
    pub fn from_raw(v: u64) -> Option<Self> {
        match v {
            1 => Some(DeviceType::Default),
            2 => Some(DeviceType::Cpu),
            4 => Some(DeviceType::Gpu),
            8 => Some(DeviceType::Accelerator),
            _ => None,
        }
    }

    pub fn as_raw(&self) -> u64 {
        *self as u64
    }
}

/// Host access requested when mapping a region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn can_read(&self) -> bool {
        !matches!(self, AccessMode::WriteOnly)
    }

    pub fn can_write(&self) -> bool {
        !matches!(self, AccessMode::ReadOnly)
    }
}

/// Platform identity as reported by the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub id: PlatformId,
    /// Raw name bytes; native strings are not guaranteed to be UTF-8
    pub name: Vec<u8>,
    pub vendor: Vec<u8>,
    pub version: String,
}

/// Device identity and limits as reported by the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: Vec<u8>,
    /// Native device type bitfield
    pub device_type: u64,
    pub global_mem_size: u64,
    /// Full API version string, e.g. `"OpenCL 2.0 ..."`
    pub version: String,
    /// Space separated extension list
    pub extensions: String,
    /// Base address alignment in bits (0 if unknown)
    pub base_addr_align_bits: u32,
    pub max_alloc_size: u64,
}

/// The compute-API runtime the core delegates to.
///
/// Implementations must be thread-safe; the core serializes access to
/// each context itself.
pub trait DeviceRuntime: Send + Sync {
    fn enumerate_platforms(&self) -> NativeResult<Vec<PlatformInfo>>;

    fn enumerate_devices(&self, platform: PlatformId) -> NativeResult<Vec<DeviceInfo>>;

    /// Raw SVM capability bitmask; only valid for API versions with SVM
    fn capability_bits(&self, device: DeviceId) -> NativeResult<u64>;

    fn create_context(&self, platform: PlatformId, device: DeviceId) -> NativeResult<NativeContext>;

    fn release_context(&self, context: NativeContext) -> NativeResult<()>;

    fn create_queue(&self, context: NativeContext, device: DeviceId) -> NativeResult<NativeQueue>;

    fn release_queue(&self, queue: NativeQueue) -> NativeResult<()>;

    /// Allocate `size` bytes; `flags` are already validated and normalized
    fn svm_alloc(
        &self,
        context: NativeContext,
        size: usize,
        alignment: usize,
        flags: RegionFlags,
    ) -> NativeResult<SvmAddr>;

    fn svm_free(&self, context: NativeContext, addr: SvmAddr) -> NativeResult<()>;

    /// Blocking map; returns the host-visible address of the span
    fn svm_map(
        &self,
        queue: NativeQueue,
        addr: SvmAddr,
        size: usize,
        access: AccessMode,
    ) -> NativeResult<SvmAddr>;

    /// Blocking unmap
    fn svm_unmap(&self, queue: NativeQueue, addr: SvmAddr) -> NativeResult<()>;

    /// Run `work_items` device-side atomic increments of the `u32` at
    /// `addr` and wait for completion
    fn atomic_increment(
        &self,
        queue: NativeQueue,
        addr: SvmAddr,
        work_items: usize,
    ) -> NativeResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_raw() {
        for ty in [DeviceType::Default, DeviceType::Cpu, DeviceType::Gpu, DeviceType::Accelerator] {
            assert_eq!(DeviceType::from_raw(ty.as_raw()), Some(ty));
        }
        assert_eq!(DeviceType::from_raw(3), None);
    }

    #[test]
    fn test_access_mode() {
        assert!(AccessMode::ReadOnly.can_read());
        assert!(!AccessMode::ReadOnly.can_write());
        assert!(!AccessMode::WriteOnly.can_read());
        assert!(AccessMode::ReadWrite.can_write());
    }
}
