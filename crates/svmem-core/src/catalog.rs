//! Capability catalog: platform/device discovery

use crate::caps::{ApiVersion, CapabilityRecord, SvmCapabilities, SvmSupport};
use crate::runtime::{DeviceId, DeviceInfo, DeviceRuntime, DeviceType, NativeError, PlatformId};
use crate::Result;
use std::fmt;
use tracing::{debug, warn};

/// Native string as raw bytes; may not be valid UTF-8
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NativeString(Vec<u8>);

impl NativeString {
    pub fn new(mut bytes: Vec<u8>) -> Self {
        // native char arrays are NUL-padded
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        bytes.truncate(end);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The string, if it is valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl From<&str> for NativeString {
    fn from(s: &str) -> Self {
        Self::new(s.as_bytes().to_vec())
    }
}

impl fmt::Display for NativeString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// One discovered device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    pub platform: PlatformId,
    pub name: NativeString,
    /// Native device type bitfield
    pub device_type: u64,
    pub global_mem_size: u64,
    pub version: String,
    pub api_version: Option<ApiVersion>,
    pub extensions: Vec<String>,
    pub base_addr_align_bits: u32,
    pub max_alloc_size: u64,
    pub record: CapabilityRecord,
}

impl Device {
    pub fn kind(&self) -> Option<DeviceType> {
        DeviceType::from_raw(self.device_type)
    }

    /// Allocation alignment in bytes; `fallback` when the device reports
    /// nothing usable
    pub fn alignment(&self, fallback: usize) -> usize {
        let bytes = (self.base_addr_align_bits / 8) as usize;
        if bytes.is_power_of_two() {
            bytes.max(fallback)
        } else {
            fallback
        }
    }
}

/// One discovered platform with its devices in runtime order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub id: PlatformId,
    pub name: NativeString,
    pub vendor: NativeString,
    pub version: String,
    pub devices: Vec<Device>,
    /// Set when device enumeration failed; `devices` is then empty
    pub device_error: Option<NativeError>,
}

impl Platform {
    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }
}

/// Queries the runtime for platforms, devices and SVM capabilities
pub struct Catalog;

impl Catalog {
    /// Enumerate every platform and device.
    ///
    /// Only a failed platform query is fatal. A platform whose device query
    /// fails is kept with no devices and its `device_error` set.
    /// Nothing is cached; the caller owns the returned snapshot.
    pub fn discover(runtime: &dyn DeviceRuntime) -> Result<Vec<Platform>> {
        let mut platforms = Vec::new();
        for info in runtime.enumerate_platforms()? {
            let listed = runtime.enumerate_devices(info.id);
            let (devices, device_error): (Vec<Device>, _) = match listed {
                Ok(devices) => (
                    devices
                        .into_iter()
                        .map(|dev| Self::describe(runtime, info.id, dev))
                        .collect(),
                    None,
                ),
                Err(e) => {
                    warn!(
                        platform = %info.id,
                        status = e.status,
                        "device query failed, skipping platform"
                    );
                    (Vec::new(), Some(e))
                }
            };
            platforms.push(Platform {
                id: info.id,
                name: NativeString::new(info.name),
                vendor: NativeString::new(info.vendor),
                version: info.version,
                devices,
                device_error,
            });
        }
        debug!(platforms = platforms.len(), "discovery finished");
        Ok(platforms)
    }

    fn describe(runtime: &dyn DeviceRuntime, platform: PlatformId, info: DeviceInfo) -> Device {
        let api_version = ApiVersion::parse(&info.version);
        let record = Self::capability_record(runtime, &info, api_version);
        let name = NativeString::new(info.name);
        debug!(
            device = %name,
            version = %info.version,
            capabilities = %record.capabilities(),
            "device discovered"
        );
        Device {
            id: info.id,
            platform,
            name,
            device_type: info.device_type,
            global_mem_size: info.global_mem_size,
            version: info.version,
            api_version,
            extensions: info.extensions.split_whitespace().map(str::to_string).collect(),
            base_addr_align_bits: info.base_addr_align_bits,
            max_alloc_size: info.max_alloc_size,
            record,
        }
    }

    /// Build the capability record; a missing or old API yields an empty set
    pub fn capability_record(
        runtime: &dyn DeviceRuntime,
        info: &DeviceInfo,
        api_version: Option<ApiVersion>,
    ) -> CapabilityRecord {
        let version = match api_version {
            Some(v) if v.supports_svm() => v,
            Some(v) => {
                return CapabilityRecord::unsupported(
                    SvmSupport::ApiTooOld {
                        major: v.major,
                        minor: v.minor,
                    },
                    &info.extensions,
                )
            }
            None => {
                return CapabilityRecord::unsupported(
                    SvmSupport::ApiTooOld { major: 0, minor: 0 },
                    &info.extensions,
                )
            }
        };

        match runtime.capability_bits(info.id) {
            Ok(bits) => {
                let caps = SvmCapabilities::from_bits_truncate(bits);
                let support = if caps.is_empty() {
                    SvmSupport::NotReported
                } else {
                    SvmSupport::Supported
                };
                CapabilityRecord::new(caps, support, &info.extensions)
            }
            Err(e) => {
                warn!(
                    device = %info.id,
                    major = version.major,
                    minor = version.minor,
                    status = e.status,
                    "capability query failed, treating device as without SVM"
                );
                let support = SvmSupport::QueryFailed { status: e.status };
                CapabilityRecord::unsupported(support, &info.extensions)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::status as host_status;
    use crate::host::{DeviceFaults, HostDevice, HostPlatform, HostRuntime};

    #[test]
    fn test_native_string_trims_nul_padding() {
        let s = NativeString::new(b"gfx1030\0\0\0".to_vec());
        assert_eq!(s.as_str(), Some("gfx1030"));
        let bad = NativeString::new(vec![0x66, 0xFF, 0x6F]);
        assert_eq!(bad.as_str(), None);
        assert_eq!(bad.to_string_lossy(), "f\u{FFFD}o");
    }

    #[test]
    fn test_discover_preserves_order() {
        let rt = HostRuntime::new(vec![
            HostPlatform::new("first", "v1")
                .with_device(HostDevice::cpu("d0"))
                .with_device(HostDevice::cpu("d1")),
            HostPlatform::new("second", "v2"),
        ]);
        let platforms = Catalog::discover(&rt).unwrap();
        assert_eq!(platforms.len(), 2);
        assert_eq!(platforms[0].name.as_str(), Some("first"));
        let names: Vec<_> = platforms[0]
            .devices
            .iter()
            .map(|d| d.name.to_string())
            .collect();
        assert_eq!(names, vec!["d0", "d1"]);
        assert!(platforms[1].devices.is_empty());
    }

    #[test]
    fn test_failed_device_query_keeps_other_platforms() {
        let rt = HostRuntime::new(vec![
            HostPlatform::new("usable", "v1").with_device(HostDevice::cpu("d0")),
            HostPlatform::new("empty", "v2")
                .with_device(HostDevice::cpu("hidden"))
                .with_device_query_status(host_status::DEVICE_NOT_FOUND),
            HostPlatform::new("late", "v3").with_device(HostDevice::cpu("d1")),
        ]);
        let platforms = Catalog::discover(&rt).unwrap();
        assert_eq!(platforms.len(), 3);
        assert_eq!(platforms[0].devices.len(), 1);
        assert!(platforms[0].device_error.is_none());
        assert!(platforms[1].devices.is_empty());
        assert_eq!(
            platforms[1].device_error.map(|e| e.status),
            Some(host_status::DEVICE_NOT_FOUND)
        );
        assert_eq!(platforms[2].devices[0].name.as_str(), Some("d1"));
    }

    #[test]
    fn test_old_api_is_not_queried() {
        let old = HostDevice::gpu("old", SvmCapabilities::from_bits_truncate(0xF))
            .with_version("OpenCL 1.2 CUDA");
        let rt = HostRuntime::new(vec![HostPlatform::new("p", "v").with_device(old)]);
        let platforms = Catalog::discover(&rt).unwrap();
        let record = &platforms[0].devices[0].record;
        assert!(!record.has_svm());
        assert_eq!(record.support(), SvmSupport::ApiTooOld { major: 1, minor: 2 });
        assert_eq!(rt.calls().capability_bits, 0);
    }

    #[test]
    fn test_empty_bits_and_failed_query_are_distinguishable() {
        let rt = HostRuntime::new(vec![HostPlatform::new("p", "v")
            .with_device(HostDevice::gpu("none", SvmCapabilities::NONE))
            .with_device(HostDevice::cpu("broken").with_faults(DeviceFaults {
                capability_query_status: Some(-30),
                ..DeviceFaults::default()
            }))]);
        let platforms = Catalog::discover(&rt).unwrap();
        let devices = &platforms[0].devices;
        assert_eq!(devices[0].record.support(), SvmSupport::NotReported);
        assert_eq!(devices[1].record.support(), SvmSupport::QueryFailed { status: -30 });
        assert!(!devices[0].record.has_svm());
        assert!(!devices[1].record.has_svm());
    }

    #[test]
    fn test_alignment_from_device() {
        let rt = HostRuntime::cpu();
        let platforms = Catalog::discover(&rt).unwrap();
        let device = &platforms[0].devices[0];
        assert_eq!(device.alignment(64), 128);
        assert_eq!(device.kind(), Some(DeviceType::Cpu));
    }
}
