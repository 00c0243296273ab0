//! Structured capability report
//!
//! Serializable rendering of a [`ResourceSnapshot`]:
//!
//! ```json
//! { "ok": true, "platforms": [ { "name": "...", "devices": [
//!     { "name": "...", "type": 4, "global_mem_size": 8589934592,
//!       "opencl_version": "OpenCL 2.0 ...", "capabilities": ["FINE_GRAIN_BUFFER"] } ] } ] }
//! ```
//!
//! Names that are not valid UTF-8 are written lossily and listed in
//! `errors` with `ok = false`; no platform or device is ever left out.
//! A platform whose device query failed is listed with no devices and an
//! `errors` entry.

use crate::caps::SvmSupport;
use crate::catalog::NativeString;
use crate::registry::{ContextSnapshot, ContextStats, ResourceSnapshot};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Text encoding of a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Json,
    JsonPretty,
}

fn default_ok() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    #[serde(default = "default_ok")]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub platforms: Vec<PlatformReport>,
    /// Contexts whose device is no longer enumerated
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub detached: Vec<ContextReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformReport {
    pub name: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub version: String,
    pub devices: Vec<DeviceReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceReport {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: u64,
    pub global_mem_size: u64,
    pub opencl_version: String,
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub svm_support: Option<SvmSupport>,
    #[serde(default)]
    pub atomic_extensions: Vec<String>,
    #[serde(default)]
    pub legal_flags: Vec<String>,
    #[serde(default)]
    pub contexts: Vec<ContextReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextReport {
    pub id: u64,
    pub stats: ContextStats,
    pub regions: Vec<RegionReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionReport {
    pub index: u32,
    pub generation: u32,
    pub addr: u64,
    pub size: usize,
    pub requested_size: usize,
    pub flags: Vec<String>,
}

impl Report {
    /// Build a report from a snapshot; never fails
    pub fn from_snapshot(snapshot: &ResourceSnapshot) -> Self {
        let mut errors = Vec::new();
        for (p, platform) in snapshot.platforms.iter().enumerate() {
            if let Some(e) = platform.device_error {
                errors.push(format!("platform {} device query failed: {}", p, e));
            }
        }
        let platforms = snapshot
            .platforms
            .iter()
            .enumerate()
            .map(|(p, platform)| PlatformReport {
                name: text(&platform.name, &format!("platform {} name", p), &mut errors),
                vendor: text(&platform.vendor, &format!("platform {} vendor", p), &mut errors),
                version: platform.version.clone(),
                devices: platform
                    .devices
                    .iter()
                    .enumerate()
                    .map(|(d, snap)| {
                        let device = &snap.device;
                        let record = &device.record;
                        DeviceReport {
                            name: text(
                                &device.name,
                                &format!("platform {} device {} name", p, d),
                                &mut errors,
                            ),
                            device_type: device.device_type,
                            global_mem_size: device.global_mem_size,
                            opencl_version: device.version.clone(),
                            capabilities: record
                                .capabilities()
                                .names()
                                .into_iter()
                                .map(str::to_string)
                                .collect(),
                            svm_support: Some(record.support()),
                            atomic_extensions: record.atomic_extensions().to_vec(),
                            legal_flags: record
                                .legal_combinations()
                                .iter()
                                .map(ToString::to_string)
                                .collect(),
                            contexts: snap.contexts.iter().map(ContextReport::from).collect(),
                        }
                    })
                    .collect(),
            })
            .collect();

        Self {
            ok: errors.is_empty(),
            errors,
            platforms,
            detached: snapshot.detached.iter().map(ContextReport::from).collect(),
        }
    }

    /// Total devices across platforms
    pub fn device_count(&self) -> usize {
        self.platforms.iter().map(|p| p.devices.len()).sum()
    }

    /// Device at flat `index`, counting across platforms in order
    pub fn device(&self, index: usize) -> Option<&DeviceReport> {
        self.platforms.iter().flat_map(|p| p.devices.iter()).nth(index)
    }

    pub fn to_bytes(&self, format: ExportFormat) -> Result<Vec<u8>> {
        encode(self, format)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Export one device on its own
    pub fn device_json(&self, index: usize, format: ExportFormat) -> Result<Vec<u8>> {
        let device = self.device(index).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "device index {} out of range ({} devices)",
                index,
                self.device_count()
            ))
        })?;
        encode(device, format)
    }
}

impl From<&ContextSnapshot> for ContextReport {
    fn from(context: &ContextSnapshot) -> Self {
        Self {
            id: context.id.0,
            stats: context.stats,
            regions: context
                .regions
                .iter()
                .map(|r| RegionReport {
                    index: r.region.index(),
                    generation: r.region.generation(),
                    addr: r.addr.0,
                    size: r.size,
                    requested_size: r.requested_size,
                    flags: r.flags.names().into_iter().map(str::to_string).collect(),
                })
                .collect(),
        }
    }
}

fn text(s: &NativeString, what: &str, errors: &mut Vec<String>) -> String {
    match s.as_str() {
        Some(s) => s.to_string(),
        None => {
            errors.push(format!("{} is not valid UTF-8", what));
            s.to_string_lossy()
        }
    }
}

fn encode<T: Serialize>(value: &T, format: ExportFormat) -> Result<Vec<u8>> {
    let bytes = match format {
        ExportFormat::Json => serde_json::to_vec(value)?,
        ExportFormat::JsonPretty => serde_json::to_vec_pretty(value)?,
    };
    Ok(bytes)
}
