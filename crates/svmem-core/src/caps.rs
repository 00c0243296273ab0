//! SVM capability bits, region flags and the flag validation matrix

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Device-reported SVM capability bit-set (native bit values)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SvmCapabilities {
    bits: u64,
}

impl SvmCapabilities {
    pub const NONE: Self = Self { bits: 0 };
    pub const COARSE_GRAIN_BUFFER: Self = Self { bits: 1 << 0 };
    pub const FINE_GRAIN_BUFFER: Self = Self { bits: 1 << 1 };
    pub const FINE_GRAIN_SYSTEM: Self = Self { bits: 1 << 2 };
    pub const ATOMICS: Self = Self { bits: 1 << 3 };

    const NAMED: [(Self, &'static str); 4] = [
        (Self::COARSE_GRAIN_BUFFER, "COARSE_GRAIN_BUFFER"),
        (Self::FINE_GRAIN_BUFFER, "FINE_GRAIN_BUFFER"),
        (Self::FINE_GRAIN_SYSTEM, "FINE_GRAIN_SYSTEM"),
        (Self::ATOMICS, "ATOMICS"),
    ];

    /// Create from a raw native bitmask, dropping bits we do not know
    pub const fn from_bits_truncate(bits: u64) -> Self {
        Self { bits: bits & 0xF }
    }

    pub const fn bits(&self) -> u64 {
        self.bits
    }

    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.bits & other.bits == other.bits
    }

    /// Names of the set bits, in native bit order
    pub fn names(&self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(cap, _)| self.contains(*cap))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Parse one capability name as produced by [`SvmCapabilities::names`]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMED
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(cap, _)| *cap)
    }
}

impl BitOr for SvmCapabilities {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self { bits: self.bits | rhs.bits }
    }
}

impl BitAnd for SvmCapabilities {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self { bits: self.bits & rhs.bits }
    }
}

impl fmt::Display for SvmCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        f.write_str(&self.names().join("|"))
    }
}

/// Flags requested for a region allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegionFlags {
    bits: u32,
}

impl RegionFlags {
    pub const NONE: Self = Self { bits: 0 };
    pub const READ_WRITE: Self = Self { bits: 0x1 };
    pub const READ_ONLY: Self = Self { bits: 0x2 };
    pub const WRITE_ONLY: Self = Self { bits: 0x4 };
    pub const ATOMIC: Self = Self { bits: 0x8 };
    pub const FINE_GRAIN: Self = Self { bits: 0x10 };
    pub const COARSE_GRAIN: Self = Self { bits: 0x20 };
    pub const FINE_GRAIN_SYSTEM: Self = Self { bits: 0x40 };

    const ACCESS_MASK: u32 = 0x7;
    const ALL: u32 = 0x7F;

    const NAMED: [(Self, &'static str); 7] = [
        (Self::READ_WRITE, "READ_WRITE"),
        (Self::READ_ONLY, "READ_ONLY"),
        (Self::WRITE_ONLY, "WRITE_ONLY"),
        (Self::ATOMIC, "ATOMIC"),
        (Self::FINE_GRAIN, "FINE_GRAIN"),
        (Self::COARSE_GRAIN, "COARSE_GRAIN"),
        (Self::FINE_GRAIN_SYSTEM, "FINE_GRAIN_SYSTEM"),
    ];

    /// Create from raw bits, rejecting unknown ones
    pub const fn from_bits(bits: u32) -> Option<Self> {
        if bits & !Self::ALL != 0 {
            None
        } else {
            Some(Self { bits })
        }
    }

    pub const fn bits(&self) -> u32 {
        self.bits
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.bits & other.bits == other.bits
    }

    pub const fn intersects(&self, other: Self) -> bool {
        self.bits & other.bits != 0
    }

    /// `self | other`, usable in constants
    pub const fn union(self, other: Self) -> Self {
        Self {
            bits: self.bits | other.bits,
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Coherence tier encoded in these flags (coarse when none is given)
    pub fn granularity(&self) -> Granularity {
        if self.contains(Self::FINE_GRAIN_SYSTEM) {
            Granularity::FineSystem
        } else if self.contains(Self::FINE_GRAIN) {
            Granularity::Fine
        } else {
            Granularity::Coarse
        }
    }

    fn access_bits(&self) -> u32 {
        self.bits & Self::ACCESS_MASK
    }
}

impl BitOr for RegionFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self { bits: self.bits | rhs.bits }
    }
}

impl BitOrAssign for RegionFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.bits |= rhs.bits;
    }
}

impl fmt::Display for RegionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bits == 0 {
            return f.write_str("NONE");
        }
        f.write_str(&self.names().join("|"))
    }
}

/// Host/device coherence tier of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    /// Explicit map/unmap around host access
    Coarse,
    /// Coherent within SVM buffers
    Fine,
    /// Coherent for any system allocation
    FineSystem,
}

impl Granularity {
    pub fn requires_map(&self) -> bool {
        matches!(self, Granularity::Coarse)
    }
}

/// Parsed `"<API> <major>.<minor> ..."` version string
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl ApiVersion {
    /// First API version able to report SVM capabilities
    pub const SVM_MIN: ApiVersion = ApiVersion { major: 2, minor: 0 };

    /// Parse e.g. `"OpenCL 2.1 AMD-APP (3188.4)"`
    pub fn parse(version: &str) -> Option<Self> {
        let number = version.split_whitespace().nth(1)?;
        let (major, minor) = number.split_once('.')?;
        let minor: String = minor.chars().take_while(char::is_ascii_digit).collect();
        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }

    pub fn supports_svm(&self) -> bool {
        *self >= Self::SVM_MIN
    }
}

/// Why a device does or does not report SVM support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SvmSupport {
    /// Capability query returned a non-empty bit-set
    Supported,
    /// API is recent enough but the device reports no SVM bits
    NotReported,
    /// API version predates SVM; capabilities were not queried
    ApiTooOld { major: u32, minor: u32 },
    /// The native capability query itself failed
    QueryFailed { status: i32 },
}

/// Flag combinations a record may list as legal
const CANDIDATE_COMBINATIONS: [RegionFlags; 5] = [
    RegionFlags::COARSE_GRAIN,
    RegionFlags::FINE_GRAIN,
    RegionFlags::FINE_GRAIN.union(RegionFlags::ATOMIC),
    RegionFlags::FINE_GRAIN_SYSTEM,
    RegionFlags::FINE_GRAIN_SYSTEM.union(RegionFlags::ATOMIC),
];

/// Normalized, read-only capability view of one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityRecord {
    capabilities: SvmCapabilities,
    support: SvmSupport,
    atomic_extensions: Vec<String>,
    legal_combinations: Vec<RegionFlags>,
}

impl CapabilityRecord {
    pub fn new(capabilities: SvmCapabilities, support: SvmSupport, extensions: &str) -> Self {
        let mut record = Self {
            capabilities,
            support,
            atomic_extensions: atomic_extensions(extensions),
            legal_combinations: Vec::new(),
        };
        record.legal_combinations = CANDIDATE_COMBINATIONS
            .iter()
            .copied()
            .filter(|flags| record.validate(*flags).is_ok())
            .collect();
        record
    }

    /// Record of a device without SVM
    pub fn unsupported(support: SvmSupport, extensions: &str) -> Self {
        Self::new(SvmCapabilities::NONE, support, extensions)
    }

    /// Get capability bits
    pub fn capabilities(&self) -> SvmCapabilities {
        self.capabilities
    }

    /// Get support state
    pub fn support(&self) -> SvmSupport {
        self.support
    }

    /// Whether any SVM tier can be allocated; every non-supported state merges here
    pub fn has_svm(&self) -> bool {
        !self.capabilities.is_empty()
    }

    /// Atomic-related extension tokens (advisory only)
    pub fn atomic_extensions(&self) -> &[String] {
        &self.atomic_extensions
    }

    pub fn legal_combinations(&self) -> &[RegionFlags] {
        &self.legal_combinations
    }

    /// Check requested flags against this record and normalize them.
    ///
    /// The returned flags always carry exactly one access bit and an
    /// explicit tier bit.
    pub fn validate(&self, requested: RegionFlags) -> Result<RegionFlags> {
        let access = requested.access_bits();
        if access.count_ones() > 1 {
            return Err(Error::InvalidArgument(format!(
                "conflicting access flags: {}",
                requested
            )));
        }
        let fine = requested.intersects(RegionFlags::FINE_GRAIN | RegionFlags::FINE_GRAIN_SYSTEM);
        if fine && requested.contains(RegionFlags::COARSE_GRAIN) {
            return Err(Error::InvalidArgument(format!(
                "coarse and fine grain requested together: {}",
                requested
            )));
        }

        let mut required = SvmCapabilities::NONE;
        if requested.contains(RegionFlags::FINE_GRAIN) {
            required = required | SvmCapabilities::FINE_GRAIN_BUFFER;
        }
        if requested.contains(RegionFlags::FINE_GRAIN_SYSTEM) {
            required = required | SvmCapabilities::FINE_GRAIN_SYSTEM;
        }
        if !fine {
            required = required | SvmCapabilities::COARSE_GRAIN_BUFFER;
        }
        if requested.contains(RegionFlags::ATOMIC) {
            // atomics are undefined without fine-grain coherence
            if !fine {
                return Err(self.unsupported_error(requested));
            }
            required = required | SvmCapabilities::ATOMICS;
        }
        if !self.capabilities.contains(required) {
            return Err(self.unsupported_error(requested));
        }

        let mut normalized = requested;
        if access == 0 {
            normalized |= RegionFlags::READ_WRITE;
        }
        if !fine {
            normalized |= RegionFlags::COARSE_GRAIN;
        }
        Ok(normalized)
    }

    fn unsupported_error(&self, requested: RegionFlags) -> Error {
        Error::UnsupportedCapability {
            requested,
            available: self.capabilities,
        }
    }
}

/// Extension tokens mentioning atomics
pub fn atomic_extensions(extensions: &str) -> Vec<String> {
    extensions
        .split_whitespace()
        .filter(|ext| ext.to_ascii_lowercase().contains("atomic"))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(caps: SvmCapabilities) -> CapabilityRecord {
        CapabilityRecord::new(caps, SvmSupport::Supported, "")
    }

    #[test]
    fn test_parse_api_version() {
        assert_eq!(
            ApiVersion::parse("OpenCL 2.1 AMD-APP (3188.4)"),
            Some(ApiVersion { major: 2, minor: 1 })
        );
        assert_eq!(
            ApiVersion::parse("OpenCL 1.2 CUDA"),
            Some(ApiVersion { major: 1, minor: 2 })
        );
        assert_eq!(ApiVersion::parse("OpenCL"), None);
        assert_eq!(ApiVersion::parse("garbage"), None);
        assert!(!ApiVersion { major: 1, minor: 2 }.supports_svm());
        assert!(ApiVersion { major: 3, minor: 0 }.supports_svm());
    }

    #[test]
    fn test_default_is_coarse_read_write() {
        let rec = record(SvmCapabilities::COARSE_GRAIN_BUFFER);
        let flags = rec.validate(RegionFlags::NONE).unwrap();
        assert!(flags.contains(RegionFlags::COARSE_GRAIN));
        assert!(flags.contains(RegionFlags::READ_WRITE));
        assert_eq!(flags.granularity(), Granularity::Coarse);
    }

    #[test]
    fn test_atomic_requires_fine_grain_and_atomics() {
        let fine_only =
            record(SvmCapabilities::COARSE_GRAIN_BUFFER | SvmCapabilities::FINE_GRAIN_BUFFER);
        let err = fine_only
            .validate(RegionFlags::FINE_GRAIN | RegionFlags::ATOMIC)
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedCapability { .. }));

        let full = record(
            SvmCapabilities::COARSE_GRAIN_BUFFER
                | SvmCapabilities::FINE_GRAIN_BUFFER
                | SvmCapabilities::ATOMICS,
        );
        assert!(full.validate(RegionFlags::FINE_GRAIN | RegionFlags::ATOMIC).is_ok());
        // coarse atomics are never legal
        assert!(matches!(
            full.validate(RegionFlags::ATOMIC),
            Err(Error::UnsupportedCapability { .. })
        ));
    }

    #[test]
    fn test_atomics_bit_without_fine_grain_capability() {
        let rec = record(SvmCapabilities::COARSE_GRAIN_BUFFER | SvmCapabilities::ATOMICS);
        assert!(rec
            .validate(RegionFlags::FINE_GRAIN | RegionFlags::ATOMIC)
            .is_err());
        assert_eq!(rec.legal_combinations(), &[RegionFlags::COARSE_GRAIN]);
    }

    #[test]
    fn test_conflicting_flags_are_invalid() {
        let rec = record(SvmCapabilities::from_bits_truncate(0xF));
        assert!(matches!(
            rec.validate(RegionFlags::FINE_GRAIN | RegionFlags::COARSE_GRAIN),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            rec.validate(RegionFlags::READ_ONLY | RegionFlags::WRITE_ONLY),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_empty_capabilities_reject_everything() {
        let rec = CapabilityRecord::unsupported(SvmSupport::ApiTooOld { major: 1, minor: 2 }, "");
        assert!(!rec.has_svm());
        assert!(rec.legal_combinations().is_empty());
        for flags in CANDIDATE_COMBINATIONS {
            assert!(matches!(
                rec.validate(flags),
                Err(Error::UnsupportedCapability { .. })
            ));
        }
    }

    #[test]
    fn test_rejection_names_requested_and_available() {
        let rec = CapabilityRecord::unsupported(SvmSupport::NotReported, "cl_khr_fp64");
        assert_eq!(rec.support(), SvmSupport::NotReported);
        match rec.validate(RegionFlags::COARSE_GRAIN) {
            Err(Error::UnsupportedCapability {
                requested,
                available,
            }) => {
                assert_eq!(requested, RegionFlags::COARSE_GRAIN);
                assert_eq!(available, SvmCapabilities::NONE);
            }
            other => panic!("expected UnsupportedCapability, got {:?}", other),
        }

        let coarse = record(SvmCapabilities::COARSE_GRAIN_BUFFER);
        match coarse.validate(RegionFlags::FINE_GRAIN) {
            Err(Error::UnsupportedCapability { available, .. }) => {
                assert_eq!(available, SvmCapabilities::COARSE_GRAIN_BUFFER)
            }
            other => panic!("expected UnsupportedCapability, got {:?}", other),
        }
    }

    #[test]
    fn test_legal_combinations_full_device() {
        let rec = record(SvmCapabilities::from_bits_truncate(0xF));
        assert_eq!(rec.legal_combinations().len(), CANDIDATE_COMBINATIONS.len());
    }

    #[test]
    fn test_atomic_extension_scan() {
        let exts = "cl_khr_fp64 cl_khr_global_int32_base_atomics \
                    cl_khr_int64_base_atomics cl_ext_ATOMIC_counters";
        assert_eq!(
            atomic_extensions(exts),
            vec![
                "cl_khr_global_int32_base_atomics",
                "cl_khr_int64_base_atomics",
                "cl_ext_ATOMIC_counters"
            ]
        );
    }

    #[test]
    fn test_names_round_trip() {
        let caps = SvmCapabilities::FINE_GRAIN_BUFFER | SvmCapabilities::ATOMICS;
        assert_eq!(caps.to_string(), "FINE_GRAIN_BUFFER|ATOMICS");
        let parsed = caps
            .names()
            .into_iter()
            .filter_map(SvmCapabilities::from_name)
            .fold(SvmCapabilities::NONE, |acc, c| acc | c);
        assert_eq!(parsed, caps);
        assert_eq!(RegionFlags::from_bits(0x80), None);
    }
}
