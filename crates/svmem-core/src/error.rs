//! Error types for svmem

use crate::caps::{RegionFlags, SvmCapabilities};
use crate::runtime::NativeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("context creation failed: {reason}")]
    ContextCreation { reason: String, status: Option<i32> },

    #[error("use after free: {0}")]
    UseAfterFree(String),

    #[error("unsupported capability: requested {requested}, device supports {available}")]
    UnsupportedCapability {
        requested: RegionFlags,
        available: SvmCapabilities,
    },

    #[error("capability mismatch on {device}: expected {expected}, observed {observed}")]
    CapabilityMismatch {
        device: String,
        expected: u64,
        observed: u64,
    },

    #[error("resource leak: {owner} still holds {live} live resource(s)")]
    ResourceLeak { owner: String, live: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("access denied: mapping is read-only")]
    ReadOnly,

    #[error("native call {call} failed with status {status}")]
    Native { call: &'static str, status: i32 },
}

impl Error {
    /// Stable integer code exposed across the C ABI
    pub fn status_code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) | Error::ReadOnly => status::INVALID_ARGUMENT,
            Error::ContextCreation { .. } | Error::Native { .. } => status::NATIVE,
            Error::UnsupportedCapability { .. } => status::UNSUPPORTED_CAPABILITY,
            Error::CapabilityMismatch { .. } => status::CAPABILITY_MISMATCH,
            Error::UseAfterFree(_) => status::USE_AFTER_FREE,
            Error::ResourceLeak { .. } => status::RESOURCE_LEAK,
            Error::Serialization(_) => status::SERIALIZATION,
        }
    }

    /// Native status code, when the failure came from the device runtime
    pub fn native_status(&self) -> Option<i32> {
        match self {
            Error::Native { status, .. } => Some(*status),
            Error::ContextCreation { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<NativeError> for Error {
    fn from(e: NativeError) -> Self {
        Error::Native {
            call: e.call,
            status: e.status,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Integer status codes shared with the C ABI
pub mod status {
    pub const SUCCESS: i32 = 0;
    pub const INVALID_ARGUMENT: i32 = -1;
    pub const NO_DEVICE: i32 = -2;
    pub const NO_PLATFORM: i32 = -3;
    pub const NATIVE: i32 = -4;
    pub const BUFFER_TOO_SMALL: i32 = -5;
    pub const FILE_IO: i32 = -6;
    pub const UNSUPPORTED_CAPABILITY: i32 = -7;
    pub const CAPABILITY_MISMATCH: i32 = -8;
    pub const USE_AFTER_FREE: i32 = -9;
    pub const RESOURCE_LEAK: i32 = -10;
    pub const SERIALIZATION: i32 = -11;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_error_keeps_status() {
        let err: Error = NativeError::new("svm_alloc", -61).into();
        assert_eq!(err.native_status(), Some(-61));
        assert_eq!(err.status_code(), status::NATIVE);
        assert!(err.to_string().contains("svm_alloc"));
    }

    #[test]
    fn test_status_codes_are_distinct() {
        let errors = [
            Error::InvalidArgument("x".into()),
            Error::UseAfterFree("x".into()),
            Error::ResourceLeak { owner: "x".into(), live: 1 },
            Error::Serialization("x".into()),
            Error::UnsupportedCapability {
                requested: RegionFlags::ATOMIC,
                available: SvmCapabilities::NONE,
            },
        ];
        let mut codes: Vec<i32> = errors.iter().map(Error::status_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
