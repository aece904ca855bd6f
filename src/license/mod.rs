//! License gate (C9): activation, validation, and transfer of a per-device license, backed by an
//! encrypted-at-rest record and a TTL-cached validation path.

pub mod crypto;
pub mod fingerprint;
pub mod manager;
pub mod rate_limit;

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;

use crate::error::ErrorKind;

pub use fingerprint::DeviceFingerprint;
pub use manager::{ActivationOutcome, LicenseManager, LicenseRecord, LicenseStatus, TransferOutcome, ValidationOutcome};

/// A validated, hyphen-stripped license key. The literal format is `ISX1Y-XXXXX-XXXXX-XXXXX-XXXXX`
/// (a tier prefix followed by four five-character groups); [`LicenseKey::parse`] checks the shape,
/// not the checksum, which is the issuer's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseKey(String);

impl LicenseKey {
    pub fn parse(raw: &str) -> Result<Self, LicenseError> {
        let segments: Vec<&str> = raw.split('-').collect();
        if segments.len() != 5 {
            return Err(LicenseError::InvalidFormat);
        }
        let (tier, groups) = (segments[0], &segments[1..]);
        if tier.len() != 5 || !tier.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(LicenseError::InvalidFormat);
        }
        for group in groups {
            if group.len() != 5 || !group.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(LicenseError::InvalidFormat);
            }
        }
        Ok(Self(segments.join("-").to_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LicenseError {
    #[error("license key has an invalid format")]
    InvalidFormat,
    #[error("license key is not recognized")]
    InvalidKey,
    #[error("license is already active on this device")]
    AlreadyActivatedOnDevice,
    #[error("reactivation limit exceeded")]
    ReactivationLimitExceeded,
    #[error("license has expired")]
    Expired,
    #[error("license has not been activated")]
    NotActivated,
    #[error("license is bound to a different device")]
    MachineMismatch,
    #[error("transfer forbidden: {0}")]
    TransferForbidden(String),
    #[error("network error contacting the license service: {0}")]
    Network(String),
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("account locked out, retry after {retry_after:?}")]
    LockedOut { retry_after: Duration },
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LicenseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LicenseError::InvalidFormat => ErrorKind::InvalidLicenseFormat,
            LicenseError::InvalidKey => ErrorKind::InvalidLicenseKey,
            LicenseError::AlreadyActivatedOnDevice => ErrorKind::AlreadyActivatedOnDevice,
            LicenseError::ReactivationLimitExceeded => ErrorKind::ReactivationLimitExceeded,
            LicenseError::Expired => ErrorKind::LicenseExpired,
            LicenseError::NotActivated => ErrorKind::LicenseNotActivated,
            LicenseError::MachineMismatch => ErrorKind::LicenseMismatch,
            LicenseError::TransferForbidden(_) => ErrorKind::Forbidden,
            LicenseError::Network(_) => ErrorKind::ServiceUnavailable,
            LicenseError::RateLimited { .. } => ErrorKind::RateLimit,
            LicenseError::LockedOut { .. } => ErrorKind::RateLimit,
            LicenseError::Crypto(_) | LicenseError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Adds extension fields the HTTP layer needs (§4.1); the message itself is already
    /// license-key-safe since [`LicenseError`]'s `Display` never embeds raw key material.
    pub fn extend_problem(&self, extensions: &mut BTreeMap<String, Value>) {
        match self {
            LicenseError::RateLimited { retry_after } | LicenseError::LockedOut { retry_after } => {
                extensions.insert("retry_after".to_string(), Value::from(retry_after.as_secs()));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_key() {
        let key = LicenseKey::parse("ISX1Y-ABCDE-12345-FGHIJ-67890").unwrap();
        assert_eq!(key.as_str(), "ISX1Y-ABCDE-12345-FGHIJ-67890");
    }

    #[test]
    fn rejects_wrong_segment_count() {
        assert!(matches!(LicenseKey::parse("ISX1Y-ABCDE-12345"), Err(LicenseError::InvalidFormat)));
    }

    #[test]
    fn rejects_wrong_segment_length() {
        assert!(matches!(
            LicenseKey::parse("ISX1Y-ABCD-12345-FGHIJ-67890"),
            Err(LicenseError::InvalidFormat)
        ));
    }

    #[test]
    fn normalizes_lowercase_to_uppercase() {
        let key = LicenseKey::parse("isx1y-abcde-12345-fghij-67890").unwrap();
        assert_eq!(key.as_str(), "ISX1Y-ABCDE-12345-FGHIJ-67890");
    }
}
