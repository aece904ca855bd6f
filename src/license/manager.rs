//! License manager: the state machine and persistence behind the §4.9 operations.
//!
//! State machine: NotActivated -> Activating -> Active -> {Expiring -> Expired} or
//! -> Transferring -> Active'. Reactivation requires device similarity >= theta (default 0.7)
//! and `reactivation_count < max_reactivations`.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::crypto::{self, EncryptedBlob};
use super::fingerprint::DeviceFingerprint;
use super::rate_limit::{AccountLockout, RateLimiter};
use super::{LicenseError, LicenseKey};

const CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.7;
const DEFAULT_MAX_REACTIVATIONS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseStatus {
    NotActivated,
    Activating,
    Active,
    Expiring,
    Expired,
    Transferring,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseRecord {
    pub key: String,
    pub email: String,
    pub status: LicenseStatus,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub device: DeviceFingerprint,
    pub activation_count: u32,
    pub reactivation_count: u32,
    pub max_reactivations: u32,
    pub organization: Option<String>,
}

impl LicenseRecord {
    /// Redacted view safe to echo back over the wire (§4.9: "responses never echo the full key").
    pub fn redacted(&self) -> serde_json::Value {
        serde_json::json!({
            "key": crate::error::redact_license_key(&self.key),
            "email": self.email,
            "status": self.status,
            "issued_at": self.issued_at,
            "expires_at": self.expires_at,
            "activation_count": self.activation_count,
            "reactivation_count": self.reactivation_count,
            "organization": self.organization,
        })
    }
}

pub type ActivationOutcome = LicenseRecord;
pub type ValidationOutcome = LicenseRecord;
pub type TransferOutcome = LicenseRecord;

struct CachedValidation {
    record: LicenseRecord,
    cached_at: Instant,
}

pub struct LicenseManager {
    store_path: PathBuf,
    secret: Vec<u8>,
    cache: RwLock<Option<CachedValidation>>,
    activation_limiter: RateLimiter,
    status_limiter: RateLimiter,
    lockout: AccountLockout,
    similarity_threshold: f64,
}

impl LicenseManager {
    /// `secret` is the process-local at-rest key material (`LICENSE_SALT` decoded from hex, if
    /// set; [`crypto::DEFAULT_SECRET`] otherwise). It is independent of the device fingerprint, so
    /// `license.bin` decrypts the same way on any device running with the same secret — the
    /// fingerprint match is a separate check `activate_inner`/`validate` apply afterward.
    pub fn new(workspace: &Path, secret: Vec<u8>) -> Self {
        Self {
            store_path: workspace.join("license.bin"),
            secret,
            cache: RwLock::new(None),
            activation_limiter: RateLimiter::activation(),
            status_limiter: RateLimiter::status(),
            lockout: AccountLockout::new(),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }

    fn rate_limit(&self, limiter: &RateLimiter, ip: IpAddr) -> Result<(), LicenseError> {
        limiter
            .check(ip)
            .map_err(|retry_after| LicenseError::RateLimited { retry_after })
    }

    pub async fn activate(&self, raw_key: &str, email: &str, ip: IpAddr) -> Result<ActivationOutcome, LicenseError> {
        if let Some(remaining) = self.lockout.check(ip) {
            return Err(LicenseError::LockedOut { retry_after: remaining });
        }
        self.rate_limit(&self.activation_limiter, ip)?;

        let key = LicenseKey::parse(raw_key)?;
        let device = DeviceFingerprint::current();

        let result = self.activate_inner(&key, email, &device).await;
        match &result {
            Ok(_) => self.lockout.record_success(ip),
            Err(LicenseError::InvalidKey) | Err(LicenseError::InvalidFormat) => self.lockout.record_failure(ip),
            Err(_) => {}
        }
        result
    }

    async fn activate_inner(&self, key: &LicenseKey, email: &str, device: &DeviceFingerprint) -> Result<LicenseRecord, LicenseError> {
        if let Some(existing) = self.read_record().await? {
            if existing.key == key.as_str() && existing.status == LicenseStatus::Active {
                if existing.device == *device {
                    return Err(LicenseError::AlreadyActivatedOnDevice);
                }
                let similarity = existing.device.similarity(device);
                if similarity < self.similarity_threshold {
                    return Err(LicenseError::MachineMismatch);
                }
                if existing.reactivation_count >= existing.max_reactivations {
                    return Err(LicenseError::ReactivationLimitExceeded);
                }
                let mut record = existing;
                record.device = device.clone();
                record.reactivation_count += 1;
                self.write_record(&record).await?;
                self.invalidate_cache().await;
                return Ok(record);
            }
        }

        let now = Utc::now();
        let record = LicenseRecord {
            key: key.as_str().to_string(),
            email: email.to_string(),
            status: LicenseStatus::Active,
            issued_at: now,
            expires_at: now + chrono::Duration::days(365),
            device: device.clone(),
            activation_count: 1,
            reactivation_count: 0,
            max_reactivations: DEFAULT_MAX_REACTIVATIONS,
            organization: None,
        };
        self.write_record(&record).await?;
        self.invalidate_cache().await;
        Ok(record)
    }

    pub async fn validate(&self, force_refresh: bool) -> Result<ValidationOutcome, LicenseError> {
        if !force_refresh {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.cached_at.elapsed() < CACHE_TTL {
                    return Ok(cached.record.clone());
                }
            }
        }

        let device = DeviceFingerprint::current();
        let record = self.read_record().await?.ok_or(LicenseError::NotActivated)?;

        if record.device != device {
            return Err(LicenseError::MachineMismatch);
        }
        if Utc::now() > record.expires_at {
            return Err(LicenseError::Expired);
        }

        // Write-lock drains any readers currently holding the old cached value before replacing
        // it (§5 License cache invalidation).
        let mut cache = self.cache.write().await;
        *cache = Some(CachedValidation {
            record: record.clone(),
            cached_at: Instant::now(),
        });
        Ok(record)
    }

    pub async fn transfer(&self, new_organization: &str, requester_email: &str) -> Result<TransferOutcome, LicenseError> {
        let mut record = self.read_record().await?.ok_or(LicenseError::NotActivated)?;

        if record.email != requester_email {
            return Err(LicenseError::TransferForbidden(
                "only the activating account may transfer this license".to_string(),
            ));
        }

        record.organization = Some(new_organization.to_string());
        self.write_record(&record).await?;
        self.invalidate_cache().await;
        Ok(record)
    }

    pub async fn check_status_rate_limit(&self, ip: IpAddr) -> Result<(), LicenseError> {
        self.rate_limit(&self.status_limiter, ip)
    }

    async fn invalidate_cache(&self) {
        let mut cache = self.cache.write().await;
        *cache = None;
    }

    async fn read_record(&self) -> Result<Option<LicenseRecord>, LicenseError> {
        if !self.store_path.exists() {
            return Ok(None);
        }
        let bytes = tokio::fs::read(&self.store_path).await?;
        let blob: EncryptedBlob =
            serde_json::from_slice(&bytes).map_err(|e| LicenseError::Crypto(e.to_string()))?;
        let plaintext = crypto::decrypt(&blob, &self.secret)?;
        let record: LicenseRecord =
            serde_json::from_slice(&plaintext).map_err(|e| LicenseError::Crypto(e.to_string()))?;
        Ok(Some(record))
    }

    async fn write_record(&self, record: &LicenseRecord) -> Result<(), LicenseError> {
        let plaintext = serde_json::to_vec(record).map_err(|e| LicenseError::Crypto(e.to_string()))?;
        let blob = crypto::encrypt(&plaintext, &self.secret)?;
        let bytes = serde_json::to_vec(&blob).map_err(|e| LicenseError::Crypto(e.to_string()))?;

        let tmp_path = self.store_path.with_extension("bin.tmp");
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &self.store_path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_activation_produces_an_active_record() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LicenseManager::new(dir.path(), crypto::DEFAULT_SECRET.to_vec());
        let ip = "127.0.0.1".parse().unwrap();

        let record = manager
            .activate("ISX1Y-ABCDE-12345-FGHIJ-67890", "user@example.com", ip)
            .await
            .unwrap();
        assert_eq!(record.status, LicenseStatus::Active);
        assert_eq!(record.activation_count, 1);
    }

    #[tokio::test]
    async fn reactivating_on_the_same_device_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LicenseManager::new(dir.path(), crypto::DEFAULT_SECRET.to_vec());
        let ip = "127.0.0.1".parse().unwrap();

        manager.activate("ISX1Y-ABCDE-12345-FGHIJ-67890", "user@example.com", ip).await.unwrap();
        let result = manager.activate("ISX1Y-ABCDE-12345-FGHIJ-67890", "user@example.com", ip).await;
        assert!(matches!(result, Err(LicenseError::AlreadyActivatedOnDevice)));
    }

    #[tokio::test]
    async fn validate_without_activation_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LicenseManager::new(dir.path(), crypto::DEFAULT_SECRET.to_vec());
        assert!(matches!(manager.validate(false).await, Err(LicenseError::NotActivated)));
    }

    #[tokio::test]
    async fn invalid_key_format_is_rejected_before_touching_storage() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LicenseManager::new(dir.path(), crypto::DEFAULT_SECRET.to_vec());
        let ip = "127.0.0.1".parse().unwrap();
        let result = manager.activate("not-a-key", "user@example.com", ip).await;
        assert!(matches!(result, Err(LicenseError::InvalidFormat)));
    }

    fn fake_device(cpu: &str, board: &str, macs: &[&str]) -> DeviceFingerprint {
        let macs: Vec<String> = macs.iter().map(|m| m.to_string()).collect();
        DeviceFingerprint::from_factors(cpu, board, &macs)
    }

    #[tokio::test]
    async fn reactivation_on_a_similar_device_succeeds_and_records_it() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LicenseManager::new(dir.path(), crypto::DEFAULT_SECRET.to_vec());
        let key = LicenseKey::parse("ISX1Y-ABCDE-12345-FGHIJ-67890").unwrap();
        let original = fake_device(
            "Intel Xeon",
            "Linux 6.1",
            &["aa:aa:aa:aa:aa:aa", "bb:bb:bb:bb:bb:bb", "cc:cc:cc:cc:cc:cc"],
        );
        // CPU and board still match (0.5); 2 of 3 MACs still present (overlap 2/4 = 0.5,
        // contributing 0.25) for a combined 0.75, clearing the default 0.7 threshold.
        let similar = fake_device(
            "Intel Xeon",
            "Linux 6.1",
            &["aa:aa:aa:aa:aa:aa", "bb:bb:bb:bb:bb:bb", "dd:dd:dd:dd:dd:dd"],
        );

        manager.activate_inner(&key, "user@example.com", &original).await.unwrap();
        let record = manager.activate_inner(&key, "user@example.com", &similar).await.unwrap();

        assert_eq!(record.reactivation_count, 1);
        assert_eq!(record.device, similar);
    }

    #[tokio::test]
    async fn reactivation_on_an_unrelated_device_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LicenseManager::new(dir.path(), crypto::DEFAULT_SECRET.to_vec());
        let key = LicenseKey::parse("ISX1Y-ABCDE-12345-FGHIJ-67890").unwrap();
        let original = fake_device("Intel Xeon", "Linux 6.1", &["aa:aa:aa:aa:aa:aa"]);
        let unrelated = fake_device("AMD EPYC", "Windows 11", &["ff:ff:ff:ff:ff:ff"]);

        manager.activate_inner(&key, "user@example.com", &original).await.unwrap();
        let result = manager.activate_inner(&key, "user@example.com", &unrelated).await;

        assert!(matches!(result, Err(LicenseError::MachineMismatch)));
    }
}
