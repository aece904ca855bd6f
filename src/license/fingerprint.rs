//! Device fingerprinting (§4.9): CPU/board/MAC factors, combined into a stable identity hash and
//! kept individually for graceful-degradation similarity comparisons. Never persisted in
//! plaintext outside the encrypted license record.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sysinfo::{Networks, System};

const CPU_WEIGHT: f64 = 0.3;
const BOARD_WEIGHT: f64 = 0.2;
const MAC_WEIGHT: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFingerprint {
    pub hash: String,
    cpu_brand: String,
    board: String,
    macs: Vec<String>,
}

impl DeviceFingerprint {
    /// Compute the current machine's fingerprint from CPU brand, board/OS identity, and the
    /// sorted set of MAC addresses. Sorting the MACs keeps the hash stable across interface
    /// enumeration order, which is not guaranteed by the OS.
    pub fn current() -> Self {
        let mut system = System::new_all();
        system.refresh_cpu_all();

        let cpu_brand = system
            .cpus()
            .first()
            .map(|c| c.brand().to_string())
            .unwrap_or_default();
        let board = System::long_os_version().unwrap_or_default();

        let networks = Networks::new_with_refreshed_list();
        let mut macs: Vec<String> = networks
            .iter()
            .map(|(_, data)| data.mac_address().to_string())
            .filter(|m| m != "00:00:00:00:00:00")
            .collect();
        macs.sort();
        macs.dedup();

        Self::from_factors(&cpu_brand, &board, &macs)
    }

    pub(crate) fn from_factors(cpu_brand: &str, board: &str, macs: &[String]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(cpu_brand.as_bytes());
        hasher.update(b"|");
        hasher.update(board.as_bytes());
        hasher.update(b"|");
        hasher.update(macs.join(",").as_bytes());
        Self {
            hash: hex::encode(hasher.finalize()),
            cpu_brand: cpu_brand.to_string(),
            board: board.to_string(),
            macs: macs.to_vec(),
        }
    }

    /// Weighted per-factor match against the reactivation similarity threshold θ (default 0.7).
    /// Compares each factor independently rather than the combined hash, so a single factor
    /// change (a NIC swap, a BIOS update bumping the OS version string) only costs that factor's
    /// weight instead of producing an unrelated score via SHA-256's avalanche effect.
    pub fn similarity(&self, other: &DeviceFingerprint) -> f64 {
        let cpu_score = if self.cpu_brand == other.cpu_brand { 1.0 } else { 0.0 };
        let board_score = if self.board == other.board { 1.0 } else { 0.0 };
        let mac_score = mac_overlap(&self.macs, &other.macs);
        CPU_WEIGHT * cpu_score + BOARD_WEIGHT * board_score + MAC_WEIGHT * mac_score
    }
}

/// Jaccard overlap of two MAC address sets. Two machines with no NICs in common score 0; an
/// empty-empty comparison (no network interfaces on either side) scores 1, since there is no
/// signal to disagree on.
fn mac_overlap(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let set_a: HashSet<&String> = a.iter().collect();
    let set_b: HashSet<&String> = b.iter().collect();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 1.0;
    }
    set_a.intersection(&set_b).count() as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_factors_produce_identical_fingerprint() {
        let a = DeviceFingerprint::from_factors("Intel Xeon", "Linux 6.1", &["aa:bb:cc:dd:ee:ff".to_string()]);
        let b = DeviceFingerprint::from_factors("Intel Xeon", "Linux 6.1", &["aa:bb:cc:dd:ee:ff".to_string()]);
        assert_eq!(a, b);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn mac_order_does_not_affect_fingerprint() {
        let a = DeviceFingerprint::from_factors(
            "Intel Xeon",
            "Linux 6.1",
            &["aa:aa:aa:aa:aa:aa".to_string(), "bb:bb:bb:bb:bb:bb".to_string()],
        );
        let mut reordered = vec!["bb:bb:bb:bb:bb:bb".to_string(), "aa:aa:aa:aa:aa:aa".to_string()];
        reordered.sort();
        let b = DeviceFingerprint::from_factors("Intel Xeon", "Linux 6.1", &reordered);
        assert_eq!(a, b);
    }

    #[test]
    fn different_factors_produce_low_similarity() {
        let a = DeviceFingerprint::from_factors("Intel Xeon", "Linux 6.1", &["aa:bb:cc:dd:ee:ff".to_string()]);
        let b = DeviceFingerprint::from_factors("AMD EPYC", "Windows 11", &["11:22:33:44:55:66".to_string()]);
        assert!(a.similarity(&b) < 0.7);
    }

    #[test]
    fn a_single_nic_swap_degrades_gracefully_instead_of_collapsing() {
        let a = DeviceFingerprint::from_factors(
            "Intel Xeon",
            "Linux 6.1",
            &["aa:aa:aa:aa:aa:aa".to_string(), "bb:bb:bb:bb:bb:bb".to_string()],
        );
        let b = DeviceFingerprint::from_factors(
            "Intel Xeon",
            "Linux 6.1",
            &["aa:aa:aa:aa:aa:aa".to_string(), "cc:cc:cc:cc:cc:cc".to_string()],
        );
        // CPU and board still match (0.5 of the weight); one of two MACs changed (1/3 overlap,
        // contributing 0.5 * 1/3), for a combined ~0.67 — well above the hash-nibble scheme's
        // ~1/16 for the same single-factor change, even though it falls short of the default 0.7
        // threshold on its own (a second matching NIC would clear it).
        let similarity = a.similarity(&b);
        assert!(similarity > 0.6, "expected graceful degradation, got {similarity}");
        assert_ne!(a.hash, b.hash);
    }
}
