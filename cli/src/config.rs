//! Simulation settings: JSON file, then command-line flags, then environment.

use crate::error::CliError;
use esn_core::PAGE_SIZE;
use esn_core::region::MIN_REGION_LEN;
use esn_core::vpa::VPA_SIZE;
use esn_guest::GuestConfig;
use esn_guest::waiters::MAX_BUCKET_BITS;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// VPAs are packed into the first page, after this offset.
pub const VPA_BASE: u64 = 0x100;
/// The notification region starts on the second page.
pub const SNR_GPA: u64 = PAGE_SIZE as u64;

pub const MAX_VCPUS: u32 = ((PAGE_SIZE - VPA_BASE as usize) / VPA_SIZE) as u32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub vcpus: u32,
    pub faults_per_vcpu: u32,
    /// Size of the notification region in bytes. A multiple of the page size.
    pub region_bytes: usize,
    pub bucket_bits: u32,
    /// Delay between injecting the fault and the page becoming ready.
    pub latency_ms: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            vcpus: 4,
            faults_per_vcpu: 32,
            region_bytes: PAGE_SIZE,
            bucket_bits: 6,
            latency_ms: 1,
        }
    }
}

impl SimConfig {
    pub fn load(path: &Path) -> Result<Self, CliError> {
        let raw = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)?;
        tracing::debug!(?path, "loaded simulation config");
        Ok(config)
    }

    /// Apply `ESN_VCPUS` and `ESN_LATENCY_MS` from the process environment.
    pub fn apply_env(&mut self) -> Result<(), CliError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), CliError> {
        if let Some(v) = lookup("ESN_VCPUS") {
            self.vcpus = v
                .parse()
                .map_err(|_| CliError::InvalidConfig(format!("ESN_VCPUS={v} is not a number")))?;
        }
        if let Some(v) = lookup("ESN_LATENCY_MS") {
            self.latency_ms = v.parse().map_err(|_| {
                CliError::InvalidConfig(format!("ESN_LATENCY_MS={v} is not a number"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), CliError> {
        if self.vcpus == 0 || self.vcpus > MAX_VCPUS {
            return Err(CliError::InvalidConfig(format!(
                "vcpus must be between 1 and {MAX_VCPUS}, got {}",
                self.vcpus
            )));
        }
        if self.faults_per_vcpu == 0 {
            return Err(CliError::InvalidConfig(
                "faults_per_vcpu must be at least 1".into(),
            ));
        }
        if self.region_bytes < MIN_REGION_LEN || self.region_bytes % PAGE_SIZE != 0 {
            return Err(CliError::InvalidConfig(format!(
                "region_bytes must be a non-zero multiple of {PAGE_SIZE}, got {}",
                self.region_bytes
            )));
        }
        if self.bucket_bits > MAX_BUCKET_BITS {
            return Err(CliError::InvalidConfig(format!(
                "bucket_bits must be at most {MAX_BUCKET_BITS}, got {}",
                self.bucket_bits
            )));
        }
        Ok(())
    }

    /// Guest memory needed: one page of VPAs plus the region.
    pub fn memory_bytes(&self) -> usize {
        PAGE_SIZE + self.region_bytes
    }

    pub fn guest_config(&self) -> GuestConfig {
        GuestConfig {
            vcpus: self.vcpus,
            snr_gpa: SNR_GPA,
            snr_len: self.region_bytes,
            vpa_base: VPA_BASE,
            bucket_bits: self.bucket_bits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        SimConfig::default().validate().unwrap();
        assert_eq!(MAX_VCPUS, 240);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"vcpus": 8, "latency_ms": 0}}"#).unwrap();

        let config = SimConfig::load(file.path()).unwrap();
        assert_eq!(config.vcpus, 8);
        assert_eq!(config.latency_ms, 0);
        assert_eq!(config.region_bytes, PAGE_SIZE);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.json");
        std::fs::write(&path, "vcpus = 3").unwrap();
        assert!(matches!(SimConfig::load(&path), Err(CliError::Json(_))));
        assert!(matches!(
            SimConfig::load(&dir.path().join("missing.json")),
            Err(CliError::Io(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [("ESN_VCPUS", "12"), ("ESN_LATENCY_MS", "5")].into();
        let mut config = SimConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.vcpus, 12);
        assert_eq!(config.latency_ms, 5);

        let mut config = SimConfig::default();
        let err = config
            .apply_overrides(|k| (k == "ESN_VCPUS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, CliError::InvalidConfig(_)));
    }

    #[test]
    fn test_validate() {
        let bad = [
            SimConfig {
                vcpus: 0,
                ..Default::default()
            },
            SimConfig {
                vcpus: MAX_VCPUS + 1,
                ..Default::default()
            },
            SimConfig {
                faults_per_vcpu: 0,
                ..Default::default()
            },
            SimConfig {
                region_bytes: 100,
                ..Default::default()
            },
            SimConfig {
                bucket_bits: MAX_BUCKET_BITS + 1,
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(config.validate().is_err(), "{config:?}");
        }
    }

    #[test]
    fn test_guest_config_layout() {
        let config = SimConfig {
            vcpus: 2,
            region_bytes: 2 * PAGE_SIZE,
            ..Default::default()
        };
        let guest = config.guest_config();
        assert_eq!(guest.snr_gpa, PAGE_SIZE as u64);
        assert_eq!(guest.snr_len, 2 * PAGE_SIZE);
        assert_eq!(guest.vpa_gpa(1), VPA_BASE + VPA_SIZE as u64);
        assert_eq!(config.memory_bytes(), 3 * PAGE_SIZE);
    }
}
