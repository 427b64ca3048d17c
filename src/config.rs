//! MME Configuration
//!
//! YAML-backed configuration for the MME: served PLMN/GUMMEI, tracking
//! areas, EPS network feature bits and NAS timer values. Loaded once at
//! startup and treated as read-only afterwards.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("configuration validation error: {0}")]
    Validation(String),
}

/// Served PLMN identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlmnConf {
    /// Mobile Country Code (3 digits)
    pub mcc: String,
    /// Mobile Network Code (2 or 3 digits)
    pub mnc: String,
}

impl Default for PlmnConf {
    fn default() -> Self {
        Self {
            mcc: "001".into(),
            mnc: "01".into(),
        }
    }
}

/// EPS network feature support bits advertised in the ATTACH ACCEPT
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NetworkFeatureConf {
    /// IMS voice over PS session supported
    #[serde(default)]
    pub ims_voice_over_ps: bool,
    /// Emergency bearer services in S1 mode supported
    #[serde(default)]
    pub emergency_bearer_services: bool,
}

impl NetworkFeatureConf {
    /// Encode as the first EPS network feature support octet
    pub fn to_octet(self) -> u8 {
        let mut octet = 0u8;
        if self.ims_voice_over_ps {
            octet |= 0x01;
        }
        if self.emergency_bearer_services {
            octet |= 0x02;
        }
        octet
    }
}

/// NAS timer values, seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NasTimerConf {
    #[serde(default = "default_t3402")]
    pub t3402: u64,
    #[serde(default = "default_t3412")]
    pub t3412: u64,
    #[serde(default = "default_t3413")]
    pub t3413: u64,
    #[serde(default = "default_retx_timer")]
    pub t3422: u64,
    #[serde(default = "default_retx_timer")]
    pub t3450: u64,
    #[serde(default = "default_retx_timer")]
    pub t3460: u64,
    #[serde(default = "default_retx_timer")]
    pub t3470: u64,
}

fn default_t3402() -> u64 {
    720
}
fn default_t3412() -> u64 {
    3240
}
fn default_t3413() -> u64 {
    400
}
fn default_retx_timer() -> u64 {
    6
}

impl Default for NasTimerConf {
    fn default() -> Self {
        Self {
            t3402: default_t3402(),
            t3412: default_t3412(),
            t3413: default_t3413(),
            t3422: default_retx_timer(),
            t3450: default_retx_timer(),
            t3460: default_retx_timer(),
            t3470: default_retx_timer(),
        }
    }
}

/// Main MME configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MmeConfig {
    /// Served PLMN
    #[serde(default)]
    pub plmn: PlmnConf,
    /// MME Group ID
    #[serde(default = "default_mme_gid")]
    pub mme_gid: u16,
    /// MME Code
    #[serde(default = "default_mme_code")]
    pub mme_code: u8,
    /// Served tracking area codes
    #[serde(default = "default_tac_list")]
    pub tac_list: Vec<u16>,
    /// EPS network feature support
    #[serde(default)]
    pub network_feature: NetworkFeatureConf,
    /// NAS timers
    #[serde(default)]
    pub timer: NasTimerConf,
    /// NAS integrity algorithm preference, most preferred first (EIA ids)
    #[serde(default = "default_integrity_order")]
    pub integrity_order: Vec<u8>,
    /// NAS ciphering algorithm preference, most preferred first (EEA ids)
    #[serde(default = "default_ciphering_order")]
    pub ciphering_order: Vec<u8>,
}

fn default_mme_gid() -> u16 {
    2
}
fn default_mme_code() -> u8 {
    1
}
fn default_tac_list() -> Vec<u16> {
    vec![1]
}
fn default_integrity_order() -> Vec<u8> {
    vec![2, 1, 0]
}
fn default_ciphering_order() -> Vec<u8> {
    vec![0, 1, 2]
}

impl Default for MmeConfig {
    fn default() -> Self {
        Self {
            plmn: PlmnConf::default(),
            mme_gid: default_mme_gid(),
            mme_code: default_mme_code(),
            tac_list: default_tac_list(),
            network_feature: NetworkFeatureConf::default(),
            timer: NasTimerConf::default(),
            integrity_order: default_integrity_order(),
            ciphering_order: default_ciphering_order(),
        }
    }
}

impl MmeConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: MmeConfig = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants the rest of the daemon relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.plmn.mcc.len() != 3 || !self.plmn.mcc.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ConfigError::Validation(format!(
                "mcc must be 3 digits, got {:?}",
                self.plmn.mcc
            )));
        }
        if !(self.plmn.mnc.len() == 2 || self.plmn.mnc.len() == 3)
            || !self.plmn.mnc.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(ConfigError::Validation(format!(
                "mnc must be 2 or 3 digits, got {:?}",
                self.plmn.mnc
            )));
        }
        if self.tac_list.is_empty() {
            return Err(ConfigError::Validation("tac_list must not be empty".into()));
        }
        if self.integrity_order.is_empty() || self.ciphering_order.is_empty() {
            return Err(ConfigError::Validation(
                "algorithm preference lists must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MmeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timer.t3450, 6);
        assert_eq!(config.timer.t3413, 400);
    }

    #[test]
    fn test_network_feature_octet() {
        let mut feature = NetworkFeatureConf::default();
        assert_eq!(feature.to_octet(), 0);
        feature.emergency_bearer_services = true;
        assert_eq!(feature.to_octet(), 0x02);
        feature.ims_voice_over_ps = true;
        assert_eq!(feature.to_octet(), 0x03);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
plmn:
  mcc: "001"
  mnc: "01"
mme_gid: 4
mme_code: 2
tac_list: [1, 2, 3]
network_feature:
  emergency_bearer_services: true
timer:
  t3450: 8
"#;
        let config: MmeConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.mme_gid, 4);
        assert_eq!(config.tac_list.len(), 3);
        assert!(config.network_feature.emergency_bearer_services);
        assert_eq!(config.timer.t3450, 8);
        // Unset timers keep their defaults
        assert_eq!(config.timer.t3460, 6);
    }

    #[test]
    fn test_validation_rejects_bad_plmn() {
        let mut config = MmeConfig::default();
        config.plmn.mcc = "1".into();
        assert!(config.validate().is_err());
    }
}
