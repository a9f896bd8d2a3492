// ⚙️ Configuration
// Every tunable constant of the engine lives here; nothing is hard-coded in
// the components.

use anyhow::{bail, Context as AnyhowContext, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::entities::account::is_valid_code;

/// Environment variable naming the JSON config file.
pub const CONFIG_ENV: &str = "LEDGER_CONFIG";

/// Environment variable naming the SQLite database used by the binary.
pub const DATABASE_ENV: &str = "LEDGER_DB";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Largest |debits − credits| still treated as balanced
    pub epsilon: Decimal,

    /// Minimum rule confidence for automatic posting
    pub auto_post_threshold: f64,

    /// Rules below this confidence are ignored
    pub min_rule_confidence: f64,

    /// Transitory account on the other leg of every bank import
    pub clearing_account_code: String,

    /// Page size for store scans
    pub scan_batch_size: usize,

    /// Words that suggest money leaving the account
    pub outflow_keywords: Vec<String>,

    /// Analytic accounts allowed to close against their nature
    pub sign_check_exempt_codes: Vec<String>,

    pub rules_path: Option<PathBuf>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            epsilon: dec!(0.01),
            auto_post_threshold: 0.90,
            min_rule_confidence: 0.50,
            clearing_account_code: "1.1.9.01".to_string(),
            scan_batch_size: 1000,
            outflow_keywords: ["PAGAMENTO", "TARIFA", "TAXA", "IOF", "DEBITO", "SAQUE"]
                .iter()
                .map(|k| k.to_string())
                .collect(),
            sign_check_exempt_codes: Vec::new(),
            rules_path: None,
        }
    }
}

impl LedgerConfig {
    /// Load config from JSON file; missing fields take their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: LedgerConfig =
            serde_json::from_str(&content).context("Failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// File named by `LEDGER_CONFIG`, or the defaults when unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(PathBuf::from(path)),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.epsilon.is_sign_negative() || self.epsilon.is_zero() {
            bail!("epsilon must be positive, got {}", self.epsilon);
        }
        if !(0.0..=1.0).contains(&self.auto_post_threshold) {
            bail!("auto_post_threshold must be between 0 and 1");
        }
        if !(0.0..=1.0).contains(&self.min_rule_confidence) {
            bail!("min_rule_confidence must be between 0 and 1");
        }
        if !is_valid_code(&self.clearing_account_code) {
            bail!("invalid clearing account code {:?}", self.clearing_account_code);
        }
        if self.scan_batch_size == 0 {
            bail!("scan_batch_size must be at least 1");
        }
        Ok(())
    }

    /// Clearing account or explicitly exempted from the sign check.
    pub fn is_sign_check_exempt(&self, code: &str) -> bool {
        code == self.clearing_account_code || self.sign_check_exempt_codes.iter().any(|c| c == code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = LedgerConfig::default();
        assert_eq!(config.epsilon, dec!(0.01));
        assert_eq!(config.clearing_account_code, "1.1.9.01");
        assert!(config.outflow_keywords.contains(&"TARIFA".to_string()));
        assert!(config.validate().is_ok());
        assert!(config.is_sign_check_exempt("1.1.9.01"));
        assert!(!config.is_sign_check_exempt("1.1.1.05"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"auto_post_threshold": 0.75, "epsilon": "0.005", "sign_check_exempt_codes": ["2.1.9.01"]}}"#
        )
        .unwrap();

        let config = LedgerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.auto_post_threshold, 0.75);
        assert_eq!(config.epsilon, dec!(0.005));
        assert_eq!(config.scan_batch_size, 1000);
        assert!(config.is_sign_check_exempt("2.1.9.01"));

        println!("✅ Config file test PASSED");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"scan_batch_size": 0}}"#).unwrap();
        assert!(LedgerConfig::from_file(file.path()).is_err());

        let config = LedgerConfig {
            auto_post_threshold: 1.5,
            ..LedgerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
