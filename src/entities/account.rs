// 💳 Account Entity - Chart of accounts node
//
// Codes are dot-decimal and hierarchical: `1.1.2.01` is an ancestor of
// `1.1.2.01.0052` but not of `1.1.2.010`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::ParseEnumError;

// ============================================================================
// ACCOUNT NATURE
// ============================================================================

/// Which side of an entry increases the balance of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountNature {
    /// Assets and expenses
    Debit,

    /// Liabilities, equity and revenue
    Credit,
}

impl AccountNature {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountNature::Debit => "DEBIT",
            AccountNature::Credit => "CREDIT",
        }
    }

    /// Net movement of `debit`/`credit` expressed in this nature's sign.
    pub fn signed(&self, debit: Decimal, credit: Decimal) -> Decimal {
        match self {
            AccountNature::Debit => debit - credit,
            AccountNature::Credit => credit - debit,
        }
    }
}

impl fmt::Display for AccountNature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountNature {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "DEBIT" | "D" | "DEVEDORA" => Ok(AccountNature::Debit),
            "CREDIT" | "C" | "CREDORA" => Ok(AccountNature::Credit),
            _ => Err(ParseEnumError::new("account nature", s)),
        }
    }
}

// ============================================================================
// ACCOUNT ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,

    /// Dot-decimal hierarchical code, the stable business key
    pub code: String,

    pub name: String,

    pub nature: AccountNature,

    /// Synthetic accounts group children and never receive lines directly
    pub is_synthetic: bool,

    /// Nearest existing ancestor (weak reference)
    pub parent_id: Option<Uuid>,
}

impl Account {
    /// Create a new analytic account with a fresh id and no parent.
    pub fn new(code: impl Into<String>, name: impl Into<String>, nature: AccountNature) -> Self {
        Account {
            id: Uuid::new_v4(),
            code: code.into(),
            name: name.into(),
            nature,
            is_synthetic: false,
            parent_id: None,
        }
    }

    pub fn is_analytic(&self) -> bool {
        !self.is_synthetic
    }

    /// Number of segments in the code (`1.1.2` has depth 3).
    pub fn depth(&self) -> usize {
        code_depth(&self.code)
    }
}

// ============================================================================
// CODE HELPERS
// ============================================================================

/// A valid code is one or more non-empty alphanumeric segments joined by `.`.
pub fn is_valid_code(code: &str) -> bool {
    !code.is_empty()
        && code
            .split('.')
            .all(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_ascii_alphanumeric()))
}

/// True when `ancestor` is a strict prefix of `code` ending at a `.` boundary.
pub fn is_ancestor_code(ancestor: &str, code: &str) -> bool {
    code.len() > ancestor.len()
        && code.starts_with(ancestor)
        && code.as_bytes()[ancestor.len()] == b'.'
}

/// The code one level up (`1.1.2.01` -> `1.1.2`), if any.
pub fn parent_code(code: &str) -> Option<&str> {
    code.rsplit_once('.').map(|(parent, _)| parent)
}

pub fn code_depth(code: &str) -> usize {
    code.split('.').count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_ancestor_prefix_respects_segment_boundary() {
        assert!(is_ancestor_code("1.1.2.01", "1.1.2.01.0052"));
        assert!(is_ancestor_code("1", "1.1.2.01.0052"));
        assert!(!is_ancestor_code("1.1.2.01", "1.1.2.010"));
        assert!(!is_ancestor_code("1.1.2.01", "1.1.2.01"));
        assert!(!is_ancestor_code("1.1.2.01.0052", "1.1.2.01"));
    }

    #[test]
    fn test_code_validation() {
        assert!(is_valid_code("1.1.2.01.0052"));
        assert!(is_valid_code("3"));
        assert!(!is_valid_code(""));
        assert!(!is_valid_code("1..2"));
        assert!(!is_valid_code("1.2."));
        assert!(!is_valid_code("1. 2"));
    }

    #[test]
    fn test_parent_code_and_depth() {
        assert_eq!(parent_code("1.1.2.01"), Some("1.1.2"));
        assert_eq!(parent_code("1"), None);
        assert_eq!(code_depth("1.1.2.01"), 4);
    }

    #[test]
    fn test_nature_sign() {
        assert_eq!(AccountNature::Debit.signed(dec!(250), dec!(50)), dec!(200));
        assert_eq!(AccountNature::Credit.signed(dec!(250), dec!(50)), dec!(-200));
    }

    #[test]
    fn test_nature_parse() {
        assert_eq!("debit".parse::<AccountNature>().unwrap(), AccountNature::Debit);
        assert_eq!("C".parse::<AccountNature>().unwrap(), AccountNature::Credit);
        assert!("sideways".parse::<AccountNature>().is_err());
    }

    #[test]
    fn test_new_account_is_analytic() {
        let account = Account::new("1.1.1.05", "Banco Sicredi", AccountNature::Debit);
        assert!(account.is_analytic());
        assert_eq!(account.depth(), 4);
        assert!(account.parent_id.is_none());
    }
}
