// 🏷️ Classification Rules - Rules as Data
// Map bank transactions to ledger accounts. Pure: classifying never mutates
// anything, and the same rules always give the same answer.

use anyhow::{Context as AnyhowContext, Result as AnyResult};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::chart::ChartOfAccounts;
use crate::entities::account::is_valid_code;
use crate::entities::{normalize_description, BankTransaction};
use crate::error::{LedgerError, Result};

// ============================================================================
// RULE DEFINITION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inflow,
    Outflow,
    #[default]
    Any,
}

/// Inclusive bounds on the absolute amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AmountRange {
    #[serde(default)]
    pub min: Option<Decimal>,
    #[serde(default)]
    pub max: Option<Decimal>,
}

impl AmountRange {
    pub fn contains(&self, magnitude: Decimal) -> bool {
        self.min.map_or(true, |min| magnitude >= min) && self.max.map_or(true, |max| magnitude <= max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRule {
    /// Rule ID for tracking
    pub id: String,

    /// Description patterns; any one matching is enough (supports `*`)
    pub patterns: Vec<String>,

    #[serde(default)]
    pub amount_range: Option<AmountRange>,

    #[serde(default)]
    pub direction: Direction,

    /// Analytic account the transaction is booked against
    pub target_account_code: String,

    /// Confidence score (0.0 - 1.0)
    pub confidence: f64,

    /// Priority (higher = applied first)
    #[serde(default = "default_priority")]
    pub priority: i32,

    #[serde(default)]
    pub description: Option<String>,
}

fn default_priority() -> i32 {
    0
}

impl ClassificationRule {
    /// Check if the rule's predicate holds for a transaction
    pub fn matches(&self, tx: &BankTransaction) -> bool {
        let direction_ok = match self.direction {
            Direction::Any => true,
            Direction::Inflow => tx.is_inflow(),
            Direction::Outflow => !tx.is_inflow(),
        };
        if !direction_ok {
            return false;
        }
        if let Some(range) = &self.amount_range {
            if !range.contains(tx.magnitude()) {
                return false;
            }
        }

        let text = normalize_description(&tx.description);
        self.patterns
            .iter()
            .any(|pattern| pattern_matches(&normalize_description(pattern), &text))
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| LedgerError::InvalidRule {
            rule_id: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.id.trim().is_empty() {
            return Err(invalid("empty rule id"));
        }
        if self.patterns.is_empty() || self.patterns.iter().any(|p| p.trim().is_empty()) {
            return Err(invalid("rule needs at least one non-empty pattern"));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(invalid("confidence must be between 0 and 1"));
        }
        if let Some(AmountRange { min: Some(min), max: Some(max) }) = self.amount_range {
            if min > max {
                return Err(invalid("amount range minimum exceeds maximum"));
            }
        }
        if !is_valid_code(&self.target_account_code) {
            return Err(invalid("target account code is malformed"));
        }
        Ok(())
    }
}

/// Both sides already normalized. Without `*` the pattern is a substring;
/// with `*` it is anchored at both ends and `*` spans any text.
fn pattern_matches(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return text.contains(pattern);
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let first = parts[0];
    let last = parts[parts.len() - 1];

    if !text.starts_with(first) {
        return false;
    }

    // Check middle parts appear in order
    let mut current_pos = first.len();
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match text[current_pos..].find(part) {
            Some(pos) => current_pos += pos + part.len(),
            None => return false,
        }
    }

    text.len() >= current_pos + last.len() && text.ends_with(last)
}

// ============================================================================
// CLASSIFICATION RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub rule_id: String,
    pub account_code: String,
    pub confidence: f64,
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Classification {
    Matched {
        account_code: String,
        confidence: f64,
        rule_id: String,
    },
    /// More than one rule matched at the top priority
    Ambiguous(Vec<Candidate>),
    NoMatch,
}

impl Classification {
    pub fn is_match(&self) -> bool {
        matches!(self, Classification::Matched { .. })
    }
}

// ============================================================================
// RULE ENGINE
// ============================================================================

pub struct RuleEngine {
    rules: Vec<ClassificationRule>,
    min_confidence: f64,
}

impl RuleEngine {
    /// Create a new empty rule engine
    pub fn new() -> Self {
        RuleEngine {
            rules: Vec::new(),
            min_confidence: 0.0,
        }
    }

    /// Load rules from JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> AnyResult<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read rules file: {:?}", path.as_ref()))?;

        let rules: Vec<ClassificationRule> =
            serde_json::from_str(&content).context("Failed to parse rules JSON")?;

        let engine = RuleEngine::from_rules(rules)
            .with_context(|| format!("Invalid rule in {:?}", path.as_ref()))?;
        Ok(engine)
    }

    /// Create engine from a list of rules, validating each one
    pub fn from_rules(rules: Vec<ClassificationRule>) -> Result<Self> {
        let mut engine = RuleEngine::new();
        for rule in rules {
            engine.add_rule(rule)?;
        }
        Ok(engine)
    }

    /// Rules matching with lower confidence are ignored entirely.
    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    /// Add a single rule
    pub fn add_rule(&mut self, rule: ClassificationRule) -> Result<()> {
        rule.validate()?;
        if self.rules.iter().any(|r| r.id == rule.id) {
            return Err(LedgerError::duplicate("classification rule", &rule.id));
        }
        self.rules.push(rule);
        // Priority first, id as a stable tie-breaker
        self.rules
            .sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(())
    }

    /// Every target must be an existing analytic account.
    pub fn validate_against(&self, chart: &ChartOfAccounts) -> Result<()> {
        for rule in &self.rules {
            let account = chart.resolve(&rule.target_account_code).map_err(|_| LedgerError::InvalidRule {
                rule_id: rule.id.clone(),
                reason: format!("unknown target account {}", rule.target_account_code),
            })?;
            if account.is_synthetic {
                return Err(LedgerError::InvalidRule {
                    rule_id: rule.id.clone(),
                    reason: format!("target account {} is synthetic", account.code),
                });
            }
        }
        Ok(())
    }

    /// Apply rules to classify a bank transaction
    pub fn classify(&self, tx: &BankTransaction) -> Classification {
        let matching: Vec<&ClassificationRule> = self
            .rules
            .iter()
            .filter(|rule| rule.confidence >= self.min_confidence && rule.matches(tx))
            .collect();

        let top_priority = match matching.first() {
            Some(rule) => rule.priority,
            None => return Classification::NoMatch,
        };
        let top: Vec<&ClassificationRule> = matching
            .into_iter()
            .take_while(|rule| rule.priority == top_priority)
            .collect();

        // A match only wins alone: any second rule at the top priority is ambiguous
        if top.len() > 1 {
            debug!(transaction = %tx.id, candidates = top.len(), "ambiguous classification");
            return Classification::Ambiguous(
                top.iter()
                    .map(|rule| Candidate {
                        rule_id: rule.id.clone(),
                        account_code: rule.target_account_code.clone(),
                        confidence: rule.confidence,
                        priority: rule.priority,
                    })
                    .collect(),
            );
        }

        let best = top[0];
        Classification::Matched {
            account_code: best.target_account_code.clone(),
            confidence: best.confidence,
            rule_id: best.id.clone(),
        }
    }

    /// Like `classify`, but ambiguity is an error and no match is `None`.
    pub fn resolve(&self, tx: &BankTransaction) -> Result<Option<Candidate>> {
        match self.classify(tx) {
            Classification::Matched {
                account_code,
                confidence,
                rule_id,
            } => {
                let priority = self
                    .rules
                    .iter()
                    .find(|r| r.id == rule_id)
                    .map(|r| r.priority)
                    .unwrap_or_default();
                Ok(Some(Candidate {
                    rule_id,
                    account_code,
                    confidence,
                    priority,
                }))
            }
            Classification::Ambiguous(candidates) => Err(LedgerError::AmbiguousClassification {
                transaction_id: tx.id,
                candidates: candidates.len(),
            }),
            Classification::NoMatch => Ok(None),
        }
    }

    /// Get number of rules loaded
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Account, AccountNature, FeedDirection, FeedRecord};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use std::io::Write;

    fn rule(id: &str, pattern: &str, target: &str, confidence: f64, priority: i32) -> ClassificationRule {
        ClassificationRule {
            id: id.to_string(),
            patterns: vec![pattern.to_string()],
            amount_range: None,
            direction: Direction::Any,
            target_account_code: target.to_string(),
            confidence,
            priority,
            description: None,
        }
    }

    fn tx(direction: FeedDirection, amount: Decimal, memo: &str) -> BankTransaction {
        FeedRecord {
            direction,
            date: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            amount,
            external_id: "FIT-1".to_string(),
            memo: memo.to_string(),
        }
        .into_transaction()
        .unwrap()
    }

    #[test]
    fn test_exact_pattern_match() {
        let r = rule("ampla", "PIX AMPLA", "3.1.1.01", 0.95, 0);

        assert!(r.matches(&tx(FeedDirection::Credit, dec!(10), "RECEBIMENTO PIX AMPLA LTDA")));
        assert!(r.matches(&tx(FeedDirection::Credit, dec!(10), "pix ampla")));
        assert!(!r.matches(&tx(FeedDirection::Credit, dec!(10), "TED AMPLA")));
    }

    #[test]
    fn test_accent_insensitive() {
        let r = rule("tarifa", "tarifa cobrança", "4.1.1.01", 0.9, 0);
        assert!(r.matches(&tx(FeedDirection::Debit, dec!(9.45), "TARIFA COBRANCA REGISTRADA")));
    }

    #[test]
    fn test_wildcard_pattern() {
        let r = rule("pix", "PIX*AMPLA", "3.1.1.01", 0.90, 0);

        assert!(r.matches(&tx(FeedDirection::Credit, dec!(1), "PIX RECEBIDO AMPLA")));
        assert!(r.matches(&tx(FeedDirection::Credit, dec!(1), "PIXAMPLA")));
        assert!(!r.matches(&tx(FeedDirection::Credit, dec!(1), "TED PIX AMPLA")));
        assert!(!r.matches(&tx(FeedDirection::Credit, dec!(1), "PIX AMPLA FILIAL")));
    }

    #[test]
    fn test_direction_and_amount_range() {
        let mut r = rule("fee", "TARIFA", "4.1.1.01", 0.9, 0);
        r.direction = Direction::Outflow;
        r.amount_range = Some(AmountRange {
            min: Some(dec!(1)),
            max: Some(dec!(50)),
        });

        assert!(r.matches(&tx(FeedDirection::Debit, dec!(9.45), "TARIFA")));
        assert!(!r.matches(&tx(FeedDirection::Credit, dec!(9.45), "TARIFA")));
        assert!(!r.matches(&tx(FeedDirection::Debit, dec!(120), "TARIFA")));
    }

    #[test]
    fn test_rule_priority() {
        let engine = RuleEngine::from_rules(vec![
            rule("general", "PIX*", "3.1.1.99", 0.80, 1),
            rule("specific", "PIX AMPLA", "3.1.1.01", 0.98, 100),
        ])
        .unwrap();

        let result = engine.classify(&tx(FeedDirection::Credit, dec!(10), "PIX AMPLA"));
        assert_eq!(
            result,
            Classification::Matched {
                account_code: "3.1.1.01".into(),
                confidence: 0.98,
                rule_id: "specific".into(),
            }
        );
    }

    #[test]
    fn test_equal_priority_conflict_is_ambiguous() {
        let engine = RuleEngine::from_rules(vec![
            rule("a", "PIX", "3.1.1.01", 0.9, 5),
            rule("b", "AMPLA", "3.1.1.02", 0.9, 5),
        ])
        .unwrap();
        let t = tx(FeedDirection::Credit, dec!(10), "PIX AMPLA");

        match engine.classify(&t) {
            Classification::Ambiguous(candidates) => assert_eq!(candidates.len(), 2),
            other => panic!("expected ambiguous, got {:?}", other),
        }
        assert!(matches!(
            engine.resolve(&t),
            Err(LedgerError::AmbiguousClassification { candidates: 2, .. })
        ));
    }

    #[test]
    fn test_equal_priority_same_target_is_still_ambiguous() {
        let engine = RuleEngine::from_rules(vec![
            rule("a", "PIX", "3.1.1.01", 0.7, 5),
            rule("b", "AMPLA", "3.1.1.01", 0.9, 5),
        ])
        .unwrap();
        let result = engine.classify(&tx(FeedDirection::Credit, dec!(10), "PIX AMPLA"));
        match result {
            Classification::Ambiguous(candidates) => {
                let ids: Vec<&str> = candidates.iter().map(|c| c.rule_id.as_str()).collect();
                assert_eq!(ids, vec!["a", "b"]);
            }
            other => panic!("expected ambiguous, got {:?}", other),
        }

        // a lower-priority rule never ties with the top one
        let engine = RuleEngine::from_rules(vec![
            rule("a", "PIX", "3.1.1.01", 0.7, 4),
            rule("b", "AMPLA", "3.1.1.01", 0.9, 5),
        ])
        .unwrap();
        let result = engine.classify(&tx(FeedDirection::Credit, dec!(10), "PIX AMPLA"));
        assert!(matches!(result, Classification::Matched { ref rule_id, .. } if rule_id == "b"));

        println!("✅ Equal-priority ambiguity test PASSED");
    }

    #[test]
    fn test_min_confidence_filters_rules() {
        let engine = RuleEngine::from_rules(vec![rule("weak", "PIX", "3.1.1.01", 0.3, 0)])
            .unwrap()
            .with_min_confidence(0.5);
        assert_eq!(
            engine.classify(&tx(FeedDirection::Credit, dec!(10), "PIX")),
            Classification::NoMatch
        );
    }

    #[test]
    fn test_no_match() {
        let engine = RuleEngine::new();
        let t = tx(FeedDirection::Credit, dec!(10), "UNKNOWN");
        assert_eq!(engine.classify(&t), Classification::NoMatch);
        assert!(engine.resolve(&t).unwrap().is_none());
    }

    #[test]
    fn test_invalid_rules_rejected() {
        assert!(RuleEngine::from_rules(vec![rule("x", "PIX", "3.1.1.01", 1.5, 0)]).is_err());
        assert!(RuleEngine::from_rules(vec![rule("x", "  ", "3.1.1.01", 0.5, 0)]).is_err());
        assert!(RuleEngine::from_rules(vec![rule("x", "PIX", "3..1", 0.5, 0)]).is_err());
        assert!(RuleEngine::from_rules(vec![
            rule("x", "PIX", "3.1.1.01", 0.5, 0),
            rule("x", "TED", "3.1.1.01", 0.5, 0),
        ])
        .is_err());
    }

    #[test]
    fn test_targets_checked_against_chart() {
        let chart = ChartOfAccounts::from_accounts(vec![
            Account::new("3.1", "Receitas", AccountNature::Credit),
            Account::new("3.1.1.01", "Honorarios", AccountNature::Credit),
        ]);

        let ok = RuleEngine::from_rules(vec![rule("a", "PIX", "3.1.1.01", 0.9, 0)]).unwrap();
        assert!(ok.validate_against(&chart).is_ok());

        let synthetic = RuleEngine::from_rules(vec![rule("a", "PIX", "3.1", 0.9, 0)]).unwrap();
        assert!(synthetic.validate_against(&chart).is_err());

        let unknown = RuleEngine::from_rules(vec![rule("a", "PIX", "9.9", 0.9, 0)]).unwrap();
        assert!(unknown.validate_against(&chart).is_err());
    }

    #[test]
    fn test_load_rules_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"id":"ampla","patterns":["PIX AMPLA"],"direction":"inflow",
                 "amount_range":{{"min":"1.00"}},
                 "target_account_code":"3.1.1.01","confidence":0.95,"priority":10}}]"#
        )
        .unwrap();

        let engine = RuleEngine::from_file(file.path()).unwrap();
        assert_eq!(engine.rule_count(), 1);
        assert_eq!(engine.rules()[0].direction, Direction::Inflow);
        assert!(engine
            .classify(&tx(FeedDirection::Credit, dec!(173116.65), "PIX AMPLA"))
            .is_match());

        println!("✅ Rules file test PASSED");
    }
}
