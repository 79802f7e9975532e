// phantom-dspm-core/src/pattern_library.rs
// Compiled detection rules with metadata, loaded once and hot-swappable.

use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use tracing::warn;

use crate::error::DspmError;
use crate::model::{DataCategory, SensitivityLevel};

/// Content-type hint the enumerator/classifier uses to skip text-only
/// rules against binary payloads and to resolve CSV/TSV column names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentTypeHint {
    Text,
    Csv,
    Tsv,
    Binary,
    Unknown,
}

impl ContentTypeHint {
    pub fn is_tabular(self) -> bool {
        matches!(self, ContentTypeHint::Csv | ContentTypeHint::Tsv)
    }

    pub fn is_binary(self) -> bool {
        matches!(self, ContentTypeHint::Binary)
    }
}

/// Uncompiled description of a rule, the shape a rule-engine reload or a
/// custom-rule loader hands in. `PatternRule::compile` turns this into a
/// rule with compiled regexes, or reports why it could not.
#[derive(Debug, Clone)]
pub struct RuleSpec {
    pub name: String,
    pub category: DataCategory,
    pub sensitivity: SensitivityLevel,
    pub primary_patterns: Vec<String>,
    pub context_patterns: Vec<String>,
    pub context_required: bool,
    pub priority: i32,
    pub enabled: bool,
    pub base_confidence: f64,
    /// Skip this rule when the content-type hint says the object is binary.
    pub text_only: bool,
}

/// A compiled detection rule. Every pattern here compiled successfully at
/// load time; a rule that fails to compile is rejected before it reaches
/// this type (see `PatternLibrary::load`).
#[derive(Debug, Clone)]
pub struct PatternRule {
    pub name: String,
    pub category: DataCategory,
    pub sensitivity: SensitivityLevel,
    pub primary_patterns: Vec<Regex>,
    pub context_patterns: Vec<Regex>,
    pub context_required: bool,
    pub priority: i32,
    pub enabled: bool,
    pub base_confidence: f64,
    pub text_only: bool,
}

impl PatternRule {
    pub fn compile(spec: &RuleSpec) -> Result<Self, DspmError> {
        if spec.primary_patterns.is_empty() {
            return Err(DspmError::Configuration(format!(
                "rule '{}' has no primary patterns",
                spec.name
            )));
        }
        let primary_patterns = spec
            .primary_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    DspmError::Configuration(format!("rule '{}' primary pattern rejected: {e}", spec.name))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let context_patterns = spec
            .context_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    DspmError::Configuration(format!("rule '{}' context pattern rejected: {e}", spec.name))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: spec.name.clone(),
            category: spec.category,
            sensitivity: spec.sensitivity,
            primary_patterns,
            context_patterns,
            context_required: spec.context_required,
            priority: spec.priority,
            enabled: spec.enabled,
            base_confidence: spec.base_confidence,
            text_only: spec.text_only,
        })
    }
}

/// An immutable snapshot of the loaded rule set. The classifier clones an
/// `Arc<RuleSet>` once per invocation so a concurrent hot reload never
/// changes the rules underneath an in-flight classification.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<PatternRule>,
}

impl RuleSet {
    /// Candidate rules for a content type, ordered by descending priority.
    /// Rules marked `text_only` are dropped when the hint says binary.
    pub fn rules_for(&self, content_type: ContentTypeHint) -> Vec<&PatternRule> {
        let mut candidates: Vec<&PatternRule> = self
            .rules
            .iter()
            .filter(|r| r.enabled)
            .filter(|r| !(r.text_only && content_type.is_binary()))
            .collect();
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
        candidates
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Loads built-in rules plus enabled custom rules, and supports an atomic
/// swap to a new rule set on reload. Regexes that fail to compile are
/// logged and skipped; loading itself never fails.
pub struct PatternLibrary {
    current: RwLock<Arc<RuleSet>>,
}

impl PatternLibrary {
    pub fn new(custom_rules: Vec<RuleSpec>) -> Self {
        let rules = Self::compile_all(builtin_rule_specs().into_iter().chain(custom_rules));
        Self {
            current: RwLock::new(Arc::new(RuleSet { rules })),
        }
    }

    pub fn with_builtins() -> Self {
        Self::new(Vec::new())
    }

    /// A cheap `Arc` clone of the current rule set, safe to hold across an
    /// entire classification call.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.read().clone()
    }

    /// Atomically swaps in a freshly compiled rule set. In-flight
    /// classifications holding an older snapshot are unaffected.
    pub fn reload(&self, custom_rules: Vec<RuleSpec>) {
        let rules = Self::compile_all(builtin_rule_specs().into_iter().chain(custom_rules));
        *self.current.write() = Arc::new(RuleSet { rules });
    }

    fn compile_all(specs: impl Iterator<Item = RuleSpec>) -> Vec<PatternRule> {
        specs
            .filter(|s| s.enabled)
            .filter_map(|spec| match PatternRule::compile(&spec) {
                Ok(rule) => Some(rule),
                Err(err) => {
                    warn!(rule = %spec.name, error = %err, "skipping rule that failed to compile");
                    None
                }
            })
            .collect()
    }
}

/// The built-in catalog: SSN, credit card, email, phone, medical record
/// number, passport, IBAN, ICD-10 diagnosis code, AWS keys, a generic
/// secret assignment, and a PEM private-key header.
pub fn builtin_rule_specs() -> Vec<RuleSpec> {
    vec![
        RuleSpec {
            name: "SSN Detector".into(),
            category: DataCategory::Pii,
            sensitivity: SensitivityLevel::Critical,
            primary_patterns: vec![r"\b\d{3}-\d{2}-\d{4}\b".into()],
            context_patterns: vec![],
            context_required: false,
            priority: 100,
            enabled: true,
            base_confidence: 0.9,
            text_only: true,
        },
        RuleSpec {
            name: "Credit Card Number".into(),
            category: DataCategory::Pci,
            sensitivity: SensitivityLevel::Critical,
            primary_patterns: vec![r"\b(?:\d[ -]?){13,16}\b".into()],
            context_patterns: vec![r"(?i)\b(card|ccn|pan|credit)\b".into()],
            context_required: true,
            priority: 95,
            enabled: true,
            base_confidence: 0.85,
            text_only: true,
        },
        RuleSpec {
            name: "Email Address".into(),
            category: DataCategory::Pii,
            sensitivity: SensitivityLevel::Low,
            primary_patterns: vec![r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}".into()],
            context_patterns: vec![],
            context_required: false,
            priority: 40,
            enabled: true,
            base_confidence: 0.75,
            text_only: true,
        },
        RuleSpec {
            name: "Phone Number".into(),
            category: DataCategory::Pii,
            sensitivity: SensitivityLevel::Medium,
            primary_patterns: vec![r"\+?\d{1,2}[\s.-]?\(?\d{3}\)?[\s.-]?\d{3}[\s.-]?\d{4}\b".into()],
            context_patterns: vec![],
            context_required: false,
            priority: 50,
            enabled: true,
            base_confidence: 0.6,
            text_only: true,
        },
        RuleSpec {
            name: "Medical Record Number".into(),
            category: DataCategory::Phi,
            sensitivity: SensitivityLevel::High,
            primary_patterns: vec![r"(?i)\bMRN[:\s#-]*\d{6,10}\b".into()],
            context_patterns: vec![],
            context_required: false,
            priority: 90,
            enabled: true,
            base_confidence: 0.88,
            text_only: true,
        },
        RuleSpec {
            name: "Passport Number".into(),
            category: DataCategory::Pii,
            sensitivity: SensitivityLevel::High,
            primary_patterns: vec![r"\b[A-Z]{1,2}\d{6,9}\b".into()],
            context_patterns: vec![r"(?i)\bpassport\b".into()],
            context_required: true,
            priority: 80,
            enabled: true,
            base_confidence: 0.7,
            text_only: true,
        },
        RuleSpec {
            name: "IBAN".into(),
            category: DataCategory::Pci,
            sensitivity: SensitivityLevel::High,
            primary_patterns: vec![r"\b[A-Z]{2}\d{2}[A-Z0-9]{10,30}\b".into()],
            context_patterns: vec![],
            context_required: false,
            priority: 85,
            enabled: true,
            base_confidence: 0.8,
            text_only: true,
        },
        RuleSpec {
            name: "ICD-10 Diagnosis Code".into(),
            category: DataCategory::Phi,
            sensitivity: SensitivityLevel::Medium,
            primary_patterns: vec![r"\b[A-TV-Z][0-9][0-9AB](?:\.[0-9A-TV-Z]{1,4})?\b".into()],
            context_patterns: vec![r"(?i)\b(diagnosis|icd|condition)\b".into()],
            context_required: true,
            priority: 60,
            enabled: true,
            base_confidence: 0.65,
            text_only: true,
        },
        RuleSpec {
            name: "AWS Access Key ID".into(),
            category: DataCategory::Secrets,
            sensitivity: SensitivityLevel::Critical,
            primary_patterns: vec![r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b".into()],
            context_patterns: vec![],
            context_required: false,
            priority: 99,
            enabled: true,
            base_confidence: 0.95,
            text_only: true,
        },
        RuleSpec {
            name: "AWS Secret Access Key".into(),
            category: DataCategory::Secrets,
            sensitivity: SensitivityLevel::Critical,
            primary_patterns: vec![r"(?i)aws_secret_access_key\s*[:=]\s*['\x22]?[A-Za-z0-9/+=]{40}['\x22]?".into()],
            context_patterns: vec![],
            context_required: false,
            priority: 99,
            enabled: true,
            base_confidence: 0.95,
            text_only: true,
        },
        RuleSpec {
            name: "Generic API Key".into(),
            category: DataCategory::Secrets,
            sensitivity: SensitivityLevel::High,
            primary_patterns: vec![r"(?i)\b(api[_-]?key|token)\s*[:=]\s*['\x22]?[A-Za-z0-9_\-]{20,64}['\x22]?".into()],
            context_patterns: vec![],
            context_required: false,
            priority: 70,
            enabled: true,
            base_confidence: 0.75,
            text_only: true,
        },
        RuleSpec {
            name: "Private Key PEM".into(),
            category: DataCategory::Secrets,
            sensitivity: SensitivityLevel::Critical,
            primary_patterns: vec![r"-----BEGIN (?:RSA |EC |OPENSSH )?PRIVATE KEY-----".into()],
            context_patterns: vec![],
            context_required: false,
            priority: 98,
            enabled: true,
            base_confidence: 0.97,
            text_only: true,
        },
        RuleSpec {
            name: "Generic Secret Assignment".into(),
            category: DataCategory::Secrets,
            sensitivity: SensitivityLevel::Medium,
            primary_patterns: vec![r"(?i)\b(password|secret|token)\s*[:=]\s*\S{6,}".into()],
            context_patterns: vec![],
            context_required: false,
            priority: 30,
            enabled: true,
            base_confidence: 0.5,
            text_only: true,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_regex_is_skipped_not_fatal() {
        let mut specs = builtin_rule_specs();
        specs.push(RuleSpec {
            name: "Broken".into(),
            category: DataCategory::Custom,
            sensitivity: SensitivityLevel::Low,
            primary_patterns: vec!["(".into()],
            context_patterns: vec![],
            context_required: false,
            priority: 1,
            enabled: true,
            base_confidence: 0.1,
            text_only: true,
        });
        let library = PatternLibrary::new(specs);
        let snapshot = library.snapshot();
        assert!(snapshot.rules_for(ContentTypeHint::Text).iter().all(|r| r.name != "Broken"));
    }

    #[test]
    fn rules_for_orders_by_descending_priority() {
        let library = PatternLibrary::with_builtins();
        let snapshot = library.snapshot();
        let candidates = snapshot.rules_for(ContentTypeHint::Text);
        let priorities: Vec<i32> = candidates.iter().map(|r| r.priority).collect();
        let mut sorted = priorities.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(priorities, sorted);
    }

    #[test]
    fn reload_swaps_snapshot_without_breaking_in_flight_holders() {
        let library = PatternLibrary::with_builtins();
        let held = library.snapshot();
        library.reload(Vec::new());
        assert_eq!(held.len(), library.snapshot().len());
    }
}
