//! Rule descriptors and the registry they are registered into
//!
//! A [`Rule`] is an explicit, typed descriptor: an id, a severity, the ids of
//! the rules it depends on, the file globs it reads, and a predicate that
//! evaluates the repository. Rules are registered into a [`RuleRegistry`] at
//! startup and are immutable afterwards.
//!
//! ```rust
//! use ruleguard::rules::{Rule, RuleRegistry, Severity, ValidationResult};
//!
//! let mut registry = RuleRegistry::new(vec!["**/*.md".to_string()]);
//! registry.register(
//!     Rule::new("readme-present", Severity::Medium, |ctx| {
//!         let found = ctx.structure().contains_file("README.md");
//!         Ok(if found {
//!             ValidationResult::pass("readme-present", Severity::Medium, "README.md found")
//!         } else {
//!             ValidationResult::fail("readme-present", Severity::Medium, "README.md missing")
//!         })
//!     })
//!     .reads(["README.md"]),
//! )?;
//! registry.validate()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod catalog;

use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::error::EngineError;
use crate::shared::{sha256_hex, unix_millis};
use crate::snapshot::{FilesystemSnapshot, RepoTree};

lazy_static! {
    static ref RULE_ID: Regex = Regex::new(r"^[a-z0-9][a-z0-9_.-]*$").unwrap();
}

/// Rule severity, ordered from least to most severe
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Info,
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One evidence field attached to a result.
///
/// Predicates may attach values that only implement `Debug`; those are kept
/// as-is in memory and reduced to their `Debug` string whenever the result is
/// serialized (cache document, process boundary).
#[derive(Clone)]
pub enum EvidenceValue {
    Json(serde_json::Value),
    Opaque(Arc<dyn fmt::Debug + Send + Sync>),
}

impl EvidenceValue {
    pub fn is_opaque(&self) -> bool {
        matches!(self, EvidenceValue::Opaque(_))
    }

    /// Transport-safe form of this value
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            EvidenceValue::Json(value) => value.clone(),
            EvidenceValue::Opaque(value) => serde_json::Value::String(format!("{value:?}")),
        }
    }
}

impl fmt::Debug for EvidenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvidenceValue::Json(value) => write!(f, "{value}"),
            EvidenceValue::Opaque(value) => write!(f, "Opaque({value:?})"),
        }
    }
}

impl PartialEq for EvidenceValue {
    fn eq(&self, other: &Self) -> bool {
        self.to_json() == other.to_json()
    }
}

impl From<serde_json::Value> for EvidenceValue {
    fn from(value: serde_json::Value) -> Self {
        EvidenceValue::Json(value)
    }
}

impl Serialize for EvidenceValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EvidenceValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(EvidenceValue::Json)
    }
}

pub type Evidence = BTreeMap<String, EvidenceValue>;

/// Outcome of one rule evaluation. Produced once per execution.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationResult {
    pub rule_id: String,
    pub passed: bool,
    pub severity: Severity,
    pub message: String,
    pub evidence: Evidence,
    /// Unix milliseconds
    pub timestamp: u64,
}

impl ValidationResult {
    fn new(rule_id: &str, passed: bool, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            passed,
            severity,
            message: message.into(),
            evidence: Evidence::new(),
            timestamp: unix_millis(),
        }
    }

    pub fn pass(rule_id: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self::new(rule_id, true, severity, message)
    }

    pub fn fail(rule_id: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self::new(rule_id, false, severity, message)
    }

    /// Failed result at critical severity, used for timeouts, crashes and errors
    pub fn critical(rule_id: &str, message: impl Into<String>) -> Self {
        Self::new(rule_id, false, Severity::Critical, message)
    }

    /// Attach a serializable evidence field
    pub fn with_evidence(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value)
            .unwrap_or_else(|e| serde_json::Value::String(format!("<unserializable: {e}>")));
        self.evidence.insert(key.into(), EvidenceValue::Json(value));
        self
    }

    /// Attach a field that can only be rendered through `Debug`
    pub fn with_opaque(
        mut self,
        key: impl Into<String>,
        value: impl fmt::Debug + Send + Sync + 'static,
    ) -> Self {
        self.evidence
            .insert(key.into(), EvidenceValue::Opaque(Arc::new(value)));
        self
    }

    /// Stable digest of the parts downstream rules may depend on
    pub fn digest(&self) -> String {
        let evidence: BTreeMap<&str, serde_json::Value> = self
            .evidence
            .iter()
            .map(|(k, v)| (k.as_str(), v.to_json()))
            .collect();
        let material = serde_json::json!({
            "passed": self.passed,
            "severity": self.severity,
            "message": self.message,
            "evidence": evidence,
        });
        sha256_hex(material.to_string().as_bytes())
    }
}

/// Everything a predicate may look at
#[derive(Clone)]
pub struct RuleContext {
    snapshot: Arc<dyn FilesystemSnapshot>,
}

impl RuleContext {
    pub fn new(snapshot: Arc<dyn FilesystemSnapshot>) -> Self {
        Self { snapshot }
    }

    pub fn repo_root(&self) -> &Path {
        self.snapshot.root()
    }

    /// Shared, immutable directory structure of the repository
    pub fn structure(&self) -> Arc<RepoTree> {
        self.snapshot.structure()
    }

    /// Read a repository-relative file as UTF-8 (lossy)
    pub fn read_to_string(&self, relative: impl AsRef<Path>) -> Result<String> {
        let path = self.repo_root().join(relative.as_ref());
        let bytes = std::fs::read(&path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

pub type Predicate = Arc<dyn Fn(&RuleContext) -> Result<ValidationResult> + Send + Sync>;

/// Typed rule descriptor
#[derive(Clone)]
pub struct Rule {
    pub id: String,
    pub severity: Severity,
    pub description: String,
    pub depends_on: BTreeSet<String>,
    /// Explicit read-set; `None` falls back to the catalog default
    pub reads: Option<Vec<String>>,
    /// Opaque version of the predicate's behaviour. Changing it invalidates
    /// cached results of this rule.
    pub signature: String,
    predicate: Predicate,
}

impl Rule {
    pub fn new<F>(id: impl Into<String>, severity: Severity, predicate: F) -> Self
    where
        F: Fn(&RuleContext) -> Result<ValidationResult> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            severity,
            description: String::new(),
            depends_on: BTreeSet::new(),
            reads: None,
            signature: String::new(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn reads<I, S>(mut self, globs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reads = Some(globs.into_iter().map(Into::into).collect());
        self
    }

    pub fn signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Run the predicate on the calling thread
    pub fn evaluate(&self, ctx: &RuleContext) -> Result<ValidationResult> {
        (self.predicate)(ctx)
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("severity", &self.severity)
            .field("depends_on", &self.depends_on)
            .field("reads", &self.reads)
            .finish_non_exhaustive()
    }
}

/// Table of registered rules, indexed by id
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: Vec<Arc<Rule>>,
    index: HashMap<String, usize>,
    default_reads: Vec<String>,
}

impl RuleRegistry {
    /// Create an empty registry; `default_reads` is the read-set of rules
    /// that do not declare one.
    pub fn new(default_reads: Vec<String>) -> Self {
        Self {
            rules: Vec::new(),
            index: HashMap::new(),
            default_reads,
        }
    }

    pub fn register(&mut self, rule: Rule) -> Result<()> {
        if !RULE_ID.is_match(&rule.id) {
            return Err(EngineError::configuration(
                &rule.id,
                "rule ids must match [a-z0-9][a-z0-9_.-]*",
            )
            .into());
        }
        if self.index.contains_key(&rule.id) {
            return Err(EngineError::configuration(&rule.id, "duplicate rule id").into());
        }
        if rule.depends_on.contains(&rule.id) {
            return Err(EngineError::configuration(&rule.id, "rule depends on itself").into());
        }
        self.index.insert(rule.id.clone(), self.rules.len());
        self.rules.push(Arc::new(rule));
        Ok(())
    }

    /// Check that every declared dependency names a registered rule
    pub fn validate(&self) -> Result<()> {
        for rule in &self.rules {
            if let Some(missing) = rule.depends_on.iter().find(|d| !self.index.contains_key(*d)) {
                return Err(EngineError::configuration(
                    &rule.id,
                    format!("depends on unknown rule '{missing}'"),
                )
                .into());
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Rule>> {
        self.index.get(id).map(|&i| &self.rules[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.rules.iter()
    }

    /// All rule ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.index.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn default_reads(&self) -> &[String] {
        &self.default_reads
    }

    /// Globs the rule reads: explicit when declared, else the catalog default
    pub fn read_set(&self, id: &str) -> &[String] {
        match self.get(id).and_then(|r| r.reads.as_deref()) {
            Some(reads) => reads,
            None => &self.default_reads,
        }
    }

    /// Rule id -> prerequisite ids
    pub fn edges(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.rules
            .iter()
            .map(|r| (r.id.clone(), r.depends_on.clone()))
            .collect()
    }

    /// Rule id -> ids of the rules that declare it as a dependency
    pub fn dependents(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for rule in &self.rules {
            for dep in &rule.depends_on {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(rule.id.clone());
            }
        }
        dependents
    }

    /// `ids` plus all of their transitive prerequisites
    pub fn with_prerequisites(&self, ids: &BTreeSet<String>) -> BTreeSet<String> {
        let mut closed = ids.clone();
        let mut stack: Vec<String> = ids.iter().cloned().collect();
        while let Some(id) = stack.pop() {
            if let Some(rule) = self.get(&id) {
                for dep in &rule.depends_on {
                    if closed.insert(dep.clone()) {
                        stack.push(dep.clone());
                    }
                }
            }
        }
        closed
    }
}
