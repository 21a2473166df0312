//! Rules declared in configuration
//!
//! `[[rules]]` entries are tagged by `kind` and compiled into [`Rule`]s with
//! their regexes built once up front. A malformed declaration is a
//! configuration error for that rule id.

use anyhow::Result;
use globset::GlobSet;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{Rule, RuleContext, RuleRegistry, Severity, ValidationResult};
use crate::error::EngineError;
use crate::shared::glob::build_globset;
use crate::shared::sha256_hex;

/// Violations listed in evidence before truncating
const MAX_LISTED: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Check {
    /// A file or directory must exist
    FileExists { path: String },
    /// A file or directory must not exist
    FileAbsent { path: String },
    /// File names matched by `glob` must match the regex `pattern`
    Naming { glob: String, pattern: String },
    /// No file matched by `glob` may contain the regex `pattern`
    ForbidContent { glob: String, pattern: String },
    /// The file at `path` must contain the regex `pattern`
    RequireContent { path: String, pattern: String },
}

impl Check {
    pub fn kind(&self) -> &'static str {
        match self {
            Check::FileExists { .. } => "file_exists",
            Check::FileAbsent { .. } => "file_absent",
            Check::Naming { .. } => "naming",
            Check::ForbidContent { .. } => "forbid_content",
            Check::RequireContent { .. } => "require_content",
        }
    }
}

/// One `[[rules]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reads: Option<Vec<String>>,
    #[serde(flatten)]
    pub check: Check,
}

impl RuleSpec {
    /// Compile the declaration into an executable rule
    pub fn compile(&self) -> Result<Rule> {
        let id = self.id.clone();
        let severity = self.severity;
        let regex = |pattern: &str| {
            Regex::new(pattern).map_err(|e| {
                EngineError::configuration(&self.id, format!("invalid pattern '{pattern}': {e}"))
            })
        };
        let globset = |glob: &str| {
            build_globset(&[glob.to_string()])
                .map_err(|e| EngineError::configuration(&self.id, format!("{e:#}")))
        };

        let rule = match &self.check {
            Check::FileExists { path } => {
                let path = path.trim_end_matches('/').to_string();
                Rule::new(id.clone(), severity, move |ctx| Ok(file_exists(&id, severity, &path, ctx)))
            }
            Check::FileAbsent { path } => {
                let path = path.trim_end_matches('/').to_string();
                Rule::new(id.clone(), severity, move |ctx| Ok(file_absent(&id, severity, &path, ctx)))
            }
            Check::Naming { glob, pattern } => {
                let set = globset(glob)?;
                let re = regex(pattern)?;
                Rule::new(id.clone(), severity, move |ctx| Ok(naming(&id, severity, &set, &re, ctx)))
            }
            Check::ForbidContent { glob, pattern } => {
                let set = globset(glob)?;
                let re = regex(pattern)?;
                Rule::new(id.clone(), severity, move |ctx| forbid_content(&id, severity, &set, &re, ctx))
            }
            Check::RequireContent { path, pattern } => {
                let path = path.clone();
                let re = regex(pattern)?;
                Rule::new(id.clone(), severity, move |ctx| Ok(require_content(&id, severity, &path, &re, ctx)))
            }
        };

        let signature = serde_json::to_string(self).map(|s| sha256_hex(s.as_bytes()))?;
        let mut rule = rule
            .describe(self.description.clone())
            .depends_on(self.depends_on.iter().cloned())
            .signature(signature);
        rule.reads = self.reads.clone();
        Ok(rule)
    }
}

/// Compile declared rules into a validated registry
pub fn build_registry(specs: &[RuleSpec], default_reads: Vec<String>) -> Result<RuleRegistry> {
    let mut registry = RuleRegistry::new(default_reads);
    for spec in specs {
        registry.register(spec.compile()?)?;
    }
    registry.validate()?;
    tracing::debug!("Registered {} rules", registry.len());
    Ok(registry)
}

fn list(items: &[String]) -> serde_json::Value {
    serde_json::json!(items.iter().take(MAX_LISTED).collect::<Vec<_>>())
}

fn file_exists(id: &str, severity: Severity, path: &str, ctx: &RuleContext) -> ValidationResult {
    let tree = ctx.structure();
    if tree.contains_file(path) || tree.contains_dir(path) {
        ValidationResult::pass(id, severity, format!("{path} exists"))
    } else {
        ValidationResult::fail(id, severity, format!("{path} is missing")).with_evidence("path", path)
    }
}

fn file_absent(id: &str, severity: Severity, path: &str, ctx: &RuleContext) -> ValidationResult {
    let tree = ctx.structure();
    if tree.contains_file(path) || tree.contains_dir(path) {
        ValidationResult::fail(id, severity, format!("{path} must not exist")).with_evidence("path", path)
    } else {
        ValidationResult::pass(id, severity, format!("{path} is absent"))
    }
}

fn naming(id: &str, severity: Severity, set: &GlobSet, re: &Regex, ctx: &RuleContext) -> ValidationResult {
    let tree = ctx.structure();
    let mut checked = 0;
    let mut violations = Vec::new();
    for path in tree.matching(set) {
        checked += 1;
        let name = path.rsplit('/').next().unwrap_or(path);
        if !re.is_match(name) {
            violations.push(path.to_string());
        }
    }

    if violations.is_empty() {
        ValidationResult::pass(id, severity, format!("{checked} file names conform"))
            .with_evidence("checked", checked)
    } else {
        ValidationResult::fail(
            id,
            severity,
            format!("{} of {} file names do not match {}", violations.len(), checked, re.as_str()),
        )
        .with_evidence("violations", list(&violations))
        .with_evidence("violation_count", violations.len())
    }
}

fn forbid_content(
    id: &str,
    severity: Severity,
    set: &GlobSet,
    re: &Regex,
    ctx: &RuleContext,
) -> Result<ValidationResult> {
    let tree = ctx.structure();
    let mut checked = 0;
    let mut violations = Vec::new();
    for path in tree.matching(set) {
        // Files can disappear between the walk and the read
        let Ok(content) = ctx.read_to_string(path) else {
            continue;
        };
        checked += 1;
        if let Some(m) = re.find(&content) {
            let line = content[..m.start()].matches('\n').count() + 1;
            violations.push(format!("{path}:{line}"));
        }
    }

    Ok(if violations.is_empty() {
        ValidationResult::pass(id, severity, format!("{checked} files clean"))
            .with_evidence("checked", checked)
    } else {
        ValidationResult::fail(
            id,
            severity,
            format!("{} files contain forbidden content", violations.len()),
        )
        .with_evidence("violations", list(&violations))
        .with_evidence("violation_count", violations.len())
    })
}

fn require_content(id: &str, severity: Severity, path: &str, re: &Regex, ctx: &RuleContext) -> ValidationResult {
    match ctx.read_to_string(path) {
        Ok(content) if re.is_match(&content) => {
            ValidationResult::pass(id, severity, format!("{path} contains required content"))
        }
        Ok(_) => ValidationResult::fail(id, severity, format!("{path} lacks {}", re.as_str()))
            .with_evidence("path", path),
        Err(_) => ValidationResult::fail(id, severity, format!("{path} cannot be read"))
            .with_evidence("path", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::WalkSnapshot;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn spec(toml_src: &str) -> RuleSpec {
        toml::from_str(toml_src).unwrap()
    }

    fn ctx(dir: &TempDir) -> RuleContext {
        RuleContext::new(Arc::new(WalkSnapshot::new(dir.path())))
    }

    #[test]
    fn test_declarations_parse_by_kind() {
        let rule = spec(
            r#"
            id = "no-todo"
            kind = "forbid_content"
            glob = "**/*.rs"
            pattern = "TODO"
            severity = "high"
            depends_on = ["other"]
            "#,
        );
        assert_eq!(rule.check.kind(), "forbid_content");
        assert_eq!(rule.severity, Severity::High);
        assert_eq!(rule.reads, None);
    }

    #[test]
    fn test_invalid_regex_names_rule() {
        let rule = spec("id = \"bad\"\nkind = \"naming\"\nglob = \"*\"\npattern = \"(\"\n");
        let err = rule.compile().unwrap_err();
        let engine = err.downcast_ref::<EngineError>().unwrap();
        assert_eq!(engine.rule(), Some("bad"));
    }

    #[test]
    fn test_predicates_against_a_tree() -> Result<()> {
        let dir = TempDir::new()?;
        fs::create_dir_all(dir.path().join("docs"))?;
        fs::write(dir.path().join("README.md"), "# Title\n")?;
        fs::write(dir.path().join("docs/Bad Name.md"), "x")?;
        fs::write(dir.path().join("docs/good.md"), "line\n<<<<<<< HEAD\n")?;

        let ctx = ctx(&dir);
        let exists = spec("id = \"a\"\nkind = \"file_exists\"\npath = \"README.md\"\n").compile()?;
        assert!(exists.evaluate(&ctx)?.passed);

        let absent = spec("id = \"b\"\nkind = \"file_absent\"\npath = \"docs/\"\n").compile()?;
        assert!(!absent.evaluate(&ctx)?.passed);

        let naming = spec(
            "id = \"c\"\nkind = \"naming\"\nglob = \"docs/*.md\"\npattern = \"^[a-z.]+$\"\n",
        )
        .compile()?;
        let result = naming.evaluate(&ctx)?;
        assert!(!result.passed);
        assert_eq!(result.evidence["violation_count"].to_json(), 1);

        let markers = spec(
            "id = \"d\"\nkind = \"forbid_content\"\nglob = \"**/*.md\"\npattern = \"(?m)^<{7}\"\n",
        )
        .compile()?;
        let result = markers.evaluate(&ctx)?;
        assert!(!result.passed);
        assert_eq!(result.evidence["violations"].to_json()[0], "docs/good.md:2");

        let title = spec(
            "id = \"e\"\nkind = \"require_content\"\npath = \"README.md\"\npattern = \"(?m)^# \"\n",
        )
        .compile()?;
        assert!(title.evaluate(&ctx)?.passed);
        Ok(())
    }

    #[test]
    fn test_signature_tracks_declaration() -> Result<()> {
        let a = spec("id = \"a\"\nkind = \"file_exists\"\npath = \"README.md\"\n").compile()?;
        let b = spec("id = \"a\"\nkind = \"file_exists\"\npath = \"README\"\n").compile()?;
        assert_ne!(a.signature, b.signature);
        Ok(())
    }

    #[test]
    fn test_build_registry_rejects_unknown_dependency() {
        let specs = vec![spec(
            "id = \"a\"\nkind = \"file_exists\"\npath = \"x\"\ndepends_on = [\"ghost\"]\n",
        )];
        assert!(build_registry(&specs, Vec::new()).is_err());
    }
}
