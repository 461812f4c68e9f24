//! Static validation and security scanning of plugin packages.
//!
//! Runs before any sandbox exists. Manifest, structure, dependency and
//! permission checks run alongside the source scan; any `Error` finding
//! makes the package invalid.

use crate::error::{HostError, HostResult};
use crate::resolver::parse_range;
use plugdock_package::{PackageEntry, PkgPermission, PluginManifest, PluginPackage};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Risk attached to a security finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Points deducted from the security score.
    pub fn penalty(self) -> u32 {
        match self {
            Self::Low => 2,
            Self::Medium => 5,
            Self::High => 15,
            Self::Critical => 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingCategory {
    Manifest,
    Structure,
    Dependencies,
    Permissions,
    Security,
    Quality,
}

/// One observation about a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub category: FindingCategory,
    pub message: String,
    /// `path` or `path:line`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskLevel>,
}

impl Finding {
    fn new(severity: Severity, category: FindingCategory, message: impl Into<String>) -> Self {
        Self {
            severity,
            category,
            message: message.into(),
            location: None,
            risk: None,
        }
    }

    fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity, self.message)?;
        if let Some(location) = &self.location {
            write!(f, " ({location})")?;
        }
        Ok(())
    }
}

/// Outcome of validating one package. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub plugin_id: String,
    pub valid: bool,
    pub findings: Vec<Finding>,
    /// 0..=100, higher is safer.
    pub security_score: u8,
    /// 0..=100, higher is better.
    pub maintainability_score: u8,
}

impl ValidationReport {
    pub fn errors(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Warning)
    }

    /// Every error finding, for error messages.
    pub fn summary(&self) -> String {
        let errors: Vec<String> = self.errors().map(ToString::to_string).collect();
        if errors.is_empty() {
            format!("no errors (security {}, maintainability {})", self.security_score, self.maintainability_score)
        } else {
            format!("{} error(s): {}", errors.len(), errors.join("; "))
        }
    }

    /// `Ok(self)` when valid, otherwise `ValidationFailed`.
    pub fn into_result(self) -> HostResult<Self> {
        if self.valid {
            Ok(self)
        } else {
            Err(HostError::ValidationFailed(Box::new(self)))
        }
    }
}

/// Validator settings, the `[validation]` table of `plugdock.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Security findings at or above this risk are errors.
    pub severity_threshold: RiskLevel,
    /// Optional directories whose absence is a warning.
    pub expected_directories: Vec<String>,
    /// Files larger than this are flagged.
    pub max_file_bytes: u64,
    /// Lines longer than this count against maintainability.
    pub max_line_length: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            severity_threshold: RiskLevel::High,
            expected_directories: vec!["assets".to_string(), "locales".to_string()],
            max_file_bytes: 1024 * 1024,
            max_line_length: 200,
        }
    }
}

const SCANNED_EXTENSIONS: &[&str] = &["js", "mjs", "cjs", "jsx", "ts", "tsx", "py", "lua", "rb", "sh"];

struct RuleSpec {
    name: &'static str,
    pattern: &'static str,
    risk: RiskLevel,
    message: &'static str,
    /// Rule only applies when the manifest does not declare this permission.
    unless_permitted: Option<PkgPermission>,
}

const RULES: &[RuleSpec] = &[
    RuleSpec {
        name: "dynamic-eval",
        pattern: r"\beval\s*\(",
        risk: RiskLevel::Critical,
        message: "dynamic code execution via eval",
        unless_permitted: None,
    },
    RuleSpec {
        name: "function-constructor",
        pattern: r"\bnew\s+Function\s*\(",
        risk: RiskLevel::Critical,
        message: "dynamic code execution via Function constructor",
        unless_permitted: None,
    },
    RuleSpec {
        name: "child-process",
        pattern: r#"\bchild_process\b|\bsubprocess\.|\bos\.system\s*\("#,
        risk: RiskLevel::Critical,
        message: "process spawning",
        unless_permitted: None,
    },
    RuleSpec {
        name: "process-control",
        pattern: r"\bprocess\.(?:exit|kill|binding|dlopen)\s*\(",
        risk: RiskLevel::High,
        message: "host process control",
        unless_permitted: None,
    },
    RuleSpec {
        name: "raw-filesystem",
        pattern: r#"require\s*\(\s*['"](?:node:)?fs(?:/promises)?['"]\s*\)|\bfrom\s+['"](?:node:)?fs(?:/promises)?['"]|\bopen\s*\(\s*['"]/"#,
        risk: RiskLevel::High,
        message: "direct filesystem access outside the storage broker",
        unless_permitted: None,
    },
    RuleSpec {
        name: "unguarded-network",
        pattern: r"\bfetch\s*\(|\bXMLHttpRequest\b|\bnew\s+WebSocket\s*\(|\brequests\.(?:get|post)\s*\(",
        risk: RiskLevel::High,
        message: "network access without the network permission",
        unless_permitted: Some(PkgPermission::Network),
    },
    RuleSpec {
        name: "string-timer",
        pattern: r#"\bset(?:Timeout|Interval)\s*\(\s*['"`]"#,
        risk: RiskLevel::Medium,
        message: "timer with string body evaluates code",
        unless_permitted: None,
    },
    RuleSpec {
        name: "hardcoded-secret",
        pattern: r#"(?i)\b(?:api[_-]?key|secret|password|token)\s*[:=]\s*['"][^'"\s]{8,}['"]"#,
        risk: RiskLevel::Medium,
        message: "hardcoded credential",
        unless_permitted: None,
    },
    RuleSpec {
        name: "obfuscated-blob",
        pattern: r"[A-Za-z0-9+/=]{200,}",
        risk: RiskLevel::Low,
        message: "long encoded blob in source",
        unless_permitted: None,
    },
];

struct ScanRule {
    name: &'static str,
    regex: Regex,
    risk: RiskLevel,
    message: &'static str,
    unless_permitted: Option<PkgPermission>,
}

fn compile_rules() -> Vec<ScanRule> {
    RULES
        .iter()
        .filter_map(|def| match Regex::new(def.pattern) {
            Ok(regex) => Some(ScanRule {
                name: def.name,
                regex,
                risk: def.risk,
                message: def.message,
                unless_permitted: def.unless_permitted,
            }),
            Err(e) => {
                warn!(rule = def.name, "Skipping scan rule that failed to compile: {e}");
                None
            }
        })
        .collect()
}

/// Static validator. Cheap to clone.
#[derive(Clone)]
pub struct StaticValidator {
    config: Arc<ValidationConfig>,
    rules: Arc<Vec<ScanRule>>,
}

impl StaticValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self {
            config: Arc::new(config),
            rules: Arc::new(compile_rules()),
        }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Validates an extracted package directory.
    pub async fn validate(&self, extraction_path: &Path, manifest: &PluginManifest) -> HostResult<ValidationReport> {
        let root = extraction_path.to_path_buf();
        let entries = tokio::task::spawn_blocking(move || read_tree(&root))
            .await
            .map_err(|e| HostError::Io(std::io::Error::other(e)))??;
        Ok(self.validate_entries(manifest, Arc::new(entries)).await)
    }

    /// Validates a package held in memory.
    pub async fn validate_package(&self, package: &PluginPackage) -> HostResult<ValidationReport> {
        Ok(self
            .validate_entries(&package.manifest, Arc::new(package.entries().to_vec()))
            .await)
    }

    async fn validate_entries(&self, manifest: &PluginManifest, entries: Arc<Vec<PackageEntry>>) -> ValidationReport {
        let scan = {
            let validator = self.clone();
            let entries = Arc::clone(&entries);
            let manifest = manifest.clone();
            tokio::task::spawn_blocking(move || validator.scan_sources(&manifest, &entries))
        };

        let mut findings = Vec::new();
        self.check_manifest(manifest, &mut findings);
        self.check_structure(manifest, &entries, &mut findings);
        self.check_dependencies(manifest, &mut findings);
        self.check_permissions(manifest, &mut findings);

        let (security, quality) = match scan.await {
            Ok(result) => result,
            Err(e) => {
                warn!(plugin_id = %manifest.id, "Security scan task failed: {e}");
                (
                    vec![Finding::new(Severity::Error, FindingCategory::Security, "security scan did not complete")],
                    Vec::new(),
                )
            }
        };

        let security_penalty: u32 = security.iter().filter_map(|f| f.risk).map(RiskLevel::penalty).sum();
        let quality_penalty: u32 = quality.len() as u32 * 2
            + findings
                .iter()
                .filter(|f| f.severity >= Severity::Warning)
                .count() as u32
                * 5;
        findings.extend(security);
        findings.extend(quality);

        let report = ValidationReport {
            plugin_id: manifest.id.clone(),
            valid: !findings.iter().any(|f| f.severity == Severity::Error),
            findings,
            security_score: 100u32.saturating_sub(security_penalty) as u8,
            maintainability_score: 100u32.saturating_sub(quality_penalty) as u8,
        };

        info!(
            plugin_id = %report.plugin_id,
            valid = report.valid,
            findings = report.findings.len(),
            security = report.security_score,
            maintainability = report.maintainability_score,
            "Package validated"
        );
        report
    }

    fn check_manifest(&self, manifest: &PluginManifest, findings: &mut Vec<Finding>) {
        for field in manifest.missing_fields() {
            findings.push(
                Finding::new(Severity::Error, FindingCategory::Manifest, format!("required field '{field}' is missing"))
                    .at(plugdock_package::MANIFEST_ENTRY),
            );
        }

        if !manifest.id.is_empty() && !is_valid_id(&manifest.id) {
            findings.push(Finding::new(
                Severity::Error,
                FindingCategory::Manifest,
                format!("plugin id '{}' may only contain letters, digits, '.', '_' and '-'", manifest.id),
            ));
        }

        if !manifest.version.is_empty() && semver::Version::parse(&manifest.version).is_err() {
            findings.push(Finding::new(
                Severity::Error,
                FindingCategory::Manifest,
                format!("version '{}' is not a semantic version", manifest.version),
            ));
        }

        for (field, value) in [("description", &manifest.description), ("author", &manifest.author)] {
            if value.trim().is_empty() {
                findings.push(Finding::new(Severity::Info, FindingCategory::Quality, format!("{field} is empty")));
            }
        }
    }

    fn check_structure(&self, manifest: &PluginManifest, entries: &[PackageEntry], findings: &mut Vec<Finding>) {
        if !manifest.entry_point.is_empty() {
            let entry_point = manifest.entry_point.trim_start_matches("./");
            if !entries.iter().any(|e| e.name == entry_point) {
                findings.push(
                    Finding::new(Severity::Error, FindingCategory::Structure, "entry point file does not exist")
                        .at(manifest.entry_point.clone()),
                );
            }
        }

        for dir in &self.config.expected_directories {
            let prefix = format!("{}/", dir.trim_end_matches('/'));
            if !entries.iter().any(|e| e.name.starts_with(&prefix)) {
                findings.push(Finding::new(
                    Severity::Warning,
                    FindingCategory::Structure,
                    format!("expected directory '{dir}' is absent"),
                ));
            }
        }

        for entry in entries {
            if entry.data.len() as u64 > self.config.max_file_bytes {
                findings.push(
                    Finding::new(
                        Severity::Warning,
                        FindingCategory::Structure,
                        format!("file is {} bytes, above the {} byte limit", entry.data.len(), self.config.max_file_bytes),
                    )
                    .at(entry.name.clone()),
                );
            }
        }
    }

    fn check_dependencies(&self, manifest: &PluginManifest, findings: &mut Vec<Finding>) {
        for (dep, range) in &manifest.dependencies {
            if dep == &manifest.id {
                findings.push(Finding::new(
                    Severity::Error,
                    FindingCategory::Dependencies,
                    "a plugin cannot depend on itself",
                ));
            }
            if let Err(e) = parse_range(range) {
                findings.push(Finding::new(Severity::Error, FindingCategory::Dependencies, format!("dependency '{dep}': {e}")));
            }
        }
    }

    fn check_permissions(&self, manifest: &PluginManifest, findings: &mut Vec<Finding>) {
        for permission in &manifest.permissions {
            if !permission.is_brokered() {
                findings.push(Finding::new(
                    Severity::Error,
                    FindingCategory::Permissions,
                    format!("permission '{}' is never granted to plugins", permission.as_str()),
                ));
            }
        }

        if manifest.requests(PkgPermission::Network) && manifest.network_allow.is_empty() {
            findings.push(Finding::new(
                Severity::Warning,
                FindingCategory::Permissions,
                "network permission declared without any allowed hosts",
            ));
        }
        for pattern in &manifest.network_allow {
            let bare = pattern.strip_prefix("*.").unwrap_or(pattern);
            let is_host = !bare.is_empty()
                && !bare.starts_with('.')
                && bare.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
            if !is_host {
                findings.push(Finding::new(
                    Severity::Warning,
                    FindingCategory::Permissions,
                    format!("network_allow pattern '{pattern}' is not a host name"),
                ));
            }
        }
    }

    /// Returns (security findings, quality findings).
    fn scan_sources(&self, manifest: &PluginManifest, entries: &[PackageEntry]) -> (Vec<Finding>, Vec<Finding>) {
        let mut security = Vec::new();
        let mut quality = Vec::new();

        for entry in entries.iter().filter(|e| is_scanned(&e.name)) {
            let Ok(text) = std::str::from_utf8(&entry.data) else {
                debug!(file = %entry.name, "Skipping non-UTF-8 source");
                continue;
            };

            for (index, line) in text.lines().enumerate() {
                let location = format!("{}:{}", entry.name, index + 1);
                for rule in self.rules.iter() {
                    if rule.unless_permitted.is_some_and(|p| manifest.requests(p)) {
                        continue;
                    }
                    if rule.regex.is_match(line) {
                        let severity = if rule.risk >= self.config.severity_threshold {
                            Severity::Error
                        } else {
                            Severity::Warning
                        };
                        let mut finding = Finding::new(
                            severity,
                            FindingCategory::Security,
                            format!("{} ({})", rule.message, rule.name),
                        )
                        .at(location.clone());
                        finding.risk = Some(rule.risk);
                        security.push(finding);
                    }
                }

                if line.chars().count() > self.config.max_line_length {
                    quality.push(Finding::new(Severity::Info, FindingCategory::Quality, "overlong line").at(location.clone()));
                }
                if line.contains("TODO") || line.contains("FIXME") {
                    quality.push(Finding::new(Severity::Info, FindingCategory::Quality, "unresolved marker").at(location));
                }
            }
        }

        (security, quality)
    }
}

fn is_valid_id(id: &str) -> bool {
    !id.starts_with('.') && id.chars().all(|c| c.is_ascii_alphanumeric() || "._-".contains(c))
}

fn is_scanned(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SCANNED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Reads every regular file under `root`, named relative to it with `/`.
/// Symlinks are not followed.
fn read_tree(root: &Path) -> HostResult<Vec<PackageEntry>> {
    let mut entries = Vec::new();
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for item in std::fs::read_dir(&dir)? {
            let item = item?;
            let file_type = item.file_type()?;
            let path = item.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let relative = path
                    .strip_prefix(root)
                    .map_err(|e| HostError::Io(std::io::Error::other(e)))?
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                entries.push(PackageEntry {
                    name: relative,
                    data: std::fs::read(&path)?,
                });
            }
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugdock_package::PackageBuilder;

    fn manifest() -> PluginManifest {
        PluginManifest {
            id: "acme.clean".into(),
            name: "Clean".into(),
            version: "1.2.0".into(),
            description: "A clean plugin".into(),
            author: "Acme".into(),
            entry_point: "main.js".into(),
            permissions: vec![PkgPermission::Storage],
            ..Default::default()
        }
    }

    fn package(manifest: PluginManifest, source: &str) -> PluginPackage {
        let bytes = PackageBuilder::new(manifest)
            .entry_point(source)
            .file("assets/icon.svg", "<svg/>")
            .file("locales/en.json", "{}")
            .build()
            .unwrap();
        PluginPackage::from_bytes(&bytes).unwrap()
    }

    fn validator() -> StaticValidator {
        StaticValidator::new(ValidationConfig::default())
    }

    #[tokio::test]
    async fn clean_package_is_valid() {
        let pkg = package(manifest(), "export function initialize(ctx) { ctx.storage.set('k', 'v'); }\n");
        let report = validator().validate_package(&pkg).await.unwrap();
        assert!(report.valid, "{}", report.summary());
        assert_eq!(report.security_score, 100);
        assert_eq!(report.maintainability_score, 100);
        assert_eq!(report.plugin_id, "acme.clean");
    }

    #[tokio::test]
    async fn eval_is_critical() {
        let pkg = package(manifest(), "const x = 1;\neval(userInput);\n");
        let report = validator().validate_package(&pkg).await.unwrap();
        assert!(!report.valid);
        let finding = report.errors().next().unwrap();
        assert_eq!(finding.risk, Some(RiskLevel::Critical));
        assert_eq!(finding.location.as_deref(), Some("main.js:2"));
        assert_eq!(report.security_score, 70);
    }

    #[tokio::test]
    async fn threshold_controls_validity() {
        let source = "setTimeout('tick()', 10);\n";
        let report = validator().validate_package(&package(manifest(), source)).await.unwrap();
        assert!(report.valid);
        assert_eq!(report.warnings().count(), 1);

        let strict = StaticValidator::new(ValidationConfig {
            severity_threshold: RiskLevel::Medium,
            ..Default::default()
        });
        let report = strict.validate_package(&package(manifest(), source)).await.unwrap();
        assert!(!report.valid);
    }

    #[tokio::test]
    async fn network_use_requires_permission() {
        let source = "fetch('https://api.example.com');\n";
        let report = validator().validate_package(&package(manifest(), source)).await.unwrap();
        assert!(!report.valid);

        let mut permitted = manifest();
        permitted.permissions.push(PkgPermission::Network);
        permitted.network_allow.push("api.example.com".into());
        let report = validator().validate_package(&package(permitted, source)).await.unwrap();
        assert!(report.valid, "{}", report.summary());
    }

    #[tokio::test]
    async fn missing_fields_and_entry_point() {
        let incomplete = PluginManifest {
            id: "acme.broken".into(),
            entry_point: "main.js".into(),
            ..Default::default()
        };
        let bytes = PackageBuilder::new(incomplete).build().unwrap();
        let pkg = PluginPackage::from_bytes(&bytes).unwrap();
        let report = validator().validate_package(&pkg).await.unwrap();

        assert!(!report.valid);
        let messages: Vec<&str> = report.errors().map(|f| f.message.as_str()).collect();
        assert!(messages.contains(&"required field 'name' is missing"));
        assert!(messages.contains(&"required field 'version' is missing"));
        assert!(messages.contains(&"entry point file does not exist"));
        assert_eq!(report.warnings().count(), 2);
    }

    #[tokio::test]
    async fn bad_dependency_range_and_forbidden_permission() {
        let mut m = manifest();
        m.dependencies.insert("acme.base".into(), "not-a-range".into());
        m.permissions.push(PkgPermission::Process);
        let report = validator().validate_package(&package(m, "export {}\n")).await.unwrap();
        assert!(!report.valid);
        assert!(report.errors().any(|f| f.category == FindingCategory::Dependencies));
        assert!(report.errors().any(|f| f.category == FindingCategory::Permissions));
        assert!(report.summary().starts_with("2 error(s)"));
    }

    #[tokio::test]
    async fn validate_extracted_directory() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = package(manifest(), "require('child_process').exec('rm -rf /');\n");
        pkg.extract_to(dir.path()).unwrap();

        let report = validator().validate(dir.path(), &pkg.manifest).await.unwrap();
        assert!(!report.valid);
        assert!(report.errors().any(|f| f.message.contains("child-process")));
    }

    #[test]
    fn into_result_wraps_report() {
        let report = ValidationReport {
            plugin_id: "p".into(),
            valid: false,
            findings: vec![Finding::new(Severity::Error, FindingCategory::Manifest, "bad")],
            security_score: 100,
            maintainability_score: 100,
        };
        let err = report.into_result().unwrap_err();
        assert_eq!(err.to_string(), "validation failed for 'p': 1 error(s): [error] bad");
    }

    #[test]
    fn every_rule_compiles() {
        assert_eq!(compile_rules().len(), RULES.len());
    }
}
