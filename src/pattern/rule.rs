use regex::Regex;
use serde::{Deserialize, Serialize};

use super::events::PatternEvent;
use super::PatternError;

/// How urgent a detection is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
}

/// Declarative form of a rule, as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    /// Regex matched against escape-stripped output text.
    pub pattern: String,
    #[serde(default)]
    pub severity: Severity,
    /// Machine-readable action identifier for the suggestion, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Human-readable label. `{match}` and `{rule}` are substituted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl RuleSpec {
    fn new(name: &str, pattern: &str, severity: Severity) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
            severity,
            action: None,
            label: None,
        }
    }

    fn suggest(mut self, action: &str, label: &str) -> Self {
        self.action = Some(action.to_string());
        self.label = Some(label.to_string());
        self
    }
}

/// Template for the suggestion a rule emits alongside its pattern event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionTemplate {
    pub action: String,
    pub label: String,
}

impl ActionTemplate {
    /// Fill the label placeholders from a pattern event.
    pub fn render(&self, event: &PatternEvent) -> String {
        self.label
            .replace("{rule}", &event.rule)
            .replace("{match}", &event.excerpt)
    }
}

/// A compiled, immutable rule.
#[derive(Debug, Clone)]
pub struct PatternRule {
    name: String,
    severity: Severity,
    matcher: Regex,
    action: Option<ActionTemplate>,
    /// The pattern only matches at the end of the text seen so far, so a
    /// match there is complete and need not wait for more output.
    anchored_at_end: bool,
}

impl PatternRule {
    pub fn compile(spec: &RuleSpec) -> Result<Self, PatternError> {
        if spec.name.trim().is_empty() {
            return Err(PatternError::EmptyName);
        }
        let matcher = Regex::new(&spec.pattern).map_err(|source| PatternError::InvalidRegex {
            rule: spec.name.clone(),
            source,
        })?;
        let action = spec.action.as_ref().map(|action| ActionTemplate {
            action: action.clone(),
            label: spec.label.clone().unwrap_or_else(|| action.clone()),
        });
        Ok(Self {
            name: spec.name.clone(),
            severity: spec.severity,
            anchored_at_end: anchored_at_end(&spec.pattern),
            matcher,
            action,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn matcher(&self) -> &Regex {
        &self.matcher
    }

    pub fn action(&self) -> Option<&ActionTemplate> {
        self.action.as_ref()
    }

    pub fn anchored_at_end(&self) -> bool {
        self.anchored_at_end
    }

    /// Back to the declarative form (used by `termbridge rules`).
    pub fn to_spec(&self) -> RuleSpec {
        RuleSpec {
            name: self.name.clone(),
            pattern: self.matcher.as_str().to_string(),
            severity: self.severity,
            action: self.action.as_ref().map(|a| a.action.clone()),
            label: self.action.as_ref().map(|a| a.label.clone()),
        }
    }
}

fn anchored_at_end(pattern: &str) -> bool {
    let pattern = pattern.trim_end();
    if pattern.ends_with(r"\z") {
        return !pattern.ends_with(r"\\z");
    }
    // An odd run of backslashes before `$` escapes it.
    let Some(body) = pattern.strip_suffix('$') else {
        return false;
    };
    let slashes = body.len() - body.trim_end_matches('\\').len();
    slashes % 2 == 0
}

/// The rule set shipped with the bridge.
pub fn builtin_rules() -> Vec<RuleSpec> {
    vec![
        RuleSpec::new("typescript-error", r"(?i)error TS\d+:", Severity::Error)
            .suggest("diagnose-types", "Run type diagnostics for {match}"),
        RuleSpec::new(
            "module-not-found",
            r"(?i)cannot find module|module not found",
            Severity::Error,
        )
        .suggest("install-dependencies", "Install missing dependencies"),
        RuleSpec::new("merge-conflict", r"CONFLICT|Merge conflict", Severity::Warning)
            .suggest("resolve-conflicts", "Open the conflict resolver"),
        RuleSpec::new(
            "progress-indicator",
            r"(?i)thinking\.\.\.|analyzing\.\.\.",
            Severity::Info,
        )
        .suggest("show-progress", "Working..."),
        RuleSpec::new("test-failure", r"(?i)\d+ tests? failed", Severity::Error)
            .suggest("debug-tests", "Debug failing tests: {match}"),
        RuleSpec::new("error-message", r"(?i)\berror:[^\r\n]*", Severity::Error)
            .suggest("explain-error", "Explain: {match}"),
        RuleSpec::new(
            "command-not-found",
            r"command not found|is not recognized as an internal or external command",
            Severity::Error,
        )
        .suggest("install-command", "Look up how to install the missing command"),
        RuleSpec::new(
            "shell-prompt",
            // One space after the sigil; `%` after a digit is a percentage.
            r"(?:^|\n)(?:[^\r\n]{0,120}[^\r\n\d])?% $|(?:^|\n)[^\r\n]{0,120}[$#>❯➜] $",
            Severity::Info,
        ),
        RuleSpec::new(
            "completion-marker",
            r"(?i)\b(?:build succeeded|compiled successfully|all tests passed|done in \d+(?:\.\d+)?m?s)",
            Severity::Info,
        )
        .suggest("notify-complete", "Finished: {match}"),
    ]
}
