//! Compile-time table of critical tool-calling/safety patterns and the
//! detector/validator built on top of it.
//!
//! Patterns are matched with the `regex` crate, which guarantees linear-time
//! matching by construction (Thompson NFA, no backtracking) — the ReDoS
//! hardness the classifier requires comes from the engine, not from
//! hand-tuned expressions. Patterns still avoid nested unbounded
//! quantifiers so the compiled automata stay small.

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    P0,
    P1,
    P2,
}

pub struct CriticalPattern {
    pub name: &'static str,
    pub priority: Priority,
    pub required: bool,
    pub regex: Regex,
    pub dependencies: &'static [&'static str],
    pub description: &'static str,
}

impl CriticalPattern {
    fn is_match(&self, text: &str) -> Option<(usize, usize)> {
        self.regex.find(text).map(|m| (m.start(), m.end()))
    }
}

macro_rules! pattern {
    ($name:expr, $priority:expr, $required:expr, $re:expr, $deps:expr, $desc:expr) => {
        CriticalPattern {
            name: $name,
            priority: $priority,
            required: $required,
            regex: Regex::new($re).expect("static critical pattern must compile"),
            dependencies: $deps,
            description: $desc,
        }
    };
}

pub static PATTERNS: Lazy<Vec<CriticalPattern>> = Lazy::new(|| {
    vec![
        pattern!(
            "function-calls-block",
            Priority::P0,
            true,
            r"(?i)<function_calls>",
            &[],
            "the structured tool-call block the model must emit verbatim"
        ),
        pattern!(
            "tool-schema-json",
            Priority::P0,
            true,
            r#"(?i)\bJSON\s+format\b"#,
            &[],
            "instruction that tool arguments must be syntactically valid JSON"
        ),
        pattern!(
            "no-system-prompt-disclosure",
            Priority::P0,
            true,
            r"(?i)\bdo not (?:reveal|disclose|repeat) (?:the|your) system prompt\b",
            &[],
            "prohibition on leaking the system prompt back to the user"
        ),
        pattern!(
            "parallel-tool-calls",
            Priority::P1,
            false,
            r"(?i)\bparallel(?:ly)? (?:tool|function) calls?\b",
            &["function-calls-block"],
            "guidance on batching independent tool calls in one turn"
        ),
        pattern!(
            "tool-result-error-handling",
            Priority::P1,
            false,
            r"(?i)\btool[_ ]result\b.{0,40}\berror\b",
            &["function-calls-block"],
            "guidance on handling a failed tool_result block"
        ),
        pattern!(
            "important-marker",
            Priority::P1,
            false,
            r"\bIMPORTANT\b",
            &[],
            "an emphasized directive the model is expected not to drop"
        ),
        pattern!(
            "sandboxed-execution",
            Priority::P2,
            false,
            r"(?i)\bsandbox(?:ed|ing)?\b",
            &[],
            "note that code execution happens in an isolated environment"
        ),
        pattern!(
            "destructive-action-confirmation",
            Priority::P2,
            false,
            r"(?i)\bconfirm(?:ation)? before\b.{0,30}\b(?:delete|overwrite|destructive)\b",
            &[],
            "guard rail requiring confirmation before irreversible actions"
        ),
    ]
});

#[derive(Debug, Clone)]
pub struct CriticalMatch {
    pub pattern_name: &'static str,
    pub priority: Priority,
    pub span: (usize, usize),
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub missing_required: Vec<&'static str>,
    pub found_sections: Vec<&'static str>,
    pub coverage_percent: f64,
    pub warnings: Vec<String>,
}

/// Detect every critical pattern present in `prompt`. Null bytes, control
/// characters, and regex metacharacters in the input are matched as literal
/// text by the `regex` crate and never cause a panic.
pub fn detect(prompt: &str) -> Vec<CriticalMatch> {
    let mut matches = Vec::new();
    for pattern in PATTERNS.iter() {
        if let Some(span) = pattern.is_match(prompt) {
            matches.push(CriticalMatch { pattern_name: pattern.name, priority: pattern.priority, span });
        }
    }
    matches
}

pub fn validate(prompt: &str) -> ValidationReport {
    let matches = detect(prompt);
    let found: Vec<&'static str> = matches.iter().map(|m| m.pattern_name).collect();

    let missing_required: Vec<&'static str> = PATTERNS
        .iter()
        .filter(|p| p.required && !found.contains(&p.name))
        .map(|p| p.name)
        .collect();

    let mut warnings = Vec::new();
    for pattern in PATTERNS.iter() {
        if !found.contains(&pattern.name) {
            continue;
        }
        for dep in pattern.dependencies {
            if !found.contains(dep) {
                warnings.push(format!(
                    "pattern '{}' matched but its dependency '{}' did not",
                    pattern.name, dep
                ));
            }
        }
    }

    for pattern in PATTERNS.iter().filter(|p| p.priority == Priority::P1 && !found.contains(&p.name))
    {
        warnings.push(format!("recommended pattern '{}' not found", pattern.name));
    }

    let coverage_percent =
        100.0 * found.len() as f64 / PATTERNS.len().max(1) as f64;

    ValidationReport {
        is_valid: missing_required.is_empty(),
        missing_required,
        found_sections: found,
        coverage_percent,
        warnings,
    }
}
