//! Keyword-based tool-intent detection and instruction injection for small
//! local models that sometimes ignore their tool schemas.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone)]
pub struct ToolKeywords {
    pub tool_name: String,
    pub positive: Vec<String>,
    pub negative_phrases: Vec<String>,
    pub required_params: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionStyle {
    Explicit,
    Subtle,
}

#[derive(Debug, Clone)]
pub struct InjectorConfig {
    pub enabled: bool,
    pub style: InjectionStyle,
    pub confidence_threshold: f64,
    pub max_injections_per_conversation: u32,
}

#[derive(Debug, Clone, Default)]
pub struct DetectionDebug {
    pub candidate_tools: Vec<String>,
    pub matched_keywords: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct InjectionResult {
    pub modified: bool,
    pub modified_message: String,
    pub injected_tool: Option<String>,
    pub injection_count: u32,
    pub security_flag: bool,
    pub debug: DetectionDebug,
}

static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://\S+").unwrap());
static FILE_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:[./~][\w./-]+|\b\w[\w-]*\.\w{1,5}\b)").unwrap());
static GLOB_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[*?]|\*\*").unwrap());
static PRIVILEGE_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(/etc/passwd|/etc/shadow|id_rsa|\.ssh/|/root/|sudoers|\.aws/credentials)")
        .unwrap()
});

const WEB_SEARCH_KEYWORDS: &[&str] = &[
    "search the web",
    "search online",
    "look up",
    "latest news",
    "recent news",
    "current events",
    "what's happening",
    "find information about",
    "search for",
    "google",
    "web search",
];

fn word_boundary_match(haystack: &str, phrase: &str) -> bool {
    let escaped = regex::escape(phrase);
    let pattern = format!(r"(?i)\b{escaped}\b");
    Regex::new(&pattern).map(|re| re.is_match(haystack)).unwrap_or(false)
}

/// Confidence = matched keywords / candidate keywords considered, after
/// negative-phrase suppression.
fn score_tool(message: &str, keywords: &ToolKeywords) -> (f64, Vec<String>) {
    for negative in &keywords.negative_phrases {
        if word_boundary_match(message, negative) {
            return (0.0, Vec::new());
        }
    }

    let mut matched = Vec::new();
    for keyword in &keywords.positive {
        if word_boundary_match(message, keyword) {
            matched.push(keyword.clone());
        }
    }

    if keywords.positive.is_empty() {
        return (0.0, matched);
    }

    let confidence = matched.len() as f64 / keywords.positive.len() as f64;
    (confidence, matched)
}

fn specificity_score(keyword: &str) -> usize {
    keyword.split_whitespace().count()
}

fn parameters_present(message: &str, keywords: &ToolKeywords) -> bool {
    if URL_RE.is_match(message) || GLOB_RE.is_match(message) || FILE_PATH_RE.is_match(message) {
        return true;
    }
    keywords.required_params.iter().any(|p| message.to_lowercase().contains(&p.to_lowercase()))
}

fn detect_security_flag(message: &str) -> bool {
    PRIVILEGE_PATH_RE.is_match(message)
}

/// Detect tool intent in `message` against the configured `tools` and, if
/// confidence clears the threshold and the per-conversation cap has not
/// been reached, append a short instruction naming the tool and its
/// required parameters.
pub fn inject(
    message: &str,
    tools: &[ToolKeywords],
    config: &InjectorConfig,
    current_count: u32,
) -> InjectionResult {
    if !config.enabled || tools.is_empty() {
        return unmodified(message);
    }

    if current_count >= config.max_injections_per_conversation {
        return unmodified(message);
    }

    let mut best: Option<(&ToolKeywords, f64, Vec<String>)> = None;
    for tool in tools {
        let (confidence, matched) = score_tool(message, tool);
        if confidence <= 0.0 {
            continue;
        }
        let better = match &best {
            None => true,
            Some((best_tool, best_conf, _)) => {
                if (confidence - best_conf).abs() > f64::EPSILON {
                    confidence > *best_conf
                } else {
                    let tie_break_specificity =
                        matched.iter().map(|k| specificity_score(k)).max().unwrap_or(0)
                            > best_tool
                                .positive
                                .iter()
                                .map(|k| specificity_score(k))
                                .max()
                                .unwrap_or(0);
                    let params_tiebreak =
                        parameters_present(message, tool) && !parameters_present(message, best_tool);
                    tie_break_specificity || params_tiebreak
                }
            },
        };
        if better {
            best = Some((tool, confidence, matched));
        }
    }

    let Some((tool, confidence, matched)) = best else {
        return unmodified(message);
    };

    if confidence < config.confidence_threshold {
        return unmodified(message);
    }

    let instruction = render_instruction(tool, config.style);
    let modified_message = format!("{message}\n\n{instruction}");
    let security_flag = detect_security_flag(message);

    InjectionResult {
        modified: true,
        modified_message,
        injected_tool: Some(tool.tool_name.clone()),
        injection_count: current_count + 1,
        security_flag,
        debug: DetectionDebug {
            candidate_tools: tools.iter().map(|t| t.tool_name.clone()).collect(),
            matched_keywords: matched,
            confidence,
        },
    }
}

fn unmodified(message: &str) -> InjectionResult {
    InjectionResult {
        modified: false,
        modified_message: message.to_string(),
        injected_tool: None,
        injection_count: 0,
        security_flag: false,
        debug: DetectionDebug::default(),
    }
}

fn render_instruction(tool: &ToolKeywords, style: InjectionStyle) -> String {
    match style {
        InjectionStyle::Explicit => {
            let params = if tool.required_params.is_empty() {
                String::new()
            } else {
                format!(" with parameters: {}", tool.required_params.join(", "))
            };
            format!("Use the {} tool now{}.", tool.tool_name, params)
        },
        InjectionStyle::Subtle => {
            format!("(Hint: the {} tool is available for this.)", tool.tool_name)
        },
    }
}

/// The fixed eleven-phrase WebSearch keyword set plus the false-positive
/// suppression list from the tool-instruction injector spec.
pub fn web_search_keywords() -> ToolKeywords {
    ToolKeywords {
        tool_name: "WebSearch".to_string(),
        positive: WEB_SEARCH_KEYWORDS.iter().map(|s| s.to_string()).collect(),
        negative_phrases: vec![
            "research".to_string(),
            "current directory".to_string(),
            "current file".to_string(),
            "current function".to_string(),
        ],
        required_params: vec!["query".to_string()],
    }
}

/// WebFetch is detected by explicit verbs or the presence of an http(s) URL.
pub fn web_fetch_keywords() -> ToolKeywords {
    ToolKeywords {
        tool_name: "WebFetch".to_string(),
        positive: vec![
            "fetch".to_string(),
            "download".to_string(),
            "scrape".to_string(),
            "get from url".to_string(),
        ],
        negative_phrases: vec!["read this carefully".to_string()],
        required_params: vec!["url".to_string()],
    }
}

pub fn read_keywords() -> ToolKeywords {
    ToolKeywords {
        tool_name: "Read".to_string(),
        positive: vec!["read the file".to_string(), "open the file".to_string(), "show me".to_string()],
        negative_phrases: vec!["read this carefully".to_string()],
        required_params: vec!["file_path".to_string()],
    }
}

#[allow(dead_code)]
fn unique_tool_names(tools: &[ToolKeywords]) -> HashSet<String> {
    tools.iter().map(|t| t.tool_name.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config() -> InjectorConfig {
        InjectorConfig {
            enabled: true,
            style: InjectionStyle::Subtle,
            confidence_threshold: 0.15,
            max_injections_per_conversation: 1,
        }
    }

    #[test]
    fn false_positive_guard_suppresses_read_and_search() {
        let tools = vec![read_keywords(), web_search_keywords()];
        let config = default_config();

        let r1 = inject("Please read this carefully", &tools, &config, 0);
        assert!(!r1.modified);

        let r2 = inject("I will write a detailed explanation", &tools, &config, 0);
        assert!(!r2.modified);
    }

    #[test]
    fn research_does_not_match_search() {
        let tools = vec![web_search_keywords()];
        let config = default_config();
        let result = inject("I need to do some research on this topic", &tools, &config, 0);
        assert!(!result.modified);
    }

    #[test]
    fn detects_web_search_intent() {
        let tools = vec![web_search_keywords()];
        let config = default_config();
        let result = inject("Can you search for the latest news on Rust releases?", &tools, &config, 0);
        assert!(result.modified);
        assert_eq!(result.injected_tool.as_deref(), Some("WebSearch"));
    }

    #[test]
    fn respects_max_injections_per_conversation() {
        let tools = vec![web_search_keywords()];
        let config = default_config();
        let result = inject("search for recent news", &tools, &config, 1);
        assert!(!result.modified);
    }

    #[test]
    fn disabled_config_never_modifies() {
        let tools = vec![web_search_keywords()];
        let mut config = default_config();
        config.enabled = false;
        let result = inject("search for recent news", &tools, &config, 0);
        assert!(!result.modified);
    }

    #[test]
    fn security_flag_set_for_privileged_paths() {
        let tools = vec![read_keywords()];
        let config = default_config();
        let result = inject("show me /etc/passwd please", &tools, &config, 0);
        assert!(result.modified);
        assert!(result.security_flag);
    }

    #[test]
    fn explicit_style_names_required_parameters() {
        let tools = vec![web_search_keywords()];
        let mut config = default_config();
        config.style = InjectionStyle::Explicit;
        let result = inject("search for recent news on rust", &tools, &config, 0);
        assert!(result.modified_message.contains("query"));
    }
}
