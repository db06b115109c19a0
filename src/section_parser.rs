//! Markdown section splitter for system prompts.
//!
//! Headers are lines whose first non-space characters are one to six `#`
//! followed by a space. Headers inside fenced (```) or inline (`` ` ``) code
//! are ignored — fenced blocks are tracked line by line, and a line opening
//! with inline code naturally fails the header regex since its first
//! non-space character is a backtick, not `#`.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::critical_classifier;

static HEADER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(#{1,6})\s+(.*)$").unwrap());
static FENCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*```").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSection {
    pub id: String,
    pub header: String,
    pub content: String,
    pub start_line: usize,
    pub end_line: usize,
    pub tier: u8,
    pub contains_critical: bool,
}

struct RawHeader {
    level: usize,
    text: String,
    line: usize,
}

/// Parse `markdown` into an ordered list of sections. Total: every line of
/// `markdown` belongs to exactly one section's header or content, including
/// a leading `_preamble` section when there is text before the first header.
pub fn parse(markdown: &str) -> Vec<PromptSection> {
    let lines: Vec<&str> = markdown.lines().collect();
    let mut headers = Vec::new();
    let mut in_fence = false;

    for (idx, line) in lines.iter().enumerate() {
        if FENCE_RE.is_match(line) {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(cap) = HEADER_RE.captures(line.trim_start()) {
            let level = cap[1].len();
            let text = cap[2].trim_end().to_string();
            headers.push(RawHeader { level, text, line: idx });
        }
    }

    let mut sections = Vec::new();

    if let Some(first) = headers.first() {
        if first.line > 0 {
            let content = lines[0..first.line].join("\n").trim().to_string();
            if !content.is_empty() {
                let end_line = content.lines().count().saturating_sub(1);
                sections.push(build_section("_preamble", "", &content, 0, end_line));
            }
        }
    } else if !lines.is_empty() {
        let content = lines.join("\n").trim().to_string();
        let end_line = content.lines().count().saturating_sub(1);
        sections.push(build_section("_preamble", "", &content, 0, end_line));
        return sections;
    }

    for (i, header) in headers.iter().enumerate() {
        let content_start = header.line + 1;
        let mut content_end = lines.len().saturating_sub(1);

        for next in headers.iter().skip(i + 1) {
            if next.level <= header.level {
                content_end = next.line.saturating_sub(1);
                break;
            }
        }

        let content_end = if content_start > content_end { content_start.saturating_sub(1) } else { content_end };
        let raw_content = if content_start <= content_end && content_start < lines.len() {
            lines[content_start..=content_end.min(lines.len().saturating_sub(1))].join("\n")
        } else {
            String::new()
        };
        // Blank lines directly after the header and directly before the next
        // header are formatting gaps, not section content — reconstruct()
        // re-inserts them via its own "\n\n" joiners.
        let content = raw_content.trim().to_string();

        let header_markers = "#".repeat(header.level);
        let header_line = format!("{header_markers} {}", header.text);
        let id = generate_id(&header.text);

        let end_line =
            if content.is_empty() { header.line } else { header.line + content.lines().count() };

        sections.push(build_section(&id, &header_line, &content, header.line, end_line));
    }

    sections
}

fn build_section(id: &str, header: &str, content: &str, start_line: usize, end_line: usize) -> PromptSection {
    let tier = tier_for_header(header);
    let contains_critical = section_contains_critical(content);
    PromptSection {
        id: id.to_string(),
        header: header.to_string(),
        content: content.to_string(),
        start_line,
        end_line,
        tier,
        contains_critical,
    }
}

/// Lowercase, strip non-alphanumeric (except spaces), collapse whitespace to
/// single hyphens, trim leading/trailing hyphens. Not guaranteed unique.
pub fn generate_id(header_text: &str) -> String {
    let lower = header_text.to_lowercase();
    let cleaned: String =
        lower.chars().filter(|c| c.is_alphanumeric() || c.is_whitespace()).collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join("-");
    collapsed.trim_matches('-').to_string()
}

const TIER0_KEYWORDS: &[&str] =
    &["tool usage policy", "available tools", "function calling", "tool schema"];
const TIER1_KEYWORDS: &[&str] = &["core identity", "tone", "doing tasks", "task management"];
const TIER2_KEYWORDS: &[&str] = &["planning", "git workflow", "asking questions"];

/// Tier is a pure function of the normalized header text.
pub fn tier_for_header(header: &str) -> u8 {
    let normalized = header.trim_start_matches('#').trim().to_lowercase();
    if TIER0_KEYWORDS.iter().any(|k| normalized.contains(k)) {
        0
    } else if TIER1_KEYWORDS.iter().any(|k| normalized.contains(k)) {
        1
    } else if TIER2_KEYWORDS.iter().any(|k| normalized.contains(k)) {
        2
    } else {
        3
    }
}

fn section_contains_critical(content: &str) -> bool {
    if !critical_classifier::detect(content).is_empty() {
        return true;
    }
    if content.contains("IMPORTANT") || content.contains("<function_calls>") {
        return true;
    }
    if let Some(pos) = content.find("JSON format") {
        let mut window_start = pos.saturating_sub(60);
        while window_start > 0 && !content.is_char_boundary(window_start) {
            window_start -= 1;
        }
        let window = &content[window_start..pos];
        if window.to_lowercase().contains("tool") {
            return true;
        }
    }
    false
}

/// Emit `header + "\n\n" + content` per section joined by `"\n\n"`, in
/// original order. Preserves a trailing newline iff `trailing_newline`.
pub fn reconstruct(sections: &[PromptSection], trailing_newline: bool) -> String {
    let parts: Vec<String> = sections
        .iter()
        .map(|s| {
            if s.header.is_empty() {
                s.content.clone()
            } else if s.content.is_empty() {
                s.header.clone()
            } else {
                format!("{}\n\n{}", s.header, s.content)
            }
        })
        .collect();
    let mut out = parts.join("\n\n");
    if trailing_newline && !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_top_level_headers() {
        let input = "# Tool Usage Policy\n\nUse JSON.\n\n# Core Identity\n\nYou are X.\n";
        let sections = parse(input);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].id, "tool-usage-policy");
        assert_eq!(sections[0].tier, 0);
        assert_eq!(sections[1].id, "core-identity");
        assert_eq!(sections[1].tier, 1);
    }

    #[test]
    fn nested_subheaders_stay_in_parent_content() {
        let input = "# Planning\n\nIntro.\n\n## Substep\n\nDetail.\n\n# Next\n\nOther.\n";
        let sections = parse(input);
        assert_eq!(sections.len(), 2);
        assert!(sections[0].content.contains("## Substep"));
        assert!(sections[0].content.contains("Detail."));
    }

    #[test]
    fn ignores_headers_inside_fenced_code() {
        let input = "# Real\n\n```\n# not a header\n```\n\nBody.\n";
        let sections = parse(input);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].id, "real");
    }

    #[test]
    fn preamble_becomes_synthetic_section() {
        let input = "Leading text.\n\n# First\n\nBody.\n";
        let sections = parse(input);
        assert_eq!(sections[0].id, "_preamble");
        assert_eq!(sections[0].tier, 3);
        assert_eq!(sections[1].id, "first");
    }

    #[test]
    fn no_preamble_without_leading_text() {
        let input = "# First\n\nBody.\n";
        let sections = parse(input);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].id, "first");
    }

    #[test]
    fn round_trip_reconstruct() {
        let input = "# A\n\nfoo\n\n# B\n\nbar";
        let sections = parse(input);
        let out = reconstruct(&sections, false);
        assert_eq!(out, input);
    }

    #[test]
    fn non_unique_ids_are_permitted() {
        let input = "# Notes\n\nfirst\n\n# Notes\n\nsecond\n";
        let sections = parse(input);
        assert_eq!(sections[0].id, sections[1].id);
    }

    #[test]
    fn multibyte_text_before_json_format_does_not_panic() {
        let filler: String = std::iter::repeat('\u{00e9}').take(59).collect();
        let content = format!("{filler}\u{1f600} respond in JSON format please");
        assert!(!section_contains_critical(&content));
    }
}
