//! Four-tier system-prompt reduction pipeline with a validation gate and
//! automatic fallback to a looser tier — composes [`section_parser`] and
//! [`critical_classifier`].

use std::collections::HashSet;
use std::time::Instant;

use crate::critical_classifier;
use crate::section_parser::{self, PromptSection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Minimal,
    Moderate,
    Aggressive,
    Extreme,
}

impl Tier {
    pub fn looser(self) -> Option<Tier> {
        match self {
            Tier::Extreme => Some(Tier::Aggressive),
            Tier::Aggressive => Some(Tier::Moderate),
            Tier::Moderate => Some(Tier::Minimal),
            Tier::Minimal => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Minimal => "MINIMAL",
            Tier::Moderate => "MODERATE",
            Tier::Aggressive => "AGGRESSIVE",
            Tier::Extreme => "EXTREME",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilterOptions {
    pub preserve_examples: bool,
    pub max_tokens: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct FilterStats {
    pub original_tokens: usize,
    pub filtered_tokens: usize,
    pub reduction_percent: f64,
    pub processing_time_ms: f64,
}

#[derive(Debug, Clone)]
pub struct ValidationSummary {
    pub is_valid: bool,
    pub missing_required: Vec<&'static str>,
}

#[derive(Debug, Clone)]
pub struct FilterResult {
    pub filtered_prompt: String,
    pub stats: FilterStats,
    pub validation: ValidationSummary,
    pub preserved_sections: Vec<String>,
    pub removed_sections: Vec<String>,
    pub applied_tier: Tier,
    pub fallback_occurred: bool,
}

/// 1 token ≈ 4 characters.
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() + 3) / 4
}

pub fn filter(prompt: &str, tier: Tier, options: &FilterOptions) -> FilterResult {
    let start = Instant::now();
    let original_tokens = estimate_tokens(prompt);

    if prompt.trim().is_empty() {
        let validation = critical_classifier::validate(prompt);
        return FilterResult {
            filtered_prompt: prompt.to_string(),
            stats: FilterStats {
                original_tokens,
                filtered_tokens: original_tokens,
                reduction_percent: 0.0,
                processing_time_ms: elapsed_ms(start),
            },
            validation: ValidationSummary {
                is_valid: validation.is_valid,
                missing_required: validation.missing_required,
            },
            preserved_sections: Vec::new(),
            removed_sections: Vec::new(),
            applied_tier: tier,
            fallback_occurred: false,
        };
    }

    let sections = section_parser::parse(prompt);
    let mut current_tier = tier;
    let mut fallback_occurred = false;

    loop {
        let (kept, dropped) = apply_tier(&sections, current_tier, options);
        let reconstructed = section_parser::reconstruct(&kept, prompt.ends_with('\n'));
        let deduped = dedupe_paragraphs(&reconstructed);

        let report = critical_classifier::validate(&deduped);

        if !report.is_valid && current_tier != Tier::Minimal {
            current_tier = current_tier.looser().unwrap_or(Tier::Minimal);
            fallback_occurred = true;
            continue;
        }

        let filtered_tokens = estimate_tokens(&deduped);
        let reduction_percent = if original_tokens == 0 {
            0.0
        } else {
            100.0 * (1.0 - filtered_tokens as f64 / original_tokens as f64)
        };

        return FilterResult {
            filtered_prompt: deduped,
            stats: FilterStats {
                original_tokens,
                filtered_tokens,
                reduction_percent,
                processing_time_ms: elapsed_ms(start),
            },
            validation: ValidationSummary {
                is_valid: report.is_valid,
                missing_required: report.missing_required,
            },
            preserved_sections: kept.iter().map(|s| s.id.clone()).collect(),
            removed_sections: dropped,
            applied_tier: current_tier,
            fallback_occurred,
        };
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Select which sections survive at `tier`, applying `options.max_tokens` as
/// a hard budget afterward (P0-critical sections are exempt from dropping).
fn apply_tier(
    sections: &[PromptSection],
    tier: Tier,
    options: &FilterOptions,
) -> (Vec<PromptSection>, Vec<String>) {
    let mut kept: Vec<PromptSection> = Vec::new();
    let mut dropped: Vec<String> = Vec::new();

    for section in sections {
        let keep = match tier {
            Tier::Minimal => true,
            Tier::Moderate => true,
            // Tier-2 (workflow) is "summarized" in the sense that it never
            // survives intact; a section only keeps its place here when the
            // classifier flags it as critical, same as tier-3.
            Tier::Aggressive => section.tier <= 1 || section.contains_critical,
            Tier::Extreme => section.tier == 0 || section.contains_critical,
        };

        if !keep {
            dropped.push(section.id.clone());
            continue;
        }

        let mut section = section.clone();
        let is_example_like = section.header.to_lowercase().contains("example");

        if tier == Tier::Moderate
            && section.tier == 3
            && is_example_like
            && !options.preserve_examples
            && !section.contains_critical
        {
            section.content = condense(&section.content, 2);
        }

        kept.push(section);
    }

    if let Some(max_tokens) = options.max_tokens {
        enforce_token_budget(&mut kept, &mut dropped, max_tokens);
    }

    (kept, dropped)
}

/// Truncate content to its first `keep_lines` non-blank lines, appending an
/// ellipsis marker when anything was cut.
fn condense(content: &str, keep_lines: usize) -> String {
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() <= keep_lines {
        return content.to_string();
    }
    let mut condensed = lines[..keep_lines].join("\n");
    condensed.push_str("\n...");
    condensed
}

fn enforce_token_budget(kept: &mut Vec<PromptSection>, dropped: &mut Vec<String>, max_tokens: usize) {
    let total_tokens = |sections: &[PromptSection]| -> usize {
        sections.iter().map(|s| estimate_tokens(&s.content) + estimate_tokens(&s.header)).sum()
    };

    while total_tokens(kept) > max_tokens {
        let drop_index = kept
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.contains_critical)
            .max_by_key(|(_, s)| s.tier)
            .map(|(idx, _)| idx);

        match drop_index {
            Some(idx) => {
                let removed = kept.remove(idx);
                dropped.push(removed.id);
            },
            None => break,
        }
    }
}

/// Remove semantically identical adjacent paragraphs (normalized
/// whitespace/case hashes collide), operating on the fully reconstructed
/// text.
fn dedupe_paragraphs(text: &str) -> String {
    let paragraphs: Vec<&str> = text.split("\n\n").collect();
    let mut seen_prev: Option<String> = None;
    let mut seen_all: HashSet<String> = HashSet::new();
    let mut out = Vec::new();

    for paragraph in paragraphs {
        let normalized = normalize_paragraph(paragraph);
        if seen_prev.as_deref() == Some(normalized.as_str()) {
            continue;
        }
        if !normalized.is_empty() && seen_all.contains(&normalized) {
            seen_prev = Some(normalized);
            continue;
        }
        if !normalized.is_empty() {
            seen_all.insert(normalized.clone());
        }
        seen_prev = Some(normalized);
        out.push(paragraph);
    }

    out.join("\n\n")
}

fn normalize_paragraph(paragraph: &str) -> String {
    paragraph.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}
