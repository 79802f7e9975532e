// phantom-dspm-core/src/classifier.rs
// Regex-based classification with context gating, confidence scoring and
// masked sample extraction. Pure with respect to its inputs: the same
// (rules, content) pair always yields the same matches.

use std::ops::Range;

use rayon::prelude::*;

use crate::config::ClassifierConfig;
use crate::model::{DataCategory, MatchLocation, SampleMatch, SensitivityLevel};
use crate::pattern_library::{ContentTypeHint, PatternRule, RuleSet};

/// A single rule's aggregated hit on one object.
#[derive(Debug, Clone)]
pub struct Match {
    pub rule_name: String,
    pub category: DataCategory,
    pub sensitivity: SensitivityLevel,
    pub count: u32,
    pub confidence: f64,
    pub sample_matches: Vec<SampleMatch>,
    pub match_locations: Vec<MatchLocation>,
}

/// Input to one classification call.
pub struct ClassifyInput<'a> {
    pub object_path: &'a str,
    pub content: &'a [u8],
    pub content_type_hint: ContentTypeHint,
    pub object_size: u64,
    /// 1-indexed line number of `content`'s first byte within the object.
    /// Non-zero only when classifying one window of a streamed large object.
    pub base_line: u32,
    /// Byte offset within `content` before which hits are dropped: the
    /// overlap with the previous window, already scored there.
    pub skip_before_byte: usize,
}

impl<'a> ClassifyInput<'a> {
    /// A single-window classification over the whole object.
    pub fn whole(object_path: &'a str, content: &'a [u8], content_type_hint: ContentTypeHint, object_size: u64) -> Self {
        Self { object_path, content, content_type_hint, object_size, base_line: 1, skip_before_byte: 0 }
    }
}

/// A single raw hit before de-duplication and confidence scoring.
struct RawHit {
    range: Range<usize>,
    has_context: bool,
}

const HASH_RUN_THRESHOLD: usize = 32;

pub struct Classifier {
    config: ClassifierConfig,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(ClassifierConfig::default())
    }
}

impl Classifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    /// Runs every candidate rule from `rules` against `input.content` and
    /// returns one `Match` per rule that produced at least one hit.
    pub fn classify(&self, rules: &RuleSet, input: ClassifyInput<'_>, scan_size_ceiling: u64) -> Vec<Match> {
        if input.content.is_empty() {
            return Vec::new();
        }

        let truncated = if (input.content.len() as u64) > scan_size_ceiling {
            &input.content[..scan_size_ceiling as usize]
        } else {
            input.content
        };
        let text = String::from_utf8_lossy(truncated);
        let text = text.as_ref();

        let header = input
            .content_type_hint
            .is_tabular()
            .then(|| text.split('\n').next().unwrap_or("").to_string());
        let delimiter = match input.content_type_hint {
            ContentTypeHint::Csv => ',',
            ContentTypeHint::Tsv => '\t',
            _ => ',',
        };

        let candidates = rules.rules_for(input.content_type_hint);
        let per_rule_hits: Vec<(&PatternRule, Vec<RawHit>)> = candidates
            .par_iter()
            .filter_map(|rule| {
                let hits = self.hits_for_rule(rule, text, input.skip_before_byte);
                if hits.is_empty() {
                    None
                } else {
                    Some((*rule, hits))
                }
            })
            .collect();

        let winners = Self::resolve_category_overlaps(per_rule_hits);

        winners
            .into_iter()
            .map(|(rule, hits)| self.build_match(rule, &hits, text, header.as_deref(), delimiter, input.base_line))
            .collect()
    }

    fn hits_for_rule(&self, rule: &PatternRule, text: &str, skip_before_byte: usize) -> Vec<RawHit> {
        let window = self.config.context_window_chars;
        let mut raw: Vec<RawHit> = Vec::new();

        for pattern in &rule.primary_patterns {
            for m in pattern.find_iter(text) {
                let has_context = if rule.context_required {
                    let start = m.start().saturating_sub(window);
                    let end = (m.end() + window).min(text.len());
                    let window_text = &text[start..end];
                    rule.context_patterns.iter().any(|cp| cp.is_match(window_text))
                } else {
                    false
                };
                if rule.context_required && !has_context {
                    continue;
                }
                if m.start() < skip_before_byte {
                    continue;
                }
                raw.push(RawHit {
                    range: m.start()..m.end(),
                    has_context,
                });
            }
        }

        Self::dedupe_overlapping(raw)
    }

    /// Drops hits of the same rule whose byte ranges overlap, keeping the
    /// first occurrence in document order.
    fn dedupe_overlapping(mut hits: Vec<RawHit>) -> Vec<RawHit> {
        hits.sort_by_key(|h| h.range.start);
        let mut out: Vec<RawHit> = Vec::new();
        for hit in hits {
            if let Some(last) = out.last() {
                if hit.range.start < last.range.end {
                    continue;
                }
            }
            out.push(hit);
        }
        out
    }

    /// When multiple rules in the same category fire on an overlapping byte
    /// range, keep the rule with higher priority on that range; ties break
    /// on confidence, then alphabetically on rule name. Only the
    /// conflicting hits are dropped -- a rule's other, non-overlapping hits
    /// survive even if it loses a tie-break elsewhere in the object.
    fn resolve_category_overlaps<'a>(
        per_rule_hits: Vec<(&'a PatternRule, Vec<RawHit>)>,
    ) -> Vec<(&'a PatternRule, Vec<RawHit>)> {
        let mut by_category: std::collections::HashMap<DataCategory, Vec<usize>> = std::collections::HashMap::new();
        for (idx, (rule, _)) in per_rule_hits.iter().enumerate() {
            by_category.entry(rule.category).or_default().push(idx);
        }

        let mut suppressed_hits: Vec<std::collections::HashSet<usize>> = vec![Default::default(); per_rule_hits.len()];
        for indices in by_category.values() {
            if indices.len() < 2 {
                continue;
            }
            for &i in indices {
                for &j in indices {
                    if i >= j {
                        continue;
                    }
                    let (rule_i, rule_j) = (per_rule_hits[i].0, per_rule_hits[j].0);
                    for (hi_idx, hi) in per_rule_hits[i].1.iter().enumerate() {
                        for (hj_idx, hj) in per_rule_hits[j].1.iter().enumerate() {
                            if !(hi.range.start < hj.range.end && hj.range.start < hi.range.end) {
                                continue;
                            }
                            let loser_is_i = if rule_i.priority != rule_j.priority {
                                rule_i.priority < rule_j.priority
                            } else if rule_i.base_confidence != rule_j.base_confidence {
                                rule_i.base_confidence < rule_j.base_confidence
                            } else {
                                rule_i.name > rule_j.name
                            };
                            if loser_is_i {
                                suppressed_hits[i].insert(hi_idx);
                            } else {
                                suppressed_hits[j].insert(hj_idx);
                            }
                        }
                    }
                }
            }
        }

        per_rule_hits
            .into_iter()
            .enumerate()
            .filter_map(|(idx, (rule, hits))| {
                let surviving: Vec<RawHit> = hits
                    .into_iter()
                    .enumerate()
                    .filter(|(hit_idx, _)| !suppressed_hits[idx].contains(hit_idx))
                    .map(|(_, hit)| hit)
                    .collect();
                if surviving.is_empty() {
                    None
                } else {
                    Some((rule, surviving))
                }
            })
            .collect()
    }

    fn build_match(
        &self,
        rule: &PatternRule,
        hits: &[RawHit],
        text: &str,
        header: Option<&str>,
        delimiter: char,
        base_line: u32,
    ) -> Match {
        let mut locations = Vec::new();
        let mut samples = Vec::new();

        for (i, hit) in hits.iter().enumerate() {
            let (line, column) = locate(text, hit.range.start);
            let line = base_line + line - 1;
            let column_name = header.and_then(|h| column_name_for(h, text, hit.range.start, delimiter));

            if i < self.config.match_location_limit {
                locations.push(MatchLocation {
                    line,
                    column: Some(column),
                    column_name: column_name.clone(),
                });
            }
            if i < self.config.sample_match_limit {
                let raw_value = &text[hit.range.clone()];
                samples.push(SampleMatch {
                    line,
                    column: Some(column),
                    column_name,
                    value: mask(raw_value, self.config.mask_visible_chars),
                    context: None,
                });
            }
        }

        let context_bonus = if rule.context_required {
            1.2_f64
        } else {
            1.0_f64
        };
        let structural_bonus = if hits.iter().any(|h| is_hash_like_run(text, &h.range)) {
            0.9
        } else {
            1.0
        };
        let confidence = (rule.base_confidence * context_bonus * structural_bonus).min(1.0);

        Match {
            rule_name: rule.name.clone(),
            category: rule.category,
            sensitivity: rule.sensitivity,
            count: hits.len() as u32,
            confidence,
            sample_matches: samples,
            match_locations: locations,
        }
    }
}

/// 1-indexed line number and 0-indexed column, by counting LFs before
/// `offset` and measuring from the previous newline.
fn locate(text: &str, offset: usize) -> (u32, u32) {
    let before = &text.as_bytes()[..offset];
    let line = before.iter().filter(|&&b| b == b'\n').count() as u32 + 1;
    let line_start = before.iter().rposition(|&b| b == b'\n').map(|p| p + 1).unwrap_or(0);
    let column = (offset - line_start) as u32;
    (line, column)
}

/// Resolves the header column name for a tabular hit by counting
/// delimiters from the start of the hit's own line and indexing into the
/// header line the same way.
fn column_name_for(header: &str, text: &str, offset: usize, delimiter: char) -> Option<String> {
    let before = &text[..offset];
    let line_start = before.rfind('\n').map(|p| p + 1).unwrap_or(0);
    let within_line = &text[line_start..offset];
    let column_index = within_line.matches(delimiter).count();
    header.split(delimiter).nth(column_index).map(|s| s.trim().to_string())
}

/// Masks a raw value: first two and last two visible characters survive,
/// the middle is replaced with `*` of equal length. No raw sensitive value
/// is ever returned by this function.
pub fn mask(value: &str, visible: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= visible * 2 {
        return chars.iter().collect();
    }
    let head: String = chars[..visible].iter().collect();
    let tail: String = chars[chars.len() - visible..].iter().collect();
    let middle = "*".repeat(chars.len() - visible * 2);
    format!("{head}{middle}{tail}")
}

/// True when the hit sits inside a long unbroken alphanumeric run, a
/// common false-positive shape for hashes and encoded blobs.
fn is_hash_like_run(text: &str, range: &Range<usize>) -> bool {
    let bytes = text.as_bytes();
    let is_alnum = |b: u8| b.is_ascii_alphanumeric();
    let mut start = range.start;
    while start > 0 && is_alnum(bytes[start - 1]) {
        start -= 1;
    }
    let mut end = range.end;
    while end < bytes.len() && is_alnum(bytes[end]) {
        end += 1;
    }
    end - start >= HASH_RUN_THRESHOLD
}
