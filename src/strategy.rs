use std::borrow::Cow;
use std::collections::BTreeMap;

use anyhow::{Result, anyhow, bail};
use diffy::{Patch as DiffPatch, apply as apply_patch};
use similar::TextDiff;

use crate::error::TxError;
use crate::model::Strategy;

/// A content transform for one non-`replace` strategy: original text + payload in,
/// new text out.
pub trait PatchStrategy {
    fn apply_diff(&self, original: &str, diff: &str) -> Result<String>;
}

/// Capability table keyed by strategy name. Lookups fail closed.
pub struct StrategyRegistry {
    table: BTreeMap<String, Box<dyn PatchStrategy>>,
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self {
            table: BTreeMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Strategy::NewUnified.as_str(), Box::new(UnifiedDiff));
        registry.register(Strategy::MultiSearchReplace.as_str(), Box::new(SearchReplace));
        registry
    }

    pub fn register(&mut self, name: &str, strategy: Box<dyn PatchStrategy>) {
        self.table.insert(name.to_string(), strategy);
    }

    pub fn lookup(&self, name: &str) -> std::result::Result<&dyn PatchStrategy, TxError> {
        self.table
            .get(name)
            .map(|strategy| strategy.as_ref())
            .ok_or_else(|| TxError::UnknownStrategy(name.to_string()))
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

pub struct UnifiedDiff;

impl PatchStrategy for UnifiedDiff {
    fn apply_diff(&self, original: &str, diff: &str) -> Result<String> {
        let patch_text = ensure_headers(diff);
        let parsed = DiffPatch::from_str(&patch_text)
            .map_err(|err| anyhow!("failed to parse unified diff: {err}"))?;
        apply_unified(original, &parsed)
    }
}

fn ensure_headers(diff: &str) -> String {
    let normalized = normalize_to_lf(diff);
    let mut text = if normalized.lines().any(|line| line.starts_with("--- ")) {
        normalized.into_owned()
    } else {
        format!("--- a\n+++ b\n{normalized}")
    };
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

/// Line terminator a file uses. Strategies work on `\n` text and convert back on
/// the way out so CRLF and CR files keep their bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LineEnding {
    Lf,
    Crlf,
    Cr,
}

impl LineEnding {
    fn of(text: &str) -> Self {
        if text.contains("\r\n") {
            LineEnding::Crlf
        } else if text.contains('\r') {
            LineEnding::Cr
        } else {
            LineEnding::Lf
        }
    }

    fn restore(self, text: String) -> String {
        match self {
            LineEnding::Lf => text,
            LineEnding::Crlf => text.replace('\n', "\r\n"),
            LineEnding::Cr => text.replace('\n', "\r"),
        }
    }
}

fn normalize_to_lf(text: &str) -> Cow<'_, str> {
    if text.contains('\r') {
        Cow::Owned(text.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        Cow::Borrowed(text)
    }
}

fn apply_unified(original: &str, patch: &DiffPatch<'_, str>) -> Result<String> {
    let ending = LineEnding::of(original);
    let patched = apply_patch(normalize_to_lf(original).as_ref(), patch)
        .map_err(|err| anyhow!("failed to apply unified diff: {err}"))?;
    Ok(ending.restore(patched))
}

pub struct SearchReplace;

#[derive(Debug, PartialEq, Eq)]
struct SearchBlock {
    search: Vec<String>,
    replace: Vec<String>,
}

impl PatchStrategy for SearchReplace {
    fn apply_diff(&self, original: &str, diff: &str) -> Result<String> {
        let blocks = parse_search_blocks(&normalize_to_lf(diff))?;
        let ending = LineEnding::of(original);
        let mut text = normalize_to_lf(original).into_owned();
        for (idx, block) in blocks.iter().enumerate() {
            text = apply_search_block(&text, block)
                .map_err(|err| anyhow!("search block {}: {err}", idx + 1))?;
        }
        Ok(ending.restore(text))
    }
}

fn parse_search_blocks(diff: &str) -> Result<Vec<SearchBlock>> {
    enum State {
        Outside,
        Search,
        Replace,
    }

    let mut blocks = Vec::new();
    let mut state = State::Outside;
    let mut search = Vec::new();
    let mut replace = Vec::new();
    for line in diff.lines() {
        let marker = line.trim_end();
        match state {
            State::Outside => {
                if marker == "<<<<<<< SEARCH" {
                    state = State::Search;
                }
            }
            State::Search => {
                if marker == "=======" {
                    state = State::Replace;
                } else {
                    search.push(line.to_string());
                }
            }
            State::Replace => {
                if marker == ">>>>>>> REPLACE" {
                    blocks.push(SearchBlock {
                        search: std::mem::take(&mut search),
                        replace: std::mem::take(&mut replace),
                    });
                    state = State::Outside;
                } else {
                    replace.push(line.to_string());
                }
            }
        }
    }
    if !matches!(state, State::Outside) {
        bail!("unterminated search/replace block");
    }
    if blocks.is_empty() {
        bail!("no search/replace blocks found");
    }
    Ok(blocks)
}

fn apply_search_block(text: &str, block: &SearchBlock) -> Result<String> {
    if block.search.iter().all(|line| line.trim().is_empty()) {
        bail!("SEARCH section is empty");
    }
    let search = block.search.join("\n");
    let replace = block.replace.join("\n");
    if text.contains(&search) {
        return Ok(text.replacen(&search, &replace, 1));
    }

    // Fall back to a whitespace-insensitive line match.
    let lines: Vec<&str> = text.split('\n').collect();
    let window = block.search.len();
    let start = (0..=lines.len().saturating_sub(window)).find(|&start| {
        lines.len() >= window
            && lines[start..start + window]
                .iter()
                .zip(&block.search)
                .all(|(have, want)| have.trim() == want.trim())
    });
    let Some(start) = start else {
        bail!("{}", describe_miss(text, &block.search[0]));
    };
    let mut rebuilt: Vec<&str> = lines[..start].to_vec();
    rebuilt.extend(block.replace.iter().map(String::as_str));
    rebuilt.extend_from_slice(&lines[start + window..]);
    Ok(rebuilt.join("\n"))
}

/// Names the line that looks most like the first SEARCH line.
fn describe_miss(text: &str, first_line: &str) -> String {
    let needle = first_line.trim();
    let closest = text
        .lines()
        .enumerate()
        .map(|(idx, line)| (similarity(line.trim(), needle), idx, line.trim()))
        .filter(|(score, ..)| *score > 0.0)
        .fold(None::<(f32, usize, &str)>, |best, candidate| match best {
            Some(current) if current.0 >= candidate.0 => Some(current),
            _ => Some(candidate),
        });
    match closest {
        Some((_, idx, line)) => format!(
            "search text not found; closest match near line {}: {line}",
            idx + 1
        ),
        None => format!("search text not found for '{needle}'"),
    }
}

fn similarity(line: &str, needle: &str) -> f32 {
    TextDiff::from_chars(line, needle).ratio()
}
