use regex::Regex;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::TxError;
use crate::files::validate_relative;
use crate::model::{ChangeSet, Control, FileOperation, Strategy};

pub const DELETE_SENTINEL: &str = "//TODO: delete this file";
pub const START_MARKER: &str = "// START";
pub const END_MARKER: &str = "// END";
pub const RENAME_ANNOTATION: &str = "rename-file";

const SEARCH_MARKER: &str = "<<<<<<< SEARCH";
const REPLACE_MARKER: &str = ">>>>>>> REPLACE";

/// Lenient entry point: malformed text yields `None`, never an error.
pub fn parse(raw: &str) -> Option<ChangeSet> {
    try_parse(raw).ok()
}

pub fn try_parse(raw: &str) -> Result<ChangeSet, TxError> {
    let text = raw.replace("\r\n", "\n");
    let lines: Vec<&str> = text.lines().collect();
    let fences = scan_fences(&lines);

    let (control, control_lines) = locate_control(&lines, &fences)?;
    let mut consumed = vec![false; lines.len()];
    for idx in control_lines {
        consumed[idx] = true;
    }

    let header = Regex::new(r"^[^\s/]*\s*//\s*(.*\S)\s*$")
        .map_err(|err| TxError::Parse(format!("invalid header pattern: {err}")))?;
    let mut operations = Vec::new();
    for fence in &fences {
        if consumed[fence.open] {
            continue;
        }
        let Some(caps) = header.captures(&fence.info) else {
            continue;
        };
        let (path, strategy) = split_annotation(&caps[1]);
        let body = lines[fence.open + 1..fence.close].join("\n");
        operations.push(build_operation(path, strategy, &body)?);
        for flag in &mut consumed[fence.open..=fence.close] {
            *flag = true;
        }
    }

    if operations.is_empty() {
        return Err(TxError::Parse("no file operations found".into()));
    }
    for op in &operations {
        for path in op.touched_paths() {
            validate_relative(path)
                .map_err(|reason| TxError::Parse(format!("invalid path '{path}': {reason}")))?;
        }
    }

    let reasoning = lines
        .iter()
        .zip(&consumed)
        .filter(|(_, used)| !**used)
        .map(|(line, _)| line.trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();

    Ok(ChangeSet {
        control,
        operations,
        reasoning,
    })
}

#[derive(Debug, Clone)]
struct Fence {
    open: usize,
    close: usize,
    info: String,
}

fn scan_fences(lines: &[&str]) -> Vec<Fence> {
    let mut fences = Vec::new();
    let mut idx = 0;
    while idx < lines.len() {
        let Some(info) = lines[idx].trim_start().strip_prefix("```") else {
            idx += 1;
            continue;
        };
        let close = (idx + 1..lines.len()).find(|&candidate| lines[candidate].trim() == "```");
        let Some(close) = close else {
            break;
        };
        fences.push(Fence {
            open: idx,
            close,
            info: info.trim().to_string(),
        });
        idx = close + 1;
    }
    fences
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawControl {
    project_id: Option<String>,
    uuid: Option<String>,
    git_commit_msg: Option<String>,
    prompt_summary: Option<String>,
}

fn locate_control(lines: &[&str], fences: &[Fence]) -> Result<(Control, Vec<usize>), TxError> {
    let labeled = fences
        .iter()
        .rev()
        .find(|fence| matches!(fence.info.as_str(), "yaml" | "yml"));
    if let Some(fence) = labeled {
        let body = lines[fence.open + 1..fence.close].join("\n");
        let control = parse_control(&body)?;
        return Ok((control, (fence.open..=fence.close).collect()));
    }

    let tail_start = fences.last().map(|fence| fence.close + 1).unwrap_or(0);
    let tail_is_blank = lines[tail_start..].iter().all(|line| line.trim().is_empty());

    if let Some(fence) = fences.last().filter(|fence| fence.info.is_empty()) {
        if tail_is_blank {
            let body = lines[fence.open + 1..fence.close].join("\n");
            let control = parse_control(&body)?;
            return Ok((control, (fence.open..=fence.close).collect()));
        }
    }

    // Bare YAML: the last paragraph of the text after the final fence.
    let Some(end) = (tail_start..lines.len())
        .rev()
        .find(|&idx| !lines[idx].trim().is_empty())
    else {
        return Err(TxError::Parse("control block not found".into()));
    };
    let start = (tail_start..=end)
        .rev()
        .take_while(|&idx| !lines[idx].trim().is_empty())
        .last()
        .unwrap_or(end);
    let body = lines[start..=end].join("\n");
    let control = parse_control(&body)?;
    Ok((control, (start..=end).collect()))
}

fn parse_control(body: &str) -> Result<Control, TxError> {
    let raw: RawControl = serde_yaml::from_str(body)
        .map_err(|err| TxError::Parse(format!("malformed control block: {err}")))?;
    let project_id = raw
        .project_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| TxError::Parse("control block is missing projectId".into()))?;
    let uuid = raw
        .uuid
        .ok_or_else(|| TxError::Parse("control block is missing uuid".into()))?;
    let uuid = Uuid::parse_str(uuid.trim())
        .map_err(|err| TxError::Parse(format!("invalid uuid '{uuid}': {err}")))?;
    Ok(Control {
        uuid,
        project_id,
        git_commit_msg: raw.git_commit_msg,
        prompt_summary: raw.prompt_summary,
    })
}

fn split_annotation(annotation: &str) -> (String, Option<Strategy>) {
    let annotation = annotation.trim();
    if let Some(rest) = annotation.strip_prefix('"') {
        let Some(end) = rest.find('"') else {
            return (annotation.to_string(), None);
        };
        let tail = rest[end + 1..].trim();
        if tail.is_empty() {
            return (rest[..end].to_string(), None);
        }
        return match Strategy::from_keyword(tail) {
            Some(strategy) => (rest[..end].to_string(), Some(strategy)),
            None => (annotation.to_string(), None),
        };
    }
    match annotation.rsplit_once(char::is_whitespace) {
        Some((head, tail)) => match Strategy::from_keyword(tail) {
            Some(strategy) => (head.trim_end().to_string(), Some(strategy)),
            None => (annotation.to_string(), None),
        },
        None => (annotation.to_string(), None),
    }
}

#[derive(Debug, Deserialize)]
struct RenameBody {
    from: String,
    to: String,
}

fn build_operation(
    path: String,
    strategy: Option<Strategy>,
    body: &str,
) -> Result<FileOperation, TxError> {
    let trimmed = body.trim();
    if path == RENAME_ANNOTATION && strategy.is_none() {
        let rename: RenameBody = serde_json::from_str(trimmed)
            .map_err(|err| TxError::Parse(format!("malformed rename-file block: {err}")))?;
        return Ok(FileOperation::Rename {
            from: rename.from,
            to: rename.to,
        });
    }
    if trimmed == DELETE_SENTINEL {
        return Ok(FileOperation::Delete { path });
    }
    let content = strip_markers(trimmed);
    let strategy = strategy.unwrap_or_else(|| detect_strategy(content));
    Ok(FileOperation::Write {
        path,
        content: content.to_string(),
        strategy,
    })
}

fn strip_markers(trimmed: &str) -> &str {
    if trimmed.len() >= START_MARKER.len() + END_MARKER.len()
        && trimmed.starts_with(START_MARKER)
        && trimmed.ends_with(END_MARKER)
    {
        trimmed[START_MARKER.len()..trimmed.len() - END_MARKER.len()].trim()
    } else {
        trimmed
    }
}

fn detect_strategy(content: &str) -> Strategy {
    if has_search_replace_blocks(content) {
        Strategy::MultiSearchReplace
    } else if looks_like_unified_diff(content) {
        Strategy::NewUnified
    } else {
        Strategy::Replace
    }
}

fn has_search_replace_blocks(content: &str) -> bool {
    let mut open = false;
    for line in content.lines() {
        let line = line.trim_end();
        if line == SEARCH_MARKER {
            open = true;
        } else if open && line == REPLACE_MARKER {
            return true;
        }
    }
    false
}

fn looks_like_unified_diff(content: &str) -> bool {
    let lines: Vec<&str> = content.lines().collect();
    lines.windows(2).enumerate().any(|(idx, pair)| {
        pair[0].starts_with("--- ")
            && pair[1].starts_with("+++ ")
            && lines[idx + 2..].iter().any(|line| line.starts_with("@@"))
    })
}
