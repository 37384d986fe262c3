use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    Replace,
    NewUnified,
    MultiSearchReplace,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Replace => "replace",
            Strategy::NewUnified => "new-unified",
            Strategy::MultiSearchReplace => "multi-search-replace",
        }
    }

    /// Keywords accepted after a path annotation. `replace` is the implicit default
    /// and is deliberately not a keyword.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "new-unified" => Some(Strategy::NewUnified),
            "multi-search-replace" => Some(Strategy::MultiSearchReplace),
            _ => None,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FileOperation {
    Write {
        path: String,
        content: String,
        #[serde(rename = "patchStrategy", default)]
        strategy: Strategy,
    },
    Delete {
        path: String,
    },
    Rename {
        from: String,
        to: String,
    },
}

impl FileOperation {
    pub fn touched_paths(&self) -> Vec<&str> {
        match self {
            FileOperation::Write { path, .. } | FileOperation::Delete { path } => vec![path],
            FileOperation::Rename { from, to } => vec![from, to],
        }
    }

    pub fn label(&self) -> String {
        match self {
            FileOperation::Write { path, strategy, .. } => format!("write {path} ({strategy})"),
            FileOperation::Delete { path } => format!("delete {path}"),
            FileOperation::Rename { from, to } => format!("rename {from} -> {to}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Control {
    pub uuid: Uuid,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit_msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub control: Control,
    pub operations: Vec<FileOperation>,
    pub reasoning: Vec<String>,
}

/// Pre-transaction content per project-relative path; `None` means the file did not exist.
pub type FileSnapshot = BTreeMap<String, Option<String>>;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Committed,
    Undone,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateFile {
    pub uuid: Uuid,
    pub project_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub reasoning: Vec<String>,
    pub operations: Vec<FileOperation>,
    pub snapshot: FileSnapshot,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines_added: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines_removed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit_msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_summary: Option<String>,
    pub status: TxStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverts_uuid: Option<Uuid>,
}

impl StateFile {
    pub fn pending(change_set: &ChangeSet, snapshot: FileSnapshot) -> Self {
        StateFile {
            uuid: change_set.control.uuid,
            project_id: change_set.control.project_id.clone(),
            created_at: OffsetDateTime::now_utc(),
            reasoning: change_set.reasoning.clone(),
            operations: change_set.operations.clone(),
            snapshot,
            approved: false,
            lines_added: None,
            lines_removed: None,
            git_commit_msg: change_set.control.git_commit_msg.clone(),
            prompt_summary: change_set.control.prompt_summary.clone(),
            status: TxStatus::Pending,
            reverts_uuid: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_serialize_with_wire_names() {
        let op = FileOperation::Write {
            path: "src/a.ts".into(),
            content: "x".into(),
            strategy: Strategy::MultiSearchReplace,
        };
        let yaml = serde_yaml::to_string(&op).expect("serialize");
        assert!(yaml.contains("type: write"), "{yaml}");
        assert!(yaml.contains("patchStrategy: multi-search-replace"), "{yaml}");
    }

    #[test]
    fn missing_strategy_defaults_to_replace() {
        let op: FileOperation =
            serde_yaml::from_str("type: write\npath: a.txt\ncontent: hi\n").expect("parse");
        assert_eq!(
            op,
            FileOperation::Write {
                path: "a.txt".into(),
                content: "hi".into(),
                strategy: Strategy::Replace,
            }
        );
    }

    #[test]
    fn rename_touches_both_paths() {
        let op = FileOperation::Rename {
            from: "a".into(),
            to: "b".into(),
        };
        assert_eq!(op.touched_paths(), vec!["a", "b"]);
    }

    #[test]
    fn replace_is_not_a_keyword() {
        assert_eq!(Strategy::from_keyword("replace"), None);
        assert_eq!(
            Strategy::from_keyword("new-unified"),
            Some(Strategy::NewUnified)
        );
    }
}
