use std::collections::HashMap;

use uuid::Uuid;

use crate::error::TxError;
use crate::model::{ChangeSet, Control, FileOperation, FileSnapshot, StateFile, Strategy};
use crate::store::REVERT_PREFIX;
use crate::strategy::StrategyRegistry;

#[derive(Debug)]
pub struct RevertPlan {
    pub change_set: ChangeSet,
    pub reverts: Uuid,
    /// Operations that could not be inverted and were left out.
    pub warnings: Vec<String>,
}

/// Builds the change-set that undoes `past`. The past operations are replayed in
/// memory from the recorded snapshot so every inverse restores the content its path
/// held right before that operation ran; the inverses are emitted back to front.
pub fn synthesize_revert(
    past: &StateFile,
    strategies: &StrategyRegistry,
) -> Result<RevertPlan, TxError> {
    let mut replay = Replay::from_snapshot(&past.snapshot);
    let mut steps = Vec::with_capacity(past.operations.len());
    for op in &past.operations {
        steps.push(replay.invert(op));
        replay.step(op, strategies);
    }

    let mut operations = Vec::new();
    let mut warnings = Vec::new();
    for step in steps.into_iter().rev() {
        operations.extend(step.operations);
        warnings.extend(step.warnings);
    }

    let uuid = Uuid::new_v4();
    if operations.is_empty() {
        return Err(TxError::Validation {
            uuid,
            reason: format!("nothing in transaction {} can be reverted", past.uuid),
        });
    }

    let mut reasoning = vec![format!("{REVERT_PREFIX}{}", past.uuid)];
    reasoning.extend(past.reasoning.iter().cloned());

    let subject = past
        .git_commit_msg
        .as_deref()
        .map(|msg| msg.lines().next().unwrap_or(msg).to_string())
        .unwrap_or_else(|| past.uuid.to_string());

    Ok(RevertPlan {
        change_set: ChangeSet {
            control: Control {
                uuid,
                project_id: past.project_id.clone(),
                git_commit_msg: Some(format!("revert: {subject}")),
                prompt_summary: Some(format!("{REVERT_PREFIX}{}", past.uuid)),
            },
            operations,
            reasoning,
        },
        reverts: past.uuid,
        warnings,
    })
}

/// What the replay knows about a path: `Some(None)` absent, `None` unknown.
type Known = Option<Option<String>>;

#[derive(Default)]
struct Inverse {
    operations: Vec<FileOperation>,
    warnings: Vec<String>,
}

struct Replay {
    files: HashMap<String, Known>,
}

impl Replay {
    fn from_snapshot(snapshot: &FileSnapshot) -> Self {
        Self {
            files: snapshot
                .iter()
                .map(|(path, content)| (path.clone(), Some(content.clone())))
                .collect(),
        }
    }

    fn get(&self, path: &str) -> Known {
        self.files.get(path).cloned().flatten()
    }

    fn invert(&self, op: &FileOperation) -> Inverse {
        let mut inverse = Inverse::default();
        match op {
            FileOperation::Write { path, .. } => match self.get(path) {
                Some(Some(content)) => inverse.operations.push(restore(path, &content)),
                Some(None) => inverse
                    .operations
                    .push(FileOperation::Delete { path: path.clone() }),
                None => inverse
                    .warnings
                    .push(format!("{path}: missing from the snapshot; left as is")),
            },
            FileOperation::Delete { path } => match self.get(path) {
                Some(Some(content)) => inverse.operations.push(restore(path, &content)),
                _ => inverse.warnings.push(format!(
                    "{path}: deleted without recorded prior content; left as is"
                )),
            },
            FileOperation::Rename { from, to } => {
                inverse.operations.push(FileOperation::Rename {
                    from: to.clone(),
                    to: from.clone(),
                });
                match self.get(to) {
                    Some(Some(content)) => inverse.operations.push(restore(to, &content)),
                    Some(None) => {}
                    None => inverse.warnings.push(format!(
                        "{to}: overwritten by a rename without recorded prior content"
                    )),
                }
            }
        }
        inverse
    }

    fn step(&mut self, op: &FileOperation, strategies: &StrategyRegistry) {
        match op {
            FileOperation::Write {
                path,
                content,
                strategy,
            } => {
                let next = match strategy {
                    Strategy::Replace => Some(content.clone()),
                    Strategy::NewUnified | Strategy::MultiSearchReplace => {
                        self.get(path).and_then(|current| {
                            strategies
                                .lookup(strategy.as_str())
                                .ok()?
                                .apply_diff(current.as_deref().unwrap_or(""), content)
                                .ok()
                        })
                    }
                };
                self.files.insert(path.clone(), next.map(Some));
            }
            FileOperation::Delete { path } => {
                self.files.insert(path.clone(), Some(None));
            }
            FileOperation::Rename { from, to } => {
                let moved = self.get(from);
                self.files.insert(from.clone(), Some(None));
                self.files.insert(to.clone(), moved);
            }
        }
    }
}

fn restore(path: &str, content: &str) -> FileOperation {
    FileOperation::Write {
        path: path.to_string(),
        content: content.to_string(),
        strategy: Strategy::Replace,
    }
}
