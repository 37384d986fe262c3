use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use anyhow::{Result, anyhow, bail};

use crate::diff::{LineStats, line_stats};
use crate::error::TxError;
use crate::files::{read_text, remove_if_exists, rename_file, resolve, write_atomic};
use crate::model::{FileOperation, FileSnapshot, Strategy};
use crate::strategy::StrategyRegistry;

#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Final content of every path that ends the transaction written (or renamed with
    /// freshly written content).
    pub final_contents: BTreeMap<String, String>,
    pub stats: LineStats,
    pub applied: usize,
}

pub fn touched_paths(operations: &[FileOperation]) -> BTreeSet<&str> {
    operations
        .iter()
        .flat_map(FileOperation::touched_paths)
        .collect()
}

/// Runs `operations` one at a time against the tree under `root`. Each step is on
/// disk before the next starts, so a failure reports exactly how many landed.
pub fn apply_operations(
    operations: &[FileOperation],
    root: &Path,
    snapshot: &FileSnapshot,
    strategies: &StrategyRegistry,
) -> std::result::Result<ApplyReport, TxError> {
    let mut applier = Applier {
        root,
        snapshot,
        strategies,
        in_flight: snapshot
            .iter()
            .map(|(path, content)| (path.clone(), content.clone()))
            .collect(),
        report: ApplyReport::default(),
    };
    for op in operations {
        applier
            .step(op)
            .map_err(|err| TxError::apply(applier.report.applied, format!("{}: {err:#}", op.label())))?;
        applier.report.applied += 1;
    }
    Ok(applier.report)
}

struct Applier<'a> {
    root: &'a Path,
    snapshot: &'a FileSnapshot,
    strategies: &'a StrategyRegistry,
    in_flight: HashMap<String, Option<String>>,
    report: ApplyReport,
}

impl Applier<'_> {
    fn step(&mut self, op: &FileOperation) -> Result<()> {
        match op {
            FileOperation::Write {
                path,
                content,
                strategy,
            } => self.write(path, content, *strategy),
            FileOperation::Delete { path } => self.delete(path),
            FileOperation::Rename { from, to } => self.rename(from, to),
        }
    }

    fn current(&self, path: &str) -> Result<Option<String>> {
        match self.in_flight.get(path) {
            Some(content) => Ok(content.clone()),
            None => read_text(&resolve(self.root, path)?),
        }
    }

    fn original(&self, path: &str) -> Option<&str> {
        self.snapshot.get(path).and_then(|content| content.as_deref())
    }

    fn write(&mut self, path: &str, content: &str, strategy: Strategy) -> Result<()> {
        let current = self.current(path)?;
        let new_text = match strategy {
            Strategy::Replace => content.to_string(),
            Strategy::MultiSearchReplace if current.is_none() => {
                bail!("{strategy} cannot be applied to a new file")
            }
            Strategy::NewUnified | Strategy::MultiSearchReplace => self
                .strategies
                .lookup(strategy.as_str())?
                .apply_diff(current.as_deref().unwrap_or(""), content)?,
        };
        write_atomic(&resolve(self.root, path)?, new_text.as_bytes())?;
        self.report.stats += line_stats(self.original(path), Some(&new_text));
        self.in_flight.insert(path.to_string(), Some(new_text.clone()));
        self.report.final_contents.insert(path.to_string(), new_text);
        Ok(())
    }

    fn delete(&mut self, path: &str) -> Result<()> {
        remove_if_exists(&resolve(self.root, path)?)?;
        self.report.stats += line_stats(self.original(path), None);
        self.in_flight.insert(path.to_string(), None);
        self.report.final_contents.remove(path);
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let content = self
            .current(from)?
            .ok_or_else(|| anyhow!("cannot rename {from}: file does not exist"))?;
        rename_file(&resolve(self.root, from)?, &resolve(self.root, to)?)?;
        self.in_flight.insert(from.to_string(), None);
        self.in_flight.insert(to.to_string(), Some(content));
        if let Some(pending) = self.report.final_contents.remove(from) {
            self.report.final_contents.insert(to.to_string(), pending);
        }
        Ok(())
    }
}
