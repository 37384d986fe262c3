use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use uuid::Uuid;

use crate::apply::{ApplyReport, apply_operations, touched_paths};
use crate::approval::{
    ApprovalChannel, ApprovalPolicy, ApprovalRequest, CommandChannel, Prompter, TerminalPrompter,
    decide,
};
use crate::config::Config;
use crate::diff::print_diff;
use crate::error::TxError;
use crate::files::{ProtectedPaths, read_text, resolve, restore_snapshot, snapshot};
use crate::logging::{LogLevel, Logger, record_event};
use crate::model::{ChangeSet, FileSnapshot, StateFile, TxStatus};
use crate::revert::synthesize_revert;
use crate::shell::{CommandOutput, CommandRunner, ShellRunner, git_commit, linter_error_count};
use crate::store::{StateStore, TxRef};
use crate::strategy::StrategyRegistry;

const PREVIEW_CONTEXT: usize = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    /// Commit without consulting the approval policy.
    pub force_approve: bool,
    pub reverts_uuid: Option<Uuid>,
}

#[derive(Debug)]
pub enum TxOutcome {
    Committed(StateFile),
    RolledBack {
        uuid: Uuid,
        reason: String,
        restored: bool,
    },
    Skipped {
        uuid: Uuid,
        reason: String,
    },
}

impl TxOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, TxOutcome::Committed(_))
    }
}

/// One project's transaction engine. Everything a transaction needs (root, log
/// level, state store, collaborators) lives here rather than in globals.
pub struct Engine {
    root: PathBuf,
    config: Config,
    logger: Logger,
    store: StateStore,
    strategies: StrategyRegistry,
    prompter: Box<dyn Prompter>,
    runner: Box<dyn CommandRunner>,
    channel: Option<Arc<dyn ApprovalChannel>>,
    protected: ProtectedPaths,
}

impl Engine {
    pub fn new(root: impl Into<PathBuf>, config: Config) -> Result<Self> {
        let root = root.into();
        let state_dir = config.state_dir_in(&root);
        let protected = ProtectedPaths::new(
            &config.protected_paths,
            state_dir.strip_prefix(&root).ok().map(Path::to_path_buf),
        )?;
        let channel = config.approval_command.as_ref().map(|command| {
            Arc::new(CommandChannel::new(command.clone(), root.clone())) as Arc<dyn ApprovalChannel>
        });
        Ok(Self {
            logger: Logger::new(config.log_level),
            store: StateStore::new(state_dir).with_logger(Logger::new(config.log_level)),
            strategies: StrategyRegistry::with_defaults(),
            prompter: Box::new(TerminalPrompter),
            runner: Box::new(ShellRunner),
            channel,
            protected,
            root,
            config,
        })
    }

    pub fn with_prompter(mut self, prompter: Box<dyn Prompter>) -> Self {
        self.prompter = prompter;
        self
    }

    pub fn with_runner(mut self, runner: Box<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Runs one change-set through validate, snapshot, pending record, hooks, apply,
    /// lint, approval and commit. Only a failed WAL write escapes as an error; every
    /// other failure is rolled back and reported in the outcome.
    pub fn apply_change_set(
        &mut self,
        change_set: &ChangeSet,
        options: ApplyOptions,
    ) -> std::result::Result<TxOutcome, TxError> {
        let uuid = change_set.control.uuid;
        if let Err(reason) = self.check(change_set) {
            return Ok(self.skip(uuid, reason));
        }
        if self.store.has_pending(uuid) {
            self.logger.warn(format!(
                "found a pending record for {uuid} from an interrupted run; retrying"
            ));
        }

        let pre_state = match snapshot(touched_paths(&change_set.operations), &self.root) {
            Ok(pre_state) => pre_state,
            Err(err) => return Ok(self.skip(uuid, format!("cannot snapshot: {err:#}"))),
        };
        let mut state = StateFile::pending(change_set, pre_state);
        state.reverts_uuid = options.reverts_uuid;
        self.store.write_pending(&state)?;
        self.logger.info(format!(
            "applying {uuid}: {} operation(s)",
            change_set.operations.len()
        ));

        let (report, error_count) = match self.run_phases(change_set, &state.snapshot) {
            Ok(result) => result,
            Err(err) => return Ok(self.rollback(&state, err.to_string())),
        };
        self.preview(&state.snapshot);

        let approved = if options.force_approve {
            self.logger.info("approval forced");
            true
        } else {
            let policy = ApprovalPolicy {
                mode: self.config.approval_mode,
                threshold: self.config.approval_on_error_count,
                timeout: self.config.approval_timeout(),
            };
            let request = ApprovalRequest {
                project_id: &self.config.project_id,
                error_count,
                channel: self.channel.clone(),
            };
            match decide(&policy, request, self.prompter.as_mut(), &self.logger) {
                Ok(approved) => approved,
                Err(err) => {
                    return Ok(self.rollback(&state, format!("approval failed: {err:#}")));
                }
            }
        };
        if !approved {
            return Ok(self.rollback(&state, "changes were not approved".into()));
        }

        state.approved = true;
        state.lines_added = Some(report.stats.added);
        state.lines_removed = Some(report.stats.removed);
        state.status = TxStatus::Committed;
        if let Err(err) = self.store.write_pending(&state) {
            return Ok(self.rollback(&state, err.to_string()));
        }
        if let Err(err) = self.store.commit(uuid) {
            self.logger.error(format!(
                "{uuid} was applied but its record could not be committed; inspect {} by hand",
                self.store.pending_path(uuid).display()
            ));
            return Err(err);
        }

        let summary = format!("+{} -{}", report.stats.added, report.stats.removed);
        self.note(uuid, "committed", &summary);
        self.logger.success(format!("committed {uuid} ({summary})"));
        Ok(TxOutcome::Committed(state))
    }

    /// Builds the inverse of a committed transaction and pushes it through the
    /// normal pipeline as a new transaction.
    pub fn revert_transaction(
        &mut self,
        reference: TxRef,
        include_reverts: bool,
        force_approve: bool,
    ) -> Result<TxOutcome> {
        let Some(target) = self.store.find(reference, !include_reverts)? else {
            bail!("no committed transaction matches {reference}");
        };
        let plan = synthesize_revert(&target, &self.strategies)?;
        for warning in &plan.warnings {
            self.logger.warn(warning);
        }
        self.logger.info(format!(
            "reverting {} as {}",
            target.uuid, plan.change_set.control.uuid
        ));
        let options = ApplyOptions {
            force_approve,
            reverts_uuid: Some(plan.reverts),
        };
        Ok(self.apply_change_set(&plan.change_set, options)?)
    }

    /// Restores the newest committed transaction's snapshot straight to disk and
    /// moves its record under `undone/`. No new transaction is created.
    pub fn undo_last(&self) -> Result<Option<StateFile>> {
        let Some(latest) = self.store.latest()? else {
            self.logger.info("nothing to undo");
            return Ok(None);
        };
        restore_snapshot(&latest.snapshot, &self.root).map_err(|err| TxError::Rollback {
            uuid: latest.uuid,
            reason: format!("{err:#}"),
        })?;
        self.store.mark_undone(&latest)?;
        self.note(
            latest.uuid,
            "undone",
            &format!("{} path(s) restored", latest.snapshot.len()),
        );
        self.logger.success(format!("undid {}", latest.uuid));
        Ok(Some(latest))
    }

    pub fn list_history(&self, skip_reverts: bool) -> std::result::Result<Vec<StateFile>, TxError> {
        self.store.read_all(skip_reverts)
    }

    /// Stages everything and commits with the newest transaction's message.
    pub fn git_commit_latest(&self) -> Result<CommandOutput> {
        let latest = self
            .store
            .latest()?
            .context("no committed transaction to describe the commit")?;
        let message = latest
            .git_commit_msg
            .clone()
            .unwrap_or_else(|| format!("safepatch: transaction {}", latest.uuid));
        let output = git_commit(&self.root, &message)?;
        if !output.success() {
            bail!("git commit failed: {}", output.stderr.trim());
        }
        Ok(output)
    }

    fn check(&self, change_set: &ChangeSet) -> std::result::Result<(), String> {
        let control = &change_set.control;
        if control.project_id != self.config.project_id {
            return Err(format!(
                "projectId '{}' does not match configured '{}'",
                control.project_id, self.config.project_id
            ));
        }
        if self.store.has_been_processed(control.uuid) {
            return Err("already processed".into());
        }

        let count = change_set.operations.len();
        if count < self.config.min_file_changes {
            return Err(format!(
                "{count} operation(s) is below the minimum of {}",
                self.config.min_file_changes
            ));
        }
        if let Some(max) = self.config.max_file_changes {
            if count > max {
                return Err(format!("{count} operation(s) exceeds the maximum of {max}"));
            }
        }

        if let Some(reason) = touched_paths(&change_set.operations)
            .into_iter()
            .find_map(|path| self.protected.refusal(path))
        {
            return Err(reason);
        }
        Ok(())
    }

    fn skip(&self, uuid: Uuid, reason: String) -> TxOutcome {
        self.logger.warn(format!("skipping {uuid}: {reason}"));
        self.note(uuid, "skipped", &reason);
        TxOutcome::Skipped { uuid, reason }
    }

    fn run_phases(
        &self,
        change_set: &ChangeSet,
        pre_state: &FileSnapshot,
    ) -> std::result::Result<(ApplyReport, usize), TxError> {
        self.hook("preCommand", &self.config.pre_command, 0)?;
        let report = apply_operations(
            &change_set.operations,
            &self.root,
            pre_state,
            &self.strategies,
        )?;
        self.logger.debug(format!(
            "{} operation(s) applied, {} file(s) written",
            report.applied,
            report.final_contents.len()
        ));
        self.hook("postCommand", &self.config.post_command, report.applied)?;
        let error_count = self.lint(report.applied)?;
        Ok((report, error_count))
    }

    fn hook(&self, label: &str, command: &str, applied: usize) -> std::result::Result<(), TxError> {
        let command = command.trim();
        if command.is_empty() {
            return Ok(());
        }
        self.logger.debug(format!("running {label}: {command}"));
        let output = self
            .runner
            .run(command, &self.root)
            .map_err(|err| TxError::apply(applied, format!("{label}: {err:#}")))?;
        if !output.success() {
            return Err(TxError::apply(
                applied,
                format!(
                    "{label} exited with {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ),
            ));
        }
        Ok(())
    }

    fn lint(&self, applied: usize) -> std::result::Result<usize, TxError> {
        let command = self.config.linter.trim();
        if command.is_empty() {
            return Ok(0);
        }
        let output = self
            .runner
            .run(command, &self.root)
            .map_err(|err| TxError::apply(applied, format!("linter: {err:#}")))?;
        let count = linter_error_count(&output);
        if count > 0 {
            self.logger.warn(format!("linter reported {count} error(s)"));
        } else {
            self.logger.debug("linter is clean");
        }
        Ok(count)
    }

    fn preview(&self, pre_state: &FileSnapshot) {
        if !self.logger.enabled(LogLevel::Info) {
            return;
        }
        for (path, before) in pre_state {
            let after = resolve(&self.root, path)
                .and_then(|full| read_text(&full))
                .ok()
                .flatten();
            if before.as_deref() == after.as_deref() {
                continue;
            }
            println!("--- {path}");
            print_diff(
                before.as_deref().unwrap_or(""),
                after.as_deref().unwrap_or(""),
                PREVIEW_CONTEXT,
            );
        }
    }

    /// Puts the snapshot back and drops the pending record. Secondary failures are
    /// logged, never returned.
    fn rollback(&self, state: &StateFile, reason: String) -> TxOutcome {
        let uuid = state.uuid;
        self.logger.warn(format!("rolling back {uuid}: {reason}"));
        let restored = match restore_snapshot(&state.snapshot, &self.root) {
            Ok(()) => true,
            Err(err) => {
                self.logger.error(format!(
                    "rollback of {uuid} failed: {err:#}; the project tree needs manual inspection"
                ));
                false
            }
        };
        if let Err(err) = self.store.delete_pending(uuid) {
            self.logger.error(format!("could not remove pending record: {err}"));
        }
        let action = if restored { "rolled-back" } else { "rollback-failed" };
        self.note(uuid, action, &reason);
        TxOutcome::RolledBack {
            uuid,
            reason,
            restored,
        }
    }

    fn note(&self, uuid: Uuid, action: &str, detail: &str) {
        if let Err(err) = record_event(self.store.state_dir(), uuid, action, detail) {
            self.logger
                .warn(format!("could not record {action} event for {uuid}: {err:#}"));
        }
    }
}
