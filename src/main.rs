use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use clap::{ArgAction, Args, Parser, Subcommand, ValueHint};
use time::format_description::well_known::Rfc3339;

mod apply;
mod approval;
mod config;
mod diff;
mod engine;
mod error;
mod files;
mod logging;
mod model;
mod parser;
mod revert;
mod shell;
mod store;
mod strategy;
mod watch;

use approval::{Prompter, TerminalPrompter};
use config::{load_config, load_config_file, write_default_config};
use engine::{ApplyOptions, Engine, TxOutcome};
use logging::{LogLevel, read_recent};
use model::StateFile;
use store::{TxRef, revert_target};
use watch::{ClipboardSource, ClipboardWatcher, SystemClipboard};

fn main() -> Result<()> {
    let cli = Cli::parse();
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    let global = cli.global;
    match cli.command {
        Command::Init => handle_init(&global)?,
        Command::Watch => handle_watch(&global)?,
        Command::Apply(cmd) => handle_apply(&global, cmd)?,
        Command::Revert(cmd) => handle_revert(&global, cmd)?,
        Command::Undo(cmd) => handle_undo(&global, cmd)?,
        Command::Log(cmd) => handle_log(&global, cmd)?,
        Command::GitCommit => handle_git_commit(&global)?,
    }

    Ok(())
}

fn handle_init(global: &GlobalArgs) -> Result<()> {
    let root = resolve_root(global.root.as_ref())?;
    let path = write_default_config(&root)?;
    let config = load_config_file(&path)?;
    let state_dir = config.state_dir_in(&root);
    fs::create_dir_all(&state_dir)
        .with_context(|| format!("creating state directory {}", state_dir.display()))?;
    println!("created {}", path.display());
    println!("state directory: {}", state_dir.display());
    println!("projectId: {}", config.project_id);
    Ok(())
}

fn handle_watch(global: &GlobalArgs) -> Result<()> {
    let mut engine = open_engine(global)?;
    let interval = engine.config().poll_interval();
    let mut watcher = ClipboardWatcher::new(SystemClipboard::new()?, interval);
    watcher.run(&mut engine)
}

fn handle_apply(global: &GlobalArgs, cmd: ApplyCommand) -> Result<()> {
    let mut engine = open_engine(global)?;
    let text = if cmd.clipboard {
        SystemClipboard::new()?
            .read()?
            .ok_or_else(|| anyhow!("the clipboard holds no text"))?
    } else {
        match cmd.file {
            Some(path) if path.as_os_str() != "-" => fs::read_to_string(&path)
                .with_context(|| format!("reading patch {}", path.display()))?,
            _ => read_stdin()?,
        }
    };
    let change_set = parser::try_parse(&text)?;
    let options = ApplyOptions {
        force_approve: cmd.yes,
        ..ApplyOptions::default()
    };
    let outcome = engine.apply_change_set(&change_set, options)?;
    report_outcome(outcome)
}

fn handle_revert(global: &GlobalArgs, cmd: RevertCommand) -> Result<()> {
    let mut engine = open_engine(global)?;
    let reference = match cmd.target.as_deref() {
        Some(raw) => raw.parse::<TxRef>().map_err(|err| anyhow!(err))?,
        None => TxRef::Index(1),
    };
    let outcome = engine.revert_transaction(reference, cmd.include_reverts, cmd.yes)?;
    report_outcome(outcome)
}

fn handle_undo(global: &GlobalArgs, cmd: UndoCommand) -> Result<()> {
    let engine = open_engine(global)?;
    let Some(latest) = engine.store().latest()? else {
        println!("no committed transactions to undo.");
        return Ok(());
    };
    println!("latest transaction: {}", describe(&latest));
    if !cmd.yes {
        let question = format!("Undo transaction {}?", latest.uuid);
        if !TerminalPrompter.ask(&question)? {
            println!("undo cancelled.");
            return Ok(());
        }
    }
    engine.undo_last()?;
    Ok(())
}

fn handle_log(global: &GlobalArgs, cmd: LogCommand) -> Result<()> {
    let engine = open_engine(global)?;
    let history = engine.list_history(false)?;
    if history.is_empty() {
        println!("no committed transactions.");
    }
    for (index, state) in history.iter().take(cmd.limit).enumerate() {
        println!("{:>3}. {}", index + 1, describe(state));
    }

    if cmd.events {
        let entries = read_recent(engine.store().state_dir(), cmd.limit)?;
        if entries.is_empty() {
            println!("event log is empty.");
            return Ok(());
        }
        println!();
        for entry in entries {
            println!(
                "[{}] {:<16} {} {}",
                entry.timestamp, entry.action, entry.uuid, entry.detail
            );
        }
    }
    Ok(())
}

fn handle_git_commit(global: &GlobalArgs) -> Result<()> {
    let engine = open_engine(global)?;
    let output = engine.git_commit_latest()?;
    let summary = output.stdout.trim();
    if !summary.is_empty() {
        println!("{summary}");
    }
    Ok(())
}

fn report_outcome(outcome: TxOutcome) -> Result<()> {
    match outcome {
        TxOutcome::Committed(_) | TxOutcome::Skipped { .. } => Ok(()),
        TxOutcome::RolledBack {
            uuid,
            reason,
            restored: true,
        } => bail!("transaction {uuid} was rolled back: {reason}"),
        TxOutcome::RolledBack { uuid, reason, .. } => bail!(
            "transaction {uuid} failed ({reason}) and could not be fully rolled back; inspect the project tree"
        ),
    }
}

fn describe(state: &StateFile) -> String {
    let when = state
        .created_at
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown time".into());
    let summary = state
        .prompt_summary
        .as_deref()
        .or(state.git_commit_msg.as_deref())
        .or(state.reasoning.first().map(String::as_str))
        .unwrap_or("")
        .lines()
        .next()
        .unwrap_or("");
    let marker = if revert_target(state).is_some() {
        " (revert)"
    } else {
        ""
    };
    format!(
        "{when} {} +{} -{} {} op(s){marker} {summary}",
        state.uuid,
        state.lines_added.unwrap_or(0),
        state.lines_removed.unwrap_or(0),
        state.operations.len()
    )
}

fn open_engine(global: &GlobalArgs) -> Result<Engine> {
    let root = resolve_root(global.root.as_ref())?;
    let mut config = load_config(&root)?;
    if let Some(level) = global.log_level {
        config.log_level = level;
    }
    Engine::new(root, config)
}

fn resolve_root(root: Option<&PathBuf>) -> Result<PathBuf> {
    match root {
        Some(path) => {
            fs::canonicalize(path).with_context(|| format!("resolving root {}", path.display()))
        }
        None => std::env::current_dir().context("determining working directory"),
    }
}

fn read_stdin() -> Result<String> {
    let mut buf = String::new();
    io::stdin()
        .read_to_string(&mut buf)
        .context("reading patch text from stdin")?;
    Ok(buf)
}

#[derive(Debug, Parser)]
#[command(
    name = "safepatch",
    version,
    about = "Transactional, reversible application of LLM-generated patches"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    #[arg(long, global = true, value_name = "DIR", value_hint = ValueHint::DirPath)]
    root: Option<PathBuf>,
    #[arg(long = "log-level", global = true, value_enum)]
    log_level: Option<LogLevel>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write a default config and create the state directory.
    Init,
    /// Apply every new patch that appears on the clipboard.
    Watch,
    Apply(ApplyCommand),
    Revert(RevertCommand),
    /// Restore the newest committed transaction's snapshot.
    Undo(UndoCommand),
    Log(LogCommand),
    /// Commit the working tree with the newest transaction's message.
    GitCommit,
}

#[derive(Debug, Args)]
struct ApplyCommand {
    /// Patch file; `-` or nothing reads stdin.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    file: Option<PathBuf>,
    #[arg(long, action = ArgAction::SetTrue, conflicts_with = "file")]
    clipboard: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    yes: bool,
}

#[derive(Debug, Args)]
struct RevertCommand {
    /// Transaction uuid, or 1-based index into `log` (defaults to 1).
    #[arg(value_name = "UUID|INDEX")]
    target: Option<String>,
    #[arg(long, action = ArgAction::SetTrue)]
    include_reverts: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    yes: bool,
}

#[derive(Debug, Args)]
struct UndoCommand {
    #[arg(long, action = ArgAction::SetTrue)]
    yes: bool,
}

#[derive(Debug, Args)]
struct LogCommand {
    #[arg(long, default_value_t = 20)]
    limit: usize,
    /// Also print the engine's event log.
    #[arg(long, action = ArgAction::SetTrue)]
    events: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_revert_by_index() {
        let cli = Cli::parse_from(["safepatch", "revert", "2", "--yes"]);
        match cli.command {
            Command::Revert(cmd) => {
                assert_eq!(cmd.target.as_deref(), Some("2"));
                assert!(cmd.yes);
                assert!(!cmd.include_reverts);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn global_flags_work_after_the_subcommand() {
        let cli = Cli::parse_from(["safepatch", "log", "--log-level", "debug", "--limit", "5"]);
        assert_eq!(cli.global.log_level, Some(LogLevel::Debug));
        assert!(matches!(cli.command, Command::Log(LogCommand { limit: 5, .. })));
    }

    #[test]
    fn rollback_is_reported_as_failure() {
        let outcome = TxOutcome::RolledBack {
            uuid: uuid::Uuid::new_v4(),
            reason: "rejected".into(),
            restored: true,
        };
        assert!(report_outcome(outcome).is_err());
    }
}
