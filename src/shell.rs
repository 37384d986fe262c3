use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub trait CommandRunner {
    fn run(&self, command: &str, cwd: &Path) -> Result<CommandOutput>;
}

/// Runs commands through the platform shell and buffers both streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, command: &str, cwd: &Path) -> Result<CommandOutput> {
        let output = shell_command(command)
            .current_dir(cwd)
            .output()
            .with_context(|| format!("running `{command}`"))?;
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// `sh -c` (or `cmd /C` on Windows) around `command`.
pub fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    }
}

/// Error count reported by a linter run: the largest "N error(s)" figure, else the
/// number of lines mentioning an error when the linter failed, else zero.
pub fn linter_error_count(output: &CommandOutput) -> usize {
    let combined = format!("{}\n{}", output.stdout, output.stderr);
    let Ok(summary) = Regex::new(r"(?i)\b(\d+)\s+errors?\b") else {
        return usize::from(!output.success());
    };
    let reported = summary
        .captures_iter(&combined)
        .filter_map(|caps| caps[1].parse::<usize>().ok())
        .max();
    if let Some(count) = reported {
        return count;
    }
    if output.success() {
        return 0;
    }
    let mentions = combined
        .lines()
        .filter(|line| line.to_lowercase().contains("error"))
        .count();
    mentions.max(1)
}

pub fn git_commit(root: &Path, message: &str) -> Result<CommandOutput> {
    let add = Command::new("git")
        .args(["add", "-A"])
        .current_dir(root)
        .output()
        .context("running git add")?;
    if !add.status.success() {
        bail!(
            "git add failed: {}",
            String::from_utf8_lossy(&add.stderr).trim()
        );
    }
    let commit = Command::new("git")
        .args(["commit", "-m", message])
        .current_dir(root)
        .output()
        .context("running git commit")?;
    Ok(CommandOutput {
        exit_code: commit.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&commit.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&commit.stderr).into_owned(),
    })
}
