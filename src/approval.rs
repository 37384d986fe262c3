use std::io::{self, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use is_terminal::IsTerminal;

use crate::config::ApprovalMode;
use crate::logging::Logger;
use crate::shell::shell_command;

const CHANNEL_POLL: Duration = Duration::from_millis(50);

pub trait Prompter {
    fn ask(&mut self, question: &str) -> Result<bool>;
}

/// y/n prompt on stdin. Without a terminal every question is answered "no".
#[derive(Debug, Default)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn ask(&mut self, question: &str) -> Result<bool> {
        if !io::stdin().is_terminal() {
            println!("{question} (no terminal attached; treating as no)");
            return Ok(false);
        }
        loop {
            print!("{question} [y/n]: ");
            io::stdout().flush()?;
            let mut input = String::new();
            if io::stdin().read_line(&mut input)? == 0 {
                return Ok(false);
            }
            match input.trim().to_lowercase().as_str() {
                "y" | "yes" => return Ok(true),
                "n" | "no" => return Ok(false),
                _ => println!("Please enter y or n."),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOutcome {
    Approved,
    Rejected,
    Timeout,
    Unsupported,
}

/// Out-of-band approval source (for example a notification with action buttons).
pub trait ApprovalChannel: Send + Sync {
    /// Should give up with `Timeout` once `timeout` has passed.
    fn request_approval(&self, project_id: &str, timeout: Duration) -> ChannelOutcome;
}

/// Shell command acting as an approval channel: exit 0 approves, exit 1 rejects,
/// anything else means the channel is unavailable. A command still running at the
/// timeout is killed.
pub struct CommandChannel {
    command: String,
    cwd: PathBuf,
}

impl CommandChannel {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
        }
    }
}

impl ApprovalChannel for CommandChannel {
    fn request_approval(&self, project_id: &str, timeout: Duration) -> ChannelOutcome {
        let command = self.command.replace("{projectId}", project_id);
        let Ok(mut child) = shell_command(&command)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        else {
            return ChannelOutcome::Unsupported;
        };

        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return match status.code() {
                        Some(0) => ChannelOutcome::Approved,
                        Some(1) => ChannelOutcome::Rejected,
                        _ => ChannelOutcome::Unsupported,
                    };
                }
                Ok(None) if start.elapsed() < timeout => thread::sleep(CHANNEL_POLL),
                Ok(None) | Err(_) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return ChannelOutcome::Timeout;
                }
            }
        }
    }
}

/// Asks `channel` on its own thread and waits at most `timeout`. A late answer is
/// dropped; the channel is expected to stop on its own once the timeout passes.
pub fn request_bounded(
    channel: Arc<dyn ApprovalChannel>,
    project_id: &str,
    timeout: Duration,
) -> ChannelOutcome {
    let (tx, rx) = mpsc::channel();
    let project_id = project_id.to_string();
    thread::spawn(move || {
        let _ = tx.send(channel.request_approval(&project_id, timeout));
    });
    rx.recv_timeout(timeout).unwrap_or(ChannelOutcome::Timeout)
}

#[derive(Debug, Clone, Copy)]
pub struct ApprovalPolicy {
    pub mode: ApprovalMode,
    pub threshold: usize,
    pub timeout: Duration,
}

pub struct ApprovalRequest<'a> {
    pub project_id: &'a str,
    pub error_count: usize,
    pub channel: Option<Arc<dyn ApprovalChannel>>,
}

pub fn decide(
    policy: &ApprovalPolicy,
    request: ApprovalRequest<'_>,
    prompter: &mut dyn Prompter,
    logger: &Logger,
) -> Result<bool> {
    match policy.mode {
        ApprovalMode::Auto if request.error_count <= policy.threshold => {
            logger.info(format!(
                "auto-approved: {} linter error(s), threshold {}",
                request.error_count, policy.threshold
            ));
            return Ok(true);
        }
        ApprovalMode::Auto => logger.warn(format!(
            "{} linter error(s) exceed the auto-approve threshold of {}; confirmation required",
            request.error_count, policy.threshold
        )),
        ApprovalMode::Manual => logger.debug("manual approval mode"),
    }

    if let Some(channel) = request.channel {
        match request_bounded(channel, request.project_id, policy.timeout) {
            ChannelOutcome::Approved => {
                logger.info("approved via notification");
                return Ok(true);
            }
            ChannelOutcome::Rejected => {
                logger.info("rejected via notification");
                return Ok(false);
            }
            ChannelOutcome::Timeout => logger.info("no notification response; asking here"),
            ChannelOutcome::Unsupported => logger.debug("notification approval unavailable"),
        }
    }

    prompter.ask("Approve and commit these changes?")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogLevel;

    struct Scripted {
        answers: Vec<bool>,
        asked: usize,
    }

    impl Scripted {
        fn new(answers: &[bool]) -> Self {
            Self {
                answers: answers.to_vec(),
                asked: 0,
            }
        }
    }

    impl Prompter for Scripted {
        fn ask(&mut self, _question: &str) -> Result<bool> {
            let answer = self.answers.get(self.asked).copied().unwrap_or(false);
            self.asked += 1;
            Ok(answer)
        }
    }

    struct Fixed(ChannelOutcome, Duration);

    impl ApprovalChannel for Fixed {
        fn request_approval(&self, _project_id: &str, _timeout: Duration) -> ChannelOutcome {
            thread::sleep(self.1);
            self.0
        }
    }

    fn policy(mode: ApprovalMode, threshold: usize) -> ApprovalPolicy {
        ApprovalPolicy {
            mode,
            threshold,
            timeout: Duration::from_millis(200),
        }
    }

    fn request(error_count: usize, channel: Option<Arc<dyn ApprovalChannel>>) -> ApprovalRequest<'static> {
        ApprovalRequest {
            project_id: "demo",
            error_count,
            channel,
        }
    }

    fn quiet() -> Logger {
        Logger::new(LogLevel::Silent)
    }

    #[test]
    fn auto_mode_approves_within_threshold() {
        let mut prompter = Scripted::new(&[]);
        let approved = decide(
            &policy(ApprovalMode::Auto, 2),
            request(2, None),
            &mut prompter,
            &quiet(),
        )
        .expect("decide");
        assert!(approved);
        assert_eq!(prompter.asked, 0);
    }

    #[test]
    fn auto_mode_falls_back_to_prompt_over_threshold() {
        let mut prompter = Scripted::new(&[false]);
        let approved = decide(
            &policy(ApprovalMode::Auto, 0),
            request(1, None),
            &mut prompter,
            &quiet(),
        )
        .expect("decide");
        assert!(!approved);
        assert_eq!(prompter.asked, 1);
    }

    #[test]
    fn manual_mode_always_prompts() {
        let mut prompter = Scripted::new(&[true]);
        let approved = decide(
            &policy(ApprovalMode::Manual, 100),
            request(0, None),
            &mut prompter,
            &quiet(),
        )
        .expect("decide");
        assert!(approved);
        assert_eq!(prompter.asked, 1);
    }

    #[test]
    fn channel_answer_skips_the_prompt() {
        let mut prompter = Scripted::new(&[true]);
        let channel: Arc<dyn ApprovalChannel> =
            Arc::new(Fixed(ChannelOutcome::Rejected, Duration::ZERO));
        let approved = decide(
            &policy(ApprovalMode::Manual, 0),
            request(0, Some(channel)),
            &mut prompter,
            &quiet(),
        )
        .expect("decide");
        assert!(!approved);
        assert_eq!(prompter.asked, 0);
    }

    #[test]
    fn slow_channel_times_out_to_prompt() {
        let mut prompter = Scripted::new(&[true]);
        let channel: Arc<dyn ApprovalChannel> =
            Arc::new(Fixed(ChannelOutcome::Rejected, Duration::from_secs(2)));
        let approved = decide(
            &policy(ApprovalMode::Manual, 0),
            request(0, Some(channel)),
            &mut prompter,
            &quiet(),
        )
        .expect("decide");
        assert!(approved);
        assert_eq!(prompter.asked, 1);
    }

    #[test]
    fn unsupported_channel_falls_through() {
        let mut prompter = Scripted::new(&[true]);
        let channel: Arc<dyn ApprovalChannel> =
            Arc::new(Fixed(ChannelOutcome::Unsupported, Duration::ZERO));
        assert!(
            decide(
                &policy(ApprovalMode::Manual, 0),
                request(0, Some(channel)),
                &mut prompter,
                &quiet(),
            )
            .expect("decide")
        );
        assert_eq!(prompter.asked, 1);
    }

    #[cfg(unix)]
    #[test]
    fn command_channel_maps_exit_codes() {
        let temp = tempfile::tempdir().expect("temp dir");
        let approve = CommandChannel::new("exit 0", temp.path());
        let reject = CommandChannel::new("exit 1", temp.path());
        let other = CommandChannel::new("exit 7", temp.path());
        let wait = Duration::from_secs(5);
        assert_eq!(approve.request_approval("demo", wait), ChannelOutcome::Approved);
        assert_eq!(reject.request_approval("demo", wait), ChannelOutcome::Rejected);
        assert_eq!(other.request_approval("demo", wait), ChannelOutcome::Unsupported);
    }

    #[cfg(unix)]
    #[test]
    fn command_channel_kills_a_slow_command() {
        let temp = tempfile::tempdir().expect("temp dir");
        let slow = CommandChannel::new("sleep 1 && touch answered", temp.path());
        let started = Instant::now();
        assert_eq!(
            slow.request_approval("demo", Duration::from_millis(100)),
            ChannelOutcome::Timeout
        );
        assert!(started.elapsed() < Duration::from_secs(1));
        thread::sleep(Duration::from_millis(1500));
        assert!(!temp.path().join("answered").exists());
    }
}
