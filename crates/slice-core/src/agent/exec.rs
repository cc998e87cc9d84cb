//! Allow-listed execution of network control commands

use crate::error::{Result, SliceError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Characters a shell would interpret; never valid in an argument
const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '`', '$', '<', '>', '\\', '(', ')', '{', '}', '*', '?', '!', '"', '\'', '\n',
    '\r', '\0',
];

const MAX_ARG_LEN: usize = 256;

/// A program invocation, optionally fed on stdin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Turn a non-zero exit into `ApplyFailed` for `node`
    pub fn check(self, node: &str, command: &CommandSpec) -> Result<CommandOutput> {
        if self.success() {
            Ok(self)
        } else {
            Err(SliceError::ApplyFailed {
                node: node.to_string(),
                reason: format!(
                    "`{}` exited {}: {}",
                    command,
                    self.status,
                    self.stderr.trim()
                ),
            })
        }
    }
}

/// Validates a command before it runs
pub trait ArgPolicy: Send + Sync {
    fn check(&self, command: &CommandSpec) -> Result<()>;
}

/// Permits a fixed set of programs with plain arguments
#[derive(Debug, Clone)]
pub struct AllowList {
    programs: BTreeSet<String>,
}

impl Default for AllowList {
    fn default() -> Self {
        Self::new(["tc", "ip", "bridge"])
    }
}

impl AllowList {
    pub fn new<I, S>(programs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            programs: programs.into_iter().map(Into::into).collect(),
        }
    }
}

fn check_token(token: &str) -> Result<()> {
    if token.is_empty() || token.len() > MAX_ARG_LEN {
        return Err(SliceError::CommandRejected(format!(
            "argument length {} outside 1..={}",
            token.len(),
            MAX_ARG_LEN
        )));
    }
    if let Some(c) = token.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Err(SliceError::CommandRejected(format!(
            "argument {:?} contains {:?}",
            token, c
        )));
    }
    Ok(())
}

impl ArgPolicy for AllowList {
    fn check(&self, command: &CommandSpec) -> Result<()> {
        if !self.programs.contains(&command.program) {
            return Err(SliceError::CommandRejected(format!(
                "program {:?} not allowed",
                command.program
            )));
        }
        for arg in &command.args {
            check_token(arg)?;
        }
        // batch input is one command per line, each held to the same rules
        if let Some(stdin) = &command.stdin {
            for line in stdin.lines().filter(|l| !l.trim().is_empty()) {
                for token in line.split_whitespace() {
                    check_token(token)?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command; a non-zero exit is returned as output, not an error
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput>;
}

/// Executes commands on the host with a per-command timeout
pub struct SystemRunner {
    policy: Arc<dyn ArgPolicy>,
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(policy: Arc<dyn ArgPolicy>, timeout: Duration) -> Self {
        Self { policy, timeout }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput> {
        self.policy.check(command)?;
        debug!(command = %command, "Executing");

        let mut child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // stdin is fed inside the timeout too
        let pipe = child.stdin.take();
        let run = async move {
            if let (Some(input), Some(mut pipe)) = (&command.stdin, pipe) {
                pipe.write_all(input.as_bytes()).await?;
                pipe.shutdown().await?;
            }
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("`{}` timed out after {:?}", command, self.timeout),
                )
            })??;

        let result = CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.success() {
            warn!(command = %command, status = result.status, stderr = %result.stderr.trim(), "Command failed");
        }
        Ok(result)
    }
}

#[derive(Debug, Clone)]
struct FailureRule {
    program: String,
    pattern: String,
    remaining: usize,
    status: i32,
    stderr: String,
}

#[derive(Debug, Clone)]
struct Response {
    program: String,
    pattern: String,
    stdout: String,
}

/// Link line reported for every `ip link show` in dry-run mode
const DRY_RUN_LINK: &str =
    "1: vxlan: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1450 qdisc noqueue state UNKNOWN mode DEFAULT";

/// Records commands without executing them
///
/// Used for dry runs and tests; failures can be injected per pattern.
pub struct RecordingRunner {
    policy: Arc<dyn ArgPolicy>,
    commands: Mutex<Vec<CommandSpec>>,
    failures: Mutex<Vec<FailureRule>>,
    responses: Mutex<Vec<Response>>,
    delay: Mutex<Option<Duration>>,
}

impl Default for RecordingRunner {
    fn default() -> Self {
        Self::new(Arc::new(AllowList::default()))
    }
}

impl RecordingRunner {
    pub fn new(policy: Arc<dyn ArgPolicy>) -> Self {
        Self {
            policy,
            commands: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            responses: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
        }
    }

    /// Runner whose link queries report every tunnel as up
    pub fn dry_run(policy: Arc<dyn ArgPolicy>) -> Self {
        let runner = Self::new(policy);
        runner.respond("ip", "link show", DRY_RUN_LINK);
        runner
    }

    /// Answer matching commands with `stdout`; later rules win
    pub fn respond(&self, program: &str, pattern: &str, stdout: &str) {
        lock(&self.responses).push(Response {
            program: program.to_string(),
            pattern: pattern.to_string(),
            stdout: stdout.to_string(),
        });
    }

    /// Fail the next `times` commands of `program` whose rendered text contains `pattern`
    pub fn fail_when(&self, program: &str, pattern: &str, times: usize, stderr: &str) {
        lock(&self.failures).push(FailureRule {
            program: program.to_string(),
            pattern: pattern.to_string(),
            remaining: times,
            status: 2,
            stderr: stderr.to_string(),
        });
    }

    /// Sleep before answering each command
    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.delay) = delay;
    }

    pub fn commands(&self) -> Vec<CommandSpec> {
        lock(&self.commands).clone()
    }

    /// Rendered command lines, stdin included after the command
    pub fn transcript(&self) -> Vec<String> {
        lock(&self.commands)
            .iter()
            .map(|c| match &c.stdin {
                Some(stdin) => format!("{}\n{}", c, stdin.trim_end()),
                None => c.to_string(),
            })
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.commands).clear();
    }

    fn injected_failure(&self, command: &CommandSpec) -> Option<CommandOutput> {
        let rendered = match &command.stdin {
            Some(stdin) => format!("{} {}", command, stdin),
            None => command.to_string(),
        };
        let mut failures = lock(&self.failures);
        let rule = failures
            .iter_mut()
            .find(|r| r.remaining > 0 && r.program == command.program && rendered.contains(&r.pattern))?;
        rule.remaining -= 1;
        Some(CommandOutput {
            status: rule.status,
            stdout: String::new(),
            stderr: rule.stderr.clone(),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput> {
        self.policy.check(command)?;
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.commands).push(command.clone());
        if let Some(failure) = self.injected_failure(command) {
            return Ok(failure);
        }
        let rendered = command.to_string();
        let stdout = lock(&self.responses)
            .iter()
            .rev()
            .find(|r| r.program == command.program && rendered.contains(&r.pattern))
            .map(|r| r.stdout.clone())
            .unwrap_or_default();
        Ok(CommandOutput {
            status: 0,
            stdout,
            stderr: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_list_accepts_plain_commands() {
        let policy = AllowList::default();
        let cmd = CommandSpec::new("ip", ["link", "del", "vxlan1000"]);
        assert!(policy.check(&cmd).is_ok());

        let batch = CommandSpec::new("tc", ["-force", "-batch", "-"])
            .with_stdin("qdisc replace dev eth0 root handle 1: htb default 9999\n");
        assert!(policy.check(&batch).is_ok());
    }

    #[test]
    fn test_allow_list_rejects_programs_and_metacharacters() {
        let policy = AllowList::default();
        assert!(matches!(
            policy.check(&CommandSpec::new("sh", ["-c", "true"])),
            Err(SliceError::CommandRejected(_))
        ));
        assert!(policy
            .check(&CommandSpec::new("ip", ["link", "del", "eth0;reboot"]))
            .is_err());
        assert!(policy
            .check(&CommandSpec::new("ip", ["link", "show", "$(id)"]))
            .is_err());
        assert!(policy.check(&CommandSpec::new("ip", [""])).is_err());

        let sneaky = CommandSpec::new("tc", ["-batch", "-"]).with_stdin("qdisc show | cat\n");
        assert!(policy.check(&sneaky).is_err());
    }

    #[tokio::test]
    async fn test_recording_runner_records_and_injects_failures() {
        let runner = RecordingRunner::default();
        runner.fail_when("ip", "vxlan1001", 1, "RTNETLINK answers: File exists");

        let ok = runner
            .run(&CommandSpec::new("ip", ["link", "set", "vxlan1000", "up"]))
            .await
            .unwrap();
        assert!(ok.success());

        let cmd = CommandSpec::new("ip", ["link", "set", "vxlan1001", "up"]);
        let failed = runner.run(&cmd).await.unwrap();
        assert!(!failed.success());
        assert!(failed.clone().check("node-a", &cmd).is_err());
        assert!(runner.run(&cmd).await.unwrap().success());

        assert_eq!(runner.commands().len(), 3);
        assert_eq!(runner.transcript()[0], "ip link set vxlan1000 up");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stalled_stdin_reader_times_out() {
        let runner = SystemRunner::new(
            Arc::new(AllowList::new(["sleep"])),
            Duration::from_millis(200),
        );
        // far more input than a pipe buffers, fed to a process that never reads it
        let cmd = CommandSpec::new("sleep", ["5"]).with_stdin("x\n".repeat(1 << 20));

        let started = std::time::Instant::now();
        assert!(runner.run(&cmd).await.is_err());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_dry_run_reports_links_up() {
        let runner = RecordingRunner::dry_run(Arc::new(AllowList::default()));
        let out = runner
            .run(&CommandSpec::new("ip", ["-o", "link", "show", "dev", "vxlan1000"]))
            .await
            .unwrap();
        assert!(out.stdout.contains("UP"));
    }

    #[tokio::test]
    async fn test_recording_runner_enforces_policy() {
        let runner = RecordingRunner::default();
        let result = runner.run(&CommandSpec::new("rm", ["-rf", "/"])).await;
        assert!(matches!(result, Err(SliceError::CommandRejected(_))));
        assert!(runner.commands().is_empty());
    }
}
