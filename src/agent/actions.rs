//! Sandboxed action execution for the action loop (spec §4.8). Every action
//! runs rooted at the task's `work_dir`; `Read`/`Write` reject any path with
//! a `..` component so a misbehaving or adversarial LLM response can't walk
//! outside the sandbox.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("path escapes sandbox: {0}")]
    PathEscapesSandbox(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("command exited with status {status}: {stderr}")]
    CommandFailed { status: i32, stderr: String },
    #[error("failed to parse action: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no action found in llm response")]
    NoActionFound,
}

/// One action of a turn's `actions` array, as the LLM is prompted to emit
/// it: a single JSON object tagged by `action`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentAction {
    Bash { command: String },
    Read { path: String },
    Write { path: String, content: String },
    Install {
        #[serde(default)]
        command: Option<String>,
        #[serde(default)]
        packages: Vec<String>,
    },
    Git { args: Vec<String> },
    Done { summary: String },
    CloseBead { summary: String },
}

impl AgentAction {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::CloseBead { .. })
    }
}

fn resolve_in_sandbox(work_dir: &Path, relative: &str) -> Result<PathBuf, ActionError> {
    if Path::new(relative).components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return Err(ActionError::PathEscapesSandbox(relative.to_string()));
    }
    Ok(work_dir.join(relative))
}

fn command_not_found_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(command not found|executable file not found|: not found\b)").expect("valid regex")
    })
}

async fn run_shell(work_dir: &Path, command: &str) -> Result<String, ActionError> {
    let output = Command::new("bash")
        .arg("-c")
        .arg(command)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .output()
        .await?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        if command_not_found_re().is_match(&stderr) {
            stderr.push_str("\nhint: if a tool is missing, use the install action to add it.");
        }
        return Err(ActionError::CommandFailed {
            status: output.status.code().unwrap_or(-1),
            stderr,
        });
    }
    Ok(if stderr.is_empty() { stdout } else { format!("{stdout}\n{stderr}") })
}

/// Builds the shell script installing `packages`, auto-detecting Alpine
/// (`apk`) vs Debian-family (`apt-get`) by the presence of
/// `/etc/alpine-release`. Kept separate from execution so the detection
/// logic is testable without running a process.
fn build_install_script(packages: &[String]) -> String {
    let pkgs = packages.join(" ");
    format!(
        "if [ -f /etc/alpine-release ]; then apk add --no-cache {pkgs}; \
         else apt-get update && apt-get install -y --no-install-recommends {pkgs}; fi"
    )
}

async fn run_install(work_dir: &Path, command: &Option<String>, packages: &[String]) -> Result<String, ActionError> {
    let script = match command {
        Some(command) => command.clone(),
        None => build_install_script(packages),
    };
    run_shell(work_dir, &script).await
}

/// Executes one action and returns the text fed back to the LLM as the
/// result of its turn.
pub async fn execute(action: &AgentAction, work_dir: &Path) -> Result<String, ActionError> {
    match action {
        AgentAction::Bash { command } => run_shell(work_dir, command).await,
        AgentAction::Install { command, packages } => run_install(work_dir, command, packages).await,
        AgentAction::Git { args } => {
            let command = format!("git {}", args.join(" "));
            run_shell(work_dir, &command).await
        }
        AgentAction::Read { path } => {
            let resolved = resolve_in_sandbox(work_dir, path)?;
            Ok(tokio::fs::read_to_string(resolved).await?)
        }
        AgentAction::Write { path, content } => {
            let resolved = resolve_in_sandbox(work_dir, path)?;
            if let Some(parent) = resolved.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::File::create(&resolved).await?;
            file.write_all(content.as_bytes()).await?;
            Ok(format!("wrote {} bytes to {path}", content.len()))
        }
        AgentAction::Done { summary } => Ok(summary.clone()),
        AgentAction::CloseBead { summary } => Ok(summary.clone()),
    }
}
