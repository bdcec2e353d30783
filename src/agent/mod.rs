//! Agent driver: launches the external code-generating agent and streams
//! its output back to the engine.
//!
//! The agent is a black box behind the [`AgentRunner`] trait: the engine
//! hands it a rendered prompt, a working directory, a tool allow-list, an
//! optional tool-server URL, and a timeout, and gets back an outcome with
//! the accumulated output. The production implementation shells out to the
//! agent CLI in `stream-json` mode; tests substitute scripted runners.
//!
//! The driver never retries; retry is the calling runner's policy.

pub mod stream;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::errors::WorkflowError;
use crate::events::{EventSender, WorkflowEvent, emit};
use stream::{ContentBlock, StreamEvent, describe_tool_use};

/// Environment variable carrying the in-process tool-server URL to the agent.
pub const TOOL_SERVER_URL_ENV: &str = "WRECKIT_TOOL_SERVER_URL";

/// One agent run: everything the driver needs to launch the process.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub prompt: String,
    pub cwd: PathBuf,
    /// Tool names the agent may use; empty means the agent's default set
    pub allowed_tools: Vec<String>,
    /// URL of the engine's tool callback server, if one is registered
    pub tool_server_url: Option<String>,
    pub timeout_secs: u64,
}

/// Result of one agent run.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub success: bool,
    pub exit_code: i32,
    pub timed_out: bool,
    pub output: String,
}

impl AgentOutcome {
    /// Map a failed outcome to the typed error the runner should surface.
    pub fn failure_error(&self, timeout_secs: u64) -> Option<WorkflowError> {
        if self.timed_out {
            Some(WorkflowError::AgentTimeout { timeout_secs })
        } else if !self.success {
            Some(WorkflowError::AgentFailure {
                exit_code: self.exit_code,
            })
        } else {
            None
        }
    }
}

/// Seam between the engine and the external agent process.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        invocation: AgentInvocation,
        events: Option<EventSender>,
    ) -> Result<AgentOutcome>;
}

/// Production driver: shells out to the agent CLI with `stream-json` output.
pub struct CliAgent {
    config: AgentConfig,
}

impl CliAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    fn build_args(&self, invocation: &AgentInvocation) -> Vec<String> {
        let mut args: Vec<String> = self.config.extra_args.clone();
        if self.config.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        args.push("--print".to_string());
        args.push("--output-format".to_string());
        args.push("stream-json".to_string());
        args.push("--verbose".to_string());
        if !invocation.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(invocation.allowed_tools.join(","));
        }
        args
    }
}

#[async_trait]
impl AgentRunner for CliAgent {
    async fn run(
        &self,
        invocation: AgentInvocation,
        events: Option<EventSender>,
    ) -> Result<AgentOutcome> {
        let args = self.build_args(&invocation);
        debug!(command = %self.config.command, ?args, cwd = %invocation.cwd.display(), "spawning agent");

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&args)
            .current_dir(&invocation.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(url) = &invocation.tool_server_url {
            cmd.env(TOOL_SERVER_URL_ENV, url);
        }

        let mut child = cmd.spawn().context("Failed to spawn agent process")?;

        // The agent may exit before draining stdin; a broken pipe here is
        // not a driver failure.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(invocation.prompt.as_bytes()).await {
                warn!(error = %e, "agent did not consume the full prompt");
            }
            let _ = stdin.shutdown().await;
        }

        let stdout = child.stdout.take().context("Failed to take agent stdout")?;
        let mut reader = BufReader::new(stdout).lines();

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(invocation.timeout_secs.max(1));
        let mut accumulated = String::new();
        let mut final_result: Option<String> = None;
        let mut is_error = false;
        let mut timed_out = false;

        loop {
            tokio::select! {
                line = reader.next_line() => {
                    let Some(line) = line.context("Failed to read agent stdout")? else {
                        break;
                    };
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<StreamEvent>(&line) {
                        Ok(StreamEvent::Assistant { message }) => {
                            for block in message.content {
                                match block {
                                    ContentBlock::Text { text } => {
                                        emit(&events, WorkflowEvent::AgentChunk { text: text.clone() });
                                        accumulated.push_str(&text);
                                        accumulated.push('\n');
                                    }
                                    ContentBlock::ToolUse { name, input } => {
                                        emit(&events, WorkflowEvent::AgentEvent {
                                            name: describe_tool_use(&name, &input),
                                            payload: input,
                                        });
                                    }
                                }
                            }
                        }
                        Ok(StreamEvent::Result { result, is_error: err }) => {
                            final_result = result;
                            is_error = err;
                        }
                        Ok(StreamEvent::User {}) | Ok(StreamEvent::System { .. }) => {}
                        Err(_) => {
                            // Non-JSON output still counts as agent text
                            emit(&events, WorkflowEvent::AgentChunk { text: line.clone() });
                            accumulated.push_str(&line);
                            accumulated.push('\n');
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(timeout_secs = invocation.timeout_secs, "agent timed out, killing process");
                    let _ = child.kill().await;
                    timed_out = true;
                    break;
                }
            }
        }

        let exit_code = if timed_out {
            -1
        } else {
            child
                .wait()
                .await
                .context("Failed to wait for agent process")?
                .code()
                .unwrap_or(-1)
        };

        let output = final_result.unwrap_or(accumulated);
        let success = !timed_out && exit_code == 0 && !is_error;

        debug!(exit_code, timed_out, output_chars = output.len(), "agent finished");

        Ok(AgentOutcome {
            success,
            exit_code,
            timed_out,
            output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(timeout_secs: u64) -> AgentInvocation {
        AgentInvocation {
            prompt: "do the work".to_string(),
            cwd: std::env::temp_dir(),
            allowed_tools: vec!["Read".to_string(), "Grep".to_string()],
            tool_server_url: None,
            timeout_secs,
        }
    }

    /// A fake agent built from `sh -c`; the script arrives before the
    /// driver's own flags, which land in the script's positional args.
    fn scripted(script: &str) -> CliAgent {
        CliAgent::new(AgentConfig {
            command: "sh".to_string(),
            skip_permissions: false,
            extra_args: vec!["-c".to_string(), script.to_string()],
        })
    }

    #[test]
    fn test_build_args_include_tool_allow_list() {
        let agent = CliAgent::new(AgentConfig::default());
        let args = agent.build_args(&invocation(60));
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(args.contains(&"--print".to_string()));
        assert!(args.contains(&"stream-json".to_string()));
        let idx = args.iter().position(|a| a == "--allowedTools").unwrap();
        assert_eq!(args[idx + 1], "Read,Grep");
    }

    #[test]
    fn test_build_args_empty_allow_list_omits_flag() {
        let agent = CliAgent::new(AgentConfig::default());
        let mut inv = invocation(60);
        inv.allowed_tools.clear();
        let args = agent.build_args(&inv);
        assert!(!args.contains(&"--allowedTools".to_string()));
    }

    #[tokio::test]
    async fn test_run_parses_stream_result() {
        let agent = scripted(
            r#"cat > /dev/null; printf '%s\n' '{"type":"result","subtype":"success","result":"final text","is_error":false}'"#,
        );
        let outcome = agent.run(invocation(30), None).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, 0);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.output, "final text");
    }

    #[tokio::test]
    async fn test_run_accumulates_text_blocks_without_result() {
        let agent = scripted(
            r#"cat > /dev/null; printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"line one"}]}}'; printf '%s\n' 'plain stderr-ish noise'"#,
        );
        let outcome = agent.run(invocation(30), None).await.unwrap();
        assert!(outcome.success);
        assert!(outcome.output.contains("line one"));
        assert!(outcome.output.contains("plain stderr-ish noise"));
    }

    #[tokio::test]
    async fn test_run_nonzero_exit_is_failure() {
        let agent = scripted("cat > /dev/null; exit 3");
        let outcome = agent.run(invocation(30), None).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, 3);
        assert!(matches!(
            outcome.failure_error(30),
            Some(WorkflowError::AgentFailure { exit_code: 3 })
        ));
    }

    #[tokio::test]
    async fn test_run_result_error_flag_is_failure() {
        let agent = scripted(
            r#"cat > /dev/null; printf '%s\n' '{"type":"result","subtype":"error","result":"broke","is_error":true}'"#,
        );
        let outcome = agent.run(invocation(30), None).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.output, "broke");
    }

    #[tokio::test]
    async fn test_run_times_out_and_kills() {
        let agent = scripted("sleep 30");
        let start = std::time::Instant::now();
        let outcome = agent.run(invocation(1), None).await.unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.success);
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(matches!(
            outcome.failure_error(1),
            Some(WorkflowError::AgentTimeout { timeout_secs: 1 })
        ));
    }

    #[tokio::test]
    async fn test_events_forwarded_to_sink() {
        let agent = scripted(
            r#"cat > /dev/null; printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"a.rs"}},{"type":"text","text":"thinking"}]}}'"#,
        );
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        agent.run(invocation(30), Some(tx)).await.unwrap();

        let mut saw_tool = false;
        let mut saw_chunk = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                WorkflowEvent::AgentEvent { name, .. } => {
                    assert_eq!(name, "read a.rs");
                    saw_tool = true;
                }
                WorkflowEvent::AgentChunk { text } => {
                    assert_eq!(text, "thinking");
                    saw_chunk = true;
                }
                _ => {}
            }
        }
        assert!(saw_tool);
        assert!(saw_chunk);
    }
}
