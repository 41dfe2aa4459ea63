use std::process::Stdio;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::types::PermissionDecision;

const STDERR_TAIL_BYTES: usize = 2000;

/// How a given attempt handles the engine's tool-permission checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionRoute {
    /// Ask the human through the permission broker.
    Broker,
    /// Deny without generating any human traffic.
    Deny,
}

/// One rung of the attempt ladder: an immutable set of capability flags.
#[derive(Debug, Clone, Copy)]
pub struct AttemptConfig {
    pub label: &'static str,
    /// Request partial-message events for live streaming.
    pub streaming: bool,
    /// Hand the engine the auxiliary MCP tool-server config.
    pub mcp_tools: bool,
    /// Leave the engine's built-in side-effecting tools enabled.
    pub builtin_tools: bool,
    /// Pass the configured model explicitly.
    pub model: bool,
    pub permissions: PermissionRoute,
    /// Offer the conversation's continuation handle. Only the most capable
    /// attempt resumes; every later rung starts a fresh engine session.
    pub resume: bool,
}

/// Tried in order until one produces a non-empty answer. Each rung strips
/// another optional capability until only a minimal safe invocation is left.
pub const ATTEMPT_LADDER: &[AttemptConfig] = &[
    AttemptConfig {
        label: "full",
        streaming: true,
        mcp_tools: true,
        builtin_tools: true,
        model: true,
        permissions: PermissionRoute::Broker,
        resume: true,
    },
    AttemptConfig {
        label: "no-streaming",
        streaming: false,
        mcp_tools: true,
        builtin_tools: true,
        model: true,
        permissions: PermissionRoute::Broker,
        resume: false,
    },
    AttemptConfig {
        label: "no-aux-tools",
        streaming: false,
        mcp_tools: false,
        builtin_tools: true,
        model: true,
        permissions: PermissionRoute::Deny,
        resume: false,
    },
    AttemptConfig {
        label: "no-builtin-tools",
        streaming: false,
        mcp_tools: false,
        builtin_tools: false,
        model: true,
        permissions: PermissionRoute::Deny,
        resume: false,
    },
    AttemptConfig {
        label: "minimal",
        streaming: false,
        mcp_tools: false,
        builtin_tools: false,
        model: false,
        permissions: PermissionRoute::Deny,
        resume: false,
    },
];

const DISALLOWED_BUILTIN_TOOLS: &str = "Bash,Edit,Write,NotebookEdit,WebFetch,WebSearch";

/// Argument list for one engine invocation. The prompt rides as the final
/// positional argument; permission decisions go back over stdin.
pub fn build_args(
    config: &EngineConfig,
    attempt: &AttemptConfig,
    system_preamble: &str,
    continuation: Option<&str>,
    prompt: &str,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--print".into(),
        "--output-format".into(),
        "stream-json".into(),
        "--verbose".into(),
    ];
    if attempt.streaming {
        args.push("--include-partial-messages".into());
    }
    if attempt.mcp_tools {
        if let Some(mcp_config) = &config.mcp_config {
            args.push("--mcp-config".into());
            args.push(mcp_config.clone());
        }
    }
    if attempt.permissions == PermissionRoute::Broker {
        args.push("--permission-prompt-tool".into());
        args.push("stdio".into());
    }
    if !attempt.builtin_tools {
        args.push("--disallowed-tools".into());
        args.push(DISALLOWED_BUILTIN_TOOLS.into());
    }
    if attempt.model && !config.model.is_empty() {
        args.push("--model".into());
        args.push(config.model.clone());
    }
    args.push("--append-system-prompt".into());
    args.push(system_preamble.to_string());
    if let Some(handle) = continuation {
        args.push("--resume".into());
        args.push(handle.to_string());
    }
    args.push("--".into());
    args.push(prompt.to_string());
    args
}

/// One line of the engine's stdout event stream. Unknown event types are
/// tolerated and ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    System(SystemEvent),
    Assistant(AssistantEvent),
    Result(ResultEvent),
    ControlRequest(ControlRequestEvent),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct SystemEvent {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AssistantEvent {
    pub message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

impl AssistantEvent {
    /// Concatenated text blocks of this message.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.message.content {
            if let ContentBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct ResultEvent {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ControlRequestEvent {
    pub request_id: String,
    pub request: ControlRequestBody,
}

#[derive(Debug, Deserialize)]
pub struct ControlRequestBody {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

/// Abnormal termination of the engine's backing process. This is the one
/// failure the attempt ladder treats as retryable; everything else aborts
/// the turn.
#[derive(Debug)]
pub struct EngineCrash {
    pub exit_code: Option<i32>,
    pub stderr_tail: String,
}

impl std::fmt::Display for EngineCrash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "engine process exited with code {}", code)?,
            None => write!(f, "engine process terminated by signal")?,
        }
        if !self.stderr_tail.is_empty() {
            write!(f, ": {}", self.stderr_tail.trim())?;
        }
        Ok(())
    }
}

impl std::error::Error for EngineCrash {}

/// Pure crash classifier over a failure value.
pub fn is_crash(error: &anyhow::Error) -> bool {
    error.downcast_ref::<EngineCrash>().is_some()
}

/// Writes permission decisions back to the engine's stdin. Cloneable into
/// the task that waits on the broker so event consumption never stalls on
/// a pending human decision.
#[derive(Clone)]
pub struct EngineResponder {
    stdin: Arc<Mutex<Option<ChildStdin>>>,
}

impl EngineResponder {
    pub async fn answer_permission(
        &self,
        request_id: &str,
        decision: &PermissionDecision,
    ) -> anyhow::Result<()> {
        let body = match decision {
            PermissionDecision::Allow => json!({ "behavior": "allow" }),
            PermissionDecision::Deny { reason } => {
                json!({ "behavior": "deny", "message": reason })
            }
        };
        let line = json!({
            "type": "control_response",
            "response": {
                "subtype": "success",
                "request_id": request_id,
                "response": body,
            },
        });
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            anyhow::bail!("engine stdin already closed");
        };
        stdin.write_all(line.to_string().as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

/// A running engine invocation: line-delimited JSON events on stdout,
/// control responses on stdin, stderr drained for crash diagnostics.
pub struct EngineProcess {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    stderr_task: JoinHandle<String>,
}

impl EngineProcess {
    pub fn spawn(
        config: &EngineConfig,
        attempt: &AttemptConfig,
        system_preamble: &str,
        continuation: Option<&str>,
        prompt: &str,
    ) -> anyhow::Result<Self> {
        let args = build_args(config, attempt, system_preamble, continuation, prompt);
        debug!(binary = %config.binary, attempt = attempt.label, "Spawning engine");

        let mut child = Command::new(&config.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to start engine '{}': {}", config.binary, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("engine stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("engine stderr not captured"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("engine stdin not captured"))?;

        let stderr_task = tokio::spawn(async move {
            let mut tail = String::new();
            let mut reader = BufReader::new(stderr);
            let mut buf = [0u8; 1024];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        tail.push_str(&String::from_utf8_lossy(&buf[..n]));
                        if tail.len() > STDERR_TAIL_BYTES {
                            let mut cut = tail.len() - STDERR_TAIL_BYTES;
                            while !tail.is_char_boundary(cut) {
                                cut += 1;
                            }
                            tail.drain(..cut);
                        }
                    }
                }
            }
            tail
        });

        Ok(Self {
            child,
            lines: BufReader::new(stdout).lines(),
            stdin: Arc::new(Mutex::new(Some(stdin))),
            stderr_task,
        })
    }

    pub fn responder(&self) -> EngineResponder {
        EngineResponder {
            stdin: Arc::clone(&self.stdin),
        }
    }

    /// Next event in arrival order, or `None` once the engine closes its
    /// stream. Blank and non-JSON lines are skipped; unparseable JSON is
    /// logged and skipped rather than aborting the turn.
    pub async fn next_event(&mut self) -> anyhow::Result<Option<EngineEvent>> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            let line = line.trim();
            if line.is_empty() || !line.starts_with('{') {
                continue;
            }
            match serde_json::from_str::<EngineEvent>(line) {
                Ok(event) => return Ok(Some(event)),
                Err(e) => {
                    let preview: String = line.chars().take(200).collect();
                    warn!(error = %e, line = %preview, "Unparseable engine event");
                }
            }
        }
    }

    /// Wait for the process to exit. Returns the exit status and the
    /// captured stderr tail.
    pub async fn finish(mut self) -> anyhow::Result<(std::process::ExitStatus, String)> {
        // Drop our stdin handle so the engine sees EOF once any in-flight
        // permission answers have been written.
        self.stdin.lock().await.take();
        let status = self.child.wait().await?;
        let stderr_tail = self.stderr_task.await.unwrap_or_default();
        Ok((status, stderr_tail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> EngineConfig {
        EngineConfig {
            binary: "claude".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            persona: String::new(),
            mcp_config: Some("mcp.json".to_string()),
            approval_timeout_secs: 120,
        }
    }

    #[test]
    fn ladder_strips_capabilities_in_order() {
        assert!(ATTEMPT_LADDER[0].resume);
        assert!(ATTEMPT_LADDER.iter().skip(1).all(|a| !a.resume));

        // Monotonic: once a capability is stripped it never comes back.
        for pair in ATTEMPT_LADDER.windows(2) {
            assert!(pair[0].streaming || !pair[1].streaming);
            assert!(pair[0].mcp_tools || !pair[1].mcp_tools);
            assert!(pair[0].builtin_tools || !pair[1].builtin_tools);
            assert!(pair[0].model || !pair[1].model);
        }
        let last = ATTEMPT_LADDER.last().unwrap();
        assert!(!last.streaming && !last.mcp_tools && !last.builtin_tools && !last.model);
        assert_eq!(last.permissions, PermissionRoute::Deny);
    }

    #[test]
    fn full_attempt_args_carry_every_capability() {
        let config = test_config();
        let args = build_args(&config, &ATTEMPT_LADDER[0], "preamble", Some("sess-1"), "hi");

        assert!(args.contains(&"--include-partial-messages".to_string()));
        assert!(args.contains(&"--mcp-config".to_string()));
        assert!(args.contains(&"--permission-prompt-tool".to_string()));
        assert!(args.contains(&"--model".to_string()));
        assert!(args.contains(&"--resume".to_string()));
        assert!(args.contains(&"sess-1".to_string()));
        assert!(!args.contains(&"--disallowed-tools".to_string()));
        assert_eq!(args.last().unwrap(), "hi");
    }

    #[test]
    fn minimal_attempt_args_are_stripped() {
        let config = test_config();
        let last = ATTEMPT_LADDER.last().unwrap();
        let args = build_args(&config, last, "preamble", None, "hi");

        assert!(!args.contains(&"--include-partial-messages".to_string()));
        assert!(!args.contains(&"--mcp-config".to_string()));
        assert!(!args.contains(&"--permission-prompt-tool".to_string()));
        assert!(!args.contains(&"--model".to_string()));
        assert!(!args.contains(&"--resume".to_string()));
        assert!(args.contains(&"--disallowed-tools".to_string()));
    }

    #[test]
    fn resume_is_only_offered_when_the_attempt_asks() {
        let config = test_config();
        let args = build_args(&config, &ATTEMPT_LADDER[1], "preamble", None, "hi");
        assert!(!args.contains(&"--resume".to_string()));
    }

    #[test]
    fn parses_init_assistant_and_result_events() {
        let init: EngineEvent = serde_json::from_str(
            r#"{"type":"system","subtype":"init","session_id":"abc","model":"m","tools":[]}"#,
        )
        .unwrap();
        match init {
            EngineEvent::System(s) => {
                assert_eq!(s.subtype, "init");
                assert_eq!(s.session_id.as_deref(), Some("abc"));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let assistant: EngineEvent = serde_json::from_str(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hel"},{"type":"tool_use","id":"t1","name":"Bash"},{"type":"text","text":"lo"}]}}"#,
        )
        .unwrap();
        match assistant {
            EngineEvent::Assistant(a) => assert_eq!(a.text(), "hello"),
            other => panic!("unexpected event: {:?}", other),
        }

        let result: EngineEvent = serde_json::from_str(
            r#"{"type":"result","subtype":"success","is_error":false,"result":"done","session_id":"abc"}"#,
        )
        .unwrap();
        match result {
            EngineEvent::Result(r) => {
                assert_eq!(r.result.as_deref(), Some("done"));
                assert!(!r.is_error);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn unknown_event_types_are_tolerated() {
        let event: EngineEvent =
            serde_json::from_str(r#"{"type":"user","message":{"role":"user"}}"#).unwrap();
        assert!(matches!(event, EngineEvent::Other));
    }

    #[test]
    fn parses_control_requests() {
        let event: EngineEvent = serde_json::from_str(
            r#"{"type":"control_request","request_id":"req-9","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"rm -rf /tmp/x"}}}"#,
        )
        .unwrap();
        match event {
            EngineEvent::ControlRequest(c) => {
                assert_eq!(c.request_id, "req-9");
                assert_eq!(c.request.tool_name, "Bash");
                assert_eq!(c.request.input["command"], "rm -rf /tmp/x");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn crash_predicate_only_matches_engine_crashes() {
        let crash = anyhow::Error::new(EngineCrash {
            exit_code: Some(1),
            stderr_tail: String::new(),
        });
        assert!(is_crash(&crash));
        assert!(!is_crash(&anyhow::anyhow!("some other failure")));
    }
}
