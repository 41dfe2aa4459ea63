use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::types::{ApprovalEvent, PermissionDecision};

/// Tool names that never need human approval: read-only or otherwise
/// side-effect-free.
const AUTO_ALLOWED_TOOLS: &[&str] = &[
    "Read",
    "Glob",
    "Grep",
    "WebFetch",
    "WebSearch",
    "TodoWrite",
    "Task",
    "NotebookRead",
];

/// Tools served by the bot's own auxiliary MCP server.
const INTERNAL_TOOL_PREFIX: &str = "mcp__agentbridge__";

const SUMMARY_MAX_CHARS: usize = 300;

/// Gates sensitive engine tool calls behind asynchronous human approval.
///
/// Each outstanding request is one entry in the pending map keyed by the
/// engine's control-request id. Resolution and expiry both claim the entry
/// by removing it, so a decision lands exactly once; whoever loses the
/// claim gets `handled = false` (resolve) or stays silent (expiry).
pub struct PermissionBroker {
    pending: Mutex<HashMap<String, oneshot::Sender<PermissionDecision>>>,
    events_tx: mpsc::Sender<ApprovalEvent>,
    timeout: Duration,
}

impl PermissionBroker {
    pub fn new(events_tx: mpsc::Sender<ApprovalEvent>, timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            events_tx,
            timeout,
        }
    }

    pub fn is_auto_allowed(tool_name: &str) -> bool {
        AUTO_ALLOWED_TOOLS.contains(&tool_name) || tool_name.starts_with(INTERNAL_TOOL_PREFIX)
    }

    /// Ask the human to allow or deny one tool call. Blocks the calling tool
    /// invocation (and nothing else) until a decision arrives or the request
    /// expires into a forced denial.
    pub async fn request(
        &self,
        correlation_id: &str,
        tool_name: &str,
        input: &Value,
        conversation_id: &str,
    ) -> PermissionDecision {
        if Self::is_auto_allowed(tool_name) {
            debug!(tool_name, "Tool auto-approved");
            return PermissionDecision::Allow;
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.insert(correlation_id.to_string(), tx).is_some() {
                // Dropping the old sender resolves the superseded request
                // as a denial on its waiter's side.
                warn!(correlation_id, "Duplicate permission request superseded");
            }
        }

        let summary = summarize_input(tool_name, input);
        info!(correlation_id, tool_name, conversation_id, "Approval requested");

        let sent = self
            .events_tx
            .send(ApprovalEvent::Requested {
                correlation_id: correlation_id.to_string(),
                conversation_id: conversation_id.to_string(),
                tool_name: tool_name.to_string(),
                summary,
            })
            .await;
        if sent.is_err() {
            warn!(correlation_id, "Approval channel closed, denying");
            self.pending.lock().await.remove(correlation_id);
            return PermissionDecision::deny("approval channel unavailable");
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => {
                // Sender dropped without a decision (superseded or shutdown).
                warn!(correlation_id, "Approval request abandoned, denying");
                PermissionDecision::deny("approval request abandoned")
            }
            Err(_) => {
                let claimed = self.pending.lock().await.remove(correlation_id).is_some();
                if claimed {
                    warn!(correlation_id, tool_name, "Approval timed out, denying");
                    let _ = self
                        .events_tx
                        .send(ApprovalEvent::Expired {
                            correlation_id: correlation_id.to_string(),
                            conversation_id: conversation_id.to_string(),
                        })
                        .await;
                }
                PermissionDecision::deny("timed out")
            }
        }
    }

    /// Deliver the user's decision. Returns whether a live request claimed
    /// it; a request already resolved or expired returns `false`.
    pub async fn resolve(&self, correlation_id: &str, decision: PermissionDecision) -> bool {
        let Some(tx) = self.pending.lock().await.remove(correlation_id) else {
            debug!(correlation_id, "Stale approval resolution");
            return false;
        };
        let _ = tx.send(decision);
        true
    }
}

/// One-line human-readable rendering of a tool call's input: the command
/// for shell tools, the path for file tools, otherwise capped JSON.
pub fn summarize_input(tool_name: &str, input: &Value) -> String {
    let summary = if let Some(command) = input.get("command").and_then(|v| v.as_str()) {
        command.to_string()
    } else if let Some(path) = input.get("file_path").and_then(|v| v.as_str()) {
        format!("{}: {}", tool_name, path)
    } else {
        serde_json::to_string(input).unwrap_or_else(|_| "<unrenderable input>".to_string())
    };
    truncate_chars(&summary, SUMMARY_MAX_CHARS)
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn broker(timeout: Duration) -> (PermissionBroker, mpsc::Receiver<ApprovalEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (PermissionBroker::new(tx, timeout), rx)
    }

    #[tokio::test]
    async fn read_only_and_internal_tools_bypass_the_broker() {
        let (broker, mut events) = broker(Duration::from_secs(5));
        let decision = broker
            .request("r1", "Read", &json!({"file_path": "/tmp/x"}), "42")
            .await;
        assert_eq!(decision, PermissionDecision::Allow);

        let decision = broker
            .request("r2", "mcp__agentbridge__status", &json!({}), "42")
            .await;
        assert_eq!(decision, PermissionDecision::Allow);

        // No prompt was ever emitted.
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn resolution_reaches_the_waiter_and_cancels_expiry() {
        let (broker, mut events) = broker(Duration::from_millis(500));
        let broker = std::sync::Arc::new(broker);

        let waiter = {
            let broker = std::sync::Arc::clone(&broker);
            tokio::spawn(async move {
                broker
                    .request("r1", "Bash", &json!({"command": "ls"}), "42")
                    .await
            })
        };

        match events.recv().await.unwrap() {
            ApprovalEvent::Requested {
                correlation_id,
                tool_name,
                summary,
                ..
            } => {
                assert_eq!(correlation_id, "r1");
                assert_eq!(tool_name, "Bash");
                assert_eq!(summary, "ls");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        assert!(broker.resolve("r1", PermissionDecision::Allow).await);
        assert_eq!(waiter.await.unwrap(), PermissionDecision::Allow);

        // Resolved before expiry: no late Expired notification.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn second_resolve_is_rejected() {
        let (broker, mut events) = broker(Duration::from_secs(5));
        let broker = std::sync::Arc::new(broker);

        let waiter = {
            let broker = std::sync::Arc::clone(&broker);
            tokio::spawn(async move {
                broker
                    .request("r1", "Bash", &json!({"command": "true"}), "42")
                    .await
            })
        };
        events.recv().await.unwrap();

        assert!(
            broker
                .resolve("r1", PermissionDecision::deny("nope"))
                .await
        );
        assert!(!broker.resolve("r1", PermissionDecision::Allow).await);
        assert_eq!(
            waiter.await.unwrap(),
            PermissionDecision::deny("nope")
        );
    }

    #[tokio::test]
    async fn expiry_forces_denial_and_notifies_the_front_end() {
        let (broker, mut events) = broker(Duration::from_millis(50));
        let decision = broker
            .request("r1", "Bash", &json!({"command": "rm -rf x"}), "42")
            .await;
        assert_eq!(decision, PermissionDecision::deny("timed out"));

        // Prompt, then the expiry rewrite.
        assert!(matches!(
            events.recv().await.unwrap(),
            ApprovalEvent::Requested { .. }
        ));
        match events.recv().await.unwrap() {
            ApprovalEvent::Expired { correlation_id, .. } => assert_eq!(correlation_id, "r1"),
            other => panic!("unexpected event: {:?}", other),
        }

        // The expired entry is gone: resolving it reports unhandled.
        assert!(!broker.resolve("r1", PermissionDecision::Allow).await);
    }

    #[test]
    fn summaries_prefer_command_then_path_then_json() {
        assert_eq!(
            summarize_input("Bash", &json!({"command": "cargo build"})),
            "cargo build"
        );
        assert_eq!(
            summarize_input("Edit", &json!({"file_path": "/src/main.rs", "old": "a"})),
            "Edit: /src/main.rs"
        );
        let long = "x".repeat(400);
        let summary = summarize_input("Custom", &json!({ "payload": long }));
        assert!(summary.ends_with("..."));
        assert!(summary.chars().count() <= SUMMARY_MAX_CHARS + 3);
    }
}
