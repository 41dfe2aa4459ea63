use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::approval::PermissionBroker;
use crate::config::EngineConfig;
use crate::engine::{
    is_crash, AttemptConfig, ControlRequestEvent, EngineCrash, EngineEvent, EngineProcess,
    EngineResponder, PermissionRoute, ATTEMPT_LADDER,
};
use crate::store::ConversationStore;
use crate::types::{ChatMessage, PermissionDecision};

/// Returned instead of an answer when every rung of the ladder produced a
/// normal (non-crash) but empty completion.
pub const FALLBACK_TEXT: &str =
    "I could not come up with a response to that. Please try again in a moment.";

/// Every attempt crashed: the engine itself looks down, not the request.
#[derive(Debug)]
pub struct ServiceUnavailable;

impl std::fmt::Display for ServiceUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "the agent engine is unavailable right now, please retry in a little while")
    }
}

impl std::error::Error for ServiceUnavailable {}

pub fn is_service_unavailable(error: &anyhow::Error) -> bool {
    error.downcast_ref::<ServiceUnavailable>().is_some()
}

struct AttemptOutcome {
    text: String,
    continuation: Option<String>,
}

/// Converts one user turn into one final answer, resiliently.
///
/// A fixed ladder of progressively less capable engine configurations is
/// tried in order. Crashes advance the ladder; empty completions advance it
/// as soft failures; anything else aborts the turn. The user's turn is
/// persisted on every path so context is never silently lost, and the
/// continuation handle survives everything except a crash.
pub struct AgentInvoker {
    config: EngineConfig,
    store: Arc<ConversationStore>,
    broker: Arc<PermissionBroker>,
}

impl AgentInvoker {
    pub fn new(
        config: EngineConfig,
        store: Arc<ConversationStore>,
        broker: Arc<PermissionBroker>,
    ) -> Self {
        Self {
            config,
            store,
            broker,
        }
    }

    pub async fn invoke(
        &self,
        conversation_id: &str,
        turn_text: &str,
        partial_tx: Option<mpsc::Sender<String>>,
    ) -> anyhow::Result<String> {
        let mut state = self.store.load(conversation_id).await;
        let user_turn = ChatMessage::user(turn_text);
        let mut soft_failure = false;
        let mut captured_continuation: Option<String> = None;

        for attempt in ATTEMPT_LADDER {
            let continuation = if attempt.resume {
                state.continuation.clone()
            } else {
                None
            };
            info!(conversation_id, attempt = attempt.label, "Invoking engine");

            match self
                .run_attempt(
                    attempt,
                    conversation_id,
                    continuation.as_deref(),
                    turn_text,
                    partial_tx.as_ref(),
                )
                .await
            {
                Ok(outcome) => {
                    if let Some(session) = outcome.continuation {
                        captured_continuation = Some(session);
                    }
                    if outcome.text.trim().is_empty() {
                        warn!(
                            conversation_id,
                            attempt = attempt.label,
                            "Attempt completed without an answer"
                        );
                        soft_failure = true;
                        continue;
                    }
                    state.history.push(user_turn);
                    state.history.push(ChatMessage::assistant(outcome.text.clone()));
                    if captured_continuation.is_some() {
                        state.continuation = captured_continuation;
                    }
                    self.store.save(conversation_id, &state).await?;
                    return Ok(outcome.text);
                }
                Err(error) if is_crash(&error) => {
                    warn!(
                        conversation_id,
                        attempt = attempt.label,
                        error = %error,
                        "Engine crashed, advancing the ladder"
                    );
                    continue;
                }
                Err(error) => {
                    // Fatal: persist the turn, keep the handle (this was not
                    // a crash), surface the error.
                    state.history.push(user_turn);
                    if captured_continuation.is_some() {
                        state.continuation = captured_continuation;
                    }
                    if let Err(save_error) = self.store.save(conversation_id, &state).await {
                        warn!(conversation_id, error = %save_error, "Failed to persist turn after fatal error");
                    }
                    return Err(error);
                }
            }
        }

        state.history.push(user_turn);
        if !soft_failure {
            // Every attempt died abnormally; force a fresh session next turn.
            state.continuation = None;
            self.store.save(conversation_id, &state).await?;
            return Err(anyhow::Error::new(ServiceUnavailable));
        }
        if captured_continuation.is_some() {
            state.continuation = captured_continuation;
        }
        self.store.save(conversation_id, &state).await?;
        Ok(FALLBACK_TEXT.to_string())
    }

    async fn run_attempt(
        &self,
        attempt: &'static AttemptConfig,
        conversation_id: &str,
        continuation: Option<&str>,
        turn_text: &str,
        partial_tx: Option<&mpsc::Sender<String>>,
    ) -> anyhow::Result<AttemptOutcome> {
        let preamble = self.system_preamble();
        let mut process =
            EngineProcess::spawn(&self.config, attempt, &preamble, continuation, turn_text)?;
        let responder = process.responder();

        let mut accumulator = String::new();
        let mut final_text: Option<String> = None;
        let mut session: Option<String> = None;

        while let Some(event) = process.next_event().await? {
            match event {
                EngineEvent::System(sys) => {
                    if let Some(id) = sys.session_id {
                        debug!(conversation_id, session_id = %id, "Engine session announced");
                        session = Some(id);
                    }
                }
                EngineEvent::Assistant(message) => {
                    let text = message.text();
                    if !text.is_empty() {
                        accumulator.push_str(&text);
                        // Only the streaming rung delivers partials; later
                        // rungs stay silent so the front end never sees a
                        // shorter text after a longer one.
                        if attempt.streaming {
                            if let Some(tx) = partial_tx {
                                // Awaited before the next event is read, so
                                // deliveries stay strictly ordered.
                                let _ = tx.send(accumulator.clone()).await;
                            }
                        }
                    }
                }
                EngineEvent::Result(result) => {
                    debug!(conversation_id, subtype = %result.subtype, "Engine result event");
                    if let Some(id) = result.session_id {
                        session = Some(id);
                    }
                    final_text = result.result;
                    break;
                }
                EngineEvent::ControlRequest(request) => {
                    self.handle_control_request(attempt, conversation_id, request, &responder);
                }
                EngineEvent::Other => {}
            }
        }

        let (status, stderr_tail) = process.finish().await?;
        if !status.success() {
            return Err(anyhow::Error::new(EngineCrash {
                exit_code: status.code(),
                stderr_tail,
            }));
        }

        Ok(AttemptOutcome {
            text: final_text.unwrap_or(accumulator),
            continuation: session,
        })
    }

    /// Answer a tool-permission check without stalling event consumption:
    /// the decision is produced (and written back) from its own task while
    /// the event loop keeps reading.
    fn handle_control_request(
        &self,
        attempt: &AttemptConfig,
        conversation_id: &str,
        request: ControlRequestEvent,
        responder: &EngineResponder,
    ) {
        if request.request.subtype != "can_use_tool" {
            debug!(subtype = %request.request.subtype, "Ignoring unsupported control request");
            return;
        }
        let route = attempt.permissions;
        let broker = Arc::clone(&self.broker);
        let responder = responder.clone();
        let conversation_id = conversation_id.to_string();
        tokio::spawn(async move {
            let decision = match route {
                PermissionRoute::Broker => {
                    broker
                        .request(
                            &request.request_id,
                            &request.request.tool_name,
                            &request.request.input,
                            &conversation_id,
                        )
                        .await
                }
                PermissionRoute::Deny => {
                    PermissionDecision::deny("tool use is disabled for this attempt")
                }
            };
            if let Err(error) = responder
                .answer_permission(&request.request_id, &decision)
                .await
            {
                warn!(error = %error, "Failed to deliver permission decision to engine");
            }
        });
    }

    fn system_preamble(&self) -> String {
        format!(
            "{}\nCurrent time: {}.",
            self.config.persona,
            Utc::now().format("%Y-%m-%d %H:%M UTC")
        )
    }
}
