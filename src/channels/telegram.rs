use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::{
    ChatAction, InlineKeyboardButton, InlineKeyboardMarkup, MaybeInaccessibleMessage, MessageId,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::approval::PermissionBroker;
use crate::config::AppConfig;
use crate::invoker::{is_service_unavailable, AgentInvoker};
use crate::store::{AgentKind, ConversationStore, Job};
use crate::supervisor::JobSupervisor;
use crate::types::{ApprovalEvent, PermissionDecision};

/// Telegram's hard ceiling on message length.
const MESSAGE_LIMIT: usize = 4096;
/// Minimum pause between streaming edits of the in-flight reply.
const EDIT_MIN_INTERVAL: Duration = Duration::from_secs(2);
/// Tail of job output included in a completion notice.
const COMPLETION_OUTPUT_PREVIEW: usize = 500;

/// The Telegram front end: receives turns and job commands, renders streamed
/// replies by editing one message in place, and carries the approve/deny
/// handshake for permission prompts.
pub struct TelegramChannel {
    bot: Bot,
    bot_token: String,
    allowed_chat_ids: Vec<i64>,
    invoker: Arc<AgentInvoker>,
    supervisor: Arc<JobSupervisor>,
    broker: Arc<PermissionBroker>,
    conversations: Arc<ConversationStore>,
    inbox_dir: PathBuf,
    max_file_size_mb: u64,
    job_workdir: String,
    /// Prompt messages per pending correlation id, so an expired request
    /// can rewrite its now-stale prompt.
    approval_messages: Mutex<HashMap<String, (ChatId, MessageId)>>,
}

impl TelegramChannel {
    pub fn new(
        config: &AppConfig,
        invoker: Arc<AgentInvoker>,
        supervisor: Arc<JobSupervisor>,
        broker: Arc<PermissionBroker>,
        conversations: Arc<ConversationStore>,
    ) -> Self {
        Self {
            bot: Bot::new(&config.telegram.bot_token),
            bot_token: config.telegram.bot_token.clone(),
            allowed_chat_ids: config.telegram.allowed_chat_ids.clone(),
            invoker,
            supervisor,
            broker,
            conversations,
            inbox_dir: PathBuf::from(&config.files.inbox_dir),
            max_file_size_mb: config.files.max_file_size_mb,
            job_workdir: config.jobs.workdir.clone(),
            approval_messages: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(
        self: Arc<Self>,
        approval_rx: mpsc::Receiver<ApprovalEvent>,
        completions_rx: mpsc::Receiver<Job>,
    ) {
        info!("Starting Telegram channel");

        tokio::spawn({
            let channel = Arc::clone(&self);
            async move { channel.handle_approval_events(approval_rx).await }
        });
        tokio::spawn({
            let channel = Arc::clone(&self);
            async move { channel.handle_job_completions(completions_rx).await }
        });

        let handler = dptree::entry()
            .branch(Update::filter_message().endpoint({
                let channel = Arc::clone(&self);
                move |msg: teloxide::types::Message, bot: Bot| {
                    let channel = Arc::clone(&channel);
                    async move {
                        channel.handle_message(msg, bot).await;
                        respond(())
                    }
                }
            }))
            .branch(Update::filter_callback_query().endpoint({
                let channel = Arc::clone(&self);
                move |q: CallbackQuery, bot: Bot| {
                    let channel = Arc::clone(&channel);
                    async move {
                        channel.handle_callback(q, bot).await;
                        respond(())
                    }
                }
            }));

        Dispatcher::builder(self.bot.clone(), handler)
            .enable_ctrlc_handler()
            .build()
            .dispatch()
            .await;
    }

    fn is_authorized(&self, chat_id: i64) -> bool {
        // Fail-closed: an empty allow-list admits nobody.
        self.allowed_chat_ids.contains(&chat_id)
    }

    async fn handle_message(&self, msg: teloxide::types::Message, bot: Bot) {
        let chat_id = msg.chat.id;
        if !self.is_authorized(chat_id.0) {
            debug!(chat_id = chat_id.0, "Ignoring message from unknown chat");
            return;
        }

        if let Some(text) = msg.text() {
            let text = text.to_string();
            if text.starts_with('/') {
                self.handle_command(&text, chat_id, &bot).await;
            } else {
                self.handle_turn(chat_id, &text, &bot).await;
            }
            return;
        }

        if msg.document().is_some() || msg.photo().is_some() {
            match self.handle_file_message(&msg, &bot).await {
                Ok(turn_text) => self.handle_turn(chat_id, &turn_text, &bot).await,
                Err(error) => {
                    let _ = bot.send_message(chat_id, format!("{}", error)).await;
                }
            }
            return;
        }

        debug!(chat_id = chat_id.0, "Unsupported message type");
    }

    /// One conversation turn: placeholder message, streamed edits while the
    /// engine produces text, final text (split if over the limit).
    async fn handle_turn(&self, chat_id: ChatId, text: &str, bot: &Bot) {
        let conversation_id = chat_id.0.to_string();

        let typing = tokio::spawn({
            let bot = bot.clone();
            async move {
                loop {
                    let _ = bot.send_chat_action(chat_id, ChatAction::Typing).await;
                    tokio::time::sleep(Duration::from_secs(4)).await;
                }
            }
        });

        let placeholder = match bot.send_message(chat_id, "Thinking...").await {
            Ok(message) => message.id,
            Err(error) => {
                warn!(chat_id = chat_id.0, %error, "Failed to send placeholder message");
                typing.abort();
                return;
            }
        };

        let (partial_tx, mut partial_rx) = mpsc::channel::<String>(16);
        let editor = tokio::spawn({
            let bot = bot.clone();
            async move {
                let mut last_edit = tokio::time::Instant::now();
                let mut last_sent = String::new();
                while let Some(partial) = partial_rx.recv().await {
                    if last_edit.elapsed() < EDIT_MIN_INTERVAL {
                        continue;
                    }
                    let preview = truncate_chars(&partial, MESSAGE_LIMIT);
                    if preview == last_sent {
                        continue;
                    }
                    if bot
                        .edit_message_text(chat_id, placeholder, preview.clone())
                        .await
                        .is_ok()
                    {
                        last_sent = preview;
                        last_edit = tokio::time::Instant::now();
                    }
                }
            }
        });

        let result = self
            .invoker
            .invoke(&conversation_id, text, Some(partial_tx))
            .await;
        let _ = editor.await;
        typing.abort();

        match result {
            Ok(answer) => {
                let chunks = split_message(&answer, MESSAGE_LIMIT);
                let mut chunks = chunks.into_iter();
                if let Some(first) = chunks.next() {
                    if bot
                        .edit_message_text(chat_id, placeholder, first.clone())
                        .await
                        .is_err()
                    {
                        let _ = bot.send_message(chat_id, first).await;
                    }
                }
                for chunk in chunks {
                    let _ = bot.send_message(chat_id, chunk).await;
                }
            }
            Err(error) => {
                let text = if is_service_unavailable(&error) {
                    "The agent engine looks unavailable right now. Please try again in a little while.".to_string()
                } else {
                    format!("Something went wrong: {}", error)
                };
                let text = truncate_chars(&text, MESSAGE_LIMIT);
                if bot
                    .edit_message_text(chat_id, placeholder, text.clone())
                    .await
                    .is_err()
                {
                    let _ = bot.send_message(chat_id, text).await;
                }
            }
        }
    }

    async fn handle_command(&self, text: &str, chat_id: ChatId, bot: &Bot) {
        let parts: Vec<&str> = text.splitn(2, ' ').collect();
        let command = parts[0];
        let arg = parts.get(1).map(|s| s.trim()).unwrap_or("");
        let conversation_id = chat_id.0.to_string();

        let reply = match command {
            "/start" | "/help" => help_text(),
            "/reset" => match self.conversations.clear(&conversation_id).await {
                Ok(true) => "Conversation history cleared. Starting fresh.".to_string(),
                Ok(false) => "Nothing to clear.".to_string(),
                Err(error) => format!("Failed to clear the conversation: {}", error),
            },
            "/jobs" => {
                let jobs = self.supervisor.list(&conversation_id).await;
                if jobs.is_empty() {
                    "No jobs yet. Start one with /spawn <task>.".to_string()
                } else {
                    let mut lines = vec!["Recent jobs (newest first):".to_string()];
                    for job in jobs {
                        lines.push(format!(
                            "{} [{}] {} - {}",
                            &job.id[..8.min(job.id.len())],
                            job.agent,
                            job.status,
                            truncate_chars(&job.task, 60)
                        ));
                    }
                    lines.join("\n")
                }
            }
            "/spawn" => {
                if arg.is_empty() {
                    "Usage: /spawn [claude|codex|gemini] <task>".to_string()
                } else {
                    let (agent, task) = match arg.split_once(' ') {
                        Some((first, rest)) => match AgentKind::parse(first) {
                            Some(agent) => (agent, rest.trim()),
                            None => (AgentKind::Claude, arg),
                        },
                        None => match AgentKind::parse(arg) {
                            // A bare agent name with no task.
                            Some(_) => {
                                let _ = bot
                                    .send_message(chat_id, "Usage: /spawn [claude|codex|gemini] <task>")
                                    .await;
                                return;
                            }
                            None => (AgentKind::Claude, arg),
                        },
                    };
                    match self
                        .supervisor
                        .spawn(agent, task, &self.job_workdir, &conversation_id)
                        .await
                    {
                        Ok(job) => format!(
                            "Job {} started ({} in {}). I'll report back when it finishes.",
                            &job.id[..8],
                            job.agent,
                            job.workdir
                        ),
                        Err(error) => format!("Could not start the job: {}", error),
                    }
                }
            }
            "/job" => {
                if arg.is_empty() {
                    "Usage: /job <job-id>".to_string()
                } else {
                    let job_id = self
                        .supervisor
                        .resolve_id(arg)
                        .await
                        .unwrap_or_else(|| arg.to_string());
                    match self.supervisor.get(&job_id).await {
                        Some(job) => {
                            let mut detail = format!(
                                "Job {} [{}] {}\nTask: {}\nStarted: {}",
                                &job.id[..8.min(job.id.len())],
                                job.agent,
                                job.status,
                                truncate_chars(&job.task, 200),
                                job.started_at.format("%Y-%m-%d %H:%M UTC")
                            );
                            if let Some(code) = job.exit_code {
                                detail.push_str(&format!("\nExit code: {}", code));
                            }
                            if !job.output.trim().is_empty() {
                                detail.push_str("\n\n");
                                detail.push_str(tail_chars(&job.output, 1000).trim());
                            }
                            truncate_chars(&detail, MESSAGE_LIMIT)
                        }
                        None => format!("No job matching '{}'.", arg),
                    }
                }
            }
            "/kill" => {
                if arg.is_empty() {
                    "Usage: /kill <job-id>".to_string()
                } else {
                    let job_id = self
                        .supervisor
                        .resolve_id(arg)
                        .await
                        .unwrap_or_else(|| arg.to_string());
                    match self.supervisor.kill(&job_id).await {
                        Ok(Some(job)) => format!(
                            "Job {} is now {}.",
                            &job.id[..8.min(job.id.len())],
                            job.status
                        ),
                        Ok(None) => format!("No job matching '{}'.", arg),
                        Err(error) => format!("Kill failed: {}", error),
                    }
                }
            }
            _ => format!("Unknown command {}. Try /help.", command),
        };

        let _ = bot.send_message(chat_id, reply).await;
    }

    /// Inline-keyboard callbacks carry `approve:<allow|deny>:<correlation>`.
    async fn handle_callback(&self, q: CallbackQuery, bot: Bot) {
        let user_id = q.from.id.0 as i64;
        if !self.is_authorized(user_id) {
            warn!(user_id, "Unauthorized callback");
            let _ = bot.answer_callback_query(q.id).text("Unauthorized.").await;
            return;
        }

        let Some(data) = q.data.as_deref() else {
            return;
        };
        let parts: Vec<&str> = data.splitn(3, ':').collect();
        if parts.len() != 3 || parts[0] != "approve" {
            return;
        }
        let correlation_id = parts[2];
        let (decision, label) = match parts[1] {
            "allow" => (PermissionDecision::Allow, "Allowed"),
            "deny" => (
                PermissionDecision::deny("denied by user"),
                "Denied",
            ),
            _ => return,
        };

        let handled = self.broker.resolve(correlation_id, decision).await;
        let label = if handled { label } else { "Expired" };
        let _ = bot.answer_callback_query(q.id).text(label).await;

        self.approval_messages.lock().await.remove(correlation_id);
        if let Some(MaybeInaccessibleMessage::Regular(m)) = q.message {
            let original = m.text().unwrap_or("");
            let _ = bot
                .edit_message_text(m.chat.id, m.id, format!("{} — {}", original, label))
                .await;
        }
    }

    async fn handle_approval_events(&self, mut approval_rx: mpsc::Receiver<ApprovalEvent>) {
        while let Some(event) = approval_rx.recv().await {
            match event {
                ApprovalEvent::Requested {
                    correlation_id,
                    conversation_id,
                    tool_name,
                    summary,
                } => {
                    let Ok(chat_id) = conversation_id.parse::<i64>() else {
                        warn!(%conversation_id, "Approval prompt for a non-numeric chat id");
                        continue;
                    };
                    let keyboard = InlineKeyboardMarkup::new(vec![vec![
                        InlineKeyboardButton::callback(
                            "Allow",
                            format!("approve:allow:{}", correlation_id),
                        ),
                        InlineKeyboardButton::callback(
                            "Deny",
                            format!("approve:deny:{}", correlation_id),
                        ),
                    ]]);
                    let text = format!(
                        "Permission required: {}\n\n{}",
                        tool_name,
                        truncate_chars(&summary, 1000)
                    );
                    match self
                        .bot
                        .send_message(ChatId(chat_id), text)
                        .reply_markup(keyboard)
                        .await
                    {
                        Ok(message) => {
                            self.approval_messages
                                .lock()
                                .await
                                .insert(correlation_id, (ChatId(chat_id), message.id));
                        }
                        Err(error) => {
                            warn!(%error, "Failed to send approval prompt");
                        }
                    }
                }
                ApprovalEvent::Expired { correlation_id, .. } => {
                    let stored = self.approval_messages.lock().await.remove(&correlation_id);
                    if let Some((chat_id, message_id)) = stored {
                        let _ = self
                            .bot
                            .edit_message_text(
                                chat_id,
                                message_id,
                                "Permission request timed out — denied.",
                            )
                            .await;
                    }
                }
            }
        }
    }

    async fn handle_job_completions(&self, mut completions_rx: mpsc::Receiver<Job>) {
        while let Some(job) = completions_rx.recv().await {
            let Ok(chat_id) = job.conversation_id.parse::<i64>() else {
                continue;
            };
            let mut text = format!(
                "Job {} ({}) finished: {}",
                &job.id[..8.min(job.id.len())],
                job.agent,
                job.status
            );
            if let Some(code) = job.exit_code {
                text.push_str(&format!(" (exit code {})", code));
            }
            if !job.output.trim().is_empty() {
                let tail = tail_chars(&job.output, COMPLETION_OUTPUT_PREVIEW);
                text.push_str("\n\n");
                text.push_str(tail.trim());
            }
            let _ = self
                .bot
                .send_message(ChatId(chat_id), truncate_chars(&text, MESSAGE_LIMIT))
                .await;
        }
    }

    /// Save an inbound photo/document to the inbox and build turn text that
    /// points the agent at the local path.
    async fn handle_file_message(
        &self,
        msg: &teloxide::types::Message,
        bot: &Bot,
    ) -> anyhow::Result<String> {
        let (file_id, file_size, filename) = if let Some(doc) = msg.document() {
            (
                doc.file.id.clone(),
                doc.file.size as u64,
                doc.file_name
                    .clone()
                    .unwrap_or_else(|| "document".to_string()),
            )
        } else if let Some(photos) = msg.photo() {
            // Last photo in the array is the largest rendition.
            let photo = photos
                .last()
                .ok_or_else(|| anyhow::anyhow!("Empty photo array"))?;
            (photo.file.id.clone(), photo.file.size as u64, "photo.jpg".to_string())
        } else {
            anyhow::bail!("Unsupported attachment type.");
        };

        let max_bytes = self.max_file_size_mb * 1_048_576;
        if file_size > max_bytes {
            anyhow::bail!(
                "File too large ({:.1} MB). Maximum is {} MB.",
                file_size as f64 / 1_048_576.0,
                self.max_file_size_mb
            );
        }

        let file = bot.get_file(file_id).await?;
        let download_url = format!(
            "https://api.telegram.org/file/bot{}/{}",
            self.bot_token, file.path
        );
        let response = reqwest::get(&download_url).await?;
        if !response.status().is_success() {
            anyhow::bail!("Failed to download file from Telegram: HTTP {}", response.status());
        }
        let bytes = response.bytes().await?;

        tokio::fs::create_dir_all(&self.inbox_dir).await?;
        let dest_name = format!(
            "{}_{}",
            &uuid::Uuid::new_v4().to_string()[..8],
            sanitize_filename(&filename)
        );
        let dest_path = self.inbox_dir.join(&dest_name);
        tokio::fs::write(&dest_path, &bytes).await?;
        info!(file = %dest_path.display(), size = bytes.len(), "Saved inbound file");

        let mut turn = format!("The user sent a file, saved at: {}", dest_path.display());
        if let Some(caption) = msg.caption() {
            if !caption.is_empty() {
                turn.push('\n');
                turn.push_str(caption);
            }
        }
        Ok(turn)
    }
}

fn help_text() -> String {
    "I relay your messages to a coding agent and stream its answers back.\n\
     \n\
     Commands:\n\
     /spawn [claude|codex|gemini] <task> — run a task in the background\n\
     /jobs — list your recent background jobs\n\
     /job <job-id> — show one job's status and output\n\
     /kill <job-id> — stop a running job\n\
     /reset — forget this conversation and start fresh\n\
     /help — this message\n\
     \n\
     When the agent wants to run something sensitive, I'll ask you first \
     with Allow/Deny buttons. Requests expire after two minutes."
        .to_string()
}

/// Strip path separators and control characters, cap the length.
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, '/' | '\\' | '\0') {
                '_'
            } else {
                c
            }
        })
        .collect();
    truncate_chars(cleaned.trim_start_matches('.'), 120)
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars().take(max_chars).collect()
}

/// Last `max_chars` characters of `s`.
fn tail_chars(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        return s.to_string();
    }
    s.chars().skip(count - max_chars).collect()
}

/// Break a long reply into chunks that fit Telegram's message limit,
/// preferring newline boundaries.
fn split_message(text: &str, limit: usize) -> Vec<String> {
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0;
    for line in text.split_inclusive('\n') {
        let line_chars = line.chars().count();
        if line_chars > limit {
            // One enormous line: hard-split it.
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_chars = 0;
            }
            let mut piece = String::new();
            let mut piece_chars = 0;
            for c in line.chars() {
                piece.push(c);
                piece_chars += 1;
                if piece_chars == limit {
                    chunks.push(std::mem::take(&mut piece));
                    piece_chars = 0;
                }
            }
            if !piece.is_empty() {
                current = piece;
                current_chars = piece_chars;
            }
            continue;
        }
        if current_chars + line_chars > limit {
            chunks.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        current.push_str(line);
        current_chars += line_chars;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_messages_are_not_split() {
        assert_eq!(split_message("hello", 4096), vec!["hello".to_string()]);
    }

    #[test]
    fn long_messages_split_on_line_boundaries() {
        let text = format!("{}\n{}", "a".repeat(3000), "b".repeat(3000));
        let chunks = split_message(&text, 4096);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with('a'));
        assert!(chunks[1].starts_with('b'));
        assert!(chunks.iter().all(|c| c.chars().count() <= 4096));
    }

    #[test]
    fn one_giant_line_is_hard_split() {
        let text = "x".repeat(10000);
        let chunks = split_message(&text, 4096);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chars().count(), 4096);
        assert_eq!(chunks[1].chars().count(), 4096);
        assert_eq!(chunks[2].chars().count(), 10000 - 2 * 4096);
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
    }

    #[test]
    fn tail_chars_keeps_the_end() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
    }
}
