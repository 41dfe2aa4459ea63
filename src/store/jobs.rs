use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::JobsConfig;

/// External agent binary a background job runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Claude,
    Codex,
    Gemini,
}

impl AgentKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "claude" => Some(Self::Claude),
            "codex" => Some(Self::Codex),
            "gemini" => Some(Self::Gemini),
            _ => None,
        }
    }

    /// Binary and fixed non-interactive flags; the task text goes last.
    pub fn command(&self, config: &JobsConfig) -> (String, Vec<String>) {
        match self {
            Self::Claude => (
                config.claude_bin.clone(),
                vec!["-p".to_string(), "--output-format".to_string(), "text".to_string()],
            ),
            Self::Codex => (
                config.codex_bin.clone(),
                vec!["exec".to_string(), "--full-auto".to_string()],
            ),
            Self::Gemini => (config.gemini_bin.clone(), vec!["-p".to_string()]),
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Claude => write!(f, "claude"),
            Self::Codex => write!(f, "codex"),
            Self::Gemini => write!(f, "gemini"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Done,
    Failed,
    Killed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
            Self::Killed => write!(f, "killed"),
        }
    }
}

/// One background task and everything known about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub agent: AgentKind,
    pub task: String,
    pub workdir: String,
    pub conversation_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub output: String,
}

impl Job {
    /// Append a chunk, keeping at most `cap` trailing bytes (on a char
    /// boundary, so the kept slice can be slightly under the cap).
    pub fn push_output(&mut self, chunk: &str, cap: usize) {
        self.output.push_str(chunk);
        if self.output.len() > cap {
            let mut cut = self.output.len() - cap;
            while !self.output.is_char_boundary(cut) {
                cut += 1;
            }
            self.output.drain(..cut);
        }
    }
}

/// Append-style registry of every job spawned in this process's lifetime,
/// persisted as one JSON array.
///
/// Every mutation is load-whole-file, mutate, save-whole-file inside one
/// mutex, so concurrent jobs never interleave their read-modify-write
/// cycles. Terminal statuses are never overwritten: the kill path and the
/// exit handler can race, and whichever write lands second only fills in
/// missing fields.
pub struct JobStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn load_all(&self) -> Vec<Job> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read job registry");
                return Vec::new();
            }
        };
        let entries: Vec<Value> = match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Malformed job registry, starting empty");
                return Vec::new();
            }
        };
        let mut jobs = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_value::<Job>(entry) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(error = %e, "Dropping malformed job record"),
            }
        }
        jobs
    }

    async fn save_all(&self, jobs: &[Job]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_string_pretty(jobs)?;
        super::write_atomic(&self.path, &raw).await
    }

    pub async fn insert(&self, job: Job) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let mut jobs = self.load_all().await;
        jobs.push(job);
        self.save_all(&jobs).await
    }

    /// Read-modify-write one record under the lock. Returns the updated
    /// record, or `None` when the id is unknown.
    pub async fn update<F>(&self, job_id: &str, mutate: F) -> anyhow::Result<Option<Job>>
    where
        F: FnOnce(&mut Job),
    {
        let _guard = self.lock.lock().await;
        let mut jobs = self.load_all().await;
        let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) else {
            return Ok(None);
        };
        mutate(job);
        let updated = job.clone();
        self.save_all(&jobs).await?;
        Ok(Some(updated))
    }

    /// Move a job into a terminal state. A record that already reached a
    /// terminal state keeps its status; only the missing completion fields
    /// are filled in.
    pub async fn finalize(
        &self,
        job_id: &str,
        status: JobStatus,
        exit_code: Option<i32>,
    ) -> anyhow::Result<Option<Job>> {
        self.update(job_id, |job| {
            if !job.status.is_terminal() {
                job.status = status;
            }
            if job.exit_code.is_none() {
                job.exit_code = exit_code;
            }
            if job.completed_at.is_none() {
                job.completed_at = Some(Utc::now());
            }
        })
        .await
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        let _guard = self.lock.lock().await;
        self.load_all().await.into_iter().find(|j| j.id == job_id)
    }

    /// Resolve a (possibly shortened) id the user typed. Returns the full id
    /// only when the prefix matches exactly one job.
    pub async fn resolve_id(&self, prefix: &str) -> Option<String> {
        let _guard = self.lock.lock().await;
        let jobs = self.load_all().await;
        let mut matches = jobs.iter().filter(|j| j.id.starts_with(prefix));
        let first = matches.next()?;
        if matches.next().is_some() {
            debug!(prefix, "Ambiguous job id prefix");
            return None;
        }
        Some(first.id.clone())
    }

    /// Most recent jobs for one conversation, newest first.
    pub async fn list_recent(&self, conversation_id: &str, limit: usize) -> Vec<Job> {
        let _guard = self.lock.lock().await;
        let mut jobs: Vec<Job> = self
            .load_all()
            .await
            .into_iter()
            .filter(|j| j.conversation_id == conversation_id)
            .collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        jobs.truncate(limit);
        jobs
    }
}
