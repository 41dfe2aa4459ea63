use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;

use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::JobsConfig;
use crate::store::{AgentKind, Job, JobStatus, JobStore};

/// Send SIGTERM to a process. Returns true if the signal was delivered; a
/// process that is already gone is not an error.
fn send_sigterm(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

/// Runs user-requested background tasks as external agent processes,
/// tracks them durably in the job store, and supports graceful termination.
///
/// Spawn failures propagate to the caller; everything after a successful
/// spawn is logged and recorded in the job's terminal state instead of
/// thrown.
pub struct JobSupervisor {
    store: Arc<JobStore>,
    config: JobsConfig,
    /// Ids with a kill in flight, consulted by the exit handler so the
    /// kill-vs-exit race always lands on `Killed`.
    kill_requested: Arc<Mutex<HashSet<String>>>,
    completions_tx: mpsc::Sender<Job>,
}

impl JobSupervisor {
    pub fn new(store: Arc<JobStore>, config: JobsConfig, completions_tx: mpsc::Sender<Job>) -> Self {
        Self {
            store,
            config,
            kill_requested: Arc::new(Mutex::new(HashSet::new())),
            completions_tx,
        }
    }

    /// Start a background job. Returns the persisted `running` record as
    /// soon as the process is up; supervision continues on its own task.
    pub async fn spawn(
        &self,
        agent: AgentKind,
        task: &str,
        workdir: &str,
        conversation_id: &str,
    ) -> anyhow::Result<Job> {
        let id = Uuid::new_v4().to_string();
        let (binary, args) = agent.command(&self.config);

        let mut child = Command::new(&binary)
            .args(&args)
            .arg(task)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to start {} job: {}", agent, e))?;

        let pid = child.id();
        let job = Job {
            id: id.clone(),
            agent,
            task: task.to_string(),
            workdir: workdir.to_string(),
            conversation_id: conversation_id.to_string(),
            status: JobStatus::Running,
            pid,
            started_at: Utc::now(),
            completed_at: None,
            exit_code: None,
            output: String::new(),
        };
        self.store.insert(job.clone()).await?;
        info!(job_id = %id, agent = %agent, pid = ?pid, workdir, "Job spawned");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let store = Arc::clone(&self.store);
        let kill_requested = Arc::clone(&self.kill_requested);
        let completions_tx = self.completions_tx.clone();
        let max_output = self.config.max_output_bytes;
        tokio::spawn(async move {
            // stdout and stderr drain concurrently into one accumulator;
            // the two streams may interleave, each stays in arrival order.
            let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(16);
            let mut readers = Vec::new();
            if let Some(stdout) = stdout {
                readers.push(tokio::spawn(drain_chunks(stdout, chunk_tx.clone())));
            }
            if let Some(stderr) = stderr {
                readers.push(tokio::spawn(drain_chunks(stderr, chunk_tx)));
            } else {
                drop(chunk_tx);
            }

            let persist_store = Arc::clone(&store);
            let persist_id = id.clone();
            let persister = tokio::spawn(async move {
                while let Some(chunk) = chunk_rx.recv().await {
                    let result = persist_store
                        .update(&persist_id, |job| job.push_output(&chunk, max_output))
                        .await;
                    if let Err(error) = result {
                        warn!(job_id = %persist_id, %error, "Failed to persist job output");
                    }
                }
            });

            let status = child.wait().await;
            for reader in readers {
                let _ = reader.await;
            }
            let _ = persister.await;

            let killed = kill_requested.lock().await.remove(&id);
            let (terminal, exit_code) = match &status {
                Ok(status) if status.success() => (JobStatus::Done, status.code()),
                _ if killed => (JobStatus::Killed, status.as_ref().ok().and_then(|s| s.code())),
                Ok(status) => (JobStatus::Failed, status.code()),
                Err(error) => {
                    warn!(job_id = %id, %error, "Failed to reap job process");
                    (JobStatus::Failed, None)
                }
            };

            let record = match store.finalize(&id, terminal, exit_code).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    warn!(job_id = %id, "Job vanished from the registry before completion");
                    return;
                }
                Err(error) => {
                    warn!(job_id = %id, %error, "Failed to persist terminal job state");
                    return;
                }
            };
            info!(job_id = %id, status = %record.status, exit_code = ?record.exit_code, "Job finished");
            let _ = completions_tx.send(record).await;
        });

        Ok(job)
    }

    /// Request termination. Idempotent: a job already in a terminal state is
    /// returned unchanged, and a process that already exited is tolerated.
    pub async fn kill(&self, job_id: &str) -> anyhow::Result<Option<Job>> {
        let Some(job) = self.store.get(job_id).await else {
            return Ok(None);
        };
        if job.status.is_terminal() {
            return Ok(Some(job));
        }

        // Flag first so the exit handler, however the race goes, computes
        // `Killed` rather than `Failed`.
        self.kill_requested.lock().await.insert(job_id.to_string());

        if let Some(pid) = job.pid {
            if send_sigterm(pid) {
                info!(job_id, pid, "Sent SIGTERM to job");
            } else {
                info!(job_id, pid, "Job process already gone");
            }
        }

        let updated = self.store.finalize(job_id, JobStatus::Killed, None).await?;
        Ok(updated)
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        self.store.get(job_id).await
    }

    pub async fn resolve_id(&self, prefix: &str) -> Option<String> {
        self.store.resolve_id(prefix).await
    }

    /// Most recent 10 jobs for a conversation, newest first.
    pub async fn list(&self, conversation_id: &str) -> Vec<Job> {
        self.store.list_recent(conversation_id, 10).await
    }
}

/// Drain an async reader into chunked strings until EOF.
async fn drain_chunks<R>(mut reader: R, chunk_tx: mpsc::Sender<String>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                if chunk_tx.send(chunk).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn supervisor_with_script(
        dir: &Path,
        script: &Path,
        max_output_bytes: usize,
    ) -> (JobSupervisor, mpsc::Receiver<Job>) {
        let store = Arc::new(JobStore::new(dir.join("jobs.json")));
        let config = JobsConfig {
            claude_bin: script.to_str().unwrap().to_string(),
            max_output_bytes,
            ..JobsConfig::default()
        };
        let (completions_tx, completions_rx) = mpsc::channel(4);
        (JobSupervisor::new(store, config, completions_tx), completions_rx)
    }

    #[tokio::test]
    async fn finished_job_is_done_with_captured_output() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "ok.sh", "echo hello from the job");
        let (supervisor, mut completions) = supervisor_with_script(tmp.path(), &script, 16384);

        let job = supervisor
            .spawn(AgentKind::Claude, "say hello", tmp.path().to_str().unwrap(), "42")
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.pid.is_some());

        let finished = completions.recv().await.unwrap();
        assert_eq!(finished.id, job.id);
        assert_eq!(finished.status, JobStatus::Done);
        assert_eq!(finished.exit_code, Some(0));
        assert!(finished.output.contains("hello from the job"));
        assert!(finished.completed_at.is_some());
    }

    #[tokio::test]
    async fn output_is_tail_truncated_to_the_ceiling() {
        let tmp = tempfile::tempdir().unwrap();
        // 5000 'A's, no trailing newline.
        let script = write_script(tmp.path(), "spam.sh", r#"printf 'A%.0s' $(seq 1 5000)"#);
        let (supervisor, mut completions) = supervisor_with_script(tmp.path(), &script, 3000);

        supervisor
            .spawn(AgentKind::Claude, "spam", tmp.path().to_str().unwrap(), "42")
            .await
            .unwrap();

        let finished = completions.recv().await.unwrap();
        assert_eq!(finished.status, JobStatus::Done);
        assert_eq!(finished.exit_code, Some(0));
        assert_eq!(finished.output.len(), 3000);
        assert!(finished.output.chars().all(|c| c == 'A'));
    }

    #[tokio::test]
    async fn failing_job_records_failed_with_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "bad.sh", "echo boom >&2\nexit 3");
        let (supervisor, mut completions) = supervisor_with_script(tmp.path(), &script, 16384);

        supervisor
            .spawn(AgentKind::Claude, "explode", tmp.path().to_str().unwrap(), "42")
            .await
            .unwrap();

        let finished = completions.recv().await.unwrap();
        assert_eq!(finished.status, JobStatus::Failed);
        assert_eq!(finished.exit_code, Some(3));
        assert!(finished.output.contains("boom"));
    }

    #[tokio::test]
    async fn killed_job_stays_killed() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "slow.sh", "sleep 30");
        let (supervisor, mut completions) = supervisor_with_script(tmp.path(), &script, 16384);

        let job = supervisor
            .spawn(AgentKind::Claude, "nap", tmp.path().to_str().unwrap(), "42")
            .await
            .unwrap();

        let killed = supervisor.kill(&job.id).await.unwrap().unwrap();
        assert_eq!(killed.status, JobStatus::Killed);

        // The exit handler runs after the signal lands; the status must
        // not be reverted to failed.
        let finished = completions.recv().await.unwrap();
        assert_eq!(finished.status, JobStatus::Killed);

        // Killing again is a no-op that reports the terminal record.
        let again = supervisor.kill(&job.id).await.unwrap().unwrap();
        assert_eq!(again.status, JobStatus::Killed);
    }

    #[tokio::test]
    async fn kill_of_unknown_job_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "ok.sh", "true");
        let (supervisor, _completions) = supervisor_with_script(tmp.path(), &script, 16384);
        assert!(supervisor.kill("no-such-job").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn spawn_failure_propagates_synchronously() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::new(tmp.path().join("jobs.json")));
        let config = JobsConfig {
            claude_bin: "/nonexistent/agentbridge-job-binary".to_string(),
            ..JobsConfig::default()
        };
        let (completions_tx, _completions_rx) = mpsc::channel(4);
        let supervisor = JobSupervisor::new(Arc::clone(&store), config, completions_tx);

        let error = supervisor
            .spawn(AgentKind::Claude, "task", tmp.path().to_str().unwrap(), "42")
            .await
            .unwrap_err();
        assert!(error.to_string().contains("Failed to start"));
        // Nothing was recorded for the failed spawn.
        assert!(store.list_recent("42", 10).await.is_empty());
    }

    #[tokio::test]
    async fn list_shows_this_conversations_jobs_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "ok.sh", "true");
        let (supervisor, mut completions) = supervisor_with_script(tmp.path(), &script, 16384);

        let first = supervisor
            .spawn(AgentKind::Claude, "one", tmp.path().to_str().unwrap(), "42")
            .await
            .unwrap();
        completions.recv().await.unwrap();
        let second = supervisor
            .spawn(AgentKind::Claude, "two", tmp.path().to_str().unwrap(), "42")
            .await
            .unwrap();
        completions.recv().await.unwrap();

        let listed = supervisor.list("42").await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
        assert!(supervisor.list("other").await.is_empty());
    }
}
