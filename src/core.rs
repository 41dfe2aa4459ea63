use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::approval::PermissionBroker;
use crate::channels::TelegramChannel;
use crate::config::AppConfig;
use crate::invoker::AgentInvoker;
use crate::store::{ConversationStore, JobStore};
use crate::supervisor::JobSupervisor;

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    // 1. Stores
    let state_dir = std::path::Path::new(&config.state.dir);
    tokio::fs::create_dir_all(state_dir.join("conversations")).await?;
    let conversations = Arc::new(ConversationStore::new(state_dir.join("conversations")));
    let jobs = Arc::new(JobStore::new(state_dir.join("jobs.json")));
    info!(dir = %state_dir.display(), "State stores initialized");

    // 2. Permission broker
    let (approval_tx, approval_rx) = tokio::sync::mpsc::channel(16);
    let broker = Arc::new(PermissionBroker::new(
        approval_tx,
        Duration::from_secs(config.engine.approval_timeout_secs),
    ));

    // 3. Job supervisor
    let (completions_tx, completions_rx) = tokio::sync::mpsc::channel(16);
    let supervisor = Arc::new(JobSupervisor::new(
        Arc::clone(&jobs),
        config.jobs.clone(),
        completions_tx,
    ));

    // 4. Agent invoker
    let invoker = Arc::new(AgentInvoker::new(
        config.engine.clone(),
        Arc::clone(&conversations),
        Arc::clone(&broker),
    ));
    info!(
        engine = %config.engine.binary,
        model = %config.engine.model,
        "Agent invoker configured"
    );

    // 5. Telegram front end
    let channel = Arc::new(TelegramChannel::new(
        &config,
        invoker,
        supervisor,
        broker,
        conversations,
    ));
    channel.run(approval_rx, completions_rx).await;

    Ok(())
}
