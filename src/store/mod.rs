mod conversations;
mod jobs;

pub use conversations::{ConversationState, ConversationStore};
pub use jobs::{AgentKind, Job, JobStatus, JobStore};

use std::path::Path;

/// Write `contents` to `path` via a temp file in the same directory and an
/// atomic rename, so a reader never observes a partial file.
pub(crate) async fn write_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
