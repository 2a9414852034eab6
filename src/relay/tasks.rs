use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

use super::transfer::{DataEndpoint, FileTransferJob};
use crate::error::TransferError;
use crate::files::FileCatalog;

/// Work the relay handlers hand off to the background.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayTask {
    Transfer(FileTransferJob),
    /// List `path` and post the entries to the answer endpoint under `cid`.
    ListFiles {
        cid: String,
        path: PathBuf,
        offset: usize,
        size: usize,
    },
}

/// Fire-and-forget task submission. Each task runs at most once; there is
/// no retry, cancellation or completion signal beyond logs.
pub trait TaskQueue: Send + Sync {
    fn submit(&self, task: RelayTask);
}

/// Runs every task as its own tokio task.
#[derive(Clone)]
pub struct BackgroundTasks {
    endpoint: Arc<DataEndpoint>,
    catalog: Arc<dyn FileCatalog>,
}

impl BackgroundTasks {
    pub fn new(endpoint: DataEndpoint, catalog: Arc<dyn FileCatalog>) -> Self {
        Self {
            endpoint: Arc::new(endpoint),
            catalog,
        }
    }
}

impl TaskQueue for BackgroundTasks {
    fn submit(&self, task: RelayTask) {
        let endpoint = self.endpoint.clone();
        let catalog = self.catalog.clone();
        tokio::spawn(async move {
            let label = match &task {
                RelayTask::Transfer(job) => format!("{:?} {}", job.direction, job.correlation_id),
                RelayTask::ListFiles { cid, .. } => format!("list {cid}"),
            };
            match run(task, &endpoint, catalog).await {
                Ok(()) => info!(task = %label, "relay task done"),
                Err(e) => error!(task = %label, error = %e, "relay task failed"),
            }
        });
    }
}

async fn run(
    task: RelayTask,
    endpoint: &DataEndpoint,
    catalog: Arc<dyn FileCatalog>,
) -> Result<(), TransferError> {
    match task {
        RelayTask::Transfer(job) => job.run(endpoint).await.map(|_| ()),
        RelayTask::ListFiles {
            cid,
            path,
            offset,
            size,
        } => {
            let files = tokio::task::spawn_blocking(move || catalog.list(&path, offset, size))
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "listing panicked, answering empty");
                    Vec::new()
                });
            endpoint.api_answer(&cid, &files).await
        }
    }
}
