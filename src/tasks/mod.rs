//! Background task execution
//!
//! All slow or failure-prone work runs through a durable task queue:
//! typed handlers, a bounded worker pool, and per-kind retry caps with
//! persisted bookkeeping. Handlers are idempotent; a startup recovery
//! scan re-queues anything a previous process left Executing, so
//! delivery is at-least-once.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::record::RecordId;
use crate::render::{RenderError, Renderer};
use crate::store::{PasteStore, StoreError, TaskStore};
use crate::sync::{PeerClient, SyncError};

pub mod handlers;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("render error: {0}")]
    Render(#[from] RenderError),

    #[error("record {0} not found")]
    MissingRecord(RecordId),

    #[error("bad task parameters: {0}")]
    BadParams(String),

    #[error("no handler registered for {0:?}")]
    NoHandler(TaskKind),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Closed set of task types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    PullFile,
    PullDeviceIcon,
    RenderMarkup,
    SyncRecord,
    DeleteRecord,
    CleanupOrphans,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::PullFile => "pull-file",
            TaskKind::PullDeviceIcon => "pull-device-icon",
            TaskKind::RenderMarkup => "render-markup",
            TaskKind::SyncRecord => "sync-record",
            TaskKind::DeleteRecord => "delete-record",
            TaskKind::CleanupOrphans => "cleanup-orphans",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pull-file" => Some(TaskKind::PullFile),
            "pull-device-icon" => Some(TaskKind::PullDeviceIcon),
            "render-markup" => Some(TaskKind::RenderMarkup),
            "sync-record" => Some(TaskKind::SyncRecord),
            "delete-record" => Some(TaskKind::DeleteRecord),
            "cleanup-orphans" => Some(TaskKind::CleanupOrphans),
            _ => None,
        }
    }

    /// Maximum executions before the task flips to Failure.
    pub fn max_attempts(&self) -> u32 {
        match self {
            TaskKind::PullFile => 5,
            TaskKind::PullDeviceIcon => 3,
            TaskKind::RenderMarkup => 3,
            TaskKind::SyncRecord => 5,
            TaskKind::DeleteRecord => 3,
            TaskKind::CleanupOrphans => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Executing,
    Success,
    Failure,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Executing => "executing",
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "executing" => Some(TaskStatus::Executing),
            "success" => Some(TaskStatus::Success),
            "failure" => Some(TaskStatus::Failure),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }
}

/// One durable unit of pending work. Created by the collection pipeline
/// or the sync layer; mutated only by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: i64,
    pub kind: TaskKind,
    pub record_id: Option<RecordId>,
    pub status: TaskStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub params: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Work a successful handler wants enqueued next.
#[derive(Debug, Clone)]
pub struct FollowOn {
    pub kind: TaskKind,
    pub record_id: Option<RecordId>,
    pub params: serde_json::Value,
}

/// Shared dependencies handed to every handler.
pub struct TaskContext {
    pub store: Arc<dyn PasteStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub renderer: Arc<dyn Renderer>,
    pub peer_client: Arc<dyn PeerClient>,
    pub data_dir: PathBuf,
    /// How long terminal tasks stay around for inspection.
    pub task_retention: chrono::Duration,
    /// How long tombstones stay visible to offline peers before purge.
    pub tombstone_retention: chrono::Duration,
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: &TaskContext, task: &TaskRecord) -> Result<Vec<FollowOn>, TaskError>;
}

/// Fixed handler registry, built once at startup.
pub struct TaskHandlers {
    map: HashMap<TaskKind, Box<dyn TaskHandler>>,
}

impl TaskHandlers {
    pub fn stock() -> Self {
        let mut set = Self {
            map: HashMap::new(),
        };
        set.insert(TaskKind::PullFile, Box::new(handlers::PullFileHandler));
        set.insert(
            TaskKind::PullDeviceIcon,
            Box::new(handlers::PullDeviceIconHandler),
        );
        set.insert(
            TaskKind::RenderMarkup,
            Box::new(handlers::RenderMarkupHandler),
        );
        set.insert(TaskKind::SyncRecord, Box::new(handlers::SyncRecordHandler));
        set.insert(
            TaskKind::DeleteRecord,
            Box::new(handlers::DeleteRecordHandler),
        );
        set.insert(
            TaskKind::CleanupOrphans,
            Box::new(handlers::CleanupOrphansHandler),
        );
        set
    }

    pub fn empty() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn insert(&mut self, kind: TaskKind, handler: Box<dyn TaskHandler>) {
        self.map.insert(kind, handler);
    }

    pub fn handler_for(&self, kind: TaskKind) -> Option<&dyn TaskHandler> {
        self.map.get(&kind).map(|h| h.as_ref())
    }
}

/// Bounded-concurrency dispatcher over the durable task queue.
pub struct TaskExecutor {
    ctx: Arc<TaskContext>,
    handlers: Arc<TaskHandlers>,
    pool_size: usize,
    poll_interval: Duration,
    stop_tx: watch::Sender<bool>,
}

impl TaskExecutor {
    pub fn new(ctx: Arc<TaskContext>, handlers: Arc<TaskHandlers>, pool_size: usize) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            ctx,
            handlers,
            pool_size: pool_size.max(1),
            poll_interval: Duration::from_millis(250),
            stop_tx,
        }
    }

    #[cfg(test)]
    fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Stop claiming new tasks. Already-executing handlers run to
    /// completion.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Run the dispatch loop until stopped. Performs the startup
    /// recovery scan first.
    pub async fn run(self: Arc<Self>) {
        match self.ctx.tasks.recover_executing().await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "re-queued tasks left executing by previous run"),
            Err(e) => error!("task recovery scan failed: {e}"),
        }

        let semaphore = Arc::new(Semaphore::new(self.pool_size));
        let mut stop_rx = self.stop_tx.subscribe();
        let mut tick = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        info!("task executor stopping");
                        break;
                    }
                }
                _ = tick.tick() => {}
            }

            let free = semaphore.available_permits();
            if free == 0 {
                continue;
            }

            let claimed = match self.ctx.tasks.claim_pending(free).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    error!("failed to claim pending tasks: {e}");
                    continue;
                }
            };

            for task in claimed {
                let permit = match Arc::clone(&semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let ctx = Arc::clone(&self.ctx);
                let handlers = Arc::clone(&self.handlers);
                tokio::spawn(async move {
                    process_one(&ctx, &handlers, task).await;
                    drop(permit);
                });
            }
        }
    }
}

/// Execute one claimed task, applying retry bookkeeping.
pub async fn process_one(ctx: &TaskContext, handlers: &TaskHandlers, task: TaskRecord) {
    let handler = match handlers.handler_for(task.kind) {
        Some(handler) => handler,
        None => {
            error!(task = task.id, kind = task.kind.as_str(), "no handler registered");
            let _ = ctx
                .tasks
                .update_task(task.id, TaskStatus::Failure, task.attempts, Some("no handler"))
                .await;
            return;
        }
    };

    debug!(task = task.id, kind = task.kind.as_str(), attempt = task.attempts + 1, "running task");
    match handler.run(ctx, &task).await {
        Ok(follow_ons) => {
            if let Err(e) = ctx
                .tasks
                .update_task(task.id, TaskStatus::Success, task.attempts, None)
                .await
            {
                error!(task = task.id, "failed to mark task success: {e}");
                return;
            }
            for follow in follow_ons {
                if let Err(e) = ctx
                    .tasks
                    .enqueue(follow.kind, follow.record_id, follow.params)
                    .await
                {
                    error!(task = task.id, "failed to enqueue follow-on: {e}");
                }
            }
        }
        Err(e) => {
            let attempts = task.attempts + 1;
            let message = e.to_string();
            if attempts >= task.kind.max_attempts() {
                warn!(
                    task = task.id,
                    kind = task.kind.as_str(),
                    attempts,
                    "task failed permanently: {message}"
                );
                let _ = ctx
                    .tasks
                    .update_task(task.id, TaskStatus::Failure, attempts, Some(&message))
                    .await;
            } else {
                debug!(
                    task = task.id,
                    kind = task.kind.as_str(),
                    attempts,
                    "task failed, will retry: {message}"
                );
                let _ = ctx
                    .tasks
                    .update_task(task.id, TaskStatus::Pending, attempts, Some(&message))
                    .await;
            }
        }
    }
}
