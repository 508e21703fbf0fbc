use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;

use crate::error::StampError;
use crate::metadata::{self, DATE_UNKNOWN};
use crate::resolver::PlaceResolver;
use crate::stamp::{self, ExifOrientation, StampedImage};

/// Per-task lifecycle. `Ready` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Reading,
    Geocoding,
    Drawing,
    Ready,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Error)
    }
}

/// Events produced by the orchestrator as stages complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Start,
    MetadataRead,
    LocationResolved,
    Stamped,
    Failed,
}

/// Pure state-transition function. Terminal states absorb every event;
/// an event that does not apply to the current state leaves it unchanged.
pub fn advance(status: TaskStatus, event: TaskEvent) -> TaskStatus {
    if status.is_terminal() {
        return status;
    }
    match (status, event) {
        (_, TaskEvent::Failed) => TaskStatus::Error,
        (TaskStatus::Idle, TaskEvent::Start) => TaskStatus::Reading,
        (TaskStatus::Reading, TaskEvent::MetadataRead) => TaskStatus::Geocoding,
        (TaskStatus::Geocoding, TaskEvent::LocationResolved) => TaskStatus::Drawing,
        (TaskStatus::Drawing, TaskEvent::Stamped) => TaskStatus::Ready,
        (status, _) => status,
    }
}

/// One submitted photo and everything its pipeline run produces. Mutated
/// only by the run driving it.
#[derive(Debug)]
pub struct PhotoTask {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub status: TaskStatus,
    pub error_message: Option<String>,
    pub result: Option<StampedImage>,
    pub suggested_filename: Option<String>,
}

impl PhotoTask {
    pub fn new(filename: String, bytes: Vec<u8>) -> Self {
        Self {
            filename,
            bytes,
            status: TaskStatus::Idle,
            error_message: None,
            result: None,
            suggested_filename: None,
        }
    }
}

/// Lowercase filesystem-safe token from the resolved place plus the
/// formatted date: `tokyo_tower_2024-01-15.jpg` style.
pub fn suggest_filename(location: &str, date: &str) -> String {
    let token: String = location
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_{}.jpg", token, date.replace('/', "-"))
}

/// Drives each photo through extract -> resolve -> stamp, one independent
/// run per task.
pub struct PhotoPipeline {
    resolver: Arc<PlaceResolver>,
}

impl PhotoPipeline {
    pub fn new(resolver: Arc<PlaceResolver>) -> Self {
        Self { resolver }
    }

    /// Run one task to a terminal state. A failure terminates only this
    /// task; the error message lands verbatim on the task record.
    pub async fn run(&self, task: &mut PhotoTask) {
        task.status = advance(task.status, TaskEvent::Start);
        if let Err(e) = self.run_stages(task).await {
            tracing::warn!(file = %task.filename, error = %e, "photo task failed");
            task.error_message = Some(e.to_string());
            task.status = advance(task.status, TaskEvent::Failed);
        }
    }

    async fn run_stages(&self, task: &mut PhotoTask) -> Result<(), StampError> {
        let meta = metadata::extract(&task.bytes)?;
        let coordinate = meta.coordinate.ok_or(StampError::CoordinateMissing)?;
        task.status = advance(task.status, TaskEvent::MetadataRead);

        let location = self.resolver.resolve(coordinate).await?;
        task.status = advance(task.status, TaskEvent::LocationResolved);

        let date = meta.capture_date.as_deref().unwrap_or(DATE_UNKNOWN);
        let stamp_text = format!("{location} {date}");
        let stamped = stamp::render(
            &task.bytes,
            ExifOrientation::from_code(meta.orientation),
            &stamp_text,
        )?;
        task.suggested_filename = Some(suggest_filename(&location, date));
        task.result = Some(stamped);
        task.status = advance(task.status, TaskEvent::Stamped);
        tracing::info!(
            file = %task.filename,
            suggested = ?task.suggested_filename,
            "photo task ready"
        );
        Ok(())
    }
}

/// Drop files whose names were already seen, preserving submission order.
pub fn dedup_by_filename(
    seen: &HashSet<String>,
    files: Vec<(String, Vec<u8>)>,
) -> Vec<(String, Vec<u8>)> {
    let mut seen_now = seen.clone();
    files
        .into_iter()
        .filter(|(name, _)| seen_now.insert(name.clone()))
        .collect()
}

/// Run a batch concurrently, one pipeline run per photo; completions
/// arrive in no particular order. A crashed run is logged and dropped so
/// siblings keep going.
pub async fn run_batch(
    pipeline: Arc<PhotoPipeline>,
    files: Vec<(String, Vec<u8>)>,
) -> Vec<PhotoTask> {
    let mut joins = JoinSet::new();
    for (filename, bytes) in files {
        let pipeline = Arc::clone(&pipeline);
        joins.spawn(async move {
            let mut task = PhotoTask::new(filename, bytes);
            pipeline.run(&mut task).await;
            task
        });
    }

    let mut tasks = Vec::new();
    while let Some(joined) = joins.join_next().await {
        match joined {
            Ok(task) => tasks.push(task),
            Err(e) => tracing::error!(error = %e, "photo task join failed"),
        }
    }
    tasks
}
