//! Work-flow / work-step value types.

use chrono::{DateTime, Utc};
use rand::RngExt;

use crate::storage::{File, StorageObject};

/// Action a [`WorkStep`] performs. `Copy` and `Delete` mutate storage;
/// the `Generate*`/`Scan` variants are scanner side-effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStepAction {
    Copy,
    Delete,
    Scan,
    GenerateMetadata,
    GeneratePreview,
    GenerateThumbnail,
}

/// Status machine for a work step: `Idle -> Working -> {Done, Error,
/// Skipped}`. There is no transition back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStepStatus {
    Idle,
    Working,
    Done,
    Error,
    Skipped,
}

/// One unit of work assigned to a single worker.
#[derive(Debug, Clone)]
pub struct WorkStep {
    pub action: WorkStepAction,
    pub file: File,
    pub target: StorageObject,
    pub priority: u8,
    pub status: WorkStepStatus,
    pub progress: f64,
}

impl WorkStep {
    pub fn new(action: WorkStepAction, file: File, target: StorageObject, priority: u8) -> Self {
        Self {
            action,
            file,
            target,
            priority,
            status: WorkStepStatus::Idle,
            progress: 0.0,
        }
    }
}

/// Origin of a [`WorkFlow`]. The source system recognises exactly one
/// producer today — reconciliation against a locally observed media item —
/// but the enum is left open for future producers (e.g. a manual resync
/// command) rather than collapsed to a bare bool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkFlowSource {
    LocalMediaItem,
}

/// An ordered sequence of work steps produced by a generator. `finished`
/// and `success` are set by the dispatcher once every step has settled —
/// the generator that creates a `WorkFlow` never sets them itself.
#[derive(Debug, Clone)]
pub struct WorkFlow {
    pub id: String,
    pub steps: Vec<WorkStep>,
    pub priority: u8,
    pub source: WorkFlowSource,
    pub created: DateTime<Utc>,
    pub finished: bool,
    pub success: bool,
}

impl WorkFlow {
    /// `id = <file path>_<random>`.
    fn new_id(file_path: &str) -> String {
        let suffix: u64 = rand::rng().random();
        format!("{file_path}_{suffix:x}")
    }

    /// Single-step COPY work-flow, as emitted by `on_add`/`on_change`.
    pub fn copy(file: File, target: StorageObject) -> Self {
        let id = Self::new_id(&file.name);
        let step = WorkStep::new(WorkStepAction::Copy, file, target, 1);
        Self {
            id,
            steps: vec![step],
            priority: 1,
            source: WorkFlowSource::LocalMediaItem,
            created: Utc::now(),
            finished: false,
            success: false,
        }
    }

    /// Single-step DELETE work-flow, one per target storage, as emitted by
    /// `on_delete`.
    pub fn delete(file: File, target: StorageObject) -> Self {
        let id = Self::new_id(&file.name);
        let step = WorkStep::new(WorkStepAction::Delete, file, target, 1);
        Self {
            id,
            steps: vec![step],
            priority: 1,
            source: WorkFlowSource::LocalMediaItem,
            created: Utc::now(),
            finished: false,
            success: false,
        }
    }
}

/// Outcome of executing one [`WorkStep`].
#[derive(Debug, Clone)]
pub struct WorkResult {
    pub status: WorkStepStatus,
    pub messages: Vec<String>,
}

impl WorkResult {
    pub fn done() -> Self {
        Self {
            status: WorkStepStatus::Done,
            messages: Vec::new(),
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: WorkStepStatus::Skipped,
            messages: Vec::new(),
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: WorkStepStatus::Error,
            messages: vec![reason.into()],
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, WorkStepStatus::Done | WorkStepStatus::Skipped)
    }
}
