use serde::{Deserialize, Serialize};

use crate::foundation::core::{BatchId, Generation, SurfaceId, TemplateId};
use crate::foundation::error::{ErrorKind, MailError};
use crate::render::engine::RasterImage;

/// Lifecycle state of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    /// Accepted, no work item started yet.
    Pending,
    /// Work items are being processed.
    Running,
    /// Every recipient rendered successfully.
    Completed,
    /// Terminal with at least one failed recipient (or cancelled).
    CompletedWithErrors,
    /// Aborted by a systemic failure; partial results are not valid.
    Failed,
}

impl BatchState {
    /// Whether no further transitions can happen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithErrors | Self::Failed
        )
    }
}

/// Outcome class of one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderStatus {
    /// Rendered (and written, where applicable).
    Success,
    /// Failed after all attempts, or never started.
    Failed,
}

/// Classified per-recipient failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientError {
    /// Machine-readable class.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl From<&MailError> for RecipientError {
    fn from(err: &MailError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result of rendering one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderResult {
    /// Position of the recipient in the batch input.
    pub recipient_index: usize,
    /// Success or failure.
    pub status: RenderStatus,
    /// Captured raster. Dropped once the page has been assembled.
    #[serde(skip)]
    pub image: Option<RasterImage>,
    /// Failure detail, present iff `status` is `Failed`.
    pub error: Option<RecipientError>,
    /// Name of the document holding this recipient's page, once written.
    pub document: Option<String>,
    /// Wall time spent on the recipient across all attempts.
    pub timing_ms: u64,
    /// Attempts made (0 for recipients that never started).
    pub attempts: u32,
    /// Surface of the last attempt.
    pub surface: Option<SurfaceId>,
    /// Lease generation of the last attempt.
    pub generation: Option<Generation>,
}

impl RenderResult {
    /// Successful render on `surface` at `generation`.
    pub fn success(
        recipient_index: usize,
        image: RasterImage,
        surface: SurfaceId,
        generation: Generation,
    ) -> Self {
        Self {
            recipient_index,
            status: RenderStatus::Success,
            image: Some(image),
            error: None,
            document: None,
            timing_ms: 0,
            attempts: 1,
            surface: Some(surface),
            generation: Some(generation),
        }
    }

    /// Failed result carrying `err`'s classification.
    pub fn failure(recipient_index: usize, err: &MailError) -> Self {
        Self {
            recipient_index,
            status: RenderStatus::Failed,
            image: None,
            error: Some(RecipientError::from(err)),
            document: None,
            timing_ms: 0,
            attempts: 1,
            surface: None,
            generation: None,
        }
    }

    /// Result for a recipient dropped by cancellation before it started.
    pub fn cancelled(recipient_index: usize) -> Self {
        Self {
            attempts: 0,
            ..Self::failure(
                recipient_index,
                &MailError::cancelled("batch cancelled before this recipient started"),
            )
        }
    }

    /// Tag with the lease the attempt ran on.
    pub fn on_surface(mut self, surface: SurfaceId, generation: Generation) -> Self {
        self.surface = Some(surface);
        self.generation = Some(generation);
        self
    }

    /// Turn a success into a failure, keeping attempt metadata.
    pub fn fail_with(&mut self, err: &MailError) {
        self.status = RenderStatus::Failed;
        self.image = None;
        self.error = Some(RecipientError::from(err));
    }

    /// True for `RenderStatus::Success`.
    pub fn is_success(&self) -> bool {
        self.status == RenderStatus::Success
    }

    /// Error class, if failed.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Snapshot of a batch's progress and results.
///
/// `completed + failed <= total` holds at every observation, with equality once the state is
/// terminal. `Failed` is the exception: its counts are frozen at the point of abort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    /// Store-assigned id.
    pub id: BatchId,
    /// Template rendered by this batch.
    pub template_id: TemplateId,
    /// Number of recipients.
    pub total: usize,
    /// Recipients rendered successfully.
    pub completed: usize,
    /// Recipients that failed, including cancelled ones.
    pub failed: usize,
    /// One slot per recipient, in input order.
    pub results: Vec<Option<RenderResult>>,
    /// Lifecycle state.
    pub state: BatchState,
    /// Set when the batch was cancelled before all items started.
    pub cancelled: bool,
    /// Batch-level failure description for `Failed`.
    pub batch_error: Option<String>,
}

impl BatchJob {
    /// A pending job for `total` recipients.
    pub fn new(id: BatchId, template_id: TemplateId, total: usize) -> Self {
        Self {
            id,
            template_id,
            total,
            completed: 0,
            failed: 0,
            results: vec![None; total],
            state: BatchState::Pending,
            cancelled: false,
            batch_error: None,
        }
    }

    /// Whether the job reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Recipients with a recorded result.
    pub fn processed(&self) -> usize {
        self.completed + self.failed
    }

    /// Store `result` at its index and bump the matching counter.
    ///
    /// A second result for the same index replaces nothing and returns `false`; each index is
    /// counted once. Results arriving after the job went terminal are ignored.
    pub fn record(&mut self, result: RenderResult) -> bool {
        if self.is_terminal() {
            return false;
        }
        let Some(slot) = self.results.get_mut(result.recipient_index) else {
            return false;
        };
        if slot.is_some() {
            return false;
        }
        if result.is_success() {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        *slot = Some(result);
        true
    }

    /// Settle the terminal state from the counters.
    pub fn finish(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.state = if self.failed == 0 && !self.cancelled {
            BatchState::Completed
        } else {
            BatchState::CompletedWithErrors
        };
    }

    /// Abort the batch with `reason`.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.state = BatchState::Failed;
        self.batch_error = Some(reason.into());
    }

    /// Successful results in input order.
    pub fn successes(&self) -> impl Iterator<Item = &RenderResult> {
        self.results.iter().flatten().filter(|r| r.is_success())
    }

    /// Failed results in input order.
    pub fn failures(&self) -> impl Iterator<Item = &RenderResult> {
        self.results.iter().flatten().filter(|r| !r.is_success())
    }
}

#[cfg(test)]
#[path = "../../tests/unit/batch/job.rs"]
mod tests;
