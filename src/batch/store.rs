use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::batch::job::{BatchState, RenderResult, RenderStatus};
use crate::foundation::core::{BatchId, TemplateId};
use crate::foundation::error::{ErrorKind, MailResult};

/// Persistence collaborator for batch progress.
///
/// The orchestrator reports creation, every progress change, and every recipient outcome.
/// Failures after creation are logged and do not abort the batch.
pub trait BatchStore: Send + Sync {
    /// Register a new batch and assign its id.
    fn create_batch_job(&self, template_id: &TemplateId, recipient_count: usize)
    -> MailResult<BatchId>;

    /// Persist the current counters and state.
    fn update_batch_progress(
        &self,
        id: BatchId,
        completed: usize,
        failed: usize,
        state: BatchState,
    ) -> MailResult<()>;

    /// Persist one recipient's final outcome.
    fn record_recipient_result(
        &self,
        id: BatchId,
        index: usize,
        result: &RenderResult,
    ) -> MailResult<()>;
}

/// One call observed by [`InMemoryBatchStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// `create_batch_job`.
    Created {
        /// Assigned id.
        id: BatchId,
        /// Template of the batch.
        template_id: TemplateId,
        /// Recipient count.
        recipient_count: usize,
    },
    /// `update_batch_progress`.
    Progress {
        /// Batch.
        id: BatchId,
        /// Successful recipients so far.
        completed: usize,
        /// Failed recipients so far.
        failed: usize,
        /// State at the time of the update.
        state: BatchState,
    },
    /// `record_recipient_result`.
    Recipient {
        /// Batch.
        id: BatchId,
        /// Recipient index.
        index: usize,
        /// Outcome.
        status: RenderStatus,
        /// Failure class, if failed.
        error: Option<ErrorKind>,
    },
}

/// Store that keeps an append-only event log in memory.
#[derive(Debug, Default)]
pub struct InMemoryBatchStore {
    next_id: AtomicU64,
    events: Mutex<Vec<StoreEvent>>,
}

impl InMemoryBatchStore {
    /// Empty store; ids start at 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event so far, in call order.
    pub fn events(&self) -> Vec<StoreEvent> {
        self.lock().clone()
    }

    /// Progress updates of one batch, in call order.
    pub fn progress(&self, id: BatchId) -> Vec<(usize, usize, BatchState)> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                StoreEvent::Progress {
                    id: eid,
                    completed,
                    failed,
                    state,
                } if *eid == id => Some((*completed, *failed, *state)),
                _ => None,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<StoreEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BatchStore for InMemoryBatchStore {
    fn create_batch_job(
        &self,
        template_id: &TemplateId,
        recipient_count: usize,
    ) -> MailResult<BatchId> {
        let id = BatchId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.lock().push(StoreEvent::Created {
            id,
            template_id: template_id.clone(),
            recipient_count,
        });
        Ok(id)
    }

    fn update_batch_progress(
        &self,
        id: BatchId,
        completed: usize,
        failed: usize,
        state: BatchState,
    ) -> MailResult<()> {
        self.lock().push(StoreEvent::Progress {
            id,
            completed,
            failed,
            state,
        });
        Ok(())
    }

    fn record_recipient_result(
        &self,
        id: BatchId,
        index: usize,
        result: &RenderResult,
    ) -> MailResult<()> {
        self.lock().push(StoreEvent::Recipient {
            id,
            index,
            status: result.status,
            error: result.error_kind(),
        });
        Ok(())
    }
}
