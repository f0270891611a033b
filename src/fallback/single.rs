use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::assemble::document::{AssembledDocument, DocumentMode, assemble_document_with};
use crate::assemble::page::Page;
use crate::batch::job::{BatchJob, BatchState};
use crate::batch::orchestrator::WorkItemRunner;
use crate::config::EngineConfig;
use crate::format::registry::{FormatRegistry, builtin_registry};
use crate::foundation::core::BatchId;
use crate::foundation::error::{ErrorKind, MailError, MailResult};
use crate::render::engine::RenderEngine;
use crate::render::pool::{PoolOpts, SurfaceHealth, SurfacePool};
use crate::template::model::{RecipientRecord, Template};

enum TokenState<T> {
    Idle,
    InFlight,
    Ready(T),
    Failed(String),
}

/// Shared "creation in flight" marker.
///
/// The first caller of [`CreationToken::get_or_create`] runs the creation; callers arriving
/// while it runs block on the token and receive the same outcome. A failed creation is
/// remembered and reported to every later caller as `SystemicPoolFailure`.
pub struct CreationToken<T> {
    state: Mutex<TokenState<T>>,
    settled: Condvar,
}

impl<T: Clone> Default for CreationToken<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> CreationToken<T> {
    /// A token nothing has been created through yet.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TokenState::Idle),
            settled: Condvar::new(),
        }
    }

    /// Return the created value, creating it with `create` if no one has started yet.
    pub fn get_or_create(&self, create: impl FnOnce() -> MailResult<T>) -> MailResult<T> {
        let mut st = self.lock();
        loop {
            match &*st {
                TokenState::Ready(v) => return Ok(v.clone()),
                TokenState::Failed(msg) => {
                    return Err(MailError::systemic_pool_failure(msg.clone()));
                }
                TokenState::InFlight => {
                    st = self
                        .settled
                        .wait(st)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                TokenState::Idle => break,
            }
        }
        *st = TokenState::InFlight;
        drop(st);

        let mut guard = UnwindGuard { token: self, armed: true };
        let outcome = create();
        guard.armed = false;

        let mut st = self.lock();
        let out = match outcome {
            Ok(v) => {
                *st = TokenState::Ready(v.clone());
                Ok(v)
            }
            Err(e) => {
                let msg = e.to_string();
                *st = TokenState::Failed(msg.clone());
                Err(MailError::systemic_pool_failure(msg))
            }
        };
        self.settled.notify_all();
        out
    }

    /// Whether a creation has completed successfully.
    pub fn is_ready(&self) -> bool {
        matches!(&*self.lock(), TokenState::Ready(_))
    }
}

impl<T> CreationToken<T> {
    fn lock(&self) -> MutexGuard<'_, TokenState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Settles the token as failed if the creation closure unwinds.
struct UnwindGuard<'a, T> {
    token: &'a CreationToken<T>,
    armed: bool,
}

impl<T> Drop for UnwindGuard<'_, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::error!("surface creation panicked");
        *self.token.lock() = TokenState::Failed("surface creation panicked".to_owned());
        self.token.settled.notify_all();
    }
}

/// One rendering-engine surface per invocation, for environments where a pool cannot outlive a
/// request.
///
/// The surface is created lazily through a [`CreationToken`] so concurrent entry into the same
/// invocation spawns exactly one engine surface. Recipients are processed sequentially; a
/// faulted surface is never replaced within the session.
pub struct SingleSurfaceSession {
    engine: Arc<dyn RenderEngine>,
    config: EngineConfig,
    formats: FormatRegistry,
    token: CreationToken<SurfacePool>,
    next_batch: AtomicU64,
}

impl SingleSurfaceSession {
    /// Session over `engine`. Nothing is created until the first [`SingleSurfaceSession::surface`]
    /// or [`SingleSurfaceSession::run`] call.
    pub fn new(engine: Arc<dyn RenderEngine>, config: EngineConfig) -> Self {
        Self {
            engine,
            config,
            formats: builtin_registry().clone(),
            token: CreationToken::new(),
            next_batch: AtomicU64::new(1),
        }
    }

    /// Replace the print format table.
    pub fn with_formats(mut self, formats: FormatRegistry) -> Self {
        self.formats = formats;
        self
    }

    /// The session's one-surface pool, creating its surface on first use.
    pub fn surface(&self) -> MailResult<SurfacePool> {
        self.token.get_or_create(|| {
            let opts = PoolOpts {
                max_surfaces: 1,
                replace_dead: false,
            };
            let pool = SurfacePool::new(Arc::clone(&self.engine), opts)?;
            pool.acquire(self.config.timeouts.acquire())?
                .release(SurfaceHealth::Healthy);
            tracing::debug!(engine = pool.engine_name(), "single-surface session ready");
            Ok(pool)
        })
    }

    /// Render every recipient in order on the session's surface and package the pages.
    ///
    /// Returns the terminal job and the assembled documents. Documents cover successful
    /// recipients only. If the surface cannot be created the job is `Failed`.
    #[tracing::instrument(skip_all, fields(template = %template.id, recipients = recipients.len()))]
    pub fn run(
        &self,
        template: &Template,
        recipients: &[RecipientRecord],
        format_name: &str,
        mode: DocumentMode,
    ) -> MailResult<(BatchJob, Vec<AssembledDocument>)> {
        if recipients.is_empty() {
            return Err(MailError::empty_batch(format!(
                "template '{}' submitted with no recipients",
                template.id
            )));
        }
        let format = self.formats.lookup(format_name)?.clone();
        template.validate()?;

        let id = BatchId(self.next_batch.fetch_add(1, Ordering::Relaxed));
        let mut job = BatchJob::new(id, template.id.clone(), recipients.len());

        let pool = match self.surface() {
            Ok(pool) => pool,
            Err(e) => {
                tracing::error!(error = %e, "single-surface session unavailable");
                job.fail(e.to_string());
                return Ok((job, Vec::new()));
            }
        };
        job.state = BatchState::Running;

        let runner = WorkItemRunner {
            pool: &pool,
            config: &self.config,
            template,
            format: &format,
        };
        let mut pages: Vec<Page> = Vec::new();
        for (index, recipient) in recipients.iter().enumerate() {
            let (result, page) = runner.run(index, recipient, |_, page| Some(page));
            if result.error_kind() == Some(ErrorKind::SystemicPoolFailure) {
                job.fail(
                    result
                        .error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "surface unavailable".to_owned()),
                );
                return Ok((job, Vec::new()));
            }
            pages.extend(page);
            job.record(result);
        }

        let docs = if pages.is_empty() {
            Vec::new()
        } else {
            assemble_document_with(&pages, mode, &self.config.assembly)?
        };
        for doc in &docs {
            for &i in &doc.recipient_indices {
                if let Some(Some(r)) = job.results.get_mut(i) {
                    r.document = Some(doc.name.clone());
                }
            }
        }
        job.finish();
        tracing::info!(
            state = ?job.state,
            completed = job.completed,
            failed = job.failed,
            documents = docs.len(),
            "single-surface run finished"
        );
        Ok((job, docs))
    }

    /// Destroy the session's surface, if one was created.
    pub fn close(&self) {
        if self.token.is_ready()
            && let Ok(pool) = self.surface()
        {
            pool.shutdown(Duration::from_millis(self.config.pool.drain_timeout_ms));
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/fallback/single.rs"]
mod tests;
