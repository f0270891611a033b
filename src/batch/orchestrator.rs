//! Batch orchestration.
//!
//! A batch runs on its own driver thread. The driver fans work items out to
//! `min(pool max, concurrency)` scoped worker threads that pull the next unstarted recipient index
//! as soon as they finish the previous one, so no surface idles while work remains. Results are
//! recorded at the recipient's original index under the job mutex.
//!
//! Documents are handed to a dedicated writer thread; every write is acknowledged over a
//! per-request channel and bounded by the write timeout.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context as _;

use crate::assemble::document::{AssembledDocument, DocumentMode, assemble_document_with};
use crate::assemble::page::{Page, assemble_page};
use crate::assemble::sink::DocumentSink;
use crate::batch::job::{BatchJob, BatchState, RenderResult};
use crate::batch::store::BatchStore;
use crate::config::{EngineConfig, RetryPolicy};
use crate::format::registry::{FormatRegistry, PrintFormat, builtin_registry};
use crate::foundation::core::{BatchId, SurfaceId, TemplateId, duration_ms};
use crate::foundation::error::{ErrorKind, MailError, MailResult};
use crate::render::pool::{SurfaceHealth, SurfacePool};
use crate::render::renderer::Renderer;
use crate::template::model::{RecipientRecord, Template};
use crate::template::store::TemplateStore;

/// Drives batches over a shared surface pool.
pub struct Orchestrator {
    pool: SurfacePool,
    config: EngineConfig,
    store: Arc<dyn BatchStore>,
    sink: Arc<dyn DocumentSink>,
    formats: FormatRegistry,
}

impl Orchestrator {
    /// Orchestrator using the built-in print formats.
    pub fn new(
        pool: SurfacePool,
        config: EngineConfig,
        store: Arc<dyn BatchStore>,
        sink: Arc<dyn DocumentSink>,
    ) -> Self {
        Self {
            pool,
            config,
            store,
            sink,
            formats: builtin_registry().clone(),
        }
    }

    /// Replace the print format table.
    pub fn with_formats(mut self, formats: FormatRegistry) -> Self {
        self.formats = formats;
        self
    }

    /// The shared pool.
    pub fn pool(&self) -> &SurfacePool {
        &self.pool
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate the request, register the batch, and start it in the background.
    ///
    /// `EmptyBatch`, `UnknownFormat`, and validation errors are returned here, before any work
    /// begins.
    #[tracing::instrument(
        skip_all,
        fields(format = format_name, recipients = recipients.len(), concurrency, mode = %mode)
    )]
    pub fn start_batch(
        &self,
        template: impl Into<Arc<Template>>,
        recipients: Vec<RecipientRecord>,
        format_name: &str,
        mode: DocumentMode,
        concurrency: usize,
    ) -> MailResult<BatchHandle> {
        let template = template.into();
        if recipients.is_empty() {
            return Err(MailError::empty_batch(format!(
                "template '{}' submitted with no recipients",
                template.id
            )));
        }
        let format = self.formats.lookup(format_name)?.clone();
        if concurrency == 0 {
            return Err(MailError::validation("concurrency must be >= 1"));
        }
        template.validate()?;

        let total = recipients.len();
        let id = self.store.create_batch_job(&template.id, total)?;
        let workers = self.pool.max_surfaces().min(concurrency).min(total);
        let shared = Arc::new(BatchShared {
            job: Mutex::new(BatchJob::new(id, template.id.clone(), total)),
            finished: Condvar::new(),
            cancel: AtomicBool::new(false),
            abort: AtomicBool::new(false),
        });

        let run = BatchRun {
            id,
            pool: self.pool.clone(),
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            sink: Arc::clone(&self.sink),
            template,
            recipients,
            format,
            mode,
            workers,
            shared: Arc::clone(&shared),
        };
        let driver = std::thread::Builder::new()
            .name(format!("mailpress-{id}"))
            .spawn(move || run.run())
            .with_context(|| format!("spawn driver thread for {id}"))?;

        tracing::info!(batch_id = %id, workers, "batch started");
        Ok(BatchHandle {
            id,
            shared,
            driver: Arc::new(Mutex::new(Some(driver))),
        })
    }

    /// Like [`Orchestrator::start_batch`], fetching the template from `templates`.
    pub fn start_batch_from_store(
        &self,
        templates: &dyn TemplateStore,
        template_id: &TemplateId,
        recipients: Vec<RecipientRecord>,
        format_name: &str,
        mode: DocumentMode,
        concurrency: usize,
    ) -> MailResult<BatchHandle> {
        let template = templates.get_template(template_id)?;
        self.start_batch(template, recipients, format_name, mode, concurrency)
    }

    /// Current snapshot of the batch.
    pub fn get_status(&self, handle: &BatchHandle) -> BatchJob {
        handle.status()
    }

    /// Stop scheduling new work items for the batch.
    pub fn cancel(&self, handle: &BatchHandle) {
        handle.cancel();
    }

    /// Shut the pool down, waiting up to the configured drain timeout for in-flight leases.
    pub fn shutdown(&self) {
        self.pool
            .shutdown(Duration::from_millis(self.config.pool.drain_timeout_ms));
    }
}

struct BatchShared {
    job: Mutex<BatchJob>,
    finished: Condvar,
    cancel: AtomicBool,
    abort: AtomicBool,
}

impl BatchShared {
    fn lock(&self) -> MutexGuard<'_, BatchJob> {
        self.job.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn should_stop(&self) -> bool {
        self.cancel.load(Ordering::SeqCst) || self.abort.load(Ordering::SeqCst)
    }
}

/// Handle to a running or finished batch. Clones refer to the same batch.
#[derive(Clone)]
pub struct BatchHandle {
    id: BatchId,
    shared: Arc<BatchShared>,
    driver: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl BatchHandle {
    /// Batch id.
    pub fn id(&self) -> BatchId {
        self.id
    }

    /// Snapshot of the job.
    pub fn status(&self) -> BatchJob {
        self.shared.lock().clone()
    }

    /// Whether the batch reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.shared.lock().is_terminal()
    }

    /// Request cancellation. In-flight items finish; unstarted items end up `Cancelled`.
    pub fn cancel(&self) {
        if !self.is_finished() && !self.shared.cancel.swap(true, Ordering::SeqCst) {
            tracing::info!(batch_id = %self.id, "batch cancellation requested");
        }
    }

    /// Block until the batch is terminal and return the final snapshot.
    pub fn wait(&self) -> BatchJob {
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(driver) = driver
            && driver.join().is_err()
        {
            let mut job = self.shared.lock();
            job.fail("batch driver thread panicked");
            self.shared.finished.notify_all();
        }

        let mut job = self.shared.lock();
        while !job.is_terminal() {
            job = self
                .shared
                .finished
                .wait(job)
                .unwrap_or_else(PoisonError::into_inner);
        }
        job.clone()
    }

    /// Like [`BatchHandle::wait`], giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<BatchJob> {
        let deadline = Instant::now() + timeout;
        let mut job = self.shared.lock();
        while !job.is_terminal() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            job = self
                .shared
                .finished
                .wait_timeout(job, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Some(job.clone())
    }
}

impl std::fmt::Debug for BatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchHandle").field("id", &self.id).finish()
    }
}

struct BatchRun {
    id: BatchId,
    pool: SurfacePool,
    config: EngineConfig,
    store: Arc<dyn BatchStore>,
    sink: Arc<dyn DocumentSink>,
    template: Arc<Template>,
    recipients: Vec<RecipientRecord>,
    format: PrintFormat,
    mode: DocumentMode,
    workers: usize,
    shared: Arc<BatchShared>,
}

impl BatchRun {
    fn run(self) {
        let span = tracing::info_span!("batch", batch_id = %self.id, template = %self.template.id);
        let _enter = span.enter();
        let started = Instant::now();

        {
            let mut job = self.shared.lock();
            job.state = BatchState::Running;
            self.publish(&job);
        }

        let writer = match DocumentWriter::spawn(Arc::clone(&self.sink), self.id) {
            Ok(w) => w,
            Err(e) => {
                self.abort(&format!("document writer unavailable: {e}"));
                self.finish();
                return;
            }
        };

        let total = self.recipients.len();
        let next = AtomicUsize::new(0);
        let pages = (self.mode == DocumentMode::Merged)
            .then(|| Mutex::new((0..total).map(|_| None).collect::<Vec<Option<Page>>>()));

        std::thread::scope(|scope| {
            let mut spawned = 0usize;
            for w in 0..self.workers {
                let ctx = WorkerCtx {
                    run: &self,
                    next: &next,
                    writer: &writer,
                    pages: pages.as_ref(),
                };
                match std::thread::Builder::new()
                    .name(format!("mailpress-{}-w{w}", self.id))
                    .spawn_scoped(scope, move || ctx.work())
                {
                    Ok(_) => spawned += 1,
                    Err(e) => tracing::warn!(worker = w, error = %e, "failed to spawn worker"),
                }
            }
            if spawned == 0 {
                self.abort("no worker thread could be spawned");
            }
        });

        if let Some(pages) = pages {
            self.write_merged(&writer, pages);
        }
        self.finish();
        writer.close(self.config.timeouts.write());

        let job = self.shared.lock();
        tracing::info!(
            state = ?job.state,
            completed = job.completed,
            failed = job.failed,
            cancelled = job.cancelled,
            elapsed_ms = duration_ms(started.elapsed()),
            "batch finished"
        );
    }

    fn record(&self, result: RenderResult) {
        let index = result.recipient_index;
        let mut job = self.shared.lock();
        if let Err(e) = self.store.record_recipient_result(self.id, index, &result) {
            tracing::warn!(index, error = %e, "batch store rejected recipient result");
        }
        if job.record(result) {
            self.publish(&job);
        }
    }

    fn publish(&self, job: &BatchJob) {
        if let Err(e) =
            self.store
                .update_batch_progress(self.id, job.completed, job.failed, job.state)
        {
            tracing::warn!(error = %e, "batch store rejected progress update");
        }
    }

    fn abort(&self, reason: &str) {
        self.shared.abort.store(true, Ordering::SeqCst);
        let mut job = self.shared.lock();
        if !job.is_terminal() {
            tracing::error!(reason, "batch failed");
            job.fail(reason);
            self.publish(&job);
        }
        self.shared.finished.notify_all();
    }

    fn finish(&self) {
        let mut job = self.shared.lock();
        if !job.is_terminal() {
            let unstarted: Vec<usize> = job
                .results
                .iter()
                .enumerate()
                .filter(|(_, r)| r.is_none())
                .map(|(i, _)| i)
                .collect();
            // Only a cancel that actually dropped work marks the batch cancelled.
            job.cancelled = !unstarted.is_empty();
            for index in unstarted {
                let result = RenderResult::cancelled(index);
                if let Err(e) = self.store.record_recipient_result(self.id, index, &result) {
                    tracing::warn!(index, error = %e, "batch store rejected recipient result");
                }
                job.record(result);
            }
            job.finish();
            self.publish(&job);
        }
        self.shared.finished.notify_all();
    }

    fn write_merged(&self, writer: &DocumentWriter, pages: Mutex<Vec<Option<Page>>>) {
        if self.shared.lock().is_terminal() {
            return;
        }
        let pages: Vec<Page> = pages
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_iter()
            .flatten()
            .collect();
        if pages.is_empty() {
            tracing::warn!("no successful pages; merged document skipped");
            return;
        }

        let written = assemble_document_with(&pages, DocumentMode::Merged, &self.config.assembly)
            .and_then(|docs| {
                let mut names = Vec::with_capacity(docs.len());
                for doc in docs {
                    let name = doc.name.clone();
                    let indices = doc.recipient_indices.clone();
                    writer.write(doc, self.config.timeouts.write())?;
                    names.push((name, indices));
                }
                Ok(names)
            });

        match written {
            Ok(names) => {
                let mut job = self.shared.lock();
                for (name, indices) in names {
                    for i in indices {
                        if let Some(Some(r)) = job.results.get_mut(i) {
                            r.document = Some(name.clone());
                        }
                    }
                }
            }
            Err(e) => self.abort(&format!("merged document could not be written: {e}")),
        }
    }
}

struct WorkerCtx<'a> {
    run: &'a BatchRun,
    next: &'a AtomicUsize,
    writer: &'a DocumentWriter,
    pages: Option<&'a Mutex<Vec<Option<Page>>>>,
}

impl WorkerCtx<'_> {
    fn work(self) {
        let run = self.run;
        let total = run.recipients.len();
        let items = WorkItemRunner {
            pool: &run.pool,
            config: &run.config,
            template: &run.template,
            format: &run.format,
        };
        loop {
            if run.shared.should_stop() {
                break;
            }
            let index = self.next.fetch_add(1, Ordering::SeqCst);
            if index >= total || run.shared.should_stop() {
                break;
            }

            let (result, page) = items.run(index, &run.recipients[index], |result, page| {
                self.deliver(result, page)
            });
            if result.error_kind() == Some(ErrorKind::SystemicPoolFailure) {
                let reason = result
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_default();
                run.abort(&reason);
                break;
            }
            if let (Some(page), Some(pages)) = (page, self.pages) {
                pages.lock().unwrap_or_else(PoisonError::into_inner)[index] = Some(page);
            }
            run.record(result);
        }
    }

    /// Per-recipient mode writes the page's document now; merged mode keeps the page.
    fn deliver(&self, result: &mut RenderResult, page: Page) -> Option<Page> {
        let run = self.run;
        if run.mode == DocumentMode::Merged {
            return Some(page);
        }
        let written = assemble_document_with(
            std::slice::from_ref(&page),
            DocumentMode::OneFilePerRecipient,
            &run.config.assembly,
        )
        .and_then(|docs| {
            let mut name = None;
            for doc in docs {
                name = Some(doc.name.clone());
                self.writer.write(doc, run.config.timeouts.write())?;
            }
            Ok(name)
        });
        match written {
            Ok(name) => result.document = name,
            Err(e) => result.fail_with(&e),
        }
        None
    }
}

/// Runs one work item (acquire, render, release, assemble, deliver) with the retry policy.
pub(crate) struct WorkItemRunner<'a> {
    pub(crate) pool: &'a SurfacePool,
    pub(crate) config: &'a EngineConfig,
    pub(crate) template: &'a Template,
    pub(crate) format: &'a PrintFormat,
}

impl WorkItemRunner<'_> {
    /// Process recipient `index`, retrying a failure once on a fresh lease.
    ///
    /// `deliver` receives each assembled page; it may fail the result (which triggers the retry)
    /// and returns the page if the caller wants to keep it.
    pub(crate) fn run(
        &self,
        index: usize,
        recipient: &RecipientRecord,
        mut deliver: impl FnMut(&mut RenderResult, Page) -> Option<Page>,
    ) -> (RenderResult, Option<Page>) {
        let started = Instant::now();
        let retry = &self.config.retry;
        let mut avoid = None;
        let mut attempt = 1;
        loop {
            let (mut result, page) = self.attempt(index, recipient, avoid, &mut deliver);
            result.attempts = attempt;
            let kind = result.error_kind();
            let again = kind.is_some()
                && kind != Some(ErrorKind::SystemicPoolFailure)
                && attempt < RetryPolicy::MAX_ATTEMPTS;
            if !again {
                result.timing_ms = duration_ms(started.elapsed());
                return (result, page);
            }

            tracing::debug!(
                index,
                attempt,
                surface = ?result.surface,
                error = ?kind,
                "retrying recipient"
            );
            if retry.prefer_different_surface {
                avoid = result.surface;
            }
            let backoff = retry.backoff();
            if !backoff.is_zero() {
                std::thread::sleep(backoff);
            }
            attempt += 1;
        }
    }

    fn attempt(
        &self,
        index: usize,
        recipient: &RecipientRecord,
        avoid: Option<SurfaceId>,
        deliver: &mut impl FnMut(&mut RenderResult, Page) -> Option<Page>,
    ) -> (RenderResult, Option<Page>) {
        let timeouts = &self.config.timeouts;
        let mut lease = match self.pool.acquire_avoiding(timeouts.acquire(), avoid) {
            Ok(lease) => lease,
            Err(e) => return (RenderResult::failure(index, &e), None),
        };
        let mut result =
            Renderer::render(&mut lease, self.template, index, recipient, timeouts.render());
        let health = if lease.surface().is_healthy() {
            SurfaceHealth::Healthy
        } else {
            SurfaceHealth::Unhealthy
        };
        lease.release(health);

        let Some(image) = result.image.take() else {
            return (result, None);
        };
        match assemble_page(&image, self.format, &self.config.assembly) {
            Ok(page) => {
                let kept = deliver(&mut result, page.for_recipient(index));
                let kept = if result.is_success() { kept } else { None };
                (result, kept)
            }
            Err(e) => {
                result.fail_with(&e);
                (result, None)
            }
        }
    }
}

struct WriteRequest {
    doc: AssembledDocument,
    ack: mpsc::SyncSender<MailResult<()>>,
}

/// Sink front-end running on its own thread so a hung sink cannot stall a worker past the
/// write timeout.
struct DocumentWriter {
    tx: mpsc::Sender<WriteRequest>,
    done: Mutex<mpsc::Receiver<()>>,
}

impl DocumentWriter {
    fn spawn(sink: Arc<dyn DocumentSink>, batch: BatchId) -> MailResult<Self> {
        let (tx, rx) = mpsc::channel::<WriteRequest>();
        let (done_tx, done) = mpsc::sync_channel(1);
        std::thread::Builder::new()
            .name(format!("mailpress-{batch}-writer"))
            .spawn(move || {
                for req in rx {
                    let res = sink.write(&req.doc);
                    let _ = req.ack.send(res);
                }
                let _ = done_tx.send(());
            })
            .with_context(|| format!("spawn writer thread for {batch}"))?;
        Ok(Self {
            tx,
            done: Mutex::new(done),
        })
    }

    fn write(&self, doc: AssembledDocument, timeout: Duration) -> MailResult<()> {
        let name = doc.name.clone();
        let (ack, ack_rx) = mpsc::sync_channel(1);
        self.tx
            .send(WriteRequest { doc, ack })
            .map_err(|_| MailError::engine_fault("document writer is not accepting documents"))?;
        match ack_rx.recv_timeout(timeout) {
            Ok(res) => res,
            Err(RecvTimeoutError::Timeout) => Err(MailError::write_timeout(format!(
                "'{name}' not acknowledged within {} ms",
                timeout.as_millis()
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(MailError::engine_fault("document writer stopped"))
            }
        }
    }

    fn close(self, timeout: Duration) {
        let Self { tx, done } = self;
        drop(tx);
        let done = done.into_inner().unwrap_or_else(PoisonError::into_inner);
        if done.recv_timeout(timeout).is_err() {
            tracing::warn!("document writer still busy at batch end; detaching it");
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/batch/orchestrator.rs"]
mod tests;
