//! mailpress renders personalized direct-mail pieces in batches and packages them as
//! print-ready PDFs.
//!
//! The library is built around an explicitly owned pool of render surfaces:
//!
//! - Describe a design as a [`Template`] and pick a [`PrintFormat`]
//! - Create a [`SurfacePool`] over a [`RenderEngine`] (the built-in [`SvgEngine`], or your own)
//! - Start batches on an [`Orchestrator`] and follow them through a [`BatchHandle`]
//!
//! Environments that cannot keep a pool alive between requests can use
//! [`SingleSurfaceSession`] instead.
#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// Raster to page to PDF.
pub mod assemble;
/// Batch jobs and orchestration.
pub mod batch;
/// Engine configuration.
pub mod config;
/// One-surface-per-invocation mode.
pub mod fallback;
/// Print format registry.
pub mod format;
/// Identifiers and the error taxonomy.
pub mod foundation;
/// Render engines, the surface pool, and the per-recipient renderer.
pub mod render;
/// Templates and recipients.
pub mod template;

pub use crate::foundation::core::{BatchId, Generation, SurfaceId, TemplateId};
pub use crate::foundation::error::{ErrorKind, MailError, MailResult};

pub use crate::assemble::document::{
    AssembledDocument, DocumentMode, assemble_document, assemble_document_with,
};
pub use crate::assemble::page::{Page, assemble_page};
pub use crate::assemble::sink::{DirDocumentSink, DocumentSink, InMemoryDocumentSink};
pub use crate::batch::job::{BatchJob, BatchState, RecipientError, RenderResult, RenderStatus};
pub use crate::batch::orchestrator::{BatchHandle, Orchestrator};
pub use crate::batch::store::{BatchStore, InMemoryBatchStore};
pub use crate::config::{AssemblyPolicy, EngineConfig, PoolConfig, RetryPolicy, TimeoutConfig};
pub use crate::fallback::single::{CreationToken, SingleSurfaceSession};
pub use crate::format::registry::{FormatRegistry, PrintFormat, builtin_registry};
pub use crate::render::engine::{
    FieldValues, RasterImage, RenderEngine, RenderSignal, SignalSender, SurfaceDriver,
};
pub use crate::render::pool::{
    LeaseState, PoolOpts, PoolStats, SurfaceHealth, SurfaceLease, SurfacePool,
};
pub use crate::render::renderer::{Renderer, resolve_fields};
pub use crate::render::svg::{SvgEngine, SvgEngineOpts};
pub use crate::template::color::Color;
pub use crate::template::model::{
    Canvas, FieldDecl, ImageSource, NodeKind, RecipientRecord, SceneNode, Template, TextAlign,
    load_recipients,
};
pub use crate::template::store::{InMemoryTemplateStore, TemplateStore};
