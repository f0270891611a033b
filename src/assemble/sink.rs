use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::Context as _;

use crate::assemble::document::AssembledDocument;
use crate::foundation::error::MailResult;

/// Destination for finished documents.
///
/// Writes may arrive from a writer thread while other batches are running, so implementations
/// take `&self` and must be shareable across threads.
///
/// Delivery is at-least-once. A write that missed its timeout is retried under the same name
/// while the first write may still complete, so a later write of a name must replace the earlier
/// one.
pub trait DocumentSink: Send + Sync {
    /// Persist one document. Returning `Ok` acknowledges the write.
    fn write(&self, doc: &AssembledDocument) -> MailResult<()>;
}

/// In-memory sink for tests and embedding.
#[derive(Debug, Default)]
pub struct InMemoryDocumentSink {
    docs: Mutex<Vec<AssembledDocument>>,
}

impl InMemoryDocumentSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Documents written so far, in order of first write. A rewritten name keeps its place.
    pub fn documents(&self) -> Vec<AssembledDocument> {
        self.docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Names of documents written so far, in order of first write.
    pub fn names(&self) -> Vec<String> {
        self.docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|d| d.name.clone())
            .collect()
    }
}

impl DocumentSink for InMemoryDocumentSink {
    fn write(&self, doc: &AssembledDocument) -> MailResult<()> {
        let mut docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
        match docs.iter_mut().find(|d| d.name == doc.name) {
            Some(existing) => *existing = doc.clone(),
            None => docs.push(doc.clone()),
        }
        Ok(())
    }
}

/// Writes each document as `<dir>/<name>`.
///
/// Files are written under a temporary name and renamed into place, so a reader never sees a
/// partial PDF.
#[derive(Debug, Clone)]
pub struct DirDocumentSink {
    dir: PathBuf,
}

impl DirDocumentSink {
    /// Create the sink, creating `dir` if needed.
    pub fn new(dir: impl Into<PathBuf>) -> MailResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("create output dir '{}'", dir.display()))?;
        Ok(Self { dir })
    }

    /// Output directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl DocumentSink for DirDocumentSink {
    fn write(&self, doc: &AssembledDocument) -> MailResult<()> {
        let path = self.dir.join(&doc.name);
        let tmp = self.dir.join(format!(".{}.partial", doc.name));
        fs::write(&tmp, &doc.bytes).with_context(|| format!("write '{}'", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("rename into '{}'", path.display()))?;
        tracing::debug!(path = %path.display(), bytes = doc.bytes.len(), "document written");
        Ok(())
    }
}

#[cfg(test)]
#[path = "../../tests/unit/assemble/sink.rs"]
mod tests;
