//! Turning rendered rasters into print pages and PDF documents.

/// Pages to PDF documents.
pub mod document;
/// Raster to print page.
pub mod page;
/// Document output sinks.
pub mod sink;
