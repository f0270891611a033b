use serde::{Deserialize, Serialize};

/// Convenience result type used across mailpress.
pub type MailResult<T> = Result<T, MailError>;

/// Top-level error taxonomy used by engine APIs.
#[derive(thiserror::Error, Debug)]
pub enum MailError {
    /// No render surface became available before the acquisition deadline.
    #[error("acquisition timeout: {0}")]
    AcquisitionTimeout(String),

    /// The rendering engine crashed, refused a command, or produced malformed output.
    #[error("engine fault: {0}")]
    EngineFault(String),

    /// The surface never signalled render completion before the render deadline.
    #[error("render timeout: {0}")]
    RenderTimeout(String),

    /// The recipient lacks a field the template declares as required.
    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    /// The rendered raster cannot satisfy the print format's resolution floor.
    #[error("image too small: {0}")]
    ImageTooSmall(String),

    /// A batch or document assembly was requested with nothing in it.
    #[error("empty batch: {0}")]
    EmptyBatch(String),

    /// The requested print format is not registered.
    #[error("unknown format: {0}")]
    UnknownFormat(String),

    /// The work item was dropped because its batch was cancelled.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The pool could not create any surface at all.
    #[error("systemic pool failure: {0}")]
    SystemicPoolFailure(String),

    /// A document sink did not acknowledge a write before the write deadline.
    #[error("write timeout: {0}")]
    WriteTimeout(String),

    /// The pool has been shut down and hands out no further leases.
    #[error("pool shut down: {0}")]
    PoolShutdown(String),

    /// Invalid user-provided configuration, template, or recipient data.
    #[error("validation error: {0}")]
    Validation(String),

    /// Errors when serializing or deserializing data structures.
    #[error("serialization error: {0}")]
    Serde(String),

    /// Wrapped lower-level error from dependencies or IO.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MailError {
    /// Build a [`MailError::AcquisitionTimeout`] value.
    pub fn acquisition_timeout(msg: impl Into<String>) -> Self {
        Self::AcquisitionTimeout(msg.into())
    }

    /// Build a [`MailError::EngineFault`] value.
    pub fn engine_fault(msg: impl Into<String>) -> Self {
        Self::EngineFault(msg.into())
    }

    /// Build a [`MailError::RenderTimeout`] value.
    pub fn render_timeout(msg: impl Into<String>) -> Self {
        Self::RenderTimeout(msg.into())
    }

    /// Build a [`MailError::MissingRequiredField`] value.
    pub fn missing_required_field(msg: impl Into<String>) -> Self {
        Self::MissingRequiredField(msg.into())
    }

    /// Build a [`MailError::ImageTooSmall`] value.
    pub fn image_too_small(msg: impl Into<String>) -> Self {
        Self::ImageTooSmall(msg.into())
    }

    /// Build a [`MailError::EmptyBatch`] value.
    pub fn empty_batch(msg: impl Into<String>) -> Self {
        Self::EmptyBatch(msg.into())
    }

    /// Build a [`MailError::UnknownFormat`] value.
    pub fn unknown_format(msg: impl Into<String>) -> Self {
        Self::UnknownFormat(msg.into())
    }

    /// Build a [`MailError::Cancelled`] value.
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Build a [`MailError::SystemicPoolFailure`] value.
    pub fn systemic_pool_failure(msg: impl Into<String>) -> Self {
        Self::SystemicPoolFailure(msg.into())
    }

    /// Build a [`MailError::WriteTimeout`] value.
    pub fn write_timeout(msg: impl Into<String>) -> Self {
        Self::WriteTimeout(msg.into())
    }

    /// Build a [`MailError::PoolShutdown`] value.
    pub fn pool_shutdown(msg: impl Into<String>) -> Self {
        Self::PoolShutdown(msg.into())
    }

    /// Build a [`MailError::Validation`] value.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Build a [`MailError::Serde`] value.
    pub fn serde(msg: impl Into<String>) -> Self {
        Self::Serde(msg.into())
    }

    /// Machine-readable per-recipient classification of this error.
    ///
    /// Errors that never belong to a single recipient's result map to
    /// [`ErrorKind::EngineFault`] so callers always get a stable kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AcquisitionTimeout(_) => ErrorKind::AcquisitionTimeout,
            Self::EngineFault(_) | Self::PoolShutdown(_) | Self::Other(_) => {
                ErrorKind::EngineFault
            }
            Self::RenderTimeout(_) => ErrorKind::RenderTimeout,
            Self::MissingRequiredField(_) => ErrorKind::MissingRequiredField,
            Self::ImageTooSmall(_) => ErrorKind::ImageTooSmall,
            Self::EmptyBatch(_) => ErrorKind::EmptyBatch,
            Self::UnknownFormat(_) => ErrorKind::UnknownFormat,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::SystemicPoolFailure(_) => ErrorKind::SystemicPoolFailure,
            Self::WriteTimeout(_) => ErrorKind::WriteTimeout,
            Self::Validation(_) | Self::Serde(_) => ErrorKind::Validation,
        }
    }

    /// Whether the failure leaves the surface that produced it in an unknown state.
    pub fn poisons_surface(&self) -> bool {
        matches!(
            self,
            Self::EngineFault(_) | Self::RenderTimeout(_) | Self::Other(_)
        )
    }
}

/// Stable, serializable error classification reported per recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No surface became available in time.
    AcquisitionTimeout,
    /// Engine crash, unresponsive engine, or malformed output.
    EngineFault,
    /// No completion signal in time.
    RenderTimeout,
    /// Recipient lacks a template-required field.
    MissingRequiredField,
    /// Rendered output cannot meet the DPI floor.
    ImageTooSmall,
    /// Nothing to render or assemble.
    EmptyBatch,
    /// Unregistered print format.
    UnknownFormat,
    /// Dropped by cancellation before it was scheduled.
    Cancelled,
    /// No surface could ever be created.
    SystemicPoolFailure,
    /// Document write not acknowledged in time.
    WriteTimeout,
    /// Invalid input data.
    Validation,
}

impl ErrorKind {
    /// Classes that usually clear up on their own (capacity or engine latency).
    ///
    /// Data problems such as [`ErrorKind::MissingRequiredField`] return `false`.
    pub fn is_retryable_class(self) -> bool {
        matches!(
            self,
            Self::AcquisitionTimeout
                | Self::RenderTimeout
                | Self::EngineFault
                | Self::WriteTimeout
        )
    }
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/error.rs"]
mod tests;
