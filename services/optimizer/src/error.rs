//! Error types for the optimizer stages.

use crate::dispatcher::DispatchReport;
use crate::variant::OutputFormat;
use thiserror::Error;

/// Errors from decoding, resizing or encoding an image
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Image has invalid dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("Failed to resize image to {width}x{height}: {message}")]
    Resize {
        width: u32,
        height: u32,
        message: String,
    },

    #[error("Failed to encode {format}: {message}")]
    Encode {
        format: OutputFormat,
        message: String,
    },
}

/// Errors from the object store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("Failed to read {bucket}/{key}: {message}")]
    Read {
        bucket: String,
        key: String,
        message: String,
    },

    #[error("Failed to write {bucket}/{key}: {message}")]
    Write {
        bucket: String,
        key: String,
        message: String,
    },

    #[error("Failed to presign {bucket}/{key}: {message}")]
    Presign {
        bucket: String,
        key: String,
        message: String,
    },
}

/// Errors from the task queue
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Failed to serialize task: {0}")]
    Serialize(String),

    #[error("Failed to send task: {0}")]
    Send(String),
}

/// A processing task that cannot be processed as given
#[derive(Debug, Error, PartialEq)]
pub enum TaskError {
    #[error("Task field {0} must not be empty")]
    MissingField(&'static str),

    #[error("Task carries invalid original dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("Target width {0} is not a catalog width")]
    NotCatalogWidth(u32),

    #[error("Target width {target} exceeds original width {original}")]
    Upscale { target: u32, original: u32 },
}

/// Errors parsing object-created notifications
#[derive(Debug, Error)]
pub enum EventError {
    #[error("Malformed notification: {0}")]
    Malformed(String),

    #[error("Object key {key} is not valid UTF-8 after decoding: {message}")]
    InvalidKey { key: String, message: String },
}

/// Errors from the dispatcher
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Failed to fetch source: {0}")]
    Fetch(#[from] StoreError),

    #[error("Failed to read source metadata: {0}")]
    Probe(#[from] WorkerError),

    #[error(
        "Enqueued {} of {} tasks for {}, failed widths: {:?}",
        .0.enqueued.len(),
        .0.sizes.len(),
        .0.source.key,
        .0.failed_widths()
    )]
    PartialFanOut(Box<DispatchReport>),
}

/// Errors from the variant worker and the single-stage processor
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Invalid task: {0}")]
    InvalidTask(#[from] TaskError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Image task failed to complete: {0}")]
    Join(String),
}

impl From<tokio::task::JoinError> for WorkerError {
    fn from(e: tokio::task::JoinError) -> Self {
        WorkerError::Join(e.to_string())
    }
}
