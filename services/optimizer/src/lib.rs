//! Pixforge Optimizer Service
//!
//! Turns every uploaded original into a fixed set of resized WebP/AVIF
//! variants for cached delivery. Variants are written to a deterministic
//! layout, `processed/w<width>/<basename>.<format>`, which the delivery
//! layer routes requests by.
//!
//! ## Features
//!
//! - **Two-stage fan-out**: the dispatcher reads each new source once and
//!   enqueues one self-describing task per applicable width; independent
//!   workers render and store one width each
//! - **Single-stage processing**: an alternative topology producing every
//!   variant of a source in one invocation, in memory-bounded chunks
//! - **Idempotent writes**: the same task always writes the same bytes to the
//!   same key, so at-least-once redelivery is safe
//! - **Bounded retries**: failed messages are redelivered a limited number of
//!   times, then moved to a dead letter topic for inspection
//! - **Variant manifest API**: reports which variants of a source exist
//!
//! ## Architecture
//!
//! ```text
//! Object Store               Kafka Topics               Object Store
//! ┌──────────────┐          ┌──────────────┐           ┌──────────────┐
//! │ originals    │─────────▶│ uploads      │           │ processed/   │
//! └──────────────┘ created  └──────────────┘           │   w<width>/  │
//!        ▲                         │                   └──────────────┘
//!        │                         ▼                          ▲
//!        │                  ┌──────────────┐                  │
//!        ├──────────────────│ Dispatcher   │                  │
//!        │    fetch once    └──────────────┘                  │
//!        │                         │ one task per width       │
//!        │                         ▼                          │
//!        │                  ┌──────────────┐                  │
//!        │                  │ tasks        │                  │
//!        │                  └──────────────┘                  │
//!        │                         │                          │
//!        │                         ▼                          │
//!        │                  ┌──────────────┐                  │
//!        └──────────────────│ Variant      │──────────────────┘
//!          fetch per task   │ Worker(s)    │  WebP (+ AVIF)
//!                           └──────────────┘
//!                                  │ exhausted retries
//!                                  ▼
//!                           ┌──────────────┐
//!                           │ dead letters │
//!                           └──────────────┘
//! ```

pub mod api;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod handlers;
pub mod processor;
pub mod queue;
pub mod render;
pub mod s3_store;
pub mod store;
pub mod task;
pub mod variant;
pub mod worker;

pub use api::AppState;
pub use catalog::{QualitySettings, QualityTier, VariantCatalog};
pub use codec::{ImageCodec, ImageRsCodec};
pub use config::{Config, ServiceMode};
pub use dispatcher::{DispatchReport, Dispatcher, EnqueueFailure};
pub use error::{CodecError, DispatchError, EventError, QueueError, StoreError, TaskError, WorkerError};
pub use event::{parse_notification, ObjectCreated};
pub use handlers::{DispatchHandler, ProcessorHandler, WorkerHandler};
pub use processor::{ProcessReport, SingleStageProcessor, StoredVariant};
pub use queue::{KafkaTaskQueue, TaskQueue};
pub use render::{VariantRenderer, VariantWriter};
pub use s3_store::S3ObjectStore;
pub use store::{ObjectStore, PutObject};
pub use task::ProcessingTask;
pub use variant::{variant_key, Dimensions, OutputFormat, SourceImage, VariantObject, VariantSpec};
pub use worker::VariantWorker;
