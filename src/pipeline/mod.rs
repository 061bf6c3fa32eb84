//! Delivery Pipeline Module
//!
//! ```text
//! FeedSource ──fetch──▶ extract_placemarks ──▶ build_events ──▶ OutboundQueue ──▶ transport
//!              (DeliveryWorker drives every stage, one event per pacing delay)
//! ```

pub mod queue;
pub mod source;
pub mod worker;

pub use queue::{outbound_queue, OutboundQueue, QueueError};
pub use source::FeedSource;
pub use worker::{
    Clock, CycleError, DeliveryPolicy, DeliveryWorker, StopReason, WorkerError, WorkerReport,
};
