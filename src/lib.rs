//! inreach-cot: Garmin inReach feed to TAK bridge
//!
//! Polls a KML location feed and streams Cursor-on-Target events to a TAK server.
//!
//! ## Architecture
//!
//! - **Acquisition**: authenticated feed fetch and KML placemark extraction
//! - **CoT**: event construction with a shared time window per poll cycle
//! - **Pipeline**: the delivery worker and its outbound queue
//! - **Transport**: TLS/TCP/UDP consumers of the queue and the startup probe

pub mod acquisition;
pub mod config;
pub mod cot;
pub mod pipeline;
pub mod transport;
pub mod types;

pub use config::Settings;
pub use types::{PointRecord, WorkerState};

pub use acquisition::{extract_placemarks, FeedClient, FetchError, ParseError};
pub use cot::{build_events, BuildError, CotEvent, CotMessage, EventTemplate};
pub use pipeline::{
    outbound_queue, CycleError, DeliveryPolicy, DeliveryWorker, FeedSource, OutboundQueue,
    StopReason, WorkerError, WorkerReport,
};
pub use transport::{run_sender, CotTransport, TransportError};
