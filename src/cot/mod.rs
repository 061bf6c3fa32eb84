//! Cursor-on-Target output
//!
//! - **CotEvent**: one situational-awareness event and its XML form
//! - **build_events**: batch builder sharing one generation instant per poll cycle

pub mod builder;
pub mod event;

pub use builder::{build_events, BuildError, CotMessage, EventTemplate};
pub use event::CotEvent;
