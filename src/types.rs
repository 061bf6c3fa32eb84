//! Shared data structures for the feed-to-CoT pipeline
//!
//! - [`PointRecord`]: one placemark extracted from the KML feed
//! - [`WorkerState`]: where the delivery worker currently is in its cycle

/// Placeholder remarks used when a placemark carries no description.
pub const NO_DESCRIPTION: &str = "No description";

// ============================================================================
// Feed Records
// ============================================================================

/// A single point of interest extracted from the feed document.
///
/// `latitude`/`longitude` are the first coordinate pair of the placemark's
/// geometry. `name` is never empty; the extractor skips unnamed placemarks.
#[derive(Debug, Clone, PartialEq)]
pub struct PointRecord {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub description: String,
}

impl PointRecord {
    pub fn new(name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            name: name.into(),
            latitude,
            longitude,
            description: NO_DESCRIPTION.to_string(),
        }
    }

    /// Replace the placeholder with a real description. Blank input keeps the placeholder.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        let description = description.into();
        if !description.trim().is_empty() {
            self.description = description;
        }
        self
    }
}

// ============================================================================
// Worker State
// ============================================================================

/// Delivery worker state machine.
///
/// `Idle → Fetching → Extracting → Building → Draining → Idle`, with
/// `Stopped` reachable from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    #[default]
    Idle,
    Fetching,
    Extracting,
    Building,
    Draining,
    Stopped,
}

impl WorkerState {
    pub fn is_stopped(self) -> bool {
        self == Self::Stopped
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Idle => write!(f, "Idle"),
            WorkerState::Fetching => write!(f, "Fetching"),
            WorkerState::Extracting => write!(f, "Extracting"),
            WorkerState::Building => write!(f, "Building"),
            WorkerState::Draining => write!(f, "Draining"),
            WorkerState::Stopped => write!(f, "Stopped"),
        }
    }
}
