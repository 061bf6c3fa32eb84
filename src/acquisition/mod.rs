//! Feed acquisition module
//!
//! Fetches the location feed over HTTP and flattens its KML into point records.

pub mod feed_client;
pub mod kml_parser;

pub use feed_client::{FeedClient, FetchError};
pub use kml_parser::{extract_placemarks, ParseError};
