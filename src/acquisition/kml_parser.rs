//! KML Placemark Extractor
//!
//! Flattens a location-feed KML document into [`PointRecord`]s.
//!
//! The feed is a three-level container structure:
//!
//! ```text
//! <kml>
//!   <Document>                 top-level document
//!     <Folder>                 one folder per tracked device
//!       <Placemark>            extracted
//! ```
//!
//! Only placemarks sitting exactly two container levels below the document
//! root are visited. Containers may be `Document` or `Folder`; namespace
//! prefixes are ignored. Output order is document order, which later fixes
//! event send order.
//!
//! Per placemark the first `<coordinates>` tuple is used (`lon,lat[,alt]`),
//! whatever the geometry type. Line and polygon placemarks therefore collapse
//! to their first vertex.

use crate::types::PointRecord;
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;
use tracing::{debug, warn};

/// Feed document errors
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Malformed XML at byte {position}: {source}")]
    Xml {
        position: usize,
        #[source]
        source: quick_xml::Error,
    },

    #[error("Document contains no root element")]
    Empty,

    #[error("Document root is <{0}>, expected <kml>")]
    UnexpectedRoot(String),

    #[error("Document ended before <{0}> was closed")]
    Truncated(String),

    #[error("Placemark '{name}' has invalid coordinates '{value}'")]
    InvalidCoordinates { name: String, value: String },
}

/// Element local names the extractor cares about.
mod kml_tags {
    pub const ROOT: &[u8] = b"kml";
    pub const DOCUMENT: &[u8] = b"Document";
    pub const FOLDER: &[u8] = b"Folder";
    pub const PLACEMARK: &[u8] = b"Placemark";
    pub const NAME: &[u8] = b"name";
    pub const DESCRIPTION: &[u8] = b"description";
    pub const COORDINATES: &[u8] = b"coordinates";
}

/// Path depth (element count, root included) of an extracted placemark.
const PLACEMARK_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Name,
    Description,
    Coordinates,
}

/// Placemark being assembled while its children stream past.
#[derive(Debug, Default)]
struct PlacemarkDraft {
    name: String,
    description: String,
    coordinates: Option<String>,
    coordinates_seen: bool,
}

impl PlacemarkDraft {
    fn append(&mut self, field: Field, text: &str) {
        match field {
            Field::Name => self.name.push_str(text),
            Field::Description => self.description.push_str(text),
            Field::Coordinates => self
                .coordinates
                .get_or_insert_with(String::new)
                .push_str(text),
        }
    }

    /// Turn the draft into a record. Unnamed or geometry-less placemarks yield `None`.
    fn finish(self) -> Result<Option<PointRecord>, ParseError> {
        let name = self.name.trim();
        if name.is_empty() {
            warn!("Skipping placemark without a name");
            return Ok(None);
        }

        let Some(raw) = self.coordinates else {
            warn!(placemark = %name, "Skipping placemark without coordinates");
            return Ok(None);
        };

        let (latitude, longitude) =
            first_vertex(&raw).ok_or_else(|| ParseError::InvalidCoordinates {
                name: name.to_string(),
                value: raw.clone(),
            })?;

        Ok(Some(
            PointRecord::new(name, latitude, longitude).with_description(self.description),
        ))
    }
}

fn is_container(name: &[u8]) -> bool {
    name == kml_tags::DOCUMENT || name == kml_tags::FOLDER
}

/// True when `path` (the open ancestors) is `kml / container / container`.
fn is_placemark_parent(path: &[Vec<u8>]) -> bool {
    path.len() == PLACEMARK_DEPTH - 1
        && path[0] == kml_tags::ROOT
        && is_container(&path[1])
        && is_container(&path[2])
}

/// Parse the first `lon,lat[,alt]` tuple of a KML coordinate string.
///
/// Returns `(latitude, longitude)`.
fn first_vertex(raw: &str) -> Option<(f64, f64)> {
    let tuple = raw.split_whitespace().next()?;
    let mut parts = tuple.split(',');
    let longitude: f64 = parts.next()?.parse().ok()?;
    let latitude: f64 = parts.next()?.parse().ok()?;

    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return None;
    }
    Some((latitude, longitude))
}

/// Extract every placemark two levels below the document root, in document order.
///
/// A document with no placemarks yields an empty vector, not an error.
pub fn extract_placemarks(document: &[u8]) -> Result<Vec<PointRecord>, ParseError> {
    let mut reader = Reader::from_reader(document);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut saw_root = false;
    let mut draft: Option<PlacemarkDraft> = None;
    // Field being captured and the path depth of its element
    let mut capture: Option<(Field, usize)> = None;
    let mut records = Vec::new();

    loop {
        let event = match reader.read_event_into(&mut buf) {
            Ok(event) => event,
            Err(source) => {
                return Err(ParseError::Xml {
                    position: reader.buffer_position(),
                    source,
                })
            }
        };

        match event {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();

                if path.is_empty() {
                    check_root(&name)?;
                    saw_root = true;
                }

                if name == kml_tags::PLACEMARK && is_placemark_parent(&path) {
                    draft = Some(PlacemarkDraft::default());
                } else if let Some(d) = draft.as_mut() {
                    let direct_child = path.len() == PLACEMARK_DEPTH;
                    if direct_child && name == kml_tags::NAME {
                        capture = Some((Field::Name, path.len() + 1));
                    } else if direct_child && name == kml_tags::DESCRIPTION {
                        capture = Some((Field::Description, path.len() + 1));
                    } else if name == kml_tags::COORDINATES && !d.coordinates_seen {
                        d.coordinates_seen = true;
                        capture = Some((Field::Coordinates, path.len() + 1));
                    }
                }

                path.push(name);
            }
            Event::Empty(e) => {
                if path.is_empty() {
                    check_root(e.local_name().as_ref())?;
                    saw_root = true;
                } else if let Some(d) = draft.as_mut() {
                    // `<coordinates/>` still counts as the first geometry
                    if e.local_name().as_ref() == kml_tags::COORDINATES {
                        d.coordinates_seen = true;
                    }
                }
            }
            Event::Text(e) => {
                if let (Some((field, _)), Some(d)) = (capture, draft.as_mut()) {
                    let text = e.unescape().map_err(|source| ParseError::Xml {
                        position: reader.buffer_position(),
                        source,
                    })?;
                    d.append(field, &text);
                }
            }
            Event::CData(e) => {
                if let (Some((field, _)), Some(d)) = (capture, draft.as_mut()) {
                    d.append(field, &String::from_utf8_lossy(&e));
                }
            }
            Event::End(_) => {
                let depth = path.len();
                if matches!(capture, Some((_, d)) if d == depth) {
                    capture = None;
                }
                path.pop();

                if depth == PLACEMARK_DEPTH {
                    if let Some(finished) = draft.take() {
                        if let Some(record) = finished.finish()? {
                            records.push(record);
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }

        buf.clear();
    }

    if let Some(open) = path.last() {
        return Err(ParseError::Truncated(
            String::from_utf8_lossy(open).into_owned(),
        ));
    }
    if !saw_root {
        return Err(ParseError::Empty);
    }

    debug!(count = records.len(), "Extracted placemarks from feed");
    Ok(records)
}

fn check_root(name: &[u8]) -> Result<(), ParseError> {
    if name == kml_tags::ROOT {
        Ok(())
    } else {
        Err(ParseError::UnexpectedRoot(
            String::from_utf8_lossy(name).into_owned(),
        ))
    }
}
