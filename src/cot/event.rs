//! Cursor-on-Target event document
//!
//! ```xml
//! <event version="2.0" uid="Garmin-Alpha" time="..." start="..." stale="..." type="a-f-G-U-C" how="m-g">
//!   <point lat="10.0" lon="20.0" ce="9999999.0" le="9999999.0" hae="0"/>
//!   <detail>
//!     <contact callsign="Alpha"/>
//!     <remarks value="No description"/>
//!   </detail>
//! </event>
//! ```

use chrono::{DateTime, Utc};
use quick_xml::escape::escape;
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::Writer;

/// CoT schema version.
pub const COT_VERSION: &str = "2.0";

/// `how` code for machine-generated positions.
pub const HOW_MACHINE_GENERATED: &str = "m-g";

/// Circular/linear error sentinel meaning "unknown".
pub const UNKNOWN_ERROR: &str = "9999999.0";

/// Height above ellipsoid; the feed carries no usable altitude.
pub const DEFAULT_HAE: &str = "0";

/// CoT timestamp layout, UTC with second precision.
pub const COT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// One situational-awareness event, immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct CotEvent {
    pub uid: String,
    pub event_type: String,
    pub time: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub stale: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub callsign: String,
    pub remarks: String,
}

impl CotEvent {
    /// Serialize to a self-contained, indented XML document.
    pub fn to_xml(&self) -> Result<Vec<u8>, quick_xml::Error> {
        let time = format_time(&self.time);
        let start = format_time(&self.start);
        let stale = format_time(&self.stale);
        let lat = format_coordinate(self.lat);
        let lon = format_coordinate(self.lon);

        let uid = attribute_value(&self.uid);
        let event_type = attribute_value(&self.event_type);
        let callsign = attribute_value(&self.callsign);
        let remarks_value = attribute_value(&self.remarks);

        let mut event = BytesStart::new("event");
        event.push_attribute(("version", COT_VERSION));
        event.push_attribute((b"uid".as_slice(), uid.as_bytes()));
        event.push_attribute(("time", time.as_str()));
        event.push_attribute(("start", start.as_str()));
        event.push_attribute(("stale", stale.as_str()));
        event.push_attribute((b"type".as_slice(), event_type.as_bytes()));
        event.push_attribute(("how", HOW_MACHINE_GENERATED));

        let mut point = BytesStart::new("point");
        point.push_attribute(("lat", lat.as_str()));
        point.push_attribute(("lon", lon.as_str()));
        point.push_attribute(("ce", UNKNOWN_ERROR));
        point.push_attribute(("le", UNKNOWN_ERROR));
        point.push_attribute(("hae", DEFAULT_HAE));

        let mut contact = BytesStart::new("contact");
        contact.push_attribute((b"callsign".as_slice(), callsign.as_bytes()));

        let mut remarks = BytesStart::new("remarks");
        remarks.push_attribute((b"value".as_slice(), remarks_value.as_bytes()));

        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Start(event))?;
        writer.write_event(Event::Empty(point))?;
        writer.write_event(Event::Start(BytesStart::new("detail")))?;
        writer.write_event(Event::Empty(contact))?;
        writer.write_event(Event::Empty(remarks))?;
        writer.write_event(Event::End(BytesEnd::new("detail")))?;
        writer.write_event(Event::End(BytesEnd::new("event")))?;

        let mut xml = writer.into_inner();
        xml.push(b'\n');
        Ok(xml)
    }
}

/// Escape an attribute value so it parses back unchanged.
///
/// Markup characters go through quick-xml. Tab, LF and CR become character
/// references because parsers normalize literal whitespace in attributes to spaces.
fn attribute_value(raw: &str) -> String {
    let escaped = escape(raw);
    if !escaped.contains(['\t', '\n', '\r']) {
        return escaped.into_owned();
    }
    let mut out = String::with_capacity(escaped.len() + 8);
    for c in escaped.chars() {
        match c {
            '\t' => out.push_str("&#9;"),
            '\n' => out.push_str("&#10;"),
            '\r' => out.push_str("&#13;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn format_time(ts: &DateTime<Utc>) -> String {
    ts.format(COT_TIME_FORMAT).to_string()
}

/// Plain decimal with at least one fractional digit (`10.0`, `-5.5`, `44.25`).
pub fn format_coordinate(value: f64) -> String {
    let s = value.to_string();
    if s.contains('.') || !value.is_finite() {
        s
    } else {
        format!("{s}.0")
    }
}
