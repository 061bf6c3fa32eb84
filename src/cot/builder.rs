//! CoT Event Builder
//!
//! Turns one poll cycle's point records into serialized CoT events.
//! The clock is read exactly once per batch: every event in the batch shares
//! the same `time`, `start` and `stale`.

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use super::event::CotEvent;
use crate::types::PointRecord;

/// Event builder errors
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("CoT event type is not configured")]
    MissingEventType,

    #[error("CoT uid prefix is not configured")]
    MissingUidPrefix,

    #[error("Stale window must be at least one second")]
    InvalidStaleWindow,

    #[error("Failed to serialize CoT event '{uid}': {source}")]
    Serialize {
        uid: String,
        #[source]
        source: quick_xml::Error,
    },
}

/// The configuration slice the builder needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    /// CoT type code, e.g. `a-f-G-U-C`.
    pub event_type: String,
    /// Seconds between `time` and `stale`.
    pub stale_secs: u32,
    /// Prepended to the placemark name to form the uid.
    pub uid_prefix: String,
}

impl EventTemplate {
    /// Reject templates that cannot classify or identify an event.
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.event_type.trim().is_empty() {
            return Err(BuildError::MissingEventType);
        }
        if self.uid_prefix.is_empty() {
            return Err(BuildError::MissingUidPrefix);
        }
        if self.stale_secs == 0 {
            return Err(BuildError::InvalidStaleWindow);
        }
        Ok(())
    }

    /// `<prefix>-<name>`, no escaping.
    pub fn uid_for(&self, name: &str) -> String {
        format!("{}-{}", self.uid_prefix, name)
    }
}

/// A serialized event ready for the outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CotMessage {
    pub uid: String,
    pub payload: Vec<u8>,
}

/// Build one serialized event per record, in record order.
///
/// `now` is called once. Records whose name contains characters XML cannot
/// carry are skipped with a warning; control characters in descriptions are dropped.
pub fn build_events<F>(
    records: &[PointRecord],
    template: &EventTemplate,
    now: F,
) -> Result<Vec<CotMessage>, BuildError>
where
    F: Fn() -> DateTime<Utc>,
{
    template.validate()?;

    let time = now().trunc_subsecs(0);
    let stale = time + TimeDelta::seconds(i64::from(template.stale_secs));

    let mut messages = Vec::with_capacity(records.len());
    for record in records {
        if !record.name.chars().all(is_xml_char) {
            warn!(
                placemark = %record.name.escape_debug(),
                "Skipping placemark whose name contains characters XML cannot represent"
            );
            continue;
        }

        let event = CotEvent {
            uid: template.uid_for(&record.name),
            event_type: template.event_type.clone(),
            time,
            start: time,
            stale,
            lat: record.latitude,
            lon: record.longitude,
            callsign: record.name.clone(),
            remarks: record.description.chars().filter(|&c| is_xml_char(c)).collect(),
        };

        let payload = event.to_xml().map_err(|source| BuildError::Serialize {
            uid: event.uid.clone(),
            source,
        })?;
        messages.push(CotMessage {
            uid: event.uid,
            payload,
        });
    }

    debug!(
        count = messages.len(),
        stale_secs = template.stale_secs,
        "Built CoT batch"
    );
    Ok(messages)
}

/// XML 1.0 `Char` production.
fn is_xml_char(c: char) -> bool {
    matches!(c, '\t' | '\n' | '\r')
        || ('\u{20}'..='\u{D7FF}').contains(&c)
        || ('\u{E000}'..='\u{FFFD}').contains(&c)
        || c >= '\u{10000}'
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn template() -> EventTemplate {
        EventTemplate {
            event_type: "a-f-G-U-C".to_string(),
            stale_secs: 300,
            uid_prefix: "Garmin".to_string(),
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + TimeDelta::milliseconds(750)
    }

    fn xml(message: &CotMessage) -> String {
        String::from_utf8(message.payload.clone()).unwrap()
    }

    fn attr(doc: &str, name: &str) -> String {
        let key = format!(" {name}=\"");
        let start = doc.find(&key).unwrap() + key.len();
        let end = doc[start..].find('"').unwrap();
        doc[start..start + end].to_string()
    }

    #[test]
    fn clock_is_read_once_per_batch() {
        let calls = std::cell::Cell::new(0u32);
        let records = vec![
            PointRecord::new("Alpha", 10.0, 20.0),
            PointRecord::new("Beta", -5.5, 44.25),
            PointRecord::new("Gamma", 1.0, 2.0),
        ];

        let messages = build_events(&records, &template(), || {
            calls.set(calls.get() + 1);
            Utc::now() + TimeDelta::seconds(i64::from(calls.get()))
        })
        .unwrap();

        assert_eq!(calls.get(), 1);
        assert_eq!(messages.len(), 3);
        let first = xml(&messages[0]);
        for message in &messages {
            let doc = xml(message);
            for field in ["time", "start", "stale"] {
                assert_eq!(attr(&doc, field), attr(&first, field));
            }
        }
    }

    #[test]
    fn stale_is_exactly_window_after_truncated_now() {
        let messages =
            build_events(&[PointRecord::new("Alpha", 10.0, 20.0)], &template(), fixed_now).unwrap();
        let doc = xml(&messages[0]);
        assert!(doc.contains(r#"time="2024-05-01T12:00:00Z""#));
        assert!(doc.contains(r#"start="2024-05-01T12:00:00Z""#));
        assert!(doc.contains(r#"stale="2024-05-01T12:05:00Z""#));
    }

    #[test]
    fn uid_is_prefix_dash_name_without_escaping() {
        let t = template();
        assert_eq!(t.uid_for("Alpha"), "Garmin-Alpha");
        assert_eq!(t.uid_for("John Smith's #2"), "Garmin-John Smith's #2");

        let messages =
            build_events(&[PointRecord::new("Team 1/B", 0.0, 0.0)], &t, fixed_now).unwrap();
        assert_eq!(messages[0].uid, "Garmin-Team 1/B");
    }

    #[test]
    fn multi_line_names_keep_their_line_breaks() {
        let record = PointRecord::new("Team\nB", 0.0, 0.0).with_description("line1\nline2");
        let messages = build_events(&[record], &template(), fixed_now).unwrap();
        assert_eq!(messages[0].uid, "Garmin-Team\nB");

        let doc = xml(&messages[0]);
        assert!(!doc.contains("Team\nB"));
        assert_eq!(attr(&doc, "uid"), "Garmin-Team&#10;B");
        assert_eq!(attr(&doc, "value"), "line1&#10;line2");
    }

    #[test]
    fn missing_type_is_a_build_error() {
        let mut t = template();
        t.event_type = "  ".to_string();
        assert!(matches!(
            build_events(&[], &t, fixed_now),
            Err(BuildError::MissingEventType)
        ));

        let mut t = template();
        t.stale_secs = 0;
        assert!(matches!(t.validate(), Err(BuildError::InvalidStaleWindow)));
    }

    #[test]
    fn names_with_control_characters_are_skipped() {
        let records = vec![
            PointRecord::new("Bad\u{1}Name", 1.0, 1.0),
            PointRecord::new("Good", 2.0, 2.0).with_description("line\u{7}one"),
        ];
        let messages = build_events(&records, &template(), fixed_now).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].uid, "Garmin-Good");
        assert!(xml(&messages[0]).contains(r#"<remarks value="lineone"/>"#));
    }
}
