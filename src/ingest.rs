// Normalization of incoming MQTT payloads into MongoDB documents.
//
// The payload contract is a flat JSON object of integer sensor readings,
// e.g. `{"temperature": 215, "humidity": 448}`. Sensors publish values
// scaled up by ten, so every field is divided by 10 and stored as a double
// under the same key. Each document additionally carries the receive
// timestamp (epoch milliseconds) and a content hash used to keep QoS 1
// redelivery idempotent.
use chrono::{DateTime, Local, NaiveDate};
use mongodb::bson::Document;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Sensors publish integer readings multiplied by this factor.
const READING_SCALE: f64 = 10.0;

/// Format of the date segment in collection names and the query API,
/// e.g. `29_11_25` for 2025-11-29.
const DATE_SEGMENT_FORMAT: &str = "%d_%m_%y";

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("field `{field}` is not an integer reading")]
    NonIntegerField { field: String },
}

/// One unit of work for the store writer: the daily collection to write to
/// and the fully built document.
#[derive(Debug, Clone)]
pub struct IngestRecord {
    pub collection: String,
    pub document: Document,
}

/// Turn one publish into a record for the writer. Fails if the payload does
/// not match the flat-integer-object contract; the caller decides whether
/// to count or log the rejection.
pub fn build_record(
    collection_prefix: &str,
    topic: &str,
    payload: &[u8],
    received: DateTime<Local>,
) -> Result<IngestRecord, PayloadError> {
    let mut document = normalize_payload(payload)?;
    document.insert("timestamp", received.timestamp_millis());
    document.insert("dedup_key", dedup_key(topic, payload, &received));

    Ok(IngestRecord {
        collection: collection_name(collection_prefix, received.date_naive()),
        document,
    })
}

/// Scale every integer field of the payload object into a double. Any
/// non-integer field rejects the whole payload.
fn normalize_payload(payload: &[u8]) -> Result<Document, PayloadError> {
    let value: serde_json::Value = serde_json::from_slice(payload)?;
    let object = value.as_object().ok_or(PayloadError::NotAnObject)?;

    let mut document = Document::new();
    for (field, raw) in object {
        let reading = raw
            .as_i64()
            .ok_or_else(|| PayloadError::NonIntegerField {
                field: field.clone(),
            })?;
        document.insert(field, reading as f64 / READING_SCALE);
    }
    Ok(document)
}

/// Name of the daily collection holding all readings received on `date`.
pub fn collection_name(prefix: &str, date: NaiveDate) -> String {
    collection_name_for_segment(prefix, &date.format(DATE_SEGMENT_FORMAT).to_string())
}

pub fn collection_name_for_segment(prefix: &str, segment: &str) -> String {
    format!("{prefix}sensor_{segment}")
}

/// Check a `dd_mm_yy` date segment before it is spliced into a collection
/// name. Shape-only; the calendar is not consulted.
pub fn is_valid_date_segment(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() == 8
        && bytes.iter().enumerate().all(|(i, b)| match i {
            2 | 5 => *b == b'_',
            _ => b.is_ascii_digit(),
        })
}

/// Idempotency key for at-least-once delivery, hashed over topic, raw
/// payload, and the receive minute. Bucketing by minute collapses QoS 1
/// redelivery (which lands within seconds) onto one key, while a sensor
/// legitimately repeating a value in a later minute still gets stored.
fn dedup_key(topic: &str, payload: &[u8], received: &DateTime<Local>) -> String {
    let minute = received.timestamp() / 60;
    let mut hasher = Sha256::new();
    hasher.update(topic.as_bytes());
    hasher.update([0u8]);
    hasher.update(payload);
    hasher.update(minute.to_be_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const TEST_PAYLOAD: &[u8] = br#"{"temperature": 215, "humidity": 448, "pressure": 10132}"#;

    fn received() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 11, 29, 22, 0, 39).unwrap()
    }

    #[test]
    fn scales_integer_readings_by_ten() {
        let doc = normalize_payload(TEST_PAYLOAD).expect("payload should normalize");
        assert_eq!(doc.get_f64("temperature").unwrap(), 21.5);
        assert_eq!(doc.get_f64("humidity").unwrap(), 44.8);
        assert_eq!(doc.get_f64("pressure").unwrap(), 1013.2);
    }

    #[test]
    fn negative_readings_are_scaled_too() {
        let doc = normalize_payload(br#"{"temperature": -124}"#).unwrap();
        assert_eq!(doc.get_f64("temperature").unwrap(), -12.4);
    }

    #[test]
    fn empty_object_yields_empty_document() {
        let doc = normalize_payload(b"{}").unwrap();
        assert!(doc.is_empty());
    }

    #[test]
    fn rejects_non_object_payloads() {
        assert!(matches!(
            normalize_payload(b"[1, 2, 3]"),
            Err(PayloadError::NotAnObject)
        ));
        assert!(matches!(
            normalize_payload(b"not json"),
            Err(PayloadError::Json(_))
        ));
    }

    #[test]
    fn rejects_non_integer_fields() {
        match normalize_payload(br#"{"temperature": 21.5}"#).unwrap_err() {
            PayloadError::NonIntegerField { field } => assert_eq!(field, "temperature"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            normalize_payload(br#"{"status": "ok"}"#),
            Err(PayloadError::NonIntegerField { .. })
        ));
    }

    #[test]
    fn build_record_targets_daily_collection() {
        let record =
            build_record("lab_", "sensors/greenhouse", TEST_PAYLOAD, received()).unwrap();
        assert_eq!(record.collection, "lab_sensor_29_11_25");
        assert_eq!(
            record.document.get_i64("timestamp").unwrap(),
            received().timestamp_millis()
        );
        // sha-256 hex digest
        assert_eq!(record.document.get_str("dedup_key").unwrap().len(), 64);
    }

    #[test]
    fn dedup_key_is_stable_within_a_minute() {
        let early = Local.with_ymd_and_hms(2025, 11, 29, 22, 0, 1).unwrap();
        let late = Local.with_ymd_and_hms(2025, 11, 29, 22, 0, 58).unwrap();
        let next_minute = Local.with_ymd_and_hms(2025, 11, 29, 22, 1, 2).unwrap();

        assert_eq!(
            dedup_key("sensors/a", b"{}", &early),
            dedup_key("sensors/a", b"{}", &late)
        );
        assert_ne!(
            dedup_key("sensors/a", b"{}", &early),
            dedup_key("sensors/a", b"{}", &next_minute)
        );
        assert_ne!(
            dedup_key("sensors/a", b"{}", &early),
            dedup_key("sensors/b", b"{}", &early)
        );
    }

    #[test]
    fn date_segments_validate_shape() {
        assert!(is_valid_date_segment("29_11_25"));
        assert!(is_valid_date_segment("01_01_99"));
        assert!(!is_valid_date_segment("29-11-25"));
        assert!(!is_valid_date_segment("29_11_2025"));
        assert!(!is_valid_date_segment("a; drop x"));
        assert!(!is_valid_date_segment(""));
    }
}
