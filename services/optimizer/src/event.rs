//! Object-created notifications.
//!
//! Uploads are announced with S3-style bucket notifications (the format S3
//! event bridges and MinIO's Kafka target publish). Object keys arrive
//! URL-encoded with `+` standing for a space.

use crate::error::EventError;
use crate::variant::is_processed_key;
use percent_encoding::percent_decode_str;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Notification {
    #[serde(rename = "Records", default)]
    records: Vec<NotificationRecord>,
}

#[derive(Debug, Deserialize)]
struct NotificationRecord {
    #[serde(rename = "eventName", default)]
    event_name: String,
    s3: S3Entity,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    bucket: S3Bucket,
    object: S3Object,
}

#[derive(Debug, Deserialize)]
struct S3Bucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct S3Object {
    key: String,
    #[serde(default)]
    size: Option<u64>,
}

/// A newly created source object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectCreated {
    pub bucket: String,
    /// Decoded object key
    pub key: String,
    pub size: Option<u64>,
}

impl ObjectCreated {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            size: None,
        }
    }

    /// Variants written by this pipeline; they must never trigger it again
    pub fn is_derived(&self) -> bool {
        is_processed_key(&self.key)
    }
}

/// Decode a notification object key: `+` becomes a space, then
/// percent-escapes are resolved (so `%2B` still yields a literal `+`).
pub fn decode_object_key(raw: &str) -> Result<String, EventError> {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|key| key.into_owned())
        .map_err(|e| EventError::InvalidKey {
            key: raw.to_string(),
            message: e.to_string(),
        })
}

fn is_object_created(event_name: &str) -> bool {
    event_name
        .trim_start_matches("s3:")
        .starts_with("ObjectCreated:")
}

/// Extract every object-created record from a notification payload.
///
/// Other event types (removals, test events) yield no records.
pub fn parse_notification(payload: &[u8]) -> Result<Vec<ObjectCreated>, EventError> {
    let notification: Notification =
        serde_json::from_slice(payload).map_err(|e| EventError::Malformed(e.to_string()))?;

    notification
        .records
        .into_iter()
        .filter(|record| is_object_created(&record.event_name))
        .map(|record| {
            if record.s3.bucket.name.is_empty() {
                return Err(EventError::Malformed("empty bucket name".to_string()));
            }
            Ok(ObjectCreated {
                bucket: record.s3.bucket.name,
                key: decode_object_key(&record.s3.object.key)?,
                size: record.s3.object.size,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_object_key() {
        assert_eq!(decode_object_key("uploads/my+photo.jpg").unwrap(), "uploads/my photo.jpg");
        assert_eq!(decode_object_key("uploads/a%2Bb.png").unwrap(), "uploads/a+b.png");
        assert_eq!(
            decode_object_key("uploads/caf%C3%A9.png").unwrap(),
            "uploads/café.png"
        );
        assert!(decode_object_key("uploads/%FF.png").is_err());
    }

    #[test]
    fn test_parse_aws_notification() {
        let payload = br#"{
            "Records": [{
                "eventVersion": "2.1",
                "eventSource": "aws:s3",
                "eventName": "ObjectCreated:Put",
                "s3": {
                    "bucket": { "name": "pixforge-originals" },
                    "object": { "key": "uploads/summer+trip/beach%281%29.jpg", "size": 48213 }
                }
            }]
        }"#;

        let events = parse_notification(payload).unwrap();
        assert_eq!(
            events,
            vec![ObjectCreated {
                bucket: "pixforge-originals".to_string(),
                key: "uploads/summer trip/beach(1).jpg".to_string(),
                size: Some(48213),
            }]
        );
    }

    #[test]
    fn test_parse_minio_notification_filters_other_events() {
        let payload = br#"{
            "EventName": "s3:ObjectCreated:Put",
            "Key": "originals/a.png",
            "Records": [
                {
                    "eventName": "s3:ObjectCreated:CompleteMultipartUpload",
                    "s3": { "bucket": { "name": "originals" }, "object": { "key": "a.png" } }
                },
                {
                    "eventName": "s3:ObjectRemoved:Delete",
                    "s3": { "bucket": { "name": "originals" }, "object": { "key": "b.png" } }
                }
            ]
        }"#;

        let events = parse_notification(payload).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, "a.png");
        assert_eq!(events[0].size, None);
    }

    #[test]
    fn test_test_event_yields_nothing() {
        let payload = br#"{"Service":"Amazon S3","Event":"s3:TestEvent","Bucket":"originals"}"#;
        assert!(parse_notification(payload).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_payload() {
        assert!(matches!(
            parse_notification(b"not json"),
            Err(EventError::Malformed(_))
        ));
    }

    #[test]
    fn test_derived_keys_detected() {
        assert!(ObjectCreated::new("b", "processed/w640/a.webp").is_derived());
        assert!(!ObjectCreated::new("b", "uploads/a.png").is_derived());
    }
}
