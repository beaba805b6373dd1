//! Payload Source Tagging
//!
//! Forwarded JSON objects are stamped with the side they came from so a
//! message that is bridged again is never tagged twice.

use bytes::{Bytes, BytesMut};
use serde_json::{Map, Value};
use url::Url;

/// Field injected into forwarded JSON objects
pub const SOURCE_TAG_FIELD: &str = "$mesh-source";

/// Source identifier for messages coming from the cloud broker:
/// `cloud-` followed by the host with `.` replaced by `_`
pub fn cloud_source_id(url: &Url) -> Option<String> {
    url.host_str()
        .map(|host| format!("cloud-{}", host.replace('.', "_")))
}

/// Stamp `source` into a JSON object payload.
///
/// The field is inserted right after the opening brace, leaving the rest of
/// the document byte-for-byte intact. Payloads that are not JSON objects,
/// and objects that already carry the field, are returned unchanged.
///
/// Only a top-level `$mesh-source` key counts as a tag. A payload that merely
/// contains the text somewhere, such as in a nested object or a string value,
/// is still tagged.
pub fn tag_payload(payload: &Bytes, source: &str) -> Bytes {
    let Ok(object) = serde_json::from_slice::<Map<String, Value>>(payload) else {
        return payload.clone();
    };
    if object.contains_key(SOURCE_TAG_FIELD) {
        return payload.clone();
    }
    // A parsed object always starts with '{' after optional whitespace
    let Some(brace) = payload.iter().position(|b| *b == b'{') else {
        return payload.clone();
    };

    let value = Value::String(source.to_string()).to_string();
    let separator = if object.is_empty() { "" } else { ", " };
    let field = format!("\"{}\":{}{}", SOURCE_TAG_FIELD, value, separator);

    let mut tagged = BytesMut::with_capacity(payload.len() + field.len());
    tagged.extend_from_slice(&payload[..=brace]);
    tagged.extend_from_slice(field.as_bytes());
    tagged.extend_from_slice(&payload[brace + 1..]);
    tagged.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tag(payload: &str, source: &str) -> String {
        let tagged = tag_payload(&Bytes::copy_from_slice(payload.as_bytes()), source);
        String::from_utf8(tagged.to_vec()).unwrap()
    }

    #[test]
    fn test_tag_inserts_after_opening_brace() {
        assert_eq!(tag(r#"{"a":1}"#, "ABC123"), r#"{"$mesh-source":"ABC123", "a":1}"#);
    }

    #[test]
    fn test_tag_is_idempotent() {
        let once = tag(r#"{"a":1}"#, "ABC123");
        assert_eq!(tag(&once, "ABC123"), once);
        assert_eq!(tag(&once, "cloud-other"), once);
    }

    #[test]
    fn test_tag_empty_object() {
        assert_eq!(tag("{}", "ABC123"), r#"{"$mesh-source":"ABC123"}"#);
        let tagged = tag(" { } ", "x");
        assert!(serde_json::from_str::<Value>(&tagged).is_ok());
    }

    #[test]
    fn test_tag_leaves_non_objects_alone() {
        assert_eq!(tag("[1,2,3]", "x"), "[1,2,3]");
        assert_eq!(tag("\"{\"", "x"), "\"{\"");
        assert_eq!(tag("on", "x"), "on");
        assert_eq!(tag("{broken", "x"), "{broken");
        assert_eq!(tag("", "x"), "");
    }

    #[test]
    fn test_tag_escapes_source() {
        let tagged = tag(r#"{"a":1}"#, "we\"ird");
        let value: Value = serde_json::from_str(&tagged).unwrap();
        assert_eq!(value[SOURCE_TAG_FIELD], "we\"ird");
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_nested_source_field_does_not_count() {
        let tagged = tag(r#"{"inner":{"$mesh-source":"x"}}"#, "ABC");
        assert_eq!(tagged, r#"{"$mesh-source":"ABC", "inner":{"$mesh-source":"x"}}"#);
    }

    #[test]
    fn test_cloud_source_id() {
        let url = Url::parse("mqtts://stream.example.com:8883").unwrap();
        assert_eq!(cloud_source_id(&url).as_deref(), Some("cloud-stream_example_com"));
        let url = Url::parse("cloud://x").unwrap();
        assert_eq!(cloud_source_id(&url).as_deref(), Some("cloud-x"));
        let url = Url::parse("mailto:someone").unwrap();
        assert_eq!(cloud_source_id(&url), None);
    }
}
