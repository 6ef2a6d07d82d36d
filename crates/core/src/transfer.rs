//! In-flight transfer states as reported by the backend's download feed.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// State label the backend uses for a transfer that is moving bytes.
pub const WORKING: &str = "working";

/// One entry of the transfer feed.
///
/// The backend does not always fill `identifier`; `filename` and `uri`
/// usually embed the item id, and some producers put it in fields we do
/// not know about, which land in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferState {
    /// Item id, when the backend supplies one
    #[serde(default, rename = "id", alias = "identifier", deserialize_with = "lenient_text")]
    pub identifier: Option<String>,

    /// Target file name
    #[serde(default, deserialize_with = "lenient_text")]
    pub filename: Option<String>,

    /// Source URI
    #[serde(default, deserialize_with = "lenient_text")]
    pub uri: Option<String>,

    /// Bytes received so far
    #[serde(default, rename = "dlnow", alias = "bytes_so_far", deserialize_with = "lenient_amount")]
    pub bytes_so_far: f64,

    /// Expected size, 0 when unknown
    #[serde(default, rename = "dltotal", alias = "bytes_total", deserialize_with = "lenient_amount")]
    pub bytes_total: f64,

    /// Transfer state label (`working`, `done`, ...)
    #[serde(default, deserialize_with = "lenient_text")]
    pub state: Option<String>,

    /// Bytes per second
    #[serde(default, deserialize_with = "lenient_amount")]
    pub speed: f64,

    /// Every other field the producer sent
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl TransferState {
    /// Whether bytes are currently moving.
    pub fn is_working(&self) -> bool {
        self.state.as_deref() == Some(WORKING)
    }

    /// Every string-valued field, known or not.
    pub fn string_fields(&self) -> impl Iterator<Item = &str> {
        let known = [
            self.identifier.as_deref(),
            self.filename.as_deref(),
            self.uri.as_deref(),
            self.state.as_deref(),
        ];
        known
            .into_iter()
            .flatten()
            .chain(self.extra.values().filter_map(|v| v.as_str()))
    }
}

/// Byte counters and speeds: null, negative or unparsable values read as 0
/// so one bad entry does not sink the whole feed.
fn lenient_amount<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let n = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(n.filter(|n| n.is_finite() && *n > 0.0).unwrap_or(0.0))
}

/// Text fields may arrive as numbers (numeric item ids); anything else
/// that is not a string is treated as absent.
fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_feed_entry() {
        let json = r#"{
            "filename": "mod_abc123.zip",
            "dlnow": 512,
            "dltotal": 2048,
            "state": "working",
            "speed": 100.5,
            "tag": "abc123"
        }"#;
        let state: TransferState = serde_json::from_str(json).unwrap();
        assert!(state.identifier.is_none());
        assert_eq!(state.bytes_so_far, 512.0);
        assert!(state.is_working());
        assert_eq!(state.extra.get("tag").and_then(|v| v.as_str()), Some("abc123"));
    }

    #[test]
    fn test_malformed_numbers_read_as_zero() {
        let json = r#"[
            { "id": 1001, "dlnow": null, "dltotal": "2048", "speed": "fast", "state": "working" },
            { "filename": "b.zip", "dlnow": -5, "dltotal": {}, "state": null }
        ]"#;
        let states: Vec<TransferState> = serde_json::from_str(json).unwrap();
        assert_eq!(states[0].identifier.as_deref(), Some("1001"));
        assert_eq!(states[0].bytes_so_far, 0.0);
        assert_eq!(states[0].bytes_total, 2048.0);
        assert_eq!(states[0].speed, 0.0);
        assert!(states[0].is_working());

        assert_eq!(states[1].bytes_so_far, 0.0);
        assert_eq!(states[1].bytes_total, 0.0);
        assert!(states[1].state.is_none());
    }

    #[test]
    fn test_string_fields_include_extra() {
        let mut state = TransferState {
            filename: Some("f.zip".into()),
            ..Default::default()
        };
        state.extra.insert("label".into(), serde_json::json!("hidden_id"));
        state.extra.insert("count".into(), serde_json::json!(3));
        let fields: Vec<_> = state.string_fields().collect();
        assert_eq!(fields, vec!["f.zip", "hidden_id"]);
    }
}
