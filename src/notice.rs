//! Purpose: Define a stable, structured schema for non-fatal stderr notices.
//! Exports: `Notice`, `notice_json`, `residency_notice`.
//! Role: Surface loader decisions (reused or shadowed libraries) that are not errors.
//! Invariants: Notices are non-fatal and never alter stdout payloads.
//! Invariants: JSON schema is additive-only once published.
use serde_json::{Map, Value, json};

use crate::core::resolver::{LoadOutcome, LoadedLibrary};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: String,
    pub time: String,
    pub cmd: String,
    pub library: String,
    pub message: String,
    pub details: Map<String, Value>,
}

pub fn notice_json(notice: &Notice) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(notice.kind));
    inner.insert("time".to_string(), json!(notice.time));
    inner.insert("cmd".to_string(), json!(notice.cmd));
    inner.insert("library".to_string(), json!(notice.library));
    inner.insert("message".to_string(), json!(notice.message));
    inner.insert("details".to_string(), Value::Object(notice.details.clone()));

    let mut outer = Map::new();
    outer.insert("notice".to_string(), Value::Object(inner));
    Value::Object(outer)
}

/// Builds a notice for outcomes other than a fresh load; `None` for `Loaded`.
pub fn residency_notice(loaded: &LoadedLibrary, cmd: &str, time: String) -> Option<Notice> {
    let mut details = Map::new();
    details.insert("path".to_string(), json!(loaded.path.display().to_string()));
    let (kind, message) = match &loaded.outcome {
        LoadOutcome::Loaded => return None,
        LoadOutcome::AlreadyResident => (
            "already_resident",
            format!("{} was already resident from the same path", loaded.logical_name),
        ),
        LoadOutcome::Shadowing { resident } => {
            let shown = resident
                .as_ref()
                .map(|path| path.display().to_string());
            details.insert("resident_path".to_string(), json!(shown));
            (
                "shadowing",
                format!(
                    "{} was loaded while another copy was already resident",
                    loaded.logical_name
                ),
            )
        }
    };
    Some(Notice {
        kind: kind.to_string(),
        time,
        cmd: cmd.to_string(),
        library: loaded.logical_name.clone(),
        message,
        details,
    })
}

#[cfg(test)]
mod tests {
    use super::{Notice, notice_json, residency_notice};
    use crate::core::resolver::{LoadOutcome, LoadedLibrary};
    use serde_json::{Map, Value};
    use std::path::PathBuf;

    #[test]
    fn notice_json_has_required_fields() {
        let mut details = Map::new();
        details.insert("path".to_string(), Value::from("/opt/ort/libonnxruntime.so.1"));

        let notice = Notice {
            kind: "already_resident".to_string(),
            time: "2026-02-01T00:00:00Z".to_string(),
            cmd: "load".to_string(),
            library: "libonnxruntime.so.1".to_string(),
            message: "libonnxruntime.so.1 was already resident from the same path".to_string(),
            details,
        };

        let value = notice_json(&notice);
        let obj = value
            .get("notice")
            .and_then(|v| v.as_object())
            .expect("notice object");

        assert_eq!(obj.get("kind").and_then(|v| v.as_str()), Some("already_resident"));
        assert_eq!(
            obj.get("time").and_then(|v| v.as_str()),
            Some("2026-02-01T00:00:00Z")
        );
        assert_eq!(obj.get("cmd").and_then(|v| v.as_str()), Some("load"));
        assert_eq!(
            obj.get("library").and_then(|v| v.as_str()),
            Some("libonnxruntime.so.1")
        );
        assert!(obj.get("details").and_then(|v| v.as_object()).is_some());
    }

    #[test]
    fn fresh_loads_produce_no_notice() {
        let loaded = LoadedLibrary {
            logical_name: "libhost.so".to_string(),
            path: PathBuf::from("/opt/libhost.so"),
            outcome: LoadOutcome::Loaded,
        };
        assert!(residency_notice(&loaded, "load", String::new()).is_none());
    }

    #[test]
    fn shadowing_notice_records_resident_path() {
        let loaded = LoadedLibrary {
            logical_name: "libhost.so".to_string(),
            path: PathBuf::from("/opt/libhost.so"),
            outcome: LoadOutcome::Shadowing {
                resident: Some(PathBuf::from("/usr/lib/libhost.so")),
            },
        };
        let notice = residency_notice(&loaded, "load", String::new()).expect("notice");
        assert_eq!(notice.kind, "shadowing");
        assert_eq!(
            notice.details.get("resident_path").and_then(|v| v.as_str()),
            Some("/usr/lib/libhost.so")
        );
    }
}
