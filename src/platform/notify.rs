//! Alarm notifications as JSON lines.

use chrono::Utc;
use log::{info, warn};
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use super::NotificationSink;

/// Logs every notification and, when a file is configured, appends it there
/// as one JSON object per line for other processes to tail.
pub struct JsonlNotifier {
    file: Option<PathBuf>,
}

impl JsonlNotifier {
    pub fn new(file: Option<PathBuf>) -> Self {
        JsonlNotifier { file }
    }

    fn emit(&self, topic: &str, payload: &Value, origin: Option<&str>) {
        let line = json!({
            "topic": topic,
            "origin": origin,
            "payload": payload,
            "sent_at": Utc::now().to_rfc3339(),
        });
        info!("Notification {} to {}: {}", topic, origin.unwrap_or("*"), payload);

        let Some(path) = &self.file else { return };
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| writeln!(f, "{}", line));
        if let Err(e) = written {
            warn!("Failed to append notification to {}: {}", path.display(), e);
        }
    }
}

impl NotificationSink for JsonlNotifier {
    fn send_to_origin(&self, topic: &str, payload: &Value, origin: &str) {
        self.emit(topic, payload, Some(origin));
    }

    fn broadcast(&self, topic: &str, payload: &Value) {
        self.emit(topic, payload, None);
    }
}
