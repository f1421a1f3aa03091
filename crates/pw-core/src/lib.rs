//! Core domain model for pagewatch: fingerprint records, check statuses,
//! watch settings, and cycle lifecycle events.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pw-core";

pub const DEFAULT_INTERVAL_MINUTES: u32 = 10;

/// Maximum length of the note stored in a check status.
pub const NOTE_MAX_CHARS: usize = 120;
/// Maximum length of the preview text handed to the notifier.
pub const PREVIEW_MAX_CHARS: usize = 200;

pub const NO_CONTENT_NOTE: &str = "NO_CONTENT";
pub const TIMEOUT_NOTE: &str = "TIMEOUT";

/// Outcome of the most recent check attempt for one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CheckStatus {
    pub ok: bool,
    pub changed: bool,
    pub note: String,
}

impl CheckStatus {
    pub fn success(changed: bool, note: &str) -> Self {
        Self {
            ok: true,
            changed,
            note: truncate_chars(note, NOTE_MAX_CHARS),
        }
    }

    /// Captured, but the sanitized text was empty. Inconclusive rather than
    /// failed: the stored baseline stays untouched.
    pub fn no_content() -> Self {
        Self {
            ok: false,
            changed: false,
            note: NO_CONTENT_NOTE.to_string(),
        }
    }

    pub fn timeout() -> Self {
        Self {
            ok: false,
            changed: false,
            note: TIMEOUT_NOTE.to_string(),
        }
    }

    pub fn error(detail: &str) -> Self {
        Self {
            ok: false,
            changed: false,
            note: truncate_chars(&format!("ERROR: {detail}"), NOTE_MAX_CHARS),
        }
    }

    pub fn handle_error(detail: &str) -> Self {
        Self {
            ok: false,
            changed: false,
            note: truncate_chars(&format!("HANDLE_ERROR: {detail}"), NOTE_MAX_CHARS),
        }
    }

    /// "We don't know yet", as opposed to "we tried and failed".
    pub fn is_inconclusive(&self) -> bool {
        !self.ok && self.note == NO_CONTENT_NOTE
    }
}

/// Per-identifier snapshot state. `prev_*` fields lag one *change*, not one
/// check: they only rotate in the same write that reports `changed = true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FingerprintRecord {
    pub content_hash: Option<String>,
    pub last_snapshot_text: String,
    pub prev_snapshot_text: String,
    pub last_snapshot_markup: String,
    pub prev_snapshot_markup: String,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_change_at: Option<DateTime<Utc>>,
    pub last_status: Option<CheckStatus>,
}

impl FingerprintRecord {
    /// True when no successful check has established a baseline yet.
    pub fn is_unobserved(&self) -> bool {
        self.content_hash.is_none()
    }
}

/// The whole persisted watch state, replaced atomically on every write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WatchState {
    #[serde(default)]
    pub records: BTreeMap<String, FingerprintRecord>,
    #[serde(default)]
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl WatchState {
    pub fn record(&self, identifier: &str) -> FingerprintRecord {
        self.records.get(identifier).cloned().unwrap_or_default()
    }
}

fn default_interval_minutes() -> u32 {
    DEFAULT_INTERVAL_MINUTES
}

fn default_polling_enabled() -> bool {
    true
}

fn default_page_url_template() -> String {
    "https://status.example.net/incident/{id}".to_string()
}

/// User-facing configuration. Identifiers are opaque keys; the URL template
/// expands `{id}` to the percent-encoded identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchSettings {
    #[serde(default)]
    pub identifiers: Vec<String>,
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u32,
    #[serde(default = "default_polling_enabled")]
    pub polling_enabled: bool,
    #[serde(default = "default_page_url_template")]
    pub page_url_template: String,
    /// End-to-end ceiling for one acquisition, seconds.
    #[serde(default)]
    pub capture_ceiling_secs: Option<u64>,
    /// Internal content-readiness timeout, seconds.
    #[serde(default)]
    pub readiness_timeout_secs: Option<u64>,
    /// Settle time after content first looks meaningful, milliseconds.
    #[serde(default)]
    pub quiet_period_ms: Option<u64>,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            identifiers: Vec::new(),
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
            polling_enabled: true,
            page_url_template: default_page_url_template(),
            capture_ceiling_secs: None,
            readiness_timeout_secs: None,
            quiet_period_ms: None,
        }
    }
}

impl WatchSettings {
    /// Interval coerced to at least one minute.
    pub fn interval_minutes(&self) -> u32 {
        self.interval_minutes.max(1)
    }

    /// The working set for a poll cycle: trimmed, empty entries dropped,
    /// order-preserving dedup.
    pub fn normalized_identifiers(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.identifiers
            .iter()
            .map(|raw| raw.trim())
            .filter(|id| !id.is_empty())
            .filter(|id| seen.insert(id.to_string()))
            .map(ToString::to_string)
            .collect()
    }

    pub fn page_url(&self, identifier: &str) -> String {
        self.page_url_template
            .replace("{id}", urlencoding::encode(identifier).as_ref())
    }
}

/// Lifecycle events emitted by the poll scheduler for observers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CycleEvent {
    Started {
        cycle_id: Uuid,
        identifiers: Vec<String>,
    },
    ItemChecked {
        cycle_id: Uuid,
        identifier: String,
        status: CheckStatus,
    },
    Completed {
        cycle_id: Uuid,
        changed_count: usize,
        cancelled: bool,
        at: DateTime<Utc>,
    },
    Tick {
        name: String,
        at: DateTime<Utc>,
    },
}

/// Result of one completed (or cancelled) poll cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub checked: usize,
    pub changed_count: usize,
    pub cancelled: bool,
}

/// Truncate to at most `max` characters without splitting a code point.
pub fn truncate_chars(input: &str, max: usize) -> String {
    match input.char_indices().nth(max) {
        Some((byte_idx, _)) => input[..byte_idx].to_string(),
        None => input.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_identifiers_trim_dedup_preserve_order() {
        let settings = WatchSettings {
            identifiers: vec![
                " INC-2 ".to_string(),
                "INC-1".to_string(),
                "".to_string(),
                "INC-2".to_string(),
                "  ".to_string(),
                "INC-3".to_string(),
            ],
            ..WatchSettings::default()
        };
        assert_eq!(
            settings.normalized_identifiers(),
            vec!["INC-2", "INC-1", "INC-3"]
        );
    }

    #[test]
    fn interval_is_coerced_to_at_least_one_minute() {
        let settings = WatchSettings {
            interval_minutes: 0,
            ..WatchSettings::default()
        };
        assert_eq!(settings.interval_minutes(), 1);
    }

    #[test]
    fn page_url_percent_encodes_the_identifier() {
        let settings = WatchSettings::default();
        assert_eq!(
            settings.page_url("INC 1/a"),
            "https://status.example.net/incident/INC%201%2Fa"
        );
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 120), "short");
    }

    #[test]
    fn fresh_record_has_no_baseline() {
        let record = FingerprintRecord::default();
        assert!(record.is_unobserved());
        assert!(record.last_check_at.is_none());
    }

    #[test]
    fn status_notes_are_bounded() {
        let long = "x".repeat(500);
        let status = CheckStatus::error(&long);
        assert!(status.note.chars().count() <= NOTE_MAX_CHARS);
        assert!(status.note.starts_with("ERROR: "));
    }

    #[test]
    fn no_content_is_inconclusive_not_failed() {
        let status = CheckStatus::no_content();
        assert!(!status.ok);
        assert!(status.is_inconclusive());
        assert!(!CheckStatus::timeout().is_inconclusive());
    }
}
