//! On-read migration of older state files.
//!
//! The raw JSON is upgraded one version at a time before it is deserialized,
//! so [`Snapshot`](super::Snapshot) only ever has to understand the current
//! layout. Files written by a newer stride are refused.

use serde_json::{Map, Value, json};
use tracing::info;

use super::model::STATE_VERSION;

/// One upgrade step from `from` to `from + 1`.
pub struct Migration {
    pub from: u32,
    pub description: &'static str,
    apply: fn(&mut Map<String, Value>),
}

impl Migration {
    pub fn to(&self) -> u32 {
        self.from + 1
    }
}

const MIGRATIONS: &[Migration] = &[Migration {
    from: 1,
    description: "add the history archive record",
    apply: add_history_archive,
}];

/// Version 2 keeps archived history entries out of the state file and
/// remembers their transition ids in `archive`.
fn add_history_archive(root: &mut Map<String, Value>) {
    root.entry("archive")
        .or_insert_with(|| json!({ "entries": 0, "through_seq": 0 }));
}

/// The format version recorded in `value`. Files without one predate
/// versioning and are treated as version 1.
pub fn detect_version(value: &Value) -> u32 {
    value
        .get("version")
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(1)
}

/// Upgrade `value` in place to [`STATE_VERSION`].
///
/// Returns the version the file was written with. `Err(found)` means the
/// file is newer than this build or no upgrade path exists.
pub fn migrate(value: &mut Value) -> Result<u32, u32> {
    let found = detect_version(value);
    if found > STATE_VERSION {
        return Err(found);
    }
    let Some(root) = value.as_object_mut() else {
        // Left for deserialization to report as corrupt.
        return Ok(found);
    };

    let mut version = found;
    while version < STATE_VERSION {
        let Some(step) = MIGRATIONS.iter().find(|m| m.from == version) else {
            return Err(found);
        };
        (step.apply)(root);
        info!(from = step.from, to = step.to(), step = step.description, "migrated state file");
        version = step.to();
    }
    root.insert("version".into(), json!(version));
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_step_is_contiguous() {
        let mut expected = 1;
        for step in MIGRATIONS {
            assert_eq!(step.from, expected, "gap before '{}'", step.description);
            expected = step.to();
        }
        assert_eq!(expected, STATE_VERSION);
    }

    #[test]
    fn test_v1_gains_archive_record() {
        let mut value = json!({"version": 1, "revision": 4, "history": []});
        assert_eq!(migrate(&mut value), Ok(1));
        assert_eq!(value["version"], json!(STATE_VERSION));
        assert_eq!(value["archive"]["entries"], json!(0));
        assert_eq!(value["revision"], json!(4));
    }

    #[test]
    fn test_missing_version_is_treated_as_v1() {
        let value = json!({"revision": 0});
        assert_eq!(detect_version(&value), 1);
    }

    #[test]
    fn test_current_version_is_untouched() {
        let mut value = json!({"version": STATE_VERSION, "archive": {"entries": 7, "through_seq": 9}});
        let before = value.clone();
        assert_eq!(migrate(&mut value), Ok(STATE_VERSION));
        assert_eq!(value, before);
    }

    #[test]
    fn test_newer_version_is_refused() {
        let mut value = json!({"version": STATE_VERSION + 1});
        assert_eq!(migrate(&mut value), Err(STATE_VERSION + 1));
    }
}
