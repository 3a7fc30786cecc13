//! Fuzz target for intake parsing and validation.
//!
//! Arbitrary bytes are parsed as `receive_events` params and as a
//! `refresh_projects` id list. Validation must never panic, and anything
//! it accepts must carry a usable subject id.

#![no_main]

use libfuzzer_sys::fuzz_target;
use replication_dispatcher::RawChange;
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let Ok(params) = serde_json::from_slice::<Value>(data) else {
        return;
    };

    if let Ok(raw) = RawChange::from_event_params(&params) {
        if let Ok(change) = raw.validate() {
            assert!(!change.subject_id().is_empty());
            assert_eq!(change.kind().as_str(), raw.kind);
        }
    }

    if let Some(Value::Array(ids)) = params.get("projects") {
        for id in ids {
            if let Ok(change) = RawChange::repository_update(id.clone()).validate() {
                assert!(!change.subject_id().is_empty());
            }
        }
    }
});
