//! Fuzz target: patch validation and deep merge.
//!
//! A validated patch deep-merged into the default configuration must yield
//! a configuration the full validator accepts.

#![no_main]

use libfuzzer_sys::fuzz_target;

use gaovm_store::{deep_merge, VmConfig};

fuzz_target!(|data: &[u8]| {
    let Ok(patch) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    if VmConfig::validate_patch(&patch).is_err() {
        return;
    }
    let base = serde_json::to_value(VmConfig::default()).expect("default serializes");
    let merged = deep_merge(&base, &patch);
    VmConfig::validate(&merged).expect("merge of valid patch must validate");
});
