//! Fuzz target: configuration validation totality.
//!
//! The validator must accept or reject every JSON value without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;

use gaovm_store::VmConfig;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    // Accepted values must re-serialize and re-validate to the same config.
    if let Ok(config) = VmConfig::validate(&value) {
        let round = serde_json::to_value(&config).expect("typed config serializes");
        let again = VmConfig::validate(&round).expect("accepted config revalidates");
        assert_eq!(config, again);
    }
});
