#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Any JSON document must produce a stable, well-formed key.
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) {
        let key = kiln_keys::generate_key(&value);
        assert!(kiln_keys::is_key(&key));
        assert_eq!(key, kiln_keys::generate_key(&value));
    }
});
