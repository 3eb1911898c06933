#![no_main]

use libfuzzer_sys::fuzz_target;
use kiln_types::RemoteSpec;

fuzz_target!(|data: &str| {
    // Parsing must never panic; accepted specs must round-trip their url.
    if let Ok(spec) = data.parse::<RemoteSpec>() {
        assert!(!spec.url.is_empty());
        let _ = spec.host_port();
    }
});
