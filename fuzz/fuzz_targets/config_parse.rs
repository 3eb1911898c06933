#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Arbitrary TOML must either parse into a config or error cleanly.
    let _ = toml::from_str::<kiln::config::UserConfig>(data);
});
