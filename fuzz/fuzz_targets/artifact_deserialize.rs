#![no_main]

use libfuzzer_sys::fuzz_target;
use kiln::artifact::Artifact;

fuzz_target!(|data: &[u8]| {
    // Corrupt artifact refs must never panic the loader.
    if let Ok(artifact) = serde_json::from_slice::<Artifact>(data) {
        let _ = artifact.tainted();
        let encoded = serde_json::to_vec(&artifact).expect("reencode");
        let _ = serde_json::from_slice::<Artifact>(&encoded).expect("reparse");
    }
});
