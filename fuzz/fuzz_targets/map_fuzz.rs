#![no_main]
use automountd::{AutomountMap, HostInfo};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Decode a map file and resolve a key against it
    if let Ok(map) = serde_json::from_slice::<AutomountMap>(data) {
        let host = HostInfo::new("fuzz.example.org", "x86_64", "Linux", "6.8.0");
        for entry in &map.entries {
            let _ = entry.resolve(&entry.key, &host);
        }
        if let Some(entry) = map.lookup("fuzz") {
            let _ = entry.resolve("fuzz", &host);
        }
        let _ = serde_json::to_string(&map);
    }
});
