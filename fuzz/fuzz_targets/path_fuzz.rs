#![no_main]
use automountd::modules::namespace::{is_valid_name, join_path, path_components};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(path) = std::str::from_utf8(data) {
        if let Ok(components) = path_components(path) {
            let mut joined = String::from("/");
            for name in components {
                assert!(name != ".." && !name.is_empty());
                joined = join_path(&joined, name);
            }
            assert!(path_components(&joined).is_ok());
        }
        let _ = is_valid_name(path);
    }
});
