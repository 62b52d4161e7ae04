#![no_main]

use chapterize_core::hash::sanitize_path_component;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };

    let sanitized = sanitize_path_component(raw);

    // The sanitizer exists to make its output safe as a single path
    // component: it must never smuggle a separator through, never exceed
    // the byte budget, and must never split a multi-byte UTF-8 sequence
    // in half while truncating.
    assert!(!sanitized.contains('/'));
    assert!(sanitized.len() <= 255);
    assert!(std::str::from_utf8(sanitized.as_bytes()).is_ok());
});
