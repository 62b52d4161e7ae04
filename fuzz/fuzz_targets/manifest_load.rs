#![no_main]

use std::fs;

use chapterize_state::ManifestStore;
use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    let store = ManifestStore::new(td.path());
    let manifest_path = td.path().join("deadbeefdeadbeef.json");
    if fs::write(manifest_path, data).is_ok() {
        let _ = store.read("deadbeefdeadbeef");
    }
});
