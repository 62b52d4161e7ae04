#![no_main]

use std::path::PathBuf;

use chapterize_core::hash::sort_version_aware;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|names: Vec<String>| {
    let mut files: Vec<PathBuf> = names.into_iter().map(PathBuf::from).collect();
    let original_len = files.len();

    // Sorting must never drop or duplicate entries, and must be a total
    // order (sorting twice gives the same result as sorting once).
    sort_version_aware(&mut files);
    assert_eq!(files.len(), original_len);

    let mut twice = files.clone();
    sort_version_aware(&mut twice);
    assert_eq!(files, twice);
});
