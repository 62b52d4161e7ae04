#![no_main]

use chapterize_types::NormalizedBook;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(json_str) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(book) = serde_json::from_str::<NormalizedBook>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&book) {
            if let Ok(parsed) = serde_json::from_str::<NormalizedBook>(&roundtripped) {
                assert_eq!(book.asin, parsed.asin);
                assert_eq!(book.title, parsed.title);
                assert_eq!(book.authors.len(), parsed.authors.len());
            }
        }
    }
});
