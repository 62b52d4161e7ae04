#![no_main]

use arbitrary::Arbitrary;
use chapterize_core::chapters::apply_duration_gate;
use chapterize_types::{NormalizedChapter, NormalizedChapters};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    probed_duration_ms: u64,
    tolerance_pct: f64,
    runtime_length_ms: u64,
    chapter_titles: Vec<String>,
    chapter_start_ms: Vec<u64>,
    chapter_length_ms: Vec<u64>,
}

fuzz_target!(|input: Input| {
    if !input.tolerance_pct.is_finite() || input.tolerance_pct < 0.0 {
        return;
    }

    let n = input
        .chapter_titles
        .len()
        .min(input.chapter_start_ms.len())
        .min(input.chapter_length_ms.len());
    let chapters = (0..n)
        .map(|i| NormalizedChapter {
            title: input.chapter_titles[i].clone(),
            start_offset_ms: input.chapter_start_ms[i],
            length_ms: input.chapter_length_ms[i],
        })
        .collect();

    let catalog = NormalizedChapters {
        is_accurate: true,
        runtime_length_ms: input.runtime_length_ms,
        brand_intro_duration_ms: None,
        brand_outro_duration_ms: None,
        chapters,
    };

    // Must terminate and never panic for any combination of probed and
    // catalog-reported durations, however far apart.
    let _ = apply_duration_gate(Some(&catalog), input.probed_duration_ms, input.tolerance_pct);
    let _ = apply_duration_gate(None, input.probed_duration_ms, input.tolerance_pct);
});
