// text helpers for the terminal UI
use unicode_segmentation::UnicodeSegmentation;

pub fn pop_grapheme(s: &mut String) {
    if let Some((idx, _)) = s.grapheme_indices(true).next_back() {
        s.truncate(idx);
    }
}

/// Avatar letter shown when the camera is off.
pub fn initial(name: &str) -> String {
    name.trim()
        .graphemes(true)
        .next()
        .map(|g| g.to_uppercase())
        .unwrap_or_else(|| "?".to_string())
}
