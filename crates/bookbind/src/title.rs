//! Chapter titles derived from source item keys.
//!
//! `00_intro.mp4` becomes `Introduction`; `01_02_error_handling.mp4` becomes
//! `1.2 Error Handling`.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

pub const INTRODUCTION: &str = "Introduction";

static INTRO_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:\d+[_\-\s.]+)*(?:intro|introduction)$").unwrap());

static NUMERIC_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+(?:_\d+)*)(?:_(.*))?$").unwrap());

/// Human-readable title for a source key (usually the lecture's file name).
pub fn derive_title(key: &str) -> String {
    let stem = Path::new(key)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(key)
        .trim();

    if INTRO_MARKER.is_match(stem) {
        return INTRODUCTION.to_string();
    }

    let (section, rest) = match NUMERIC_PREFIX.captures(stem) {
        Some(caps) => {
            let numbers: Vec<String> = caps[1].split('_').map(strip_leading_zeros).collect();
            let rest = caps.get(2).map_or("", |m| m.as_str());
            (Some(numbers.join(".")), rest)
        }
        None => (None, stem),
    };

    let words = title_case(rest);
    match (section, words.is_empty()) {
        (Some(section), true) => section,
        (Some(section), false) => format!("{section} {words}"),
        (None, _) => words,
    }
}

fn strip_leading_zeros(number: &str) -> String {
    let trimmed = number.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

fn title_case(text: &str) -> String {
    text.split(['_', '-', ' '])
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}
