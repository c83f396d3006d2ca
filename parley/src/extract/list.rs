//! Numbered-list grammar (`1. first 2. second ...`).
//!
//! Item markers are a number followed by a period, at the start of the text
//! or after whitespace, numbered consecutively from 1. Text before the first
//! marker is the preamble. Numbers that break the sequence are plain text.

use std::sync::LazyLock;

use regex::Regex;

static ITEM_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\s)(\d+)\.").expect("item marker pattern is valid")
});

/// A parsed numbered list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct NumberedList {
    pub(crate) preamble: Option<String>,
    pub(crate) items: Vec<String>,
}

/// Parses `text` as an optional preamble followed by a numbered list.
///
/// Meant for finished text. On a growing prefix an item can shrink: a trailing
/// `" 2"` belongs to the last item until the period arrives and turns it into
/// the next marker. Suggestion lists are only parsed once truncated.
pub(crate) fn parse(text: &str) -> NumberedList {
    // (number start, marker end) of each accepted marker.
    let mut markers: Vec<(usize, usize)> = Vec::new();
    let mut expected = 1_usize;
    let mut search_from = 0;
    while search_from <= text.len() {
        let Some(caps) = ITEM_MARKER.captures_at(text, search_from) else {
            break;
        };
        let (Some(number), Some(whole)) = (caps.get(1), caps.get(0)) else {
            break;
        };
        if number.as_str().parse::<usize>().ok() == Some(expected) {
            markers.push((number.start(), whole.end()));
            expected += 1;
        }
        search_from = whole.end();
    }

    let clean = |s: &str| Some(s.trim().to_owned()).filter(|s| !s.is_empty());

    let preamble_end = markers.first().map_or(text.len(), |&(start, _)| start);
    let items = markers
        .iter()
        .enumerate()
        .filter_map(|(i, &(_, body_start))| {
            let body_end = markers.get(i + 1).map_or(text.len(), |&(start, _)| start);
            clean(&text[body_start..body_end])
        })
        .collect();

    NumberedList {
        preamble: clean(&text[..preamble_end]),
        items,
    }
}
