use regex::Regex;

pub const DEFAULT_STOP_MARKERS: [&str; 1] = ["</s>"];

const DEFAULT_RULES: [&str; 8] = [
    r"<think>[\s\S]*?</think>",
    r"<\| begin of sentence \|>",
    r"<\| end of sentence \|>",
    r"<\| begin__of__sentence \|>",
    r"<\| end__of__sentence \|>",
    r"</s>",
    r"<\|end_header_id\|>",
    r"[\x00-\x08\x0B\x0C\x0E-\x1F]",
];

// A removal can splice two fragments into a new match; rules run until stable.
const MAX_PASSES: usize = 16;

#[derive(Debug, Clone)]
pub struct CleaningRule {
    pattern: Regex,
    replacement: String,
}

impl CleaningRule {
    pub fn new(pattern: &str, replacement: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            replacement: replacement.into(),
        })
    }

    pub fn removal(pattern: &str) -> Result<Self, regex::Error> {
        Self::new(pattern, "")
    }

    pub fn apply(&self, input: &str) -> String {
        self.pattern
            .replace_all(input, self.replacement.as_str())
            .into_owned()
    }
}

/// Ordered pattern/replacement rules applied to every streamed increment.
#[derive(Debug, Clone)]
pub struct ResponseCleaner {
    rules: Vec<CleaningRule>,
}

impl ResponseCleaner {
    pub fn new(rules: Vec<CleaningRule>) -> Self {
        Self { rules }
    }

    /// Returns the cleaned text, or an empty string when nothing printable is left.
    pub fn clean(&self, input: &str) -> String {
        if input.is_empty() {
            return String::new();
        }
        let mut current = input.to_string();
        for _ in 0..MAX_PASSES {
            let next = self
                .rules
                .iter()
                .fold(current.clone(), |text, rule| rule.apply(&text));
            if next == current {
                break;
            }
            current = next;
        }
        if current.trim().is_empty() {
            return String::new();
        }
        current
    }
}

impl Default for ResponseCleaner {
    fn default() -> Self {
        let rules = DEFAULT_RULES
            .iter()
            .map(|pattern| CleaningRule::removal(pattern).expect("built-in cleaning rule"))
            .collect();
        Self::new(rules)
    }
}

pub fn contains_stop_marker<S: AsRef<str>>(raw: &str, markers: &[S]) -> bool {
    markers
        .iter()
        .map(AsRef::as_ref)
        .any(|marker| !marker.is_empty() && raw.contains(marker))
}

/// Byte length of the longest suffix of `raw` that is a proper prefix of a
/// stop marker, i.e. a marker that may still be completed by the next chunk.
pub fn partial_stop_marker_len<S: AsRef<str>>(raw: &str, markers: &[S]) -> usize {
    markers
        .iter()
        .map(AsRef::as_ref)
        .flat_map(|marker| {
            (1..marker.len())
                .filter(move |&len| marker.is_char_boundary(len))
                .filter(move |&len| raw.ends_with(&marker[..len]))
        })
        .max()
        .unwrap_or(0)
}
