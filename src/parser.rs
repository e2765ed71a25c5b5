//! Output sanitizer and structured-field extraction
//!
//! Generated text is unreliable: it carries stray control characters, ragged
//! whitespace, leftover turn markers, and sometimes ignores the requested
//! format entirely. Everything here is a pure function of its input, and
//! structure mismatches are absorbed by fallbacks instead of raised as errors.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::constants::markers;

lazy_static! {
    static ref LINE_ENDINGS: Regex = Regex::new(r"\r\n?").unwrap();
    static ref CONTROL_CHARS: Regex = Regex::new(r"[\p{Cc}&&[^\n\t]]").unwrap();
    static ref TRAILING_HSPACE: Regex = Regex::new(r"[^\S\n]+\n").unwrap();
    static ref EXCESS_NEWLINES: Regex = Regex::new(r"\n{3,}").unwrap();
    static ref HSPACE_RUNS: Regex = Regex::new(r"[^\S\n]{2,}").unwrap();
}

/// Normalize raw generated text.
///
/// Idempotent: `sanitize(&sanitize(x)) == sanitize(x)`.
pub fn sanitize(text: &str) -> String {
    let text = LINE_ENDINGS.replace_all(text, "\n");
    let text = CONTROL_CHARS.replace_all(&text, "");
    let text = TRAILING_HSPACE.replace_all(&text, "\n");
    let text = EXCESS_NEWLINES.replace_all(&text, "\n\n");
    let text = HSPACE_RUNS.replace_all(&text, " ");
    text.trim().to_string()
}

/// ASCII case-insensitive search for `needle` in `haystack`, starting at byte `from`
fn find_ignore_case(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let hay = haystack.as_bytes();
    let needle = needle.as_bytes();
    if needle.is_empty() {
        return Some(from.min(hay.len()));
    }
    if from > hay.len() || needle.len() > hay.len() - from {
        return None;
    }
    (from..=hay.len() - needle.len()).find(|&i| hay[i..i + needle.len()].eq_ignore_ascii_case(needle))
}

/// Text between the first `start` marker and the first `end` marker after it.
///
/// Empty when `start` is absent; the remainder of the text when `end` is absent.
pub fn extract_between<'a>(text: &'a str, start: &str, end: &str) -> &'a str {
    let Some(pos) = find_ignore_case(text, start, 0) else {
        return "";
    };
    let body = pos + start.len();
    match find_ignore_case(text, end, body) {
        Some(stop) => &text[body..stop],
        None => &text[body..],
    }
}

/// Everything after the first `marker`, or empty when it is absent
pub fn extract_after<'a>(text: &'a str, marker: &str) -> &'a str {
    match find_ignore_case(text, marker, 0) {
        Some(pos) => &text[pos + marker.len()..],
        None => "",
    }
}

/// Remove every occurrence of the engine-specific `markers`
pub fn strip_markers(text: &str, markers: &[String]) -> String {
    let mut out = text.to_string();
    for marker in markers.iter().filter(|m| !m.is_empty()) {
        if out.contains(marker.as_str()) {
            out = out.replace(marker.as_str(), "");
        }
    }
    out
}

/// Which structure to extract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyKind {
    Riddle,
    Verdict,
}

/// Structured fields of a reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParsedReply {
    Riddle {
        riddle: String,
        answer: String,
    },
    Verdict {
        verdict: String,
        /// `Some` when the verdict opens with a recognizable judgement
        correct: Option<bool>,
    },
}

/// Parsed reply plus the sanitized text it came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedResult {
    pub reply: ParsedReply,
    pub sanitized: String,
}

impl ParsedResult {
    pub fn riddle(&self) -> Option<(&str, &str)> {
        match &self.reply {
            ParsedReply::Riddle { riddle, answer } => Some((riddle, answer)),
            ParsedReply::Verdict { .. } => None,
        }
    }

    pub fn verdict(&self) -> Option<&str> {
        match &self.reply {
            ParsedReply::Verdict { verdict, .. } => Some(verdict),
            ParsedReply::Riddle { .. } => None,
        }
    }
}

/// Riddle extraction with the whole-text fallback.
///
/// When the riddle field comes out blank the full sanitized text becomes the
/// riddle and the answer is left empty, so a blank riddle is never shown.
pub fn parse_riddle(sanitized: &str) -> ParsedReply {
    let riddle = extract_between(sanitized, markers::RIDDLE, markers::ANSWER).trim();
    if riddle.is_empty() {
        tracing::debug!("Reply has no riddle field, using the whole text");
        return ParsedReply::Riddle {
            riddle: sanitized.to_string(),
            answer: String::new(),
        };
    }
    let answer = extract_after(sanitized, markers::ANSWER).trim();
    ParsedReply::Riddle {
        riddle: riddle.to_string(),
        answer: answer.to_string(),
    }
}

/// The verdict is the sanitized text verbatim
pub fn parse_verdict(sanitized: &str) -> ParsedReply {
    ParsedReply::Verdict {
        verdict: sanitized.to_string(),
        correct: classify_verdict(sanitized),
    }
}

/// Read the judgement off the first word of a verdict
pub fn classify_verdict(verdict: &str) -> Option<bool> {
    let first = verdict
        .split(|c: char| !c.is_alphanumeric())
        .find(|w| !w.is_empty())?
        .to_ascii_lowercase();
    match first.as_str() {
        "correct" | "yes" | "right" => Some(true),
        "incorrect" | "wrong" | "no" | "not" => Some(false),
        _ => None,
    }
}

/// Turns completed generation text into a `ParsedResult` for one reply kind
#[derive(Debug, Clone)]
pub struct OutputParser {
    kind: ReplyKind,
    strip: Vec<String>,
}

impl OutputParser {
    /// `strip` lists markers removed before sanitizing
    pub fn new(kind: ReplyKind, strip: Vec<String>) -> Self {
        Self { kind, strip }
    }

    pub fn parse(&self, text: &str) -> ParsedResult {
        let sanitized = sanitize(&strip_markers(text, &self.strip));
        let reply = match self.kind {
            ReplyKind::Riddle => parse_riddle(&sanitized),
            ReplyKind::Verdict => parse_verdict(&sanitized),
        };
        ParsedResult { reply, sanitized }
    }
}
