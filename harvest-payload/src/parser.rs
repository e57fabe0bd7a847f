//! Payload output parser
//!
//! stdout carries one JSON product per line; any other non-blank stdout line
//! is skipped with a warning and reported as malformed. stderr carries free-form diagnostics, some of which embed a
//! progress marker or report a failure:
//!
//! ```text
//! phase-marker  = "phase" WS+ INT WS* ":" WS* fraction   ; anywhere in the line, any case
//! progress-line = "PROGRESS:" <text containing a fraction>
//! fraction      = INT WS* "/" WS* INT
//! ```
//!
//! A stderr line containing `error`, `exception`, `traceback` or `failed`
//! (any case) is also an error signal.

use harvest_core::domain::record::{
    BatchProgress, ErrorSignal, OutputEvent, ProgressSignal, ResultRecord,
};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

const ERROR_KEYWORDS: [&str; 4] = ["error", "exception", "traceback", "failed"];

/// Longest stdout excerpt kept in a malformed-line warning
const EXCERPT_CHARS: usize = 100;

/// A stdout line that was skipped
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MalformedOutput {
    #[error("line {line}: not JSON")]
    NotJson { line: usize },

    #[error("line {line}: not a JSON object ({reason})")]
    InvalidJson { line: usize, reason: String },

    #[error("line {line}: missing or blank 'name'")]
    MissingName { line: usize },

    #[error("line {line}: missing or non-numeric 'price'")]
    InvalidPrice { line: usize },
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, alias = "competitor_price")]
    price: Option<Value>,
    #[serde(default, alias = "currency_code")]
    currency: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default, alias = "image")]
    image_url: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    sku: Option<String>,
    #[serde(default)]
    brand: Option<String>,
    #[serde(default, alias = "barcode", deserialize_with = "lenient_string")]
    ean: Option<String>,
    #[serde(default)]
    raw_data: Option<Value>,
}

/// Accepts identifiers printed either as strings or as bare numbers
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn parse_price(value: &Value) -> Option<f64> {
    let price = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    price.is_finite().then_some(price)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Parses one stdout line into a result record
///
/// # Arguments
/// * `line` - The trimmed stdout line
/// * `line_no` - 1-based line number used in the error
pub fn parse_record_line(line: &str, line_no: usize) -> Result<ResultRecord, MalformedOutput> {
    let raw: RawRecord =
        serde_json::from_str(line).map_err(|e| MalformedOutput::InvalidJson {
            line: line_no,
            reason: e.to_string(),
        })?;

    let name = non_blank(raw.name).ok_or(MalformedOutput::MissingName { line: line_no })?;
    let price = raw
        .price
        .as_ref()
        .and_then(parse_price)
        .ok_or(MalformedOutput::InvalidPrice { line: line_no })?;

    Ok(ResultRecord {
        name: name.trim().to_string(),
        price,
        currency: non_blank(raw.currency),
        url: non_blank(raw.url),
        image_url: non_blank(raw.image_url),
        sku: non_blank(raw.sku),
        brand: non_blank(raw.brand),
        ean: non_blank(raw.ean),
        raw_data: raw.raw_data,
    })
}

/// Checks whether a diagnostic line reports a failure
pub fn is_error_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    ERROR_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Extracts a batch progress marker from a diagnostic line
pub fn parse_progress(line: &str) -> Option<BatchProgress> {
    parse_phase_marker(line).or_else(|| parse_progress_line(line))
}

fn parse_phase_marker(line: &str) -> Option<BatchProgress> {
    // ASCII lowercasing keeps byte offsets valid for `line`
    let lower = line.to_ascii_lowercase();
    let mut from = 0;

    while let Some(offset) = lower[from..].find("phase") {
        let after = from + offset + "phase".len();
        let mut cursor = Cursor::new(&line[after..]);

        if cursor.skip_whitespace() > 0 {
            if let Some(phase) = cursor.integer() {
                cursor.skip_whitespace();
                if cursor.eat(':') {
                    cursor.skip_whitespace();
                    if let Some((current, total)) = cursor.fraction() {
                        return Some(BatchProgress {
                            phase: Some(phase),
                            current,
                            total,
                        });
                    }
                }
            }
        }

        from = after;
    }

    None
}

fn parse_progress_line(line: &str) -> Option<BatchProgress> {
    let body = line.trim_start().strip_prefix("PROGRESS:")?;
    let mut previous_digit = false;

    for (idx, ch) in body.char_indices() {
        let digit = ch.is_ascii_digit();
        if digit && !previous_digit {
            if let Some((current, total)) = Cursor::new(&body[idx..]).fraction() {
                return Some(BatchProgress {
                    phase: None,
                    current,
                    total,
                });
            }
        }
        previous_digit = digit;
    }

    None
}

struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(rest: &'a str) -> Self {
        Self { rest }
    }

    fn skip_whitespace(&mut self) -> usize {
        let trimmed = self.rest.trim_start();
        let skipped = self.rest.len() - trimmed.len();
        self.rest = trimmed;
        skipped
    }

    fn integer(&mut self) -> Option<u32> {
        let end = self
            .rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(self.rest.len());
        if end == 0 {
            return None;
        }
        let value = self.rest[..end].parse().ok()?;
        self.rest = &self.rest[end..];
        Some(value)
    }

    fn eat(&mut self, expected: char) -> bool {
        match self.rest.strip_prefix(expected) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    fn fraction(&mut self) -> Option<(u32, u32)> {
        let current = self.integer()?;
        self.skip_whitespace();
        if !self.eat('/') {
            return None;
        }
        self.skip_whitespace();
        let total = self.integer()?;
        Some((current, total))
    }
}

/// Classifies one stderr line
///
/// Every line yields a progress signal; lines matching an error keyword
/// additionally yield an error signal.
pub fn classify_diagnostic(line: &str) -> Vec<OutputEvent> {
    let mut events = vec![OutputEvent::Progress(ProgressSignal {
        text: line.to_string(),
        progress: parse_progress(line),
    })];

    if is_error_line(line) {
        events.push(OutputEvent::Error(ErrorSignal {
            text: line.to_string(),
        }));
    }

    events
}

/// Classifies captured payload output
///
/// Records come first in stdout order, followed by stderr events in order.
/// Skipped stdout lines are returned separately; they never fail the parse.
pub fn parse_events(stdout: &str, stderr: &str) -> (Vec<OutputEvent>, Vec<MalformedOutput>) {
    let mut events = Vec::new();
    let mut malformed = Vec::new();

    for (idx, line) in stdout.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed = if line.starts_with('{') {
            parse_record_line(line, idx + 1)
        } else {
            Err(MalformedOutput::NotJson { line: idx + 1 })
        };

        match parsed {
            Ok(record) => events.push(OutputEvent::Record(record)),
            Err(e) => {
                let excerpt: String = line.chars().take(EXCERPT_CHARS).collect();
                warn!("Skipping malformed output, {}: {}", e, excerpt);
                malformed.push(e);
            }
        }
    }

    for line in stderr.lines() {
        let line = line.trim();
        if !line.is_empty() {
            events.extend(classify_diagnostic(line));
        }
    }

    (events, malformed)
}

/// How a finished payload run should be judged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    /// The process exited with a non-zero code
    ExitCode(i32),
    /// Exit code 0, but stderr reported this many errors
    EmbeddedErrors(usize),
}

/// Summary of a parsed payload run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    pub records: Vec<ResultRecord>,
    pub diagnostics: Vec<String>,
    pub errors: Vec<String>,
    /// Latest progress of the highest phase seen
    pub progress: Option<BatchProgress>,
    pub malformed: Vec<MalformedOutput>,
}

impl ParsedOutput {
    pub fn parse(stdout: &str, stderr: &str) -> Self {
        let (events, malformed) = parse_events(stdout, stderr);
        Self::from_events(events, malformed)
    }

    pub fn from_events(events: Vec<OutputEvent>, malformed: Vec<MalformedOutput>) -> Self {
        let mut parsed = Self {
            malformed,
            ..Self::default()
        };
        let mut phased: Option<BatchProgress> = None;
        let mut unphased: Option<BatchProgress> = None;

        for event in events {
            match event {
                OutputEvent::Record(record) => parsed.records.push(record),
                OutputEvent::Error(signal) => parsed.errors.push(signal.text),
                OutputEvent::Progress(signal) => {
                    match signal.progress {
                        Some(progress @ BatchProgress { phase: Some(phase), .. }) => {
                            let current_phase = phased.and_then(|p| p.phase).unwrap_or(0);
                            if phased.is_none() || phase >= current_phase {
                                phased = Some(progress);
                            }
                        }
                        Some(progress) => unphased = Some(progress),
                        None => {}
                    }
                    parsed.diagnostics.push(signal.text);
                }
            }
        }

        parsed.progress = phased.or(unphased);
        parsed
    }

    /// Last `n` diagnostic lines
    pub fn stderr_tail(&self, n: usize) -> &[String] {
        let start = self.diagnostics.len().saturating_sub(n);
        &self.diagnostics[start..]
    }

    /// Judges the run; a non-zero exit code takes precedence over embedded errors
    pub fn verdict(&self, exit_code: i32) -> Verdict {
        if exit_code != 0 {
            Verdict::ExitCode(exit_code)
        } else if !self.errors.is_empty() {
            Verdict::EmbeddedErrors(self.errors.len())
        } else {
            Verdict::Success
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_lines_are_skipped() {
        let stdout = concat!(
            "{\"name\":\"Widget\",\"price\":19.9,\"currency\":\"SEK\"}\n",
            "Fetching page 2\n",
            "{not json\n",
            "{\"name\":\"No price\"}\n",
            "{\"name\":\"  \",\"price\":5}\n",
            "\n",
            "{\"name\":\"Gadget\",\"price\":\"7.50\",\"ean\":7310865004703}\n",
            "{\"name\":\"Bad price\",\"price\":\"cheap\"}\n",
        );

        let parsed = ParsedOutput::parse(stdout, "");

        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.records[0].name, "Widget");
        assert_eq!(parsed.records[0].currency.as_deref(), Some("SEK"));
        assert_eq!(parsed.records[1].price, 7.5);
        assert_eq!(parsed.records[1].ean.as_deref(), Some("7310865004703"));
        assert_eq!(parsed.malformed.len(), 5);
        assert_eq!(parsed.malformed[0], MalformedOutput::NotJson { line: 2 });
        assert_eq!(parsed.malformed[2], MalformedOutput::InvalidPrice { line: 4 });
        assert_eq!(parsed.malformed[3], MalformedOutput::MissingName { line: 5 });
    }

    #[test]
    fn test_plain_text_stdout_is_reported_malformed() {
        let stdout = "Starting scrape\n{\"name\":\"Widget\",\"price\":1}\n  \nDone: 1 product\n";

        let (events, malformed) = parse_events(stdout, "");

        assert_eq!(events.len(), 1);
        assert_eq!(
            malformed,
            vec![
                MalformedOutput::NotJson { line: 1 },
                MalformedOutput::NotJson { line: 4 },
            ]
        );
        assert_eq!(malformed[1].to_string(), "line 4: not JSON");
    }

    #[test]
    fn test_record_field_aliases() {
        let record = parse_record_line(
            r#"{"name":"Widget","competitor_price":12,"currency_code":"EUR","image":"https://img","barcode":"123","raw_data":{"stock":3}}"#,
            1,
        )
        .unwrap();

        assert_eq!(record.price, 12.0);
        assert_eq!(record.currency.as_deref(), Some("EUR"));
        assert_eq!(record.image_url.as_deref(), Some("https://img"));
        assert_eq!(record.ean.as_deref(), Some("123"));
        assert_eq!(record.raw_data.unwrap()["stock"], 3);
    }

    #[test]
    fn test_phase_marker_variants() {
        let expect = |phase, current, total| {
            Some(BatchProgress {
                phase: Some(phase),
                current,
                total,
            })
        };

        assert_eq!(parse_progress("Phase 1: 3/10"), expect(1, 3, 10));
        assert_eq!(
            parse_progress("Updated progress in database: Phase 2: 5/10"),
            expect(2, 5, 10)
        );
        assert_eq!(parse_progress("PHASE 3 : 1 / 4 batches"), expect(3, 1, 4));
        assert_eq!(parse_progress("phase one then Phase 2: 7/9"), expect(2, 7, 9));

        assert_eq!(parse_progress("Phase1: 2/3"), None);
        assert_eq!(parse_progress("Phase 1 done"), None);
        assert_eq!(parse_progress("Phase 1: 3 of 10"), None);
    }

    #[test]
    fn test_progress_prefix_line() {
        assert_eq!(
            parse_progress("PROGRESS: processed 12 / 40 products"),
            Some(BatchProgress {
                phase: None,
                current: 12,
                total: 40,
            })
        );
        assert_eq!(parse_progress("progress: 12/40"), None);
        assert_eq!(parse_progress("PROGRESS: warming up"), None);
    }

    #[test]
    fn test_stderr_classification() {
        let events = classify_diagnostic("Traceback (most recent call last):");
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], OutputEvent::Error(_)));

        let events = classify_diagnostic("Phase 1: 2/5");
        assert_eq!(events.len(), 1);
        match &events[0] {
            OutputEvent::Progress(signal) => assert!(signal.progress.is_some()),
            other => panic!("expected progress, got {:?}", other),
        }

        assert!(is_error_line("Request FAILED for page 3"));
        assert!(is_error_line("ValueError: bad"));
        assert!(!is_error_line("Fetched 20 products"));
    }

    #[test]
    fn test_latest_progress_comes_from_highest_phase() {
        let stderr = concat!(
            "PROGRESS: 1/9\n",
            "Phase 1: 4/4\n",
            "Phase 2: 1/10\n",
            "Phase 2: 6/10\n",
            "Phase 1: 9/9\n",
            "PROGRESS: 2/9\n",
        );

        let parsed = ParsedOutput::parse("", stderr);

        assert_eq!(
            parsed.progress,
            Some(BatchProgress {
                phase: Some(2),
                current: 6,
                total: 10,
            })
        );
        assert_eq!(parsed.diagnostics.len(), 6);
    }

    #[test]
    fn test_unphased_progress_used_when_no_phase_seen() {
        let parsed = ParsedOutput::parse("", "PROGRESS: 1/9\nPROGRESS: 3/9\n");
        assert_eq!(
            parsed.progress,
            Some(BatchProgress {
                phase: None,
                current: 3,
                total: 9,
            })
        );
    }

    #[test]
    fn test_verdict() {
        let clean = ParsedOutput::parse("{\"name\":\"a\",\"price\":1}\n", "Fetched 1 product\n");
        assert_eq!(clean.verdict(0), Verdict::Success);

        let noisy = ParsedOutput::parse("", "Exception: timeout\nError on page 2\n");
        assert_eq!(noisy.verdict(0), Verdict::EmbeddedErrors(2));
        assert_eq!(noisy.verdict(2), Verdict::ExitCode(2));
    }

    #[test]
    fn test_stderr_tail() {
        let parsed = ParsedOutput::parse("", "a\nb\nc\n");
        assert_eq!(parsed.stderr_tail(2), ["b".to_string(), "c".to_string()]);
        assert_eq!(parsed.stderr_tail(10).len(), 3);
    }

    #[test]
    fn test_records_precede_diagnostics() {
        let (events, _) = parse_events("{\"name\":\"a\",\"price\":1}\n", "working\n");
        assert!(matches!(events[0], OutputEvent::Record(_)));
        assert!(matches!(events[1], OutputEvent::Progress(_)));
    }
}
