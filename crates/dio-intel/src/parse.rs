//! Ordered strategies for pulling one JSON object out of a noisy model reply.

use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub type JsonObject = Map<String, JsonValue>;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("response is empty")]
    Empty,
    #[error("no {0} found in response")]
    NotFound(&'static str),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a json object, got {0}")]
    NotAnObject(&'static str),
    #[error("response is missing `{0}`")]
    MissingField(&'static str),
    #[error("all {attempts} parse strategies failed, last: {last}")]
    Exhausted { attempts: usize, last: Box<ParseError> },
}

pub trait ParseStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn parse(&self, raw: &str) -> Result<JsonObject, ParseError>;
}

#[derive(Debug)]
pub struct ParsedResponse {
    pub object: JsonObject,
    pub strategy: &'static str,
}

/// Runs strategies in order and stops at the first success.
pub struct ResponseParser {
    strategies: Vec<Box<dyn ParseStrategy>>,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self {
            strategies: vec![
                Box::new(DirectParse),
                Box::new(FencedBlock),
                Box::new(BraceMatch),
                Box::new(MarkerStripped),
            ],
        }
    }
}

impl ResponseParser {
    pub fn empty() -> Self {
        Self { strategies: Vec::new() }
    }

    pub fn with_strategy(mut self, strategy: Box<dyn ParseStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn parse(&self, raw: &str) -> Result<ParsedResponse, ParseError> {
        if raw.trim().is_empty() {
            return Err(ParseError::Empty);
        }
        let mut last = ParseError::NotFound("parse strategy");
        for strategy in &self.strategies {
            match strategy.parse(raw) {
                Ok(object) => {
                    return Ok(ParsedResponse {
                        object,
                        strategy: strategy.name(),
                    })
                }
                Err(err) => {
                    tracing::trace!(strategy = strategy.name(), error = %err, "parse strategy failed");
                    last = err;
                }
            }
        }
        Err(ParseError::Exhausted {
            attempts: self.strategies.len(),
            last: Box::new(last),
        })
    }
}

pub struct DirectParse;

impl ParseStrategy for DirectParse {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn parse(&self, raw: &str) -> Result<JsonObject, ParseError> {
        parse_object(raw.trim())
    }
}

/// Contents of ```-fenced blocks, with or without a language tag.
pub struct FencedBlock;

impl ParseStrategy for FencedBlock {
    fn name(&self) -> &'static str {
        "fenced"
    }

    fn parse(&self, raw: &str) -> Result<JsonObject, ParseError> {
        let mut last = ParseError::NotFound("fenced block");
        for block in fenced_blocks(raw) {
            match parse_object(block.trim()) {
                Ok(object) => return Ok(object),
                Err(err) => last = err,
            }
        }
        Err(last)
    }
}

/// First balanced `{...}`, then the greedy span from the first `{` to the last `}`.
pub struct BraceMatch;

impl ParseStrategy for BraceMatch {
    fn name(&self) -> &'static str {
        "brace_match"
    }

    fn parse(&self, raw: &str) -> Result<JsonObject, ParseError> {
        let balanced = balanced_object(raw).ok_or(ParseError::NotFound("json object"));
        match balanced.and_then(parse_object) {
            Ok(object) => Ok(object),
            Err(first) => match greedy_object(raw) {
                Some(span) => parse_object(span),
                None => Err(first),
            },
        }
    }
}

/// Strips fences and typographic quotes, drops trailing commas, then retries.
pub struct MarkerStripped;

impl ParseStrategy for MarkerStripped {
    fn name(&self) -> &'static str {
        "marker_stripped"
    }

    fn parse(&self, raw: &str) -> Result<JsonObject, ParseError> {
        let cleaned = raw
            .replace("```json", "")
            .replace("```JSON", "")
            .replace("```", "")
            .replace(['\u{201c}', '\u{201d}'], "\"")
            .replace(['\u{2018}', '\u{2019}'], "'");
        let cleaned = strip_trailing_commas(&cleaned);
        let span = balanced_object(&cleaned)
            .or_else(|| greedy_object(&cleaned))
            .ok_or(ParseError::NotFound("json object"))?;
        parse_object(span)
    }
}

fn parse_object(text: &str) -> Result<JsonObject, ParseError> {
    match serde_json::from_str::<JsonValue>(text)? {
        JsonValue::Object(map) => Ok(map),
        JsonValue::Array(_) => Err(ParseError::NotAnObject("array")),
        JsonValue::String(_) => Err(ParseError::NotAnObject("string")),
        JsonValue::Number(_) => Err(ParseError::NotAnObject("number")),
        JsonValue::Bool(_) => Err(ParseError::NotAnObject("bool")),
        JsonValue::Null => Err(ParseError::NotAnObject("null")),
    }
}

fn fenced_blocks(raw: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = raw;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let header_end = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = if after[..header_end].contains('{') {
            after
        } else {
            &after[header_end..]
        };
        match body.find("```") {
            Some(close) => {
                blocks.push(&body[..close]);
                rest = &body[close + 3..];
            }
            None => break,
        }
    }
    blocks
}

/// String-aware scan for the first complete top-level object.
fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, &b) in text.as_bytes().iter().enumerate().skip(start) {
        if escape {
            escape = false;
            continue;
        }
        if b == b'\\' && in_string {
            escape = true;
            continue;
        }
        if b == b'"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn greedy_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn strip_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escape = false;
    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c == '"' {
            in_string = true;
        }
        if c == ',' {
            let next = chars[i + 1..].iter().find(|n| !n.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}
