//! Inbound byte inspection.
//!
//! Every byte sequence a client sends passes through [`InputValidator`]
//! before reaching the terminal. Ordinary keystrokes, control codes and
//! cursor/function-key sequences pass untouched; complete control strings
//! that could be echoed back to rewrite the client's title, write its
//! clipboard, or query and exfiltrate terminal state are stripped.
//! [`InputStream`] applies the same rules across message boundaries.

use std::borrow::Cow;

use regex::bytes::Regex;
use serde::{Deserialize, Serialize};

/// Built-in deny-list: (name, pattern)
const DEFAULT_RULES: &[(&str, &str)] = &[
    // OSC: title, clipboard (52), hyperlinks, palette... terminated by BEL or ST
    ("osc", r"(?-u)\x1b\][0-9]+(?:;[^\x07\x1b]*)?(?:\x07|\x1b\\)"),
    // DCS, including DECRQSS and tmux passthrough
    ("dcs", r"(?-u)\x1bP[^\x1b]*\x1b\\"),
    ("apc_pm_sos", r"(?-u)\x1b[_^X][^\x1b]*\x1b\\"),
    // Device status/attribute queries and window reports
    ("terminal_query", r"(?-u)\x1b\[[0-9;?>=]*[cnt]"),
];

/// A control string or query cut off before its final byte, anchored at the
/// end of the input
const UNTERMINATED_TAIL: &str =
    r"(?-u)\x1b(?:\][0-9]*(?:;[^\x07\x1b]*)?|P[^\x1b]*|[_^X][^\x1b]*|\[[0-9;?>=]*)\x1b?\z";

/// Bytes that open a control string or query when they follow ESC
const INTRODUCERS: &[u8] = b"]P_^X[";

const ESC: u8 = 0x1b;

/// Longest unterminated control string held back waiting for its end
pub const MAX_PENDING_CONTROL_BYTES: usize = 4096;

/// Rule name reported when a held control string outgrows the limit
pub const UNTERMINATED_RULE: &str = "unterminated_control_string";

/// A single deny-list entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyRule {
    pub name: String,
    /// Byte regex; use `(?-u)` and `\xNN` escapes for raw bytes
    pub pattern: String,
}

impl DenyRule {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
        }
    }
}

/// Deny-list configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Include the built-in rules ahead of `deny`
    #[serde(default = "default_use_defaults")]
    pub use_defaults: bool,
    #[serde(default)]
    pub deny: Vec<DenyRule>,
}

fn default_use_defaults() -> bool {
    true
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            use_defaults: true,
            deny: Vec::new(),
        }
    }
}

/// One stripped sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub rule: String,
    pub offset: usize,
    pub len: usize,
}

/// Result of validating one input payload
#[derive(Debug)]
pub struct Validated<'a> {
    pub bytes: Cow<'a, [u8]>,
    pub rejected: Vec<Rejection>,
}

impl Validated<'_> {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }

    pub fn rule_names(&self) -> String {
        rule_names(&self.rejected)
    }
}

/// Comma-separated names of the rules that fired, deduplicated
pub fn rule_names(rejected: &[Rejection]) -> String {
    let mut names: Vec<&str> = Vec::new();
    for rejection in rejected {
        if !names.contains(&rejection.rule.as_str()) {
            names.push(&rejection.rule);
        }
    }
    names.join(", ")
}

#[derive(Debug, Clone)]
pub struct InputValidator {
    rules: Vec<(String, Regex)>,
    /// Only set with the built-in rules, which it mirrors
    tail: Option<Regex>,
}

impl Default for InputValidator {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl InputValidator {
    pub fn new(config: &ValidatorConfig) -> Result<Self, regex::Error> {
        let mut rules = Vec::new();
        if config.use_defaults {
            for (name, pattern) in DEFAULT_RULES {
                rules.push((name.to_string(), Regex::new(pattern)?));
            }
        }
        for rule in &config.deny {
            rules.push((rule.name.clone(), Regex::new(&rule.pattern)?));
        }
        let tail = if config.use_defaults {
            Some(Regex::new(UNTERMINATED_TAIL)?)
        } else {
            None
        };
        Ok(Self { rules, tail })
    }

    pub fn with_defaults() -> Self {
        let rules = DEFAULT_RULES
            .iter()
            .filter_map(|(name, pattern)| {
                Regex::new(pattern).ok().map(|re| (name.to_string(), re))
            })
            .collect();
        Self {
            rules,
            tail: Regex::new(UNTERMINATED_TAIL).ok(),
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Start of a control string left open at the end of `raw`
    fn unterminated_tail(&self, raw: &[u8]) -> Option<usize> {
        self.tail.as_ref()?.find(raw).map(|m| m.start())
    }

    /// Strip every deny-listed sequence from `raw`.
    ///
    /// Returns the input borrowed and unchanged when nothing matches.
    pub fn validate<'a>(&self, raw: &'a [u8]) -> Validated<'a> {
        let mut rejected = Vec::new();
        for (name, regex) in &self.rules {
            for m in regex.find_iter(raw) {
                rejected.push(Rejection {
                    rule: name.clone(),
                    offset: m.start(),
                    len: m.len(),
                });
            }
        }

        if rejected.is_empty() {
            return Validated {
                bytes: Cow::Borrowed(raw),
                rejected,
            };
        }

        rejected.sort_by_key(|r| (r.offset, r.len));

        let mut kept = Vec::with_capacity(raw.len());
        let mut cursor = 0;
        for rejection in &rejected {
            if rejection.offset > cursor {
                kept.extend_from_slice(&raw[cursor..rejection.offset]);
            }
            cursor = cursor.max(rejection.offset + rejection.len);
        }
        if cursor < raw.len() {
            kept.extend_from_slice(&raw[cursor..]);
        }

        Validated {
            bytes: Cow::Owned(kept),
            rejected,
        }
    }
}

/// Validates a stream of input chunks as one byte sequence.
///
/// A control string cut off at the end of a chunk is held back and checked
/// together with the next chunk, so splitting it across messages does not
/// get it past the deny-list. A held string that grows past
/// [`MAX_PENDING_CONTROL_BYTES`] is dropped. A lone trailing ESC is written
/// straight away (it is the Escape key) and remembered, so an introducer
/// arriving next is still checked as part of the same sequence.
#[derive(Debug, Default)]
pub struct InputStream {
    pending: Vec<u8>,
    /// `pending` starts with an ESC the terminal already received
    pending_escape_sent: bool,
    /// The last byte the terminal received was ESC
    escape_sent: bool,
}

impl InputStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently held back
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Validate `chunk` in the context of what came before it.
    ///
    /// Rejection offsets are relative to the held bytes plus `chunk`.
    pub fn feed(&mut self, validator: &InputValidator, chunk: &[u8]) -> Validated<'static> {
        let mut input = std::mem::take(&mut self.pending);
        let mut escape_replayed = std::mem::take(&mut self.pending_escape_sent);
        if input.is_empty()
            && self.escape_sent
            && chunk.first().is_some_and(|b| INTRODUCERS.contains(b))
        {
            input.push(ESC);
            escape_replayed = true;
        }
        input.extend_from_slice(chunk);

        let mut rejected = Vec::new();
        let held_from = validator.unterminated_tail(&input).unwrap_or(input.len());
        let mut tail = input.split_off(held_from);
        if tail.len() > MAX_PENDING_CONTROL_BYTES {
            rejected.push(Rejection {
                rule: UNTERMINATED_RULE.to_string(),
                offset: held_from,
                len: tail.len(),
            });
            tail.clear();
        }

        let validated = validator.validate(&input);
        let escape_stripped = validated.rejected.iter().any(|r| r.offset == 0);
        let mut bytes = validated.bytes.into_owned();
        rejected.extend(validated.rejected);
        rejected.sort_by_key(|r| (r.offset, r.len));

        // The replayed ESC already reached the terminal.
        if escape_replayed && held_from > 0 && !escape_stripped {
            bytes.remove(0);
        }

        if !tail.is_empty() {
            self.pending = tail;
            self.pending_escape_sent = escape_replayed && held_from == 0;
            self.escape_sent = false;
        } else if let Some(&last) = bytes.last() {
            self.escape_sent = last == ESC;
        }

        Validated {
            bytes: Cow::Owned(bytes),
            rejected,
        }
    }
}
