//! Incremental extraction of one string field from a streamed JSON object.
//!
//! The completion service answers with a structured object such as
//! `{"response": "...", "responseSourceId": 3}`. Tokens arrive in arbitrary
//! chunk boundaries, so the seeker runs a small state machine over the raw
//! character stream and yields only the decoded value of the target field,
//! as soon as its characters arrive.

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    SeekKey,
    SeekColon,
    SeekQuote,
    InValue,
    Done,
}

/// Streaming extractor for a single string-valued JSON field.
#[derive(Debug, Clone)]
pub struct StreamFieldSeeker {
    pattern: Vec<char>,
    matched: usize,
    state: State,
    /// Pending escape-sequence characters after a backslash, if any.
    escape: Option<String>,
}

impl StreamFieldSeeker {
    pub fn new(field: &str) -> Self {
        Self {
            pattern: format!("\"{field}\"").chars().collect(),
            matched: 0,
            state: State::SeekKey,
            escape: None,
        }
    }

    /// True once the closing quote of the target value has been seen.
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Consume the next raw chunk and return any decoded value characters
    /// it contained.
    pub fn feed(&mut self, chunk: &str) -> String {
        let mut out = String::new();
        for ch in chunk.chars() {
            match self.state {
                State::SeekKey => {
                    if ch == self.pattern[self.matched] {
                        self.matched += 1;
                        if self.matched == self.pattern.len() {
                            self.state = State::SeekColon;
                        }
                    } else if ch == self.pattern[0] {
                        self.matched = 1;
                    } else {
                        self.matched = 0;
                    }
                }
                State::SeekColon => {
                    if ch == ':' {
                        self.state = State::SeekQuote;
                    } else if !ch.is_whitespace() {
                        // The key text occurred as a value, keep scanning.
                        self.matched = 0;
                        self.state = State::SeekKey;
                    }
                }
                State::SeekQuote => {
                    if ch == '"' {
                        self.state = State::InValue;
                    } else if !ch.is_whitespace() {
                        self.matched = 0;
                        self.state = State::SeekKey;
                    }
                }
                State::InValue => {
                    if let Some(pending) = self.escape.take() {
                        if let Some(decoded) = self.decode_escape(pending, ch) {
                            out.push_str(&decoded);
                        }
                    } else if ch == '\\' {
                        self.escape = Some(String::new());
                    } else if ch == '"' {
                        self.state = State::Done;
                    } else {
                        out.push(ch);
                    }
                }
                State::Done => break,
            }
        }
        out
    }

    /// Advance a pending escape sequence with one more character. Returns
    /// decoded text once complete, re-arming `self.escape` otherwise.
    fn decode_escape(&mut self, mut pending: String, ch: char) -> Option<String> {
        if pending.is_empty() {
            return match ch {
                '"' => Some("\"".to_string()),
                '\\' => Some("\\".to_string()),
                '/' => Some("/".to_string()),
                'n' => Some("\n".to_string()),
                't' => Some("\t".to_string()),
                'r' => Some("\r".to_string()),
                'b' => Some("\u{8}".to_string()),
                'f' => Some("\u{c}".to_string()),
                'u' => {
                    self.escape = Some("u".to_string());
                    None
                }
                other => Some(other.to_string()),
            };
        }

        // \uXXXX: collect four hex digits, which may straddle chunks.
        pending.push(ch);
        if pending.len() < 5 {
            self.escape = Some(pending);
            return None;
        }
        let code = u32::from_str_radix(&pending[1..], 16).ok()?;
        char::from_u32(code).map(String::from)
    }
}
