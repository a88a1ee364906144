//! Remove terminal control sequences from streamed output.
//!
//! Output arrives in arbitrary chunks, so a sequence may begin in one chunk
//! and end in the next. [`EscapeStripper`] keeps its parse state between
//! calls and never emits a fragment of a sequence.

/// Longest OSC/DCS string we keep swallowing before assuming it was never
/// terminated and falling back to plain text.
const MAX_STRING_SEQUENCE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    #[default]
    Ground,
    Escape,
    Csi,
    /// OSC, DCS, SOS, PM, APC: terminated by BEL or ST.
    String,
    StringEscape,
    /// `ESC (` and friends take exactly one more character.
    Charset,
}

#[derive(Debug, Clone, Default)]
pub struct EscapeStripper {
    state: State,
    string_len: usize,
}

impl EscapeStripper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strip `input`, carrying any unfinished sequence over to the next call.
    pub fn strip(&mut self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        for c in input.chars() {
            self.state = match self.state {
                State::Ground => match c {
                    '\x1b' => State::Escape,
                    '\u{9b}' => State::Csi,
                    '\n' | '\r' | '\t' => {
                        out.push(c);
                        State::Ground
                    }
                    c if c.is_control() => State::Ground,
                    c => {
                        out.push(c);
                        State::Ground
                    }
                },
                State::Escape => match c {
                    '[' => State::Csi,
                    ']' | 'P' | 'X' | '^' | '_' => {
                        self.string_len = 0;
                        State::String
                    }
                    '(' | ')' | '*' | '+' | '#' | '%' => State::Charset,
                    '\x1b' => State::Escape,
                    _ => State::Ground,
                },
                State::Csi => match c {
                    '\x40'..='\x7e' => State::Ground,
                    '\x1b' => State::Escape,
                    _ => State::Csi,
                },
                State::String => match c {
                    '\x07' => State::Ground,
                    '\x1b' => State::StringEscape,
                    _ => {
                        self.string_len += 1;
                        if self.string_len > MAX_STRING_SEQUENCE {
                            State::Ground
                        } else {
                            State::String
                        }
                    }
                },
                State::StringEscape => State::Ground,
                State::Charset => State::Ground,
            };
        }
        out
    }

    /// True while a sequence is partially consumed.
    pub fn in_sequence(&self) -> bool {
        self.state != State::Ground
    }
}
