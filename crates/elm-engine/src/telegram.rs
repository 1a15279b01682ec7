//! Streaming reassembly of multi-frame replies.
//!
//! With headers off the adapter prints an ISO-TP message as a byte-count
//! line followed by indexed segments:
//!
//! ```text
//! 014
//! 0: 49 02 01 31 44 34
//! 1: 47 50 30 30 52 35 35
//! 2: 42 31 32 33 34 35 36
//! ```
//!
//! The assembler accepts chunks as they arrive, strips the `i:` prefixes and
//! emits one telegram once the announced byte count has been collected.
//! Without a count, the telegram ends at the prompt or on `finish`.

use crate::classifier::{Classification, ResponseKind, classify, normalize};

/// One reassembled reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telegram {
    /// Hex payload with segment prefixes removed.
    pub payload: String,
    /// Announced payload length in hex characters, if a count line was seen.
    pub expected_chars: Option<usize>,
    pub classification: Classification,
}

impl Telegram {
    /// Fewer characters arrived than were announced.
    pub fn is_short(&self) -> bool {
        self.expected_chars
            .is_some_and(|expected| self.payload.len() < expected)
    }
}

#[derive(Debug, Default)]
pub struct TelegramAssembler {
    /// Unterminated tail of the input.
    partial: String,
    payload: String,
    expected_chars: Option<usize>,
}

/// A count line: `0` followed by one to three hex digits.
fn length_token(line: &str) -> Option<usize> {
    let digits = line.strip_prefix('0')?;
    if digits.is_empty() || digits.len() > 3 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    usize::from_str_radix(digits, 16)
        .ok()
        .filter(|&bytes| bytes > 0)
        .map(|bytes| bytes * 2)
}

/// `i:` segment prefix, single hex digit index.
fn strip_segment_index(line: &str) -> Option<&str> {
    let (index, rest) = line.split_once(':')?;
    (index.len() == 1 && index.chars().all(|c| c.is_ascii_hexdigit())).then_some(rest)
}

impl TelegramAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk. Returns a telegram when one completes.
    pub fn push(&mut self, chunk: &str) -> Option<Telegram> {
        self.partial.push_str(chunk);
        let mut done = None;

        while let Some(end) = self.partial.find(['\r', '\n', '>']) {
            let prompt = self.partial[end..].starts_with('>');
            let line: String = self.partial.drain(..=end).collect();
            if let Some(t) = self.accept_line(&line[..line.len() - 1]) {
                done.get_or_insert(t);
            }
            if prompt {
                if let Some(t) = self.take() {
                    done.get_or_insert(t);
                }
            }
        }
        done
    }

    /// Flush whatever has been collected.
    pub fn finish(&mut self) -> Option<Telegram> {
        let tail = std::mem::take(&mut self.partial);
        let completed = self.accept_line(&tail);
        completed.or_else(|| self.take())
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn accept_line(&mut self, line: &str) -> Option<Telegram> {
        let line = normalize(line);
        if line.is_empty() || classify(&line).kind == ResponseKind::Searching {
            return None;
        }

        if self.payload.is_empty() && self.expected_chars.is_none() {
            if let Some(expected) = length_token(&line) {
                self.expected_chars = Some(expected);
                return None;
            }
        }

        match strip_segment_index(&line) {
            Some(rest) => self.payload.push_str(rest),
            None => self.payload.push_str(&line),
        }

        match self.expected_chars {
            Some(expected) if self.payload.len() >= expected => {
                self.payload.truncate(expected);
                self.take()
            }
            _ => None,
        }
    }

    fn take(&mut self) -> Option<Telegram> {
        if self.payload.is_empty() {
            self.expected_chars = None;
            return None;
        }
        let payload = std::mem::take(&mut self.payload);
        let expected_chars = self.expected_chars.take();
        let classification = classify(&payload);
        Some(Telegram {
            payload,
            expected_chars,
            classification,
        })
    }
}

/// Reassemble a complete reply in one go.
pub fn assemble(raw: &str) -> Option<Telegram> {
    let mut assembler = TelegramAssembler::new();
    let first = assembler.push(raw);
    first.or_else(|| assembler.finish())
}
