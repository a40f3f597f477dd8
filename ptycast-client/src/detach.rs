//! Detach key sequence detection
//!
//! A streaming filter over the keystroke stream: bytes of a partially
//! matched sequence are held back across chunks, and either swallowed (on a
//! full match, which detaches the client) or replayed into the stream when
//! the match falls through.

use ptycast_utils::{PtycastError, Result};

#[derive(Debug)]
pub struct DetachDetector {
    sequence: Vec<u8>,
    matched: usize,
}

impl DetachDetector {
    /// Parse a sequence spec like `"ctrl-p,ctrl-q"`. Tokens are either
    /// `ctrl-<letter>` or a single printable character.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut sequence = Vec::new();
        for token in spec.split(',') {
            let token = token.trim();
            if let Some(letter) = token.strip_prefix("ctrl-") {
                let mut chars = letter.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) if c.is_ascii_alphabetic() => {
                        sequence.push(c.to_ascii_uppercase() as u8 - b'@');
                    }
                    _ => {
                        return Err(PtycastError::usage(format!(
                            "invalid detach key token: {}",
                            token
                        )))
                    }
                }
            } else {
                let mut chars = token.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) if c.is_ascii() && !c.is_ascii_control() => {
                        sequence.push(c as u8);
                    }
                    _ => {
                        return Err(PtycastError::usage(format!(
                            "invalid detach key token: {}",
                            token
                        )))
                    }
                }
            }
        }
        if sequence.is_empty() {
            return Err(PtycastError::usage("empty detach key sequence"));
        }
        Ok(Self {
            sequence,
            matched: 0,
        })
    }

    /// Filter one input chunk. Returns the bytes to forward and whether the
    /// full sequence was seen.
    pub fn feed(&mut self, input: &[u8]) -> (Vec<u8>, bool) {
        let mut out = Vec::with_capacity(input.len());
        for &byte in input {
            if byte == self.sequence[self.matched] {
                self.matched += 1;
                if self.matched == self.sequence.len() {
                    return (out, true);
                }
            } else {
                // Replay the held-back prefix, then retry this byte at the
                // start of the sequence.
                out.extend_from_slice(&self.sequence[..self.matched]);
                self.matched = 0;
                if byte == self.sequence[0] {
                    self.matched = 1;
                } else {
                    out.push(byte);
                }
            }
        }
        (out, false)
    }
}
