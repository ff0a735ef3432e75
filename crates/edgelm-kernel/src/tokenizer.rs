//! Tokenizer contract and streaming UTF-8 reassembly.
//!
//! Byte-level vocabularies encode raw bytes as `<0xHH>` pieces. During
//! streaming decode a multi-byte character can arrive split across calls,
//! so [`Utf8TokenBuffer`] holds incomplete sequences and emits empty
//! strings until the character is whole.

use crate::error::Result;
use crate::io::TokenId;

/// SentencePiece-style leading whitespace marker.
const WHITESPACE_MARKER: char = '\u{2581}';

/// The tokenizer contract the session and scheduler consume.
/// `ids_to_text` is stateful: implementations buffer partial UTF-8
/// sequences across calls.
pub trait Tokenizer: Send {
    fn text_to_ids(&self, text: &str) -> Result<Vec<TokenId>>;

    /// Fails with `NotFound` for tokens outside the vocabulary.
    fn token_to_id(&self, token: &str) -> Result<TokenId>;

    /// The raw vocabulary piece for an id, e.g. `"▁volume"` or `"<0xC2>"`.
    fn id_to_piece(&self, id: TokenId) -> Result<String>;

    /// Streaming detokenization. Interim calls inside a multi-byte
    /// character return the empty string.
    fn ids_to_text(&mut self, ids: &[TokenId]) -> Result<String>;

    fn vocab_size(&self) -> usize;
}

/// Parses a `<0xHH>` byte piece.
pub fn parse_byte_piece(piece: &str) -> Option<u8> {
    let hex = piece
        .strip_prefix("<0x")
        .and_then(|rest| rest.strip_suffix('>'))?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

/// Expected total length of a UTF-8 character starting with `byte`:
/// 1-4 for a lead byte, 0 for a continuation byte, -1 for invalid.
fn utf8_expected_len(byte: u8) -> i32 {
    if byte & 0x80 == 0 {
        1
    } else if byte & 0xE0 == 0xC0 {
        2
    } else if byte & 0xF0 == 0xE0 {
        3
    } else if byte & 0xF8 == 0xF0 {
        4
    } else if byte & 0xC0 == 0x80 {
        0
    } else {
        -1
    }
}

/// Accumulates byte-level tokens until they form a complete UTF-8
/// character. Non-byte pieces pass straight through with the whitespace
/// marker mapped to a space.
#[derive(Debug, Default)]
pub struct Utf8TokenBuffer {
    buffered: Vec<u8>,
    expected_len: usize,
}

impl Utf8TokenBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one vocabulary piece and returns the text to emit for it
    /// (possibly empty while a character is incomplete).
    pub fn push_piece(&mut self, piece: &str) -> String {
        match parse_byte_piece(piece) {
            Some(byte) => self.push_byte(byte),
            None => piece.replace(WHITESPACE_MARKER, " "),
        }
    }

    fn push_byte(&mut self, byte: u8) -> String {
        let len = utf8_expected_len(byte);
        // A lone single byte, or a continuation/invalid byte arriving with
        // nothing buffered, decodes immediately.
        if self.expected_len == 0 && len <= 1 {
            return String::from_utf8_lossy(&[byte]).into_owned();
        }
        if len > self.expected_len as i32 {
            self.expected_len = len as usize;
        }
        self.buffered.push(byte);
        if self.buffered.len() >= self.expected_len {
            let out = String::from_utf8_lossy(&self.buffered).into_owned();
            self.buffered.clear();
            self.expected_len = 0;
            out
        } else {
            String::new()
        }
    }

    /// Whether an incomplete character is currently buffered.
    pub fn has_buffered(&self) -> bool {
        !self.buffered.is_empty()
    }
}
