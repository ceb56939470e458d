//! Character-set codec at the GB18030/UTF-8 boundary.
//!
//! Two pure operations, parameterised by [`Charset`]. UTF-8 is identity in
//! both directions; GB18030 uses `encoding_rs`'s implementation of the
//! standard mapping. Invalid trailing GB18030 sequences are never treated
//! as hard errors here — see the preprocessor in `session.rs`, which is
//! the component responsible for buffering a dangling multi-byte lead byte.

/// Which charset a byte sequence is encoded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    Utf8,
    Gb18030,
}

/// Decode `bytes` into Unicode text.
///
/// For GB18030, malformed or incomplete sequences are replaced with
/// U+FFFD (the standard lossy-decode behavior); callers that need to
/// detect a dangling trailing lead byte should use
/// [`ends_in_replacement`] on the result before committing to the lossy
/// decode, per the preprocessor's incremental-decode contract.
pub fn decode(charset: Charset, bytes: &[u8]) -> String {
    match charset {
        Charset::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        Charset::Gb18030 => {
            let (text, _, _) = encoding_rs::GB18030.decode(bytes);
            text.into_owned()
        }
    }
}

/// Encode `text` into bytes for the wire.
pub fn encode(charset: Charset, text: &str) -> Vec<u8> {
    match charset {
        Charset::Utf8 => text.as_bytes().to_vec(),
        Charset::Gb18030 => {
            let (bytes, _, _) = encoding_rs::GB18030.encode(text);
            bytes.into_owned()
        }
    }
}

/// Whether decoding `bytes` as GB18030 ends in the replacement character,
/// i.e. the trailing bytes are an incomplete or invalid multi-byte
/// sequence. The preprocessor uses this to decide whether to hold the
/// buffer open for more bytes rather than emit a lossy chunk.
pub fn ends_in_replacement(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    let (text, _, _) = encoding_rs::GB18030.decode(bytes);
    text.ends_with('\u{FFFD}')
}
