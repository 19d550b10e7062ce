//! Wire event decoding
//!
//! The ring buffer hands out opaque byte records. A record is accepted only if
//! its length equals the compiled-in [`EVENT_SIZE`]; anything else means the
//! probe program and this binary were built from different layouts.

#![allow(unsafe_code)] // DebugEvent <-> bytes

use kdebug_common::{DebugEvent, EVENT_SIZE};
use log::error;

use crate::domain::DecodeError;

/// Fixed-size text field after NUL trimming
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameField {
    Text(String),
    /// Not valid UTF-8; kept as raw bytes
    Binary(Vec<u8>),
}

impl NameField {
    /// Display form; binary names are rendered lossily
    pub fn to_display(&self) -> String {
        match self {
            NameField::Text(s) => s.clone(),
            NameField::Binary(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, NameField::Binary(_))
    }
}

/// Trim trailing NUL bytes and validate the remainder as text
pub fn decode_name(raw: &[u8]) -> NameField {
    let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    let trimmed = &raw[..end];
    match std::str::from_utf8(trimmed) {
        Ok(text) => NameField::Text(text.to_string()),
        Err(_) => NameField::Binary(trimmed.to_vec()),
    }
}

/// Decode one record
///
/// # Errors
/// Returns `DecodeError` if `bytes` is not exactly [`EVENT_SIZE`] long
pub fn decode_event(bytes: &[u8]) -> Result<DebugEvent, DecodeError> {
    if bytes.len() != EVENT_SIZE {
        return Err(DecodeError { expected: EVENT_SIZE, actual: bytes.len() });
    }
    // SAFETY: length checked above; DebugEvent is repr(C) plain data with no
    // invalid bit patterns
    Ok(unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<DebugEvent>()) })
}

/// Byte image of an event, as the probe program writes it
pub fn encode_event(event: &DebugEvent) -> Vec<u8> {
    // SAFETY: DebugEvent is repr(C), EVENT_SIZE bytes, without padding holes
    let bytes = unsafe {
        std::slice::from_raw_parts(std::ptr::from_ref(event).cast::<u8>(), EVENT_SIZE)
    };
    bytes.to_vec()
}

/// Stateful decoder for the reader task
///
/// Layout drift is reported once at `error!` level; every rejected record is
/// counted.
#[derive(Debug, Default)]
pub struct EventDecoder {
    pub decode_errors: u64,
    drift_reported: bool,
}

impl EventDecoder {
    pub fn decode(&mut self, bytes: &[u8]) -> Option<DebugEvent> {
        match decode_event(bytes) {
            Ok(event) => Some(event),
            Err(e) => {
                self.decode_errors += 1;
                if !self.drift_reported {
                    self.drift_reported = true;
                    error!("Event layout drift ({e}): rebuild the probe program and kdebug together");
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_name_trims_trailing_nuls() {
        let mut raw = [0u8; 16];
        raw[..3].copy_from_slice(b"foo");
        assert_eq!(decode_name(&raw), NameField::Text("foo".to_string()));
        assert_eq!(decode_name(&[0u8; 16]), NameField::Text(String::new()));
    }

    #[test]
    fn test_decode_name_marks_invalid_utf8_binary() {
        let raw = [0xff, 0xfe, b'a', 0, 0];
        let name = decode_name(&raw);
        assert_eq!(name, NameField::Binary(vec![0xff, 0xfe, b'a']));
        assert!(name.is_binary());
        assert!(name.to_display().ends_with('a'));
    }

    #[test]
    fn test_decode_round_trips_bytes() {
        let mut event = DebugEvent::zeroed();
        event.pid = 7;
        event.timestamp_ns = 123;
        event.regs[3] = 0xdead;
        let bytes = encode_event(&event);
        assert_eq!(bytes.len(), EVENT_SIZE);
        let decoded = decode_event(&bytes).unwrap();
        assert_eq!(decoded.pid, 7);
        assert_eq!(decoded.timestamp_ns, 123);
        assert_eq!(decoded.regs[3], 0xdead);
        assert_eq!(encode_event(&decoded), bytes);
    }

    #[test]
    fn test_decoder_counts_size_mismatch() {
        let mut decoder = EventDecoder::default();
        assert!(decoder.decode(&[0u8; 72]).is_none());
        assert!(decoder.decode(&[0u8; EVENT_SIZE + 8]).is_none());
        assert!(decoder.decode(&vec![0u8; EVENT_SIZE]).is_some());
        assert_eq!(decoder.decode_errors, 2);
    }
}
