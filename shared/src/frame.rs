//! Length-prefixed framing used on every TCP connection.
//!
//! A frame is laid out big-endian as
//!
//! ```text
//! +----------------+-------------+----------------------------+
//! | u32 total_len  | u16 msg_id  | payload[total_len - 2]     |
//! +----------------+-------------+----------------------------+
//! ```
//!
//! `total_len` excludes itself and must lie in `[MIN_FRAME_LEN, MAX_FRAME_LEN]`.
//! Anything outside that range is a protocol violation and the peer is dropped.

use thiserror::Error;

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_LEN: usize = 4;
/// Size of the message identifier in bytes
pub const MSG_ID_LEN: usize = 2;
/// Smallest legal `total_len`: a bare message id with an empty payload
pub const MIN_FRAME_LEN: u32 = MSG_ID_LEN as u32;
/// Largest legal `total_len` (10 MiB)
pub const MAX_FRAME_LEN: u32 = 10 * 1024 * 1024;
/// Largest payload that still fits in a single frame
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN as usize - MSG_ID_LEN;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The length prefix announced a frame outside the legal range
    #[error("frame length {0} outside [2, 10485760]")]
    InvalidLength(u32),

    /// A payload was too large to be encoded into one frame
    #[error("payload of {0} bytes does not fit in one frame")]
    PayloadTooLarge(usize),
}

/// One decoded protocol unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_id: u16,
    pub payload: Vec<u8>,
}

/// Checks a `total_len` value read from the wire.
pub fn validate_length(total_len: u32) -> Result<(), FrameError> {
    if (MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&total_len) {
        Ok(())
    } else {
        Err(FrameError::InvalidLength(total_len))
    }
}

/// Encodes `payload` under `msg_id` into a ready-to-write frame.
pub fn encode_frame(msg_id: u16, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }

    let total_len = (payload.len() + MSG_ID_LEN) as u32;
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_LEN + total_len as usize);
    buf.extend_from_slice(&total_len.to_be_bytes());
    buf.extend_from_slice(&msg_id.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Incremental frame extractor.
///
/// Bytes are appended as they arrive from the socket and whole frames are
/// pulled out with [`FrameDecoder::next_frame`]. Nothing is consumed until a
/// complete frame (prefix + `total_len` bytes) is buffered, so partial reads
/// and several frames coalesced into one read are both handled.
///
/// Extracting a frame only advances a read offset; consumed bytes are shifted
/// out once per [`FrameDecoder::extend`], which keeps a burst of coalesced
/// frames linear to decode.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    consumed: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly read bytes to the accumulator
    pub fn extend(&mut self, bytes: &[u8]) {
        if self.consumed > 0 {
            self.buffer.drain(..self.consumed);
            self.consumed = 0;
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of bytes waiting to be parsed
    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.consumed
    }

    /// Extracts the next complete frame.
    ///
    /// Returns `Ok(None)` when more bytes are needed and an error as soon as
    /// the length prefix is known to be illegal. After an error the decoder
    /// state is unspecified; the connection is expected to be closed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let pending = &self.buffer[self.consumed..];
        if pending.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let total_len = u32::from_be_bytes([pending[0], pending[1], pending[2], pending[3]]);
        validate_length(total_len)?;

        let frame_end = LENGTH_PREFIX_LEN + total_len as usize;
        if pending.len() < frame_end {
            return Ok(None);
        }

        let msg_id = u16::from_be_bytes([
            pending[LENGTH_PREFIX_LEN],
            pending[LENGTH_PREFIX_LEN + 1],
        ]);
        let payload = pending[LENGTH_PREFIX_LEN + MSG_ID_LEN..frame_end].to_vec();
        self.consumed += frame_end;
        if self.consumed == self.buffer.len() {
            self.buffer.clear();
            self.consumed = 0;
        }

        Ok(Some(Frame { msg_id, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg_id: u16, payload: &[u8]) -> Frame {
        let bytes = encode_frame(msg_id, payload).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);
        let frame = decoder.next_frame().unwrap().expect("complete frame");
        assert_eq!(decoder.buffered(), 0);
        frame
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let frame = roundtrip(5, &[]);
        assert_eq!(frame.msg_id, 5);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_single_byte_roundtrip() {
        let frame = roundtrip(16, &[0xAB]);
        assert_eq!(frame.msg_id, 16);
        assert_eq!(frame.payload, vec![0xAB]);
    }

    #[test]
    fn test_largest_tested_payload_roundtrip() {
        let payload: Vec<u8> = (0..MAX_FRAME_LEN as usize - 3).map(|i| i as u8).collect();
        let frame = roundtrip(9, &payload);
        assert_eq!(frame.msg_id, 9);
        assert_eq!(frame.payload.len(), payload.len());
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn test_header_layout_is_big_endian() {
        let bytes = encode_frame(0x0102, &[7, 8, 9]).unwrap();
        assert_eq!(&bytes[..4], &[0, 0, 0, 5]);
        assert_eq!(&bytes[4..6], &[0x01, 0x02]);
        assert_eq!(&bytes[6..], &[7, 8, 9]);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert_eq!(
            encode_frame(1, &payload),
            Err(FrameError::PayloadTooLarge(MAX_PAYLOAD_LEN + 1))
        );
    }

    #[test]
    fn test_encode_accepts_exact_limit() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN];
        let bytes = encode_frame(1, &payload).unwrap();
        assert_eq!(&bytes[..4], &MAX_FRAME_LEN.to_be_bytes());
    }

    #[test]
    fn test_decode_rejects_short_length() {
        for bad in [0u32, 1] {
            let mut decoder = FrameDecoder::new();
            decoder.extend(&bad.to_be_bytes());
            assert_eq!(decoder.next_frame(), Err(FrameError::InvalidLength(bad)));
        }
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&(MAX_FRAME_LEN + 1).to_be_bytes());
        assert_eq!(
            decoder.next_frame(),
            Err(FrameError::InvalidLength(MAX_FRAME_LEN + 1))
        );
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let bytes = encode_frame(3, b"hello").unwrap();
        let mut decoder = FrameDecoder::new();

        decoder.extend(&bytes[..2]);
        assert_eq!(decoder.next_frame(), Ok(None));
        decoder.extend(&bytes[2..7]);
        assert_eq!(decoder.next_frame(), Ok(None));
        assert_eq!(decoder.buffered(), 7);

        decoder.extend(&bytes[7..]);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.payload, b"hello".to_vec());
    }

    #[test]
    fn test_coalesced_frames_are_split() {
        let mut bytes = encode_frame(1, b"a").unwrap();
        bytes.extend(encode_frame(2, b"bb").unwrap());
        bytes.extend(encode_frame(3, b"").unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);

        let ids: Vec<u16> = std::iter::from_fn(|| decoder.next_frame().unwrap())
            .map(|frame| frame.msg_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_tail_survives_compaction() {
        let mut bytes = encode_frame(1, b"first").unwrap();
        let second = encode_frame(2, b"second").unwrap();
        bytes.extend_from_slice(&second[..5]);

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);
        assert_eq!(decoder.next_frame().unwrap().unwrap().msg_id, 1);
        assert_eq!(decoder.next_frame(), Ok(None));
        assert_eq!(decoder.buffered(), 5);

        decoder.extend(&second[5..]);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!((frame.msg_id, frame.payload), (2, b"second".to_vec()));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_large_coalesced_burst_decodes_in_order() {
        let frames = 50_000u32;
        let mut bytes = Vec::new();
        for i in 0..frames {
            bytes.extend(encode_frame((i % 18 + 1) as u16, &i.to_be_bytes()).unwrap());
        }

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);
        let start = std::time::Instant::now();
        for i in 0..frames {
            let frame = decoder.next_frame().unwrap().unwrap();
            assert_eq!(frame.payload, i.to_be_bytes().to_vec());
            assert_eq!(decoder.buffered(), (frames - i - 1) as usize * 10);
        }
        assert_eq!(decoder.next_frame(), Ok(None));
        // One memmove per frame over a 500 KB buffer would take far longer
        assert!(start.elapsed().as_millis() < 1000);
    }
}
