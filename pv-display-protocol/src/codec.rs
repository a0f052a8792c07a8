//! Framing: turns `(type, payload)` pairs into `header ‖ payload ‖ footer` packets
//! and back, including streaming reassembly over an arbitrarily-chunked byte
//! stream (see [`Reassembler`]).

use crate::crc;
use crate::error::ProtocolError;
use crate::footer::{Footer, FOOTER_SIZE};
use crate::header::{Header, HEADER_SIZE, MAX_PAYLOAD};

/// Encodes a single packet: header, payload, footer, in one contiguous buffer
/// suitable for a single atomic transport send.
pub fn encode(packet_type: u32, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD,
        });
    }

    let header = Header {
        packet_type,
        length: payload.len() as u32,
    };

    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len() + FOOTER_SIZE);
    header.write_to(&mut out);
    out.extend_from_slice(payload);

    let crc = crc::checksum(&out[..HEADER_SIZE], payload);
    Footer { crc }.write_to(&mut out);

    Ok(out)
}

/// Decodes a single complete packet (no leftover bytes expected), returning the
/// header's `packet_type` and the payload. Used by tests and by callers that
/// already know they hold exactly one frame.
pub fn decode_one(bytes: &[u8]) -> Result<(u32, Vec<u8>), ProtocolError> {
    let header = Header::parse(bytes)?;
    let body_start = HEADER_SIZE;
    let body_end = body_start + header.length as usize;
    let footer_end = body_end + FOOTER_SIZE;

    if bytes.len() < footer_end {
        return Err(ProtocolError::Truncated {
            need: footer_end,
            have: bytes.len(),
        });
    }

    let payload = &bytes[body_start..body_end];
    let footer = Footer::parse(&bytes[body_end..footer_end])?;
    let computed = crc::checksum(&bytes[..HEADER_SIZE], payload);

    if footer.crc != computed {
        return Err(ProtocolError::CrcMismatch {
            expected: footer.crc,
            computed,
        });
    }

    Ok((header.packet_type, payload.to_vec()))
}

/// A fully decoded packet, returned by the reassembler. Carries an owned copy of
/// the header taken *before* any reassembly state is reset, so callers never
/// observe an already-invalidated header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: u32,
    pub payload: Vec<u8>,
}

/// Streaming packet reassembler: feed it bytes as they arrive off the transport,
/// in chunks of any size (including one byte at a time), and pull complete
/// packets back out in FIFO order.
///
/// `current_header` mirrors the source's `current_packet_header`: `None` means
/// "no reassembly in progress", expressed as an `Option` instead of a
/// sentinel `length == 0` field.
pub struct Reassembler {
    buf: Vec<u8>,
    current_header: Option<Header>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            current_header: None,
        }
    }

    /// Appends newly received bytes to the internal buffer.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Attempts to decode one complete packet from buffered bytes.
    ///
    /// Returns:
    /// - `Ok(Some(packet))` if a full packet was available and valid.
    /// - `Ok(None)` if more bytes are needed (caller should `push` more and retry).
    /// - `Err(_)` on a CRC mismatch or malformed header; the in-progress header is
    ///   invalidated (matching the source's `current_packet_header.length = 0`)
    ///   before the error is returned, so a subsequent `poll` starts a fresh frame.
    ///
    /// Callers should call this in a loop until it returns `Ok(None)`: keep
    /// draining complete packets until the buffered bytes yield no further
    /// progress.
    pub fn poll(&mut self) -> Result<Option<Packet>, ProtocolError> {
        if self.current_header.is_none() {
            if self.buf.len() < HEADER_SIZE {
                return Ok(None);
            }
            match Header::parse(&self.buf[..HEADER_SIZE]) {
                Ok(header) => {
                    self.buf.drain(..HEADER_SIZE);
                    self.current_header = Some(header);
                }
                Err(e) => {
                    // Resynchronize: drop the bogus bytes so a later retry isn't
                    // stuck reparsing the same garbage forever.
                    self.buf.drain(..HEADER_SIZE.min(self.buf.len()));
                    return Err(e);
                }
            }
        }

        let header = self.current_header.expect("checked above");
        let need = header.length as usize + FOOTER_SIZE;
        if self.buf.len() < need {
            return Ok(None);
        }

        let payload = self.buf[..header.length as usize].to_vec();
        let footer_bytes = &self.buf[header.length as usize..need];
        let footer = Footer::parse(footer_bytes)?;

        let mut header_bytes = Vec::with_capacity(HEADER_SIZE);
        header.write_to(&mut header_bytes);
        let computed = crc::checksum(&header_bytes, &payload);

        // Invalidate reassembly state before returning, regardless of outcome,
        // mirroring the source's ordering (and resolving its open question: the
        // header handed back to the caller below is a copy taken before this
        // reset, not a reference into `current_header`).
        let completed_header = header;
        self.current_header = None;
        self.buf.drain(..need);

        if footer.crc != computed {
            return Err(ProtocolError::CrcMismatch {
                expected: footer.crc,
                computed,
            });
        }

        Ok(Some(Packet {
            packet_type: completed_header.packet_type,
            payload,
        }))
    }

    /// Drains every complete packet currently bufferable, stopping at the first
    /// error (matching "on mismatch, raise a fatal channel error" — the caller
    /// decides whether to continue after an error).
    pub fn poll_all(&mut self) -> Result<Vec<Packet>, ProtocolError> {
        let mut out = Vec::new();
        while let Some(packet) = self.poll()? {
            out.push(packet);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn round_trip_single_packet() {
        let payload = b"hello display handler";
        let encoded = encode(42, payload).unwrap();
        let (t, p) = decode_one(&encoded).unwrap();
        assert_eq!(t, 42);
        assert_eq!(p, payload);
    }

    #[test]
    fn round_trip_max_payload() {
        let payload = vec![0xAB; MAX_PAYLOAD];
        let encoded = encode(1, &payload).unwrap();
        let (_, p) = decode_one(&encoded).unwrap();
        assert_eq!(p, payload);
    }

    #[test]
    fn rejects_oversize_payload() {
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        assert!(matches!(
            encode(1, &payload),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[rstest]
    #[case::header_type_field(4)]
    #[case::payload_first_byte(HEADER_SIZE)]
    #[case::footer_crc_byte(HEADER_SIZE + 4)]
    fn single_bit_flip_is_rejected(#[case] offset: usize) {
        let mut encoded = encode(1, b"abcd").unwrap();
        encoded[offset] ^= 0x01;
        assert!(matches!(
            decode_one(&encoded),
            Err(ProtocolError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn streaming_reassembly_whole_buffer_at_once() {
        let encoded = encode(7, b"one-shot").unwrap();
        let mut r = Reassembler::new();
        r.push(&encoded);
        let packets = r.poll_all().unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].packet_type, 7);
        assert_eq!(packets[0].payload, b"one-shot");
    }

    #[test]
    fn streaming_reassembly_byte_at_a_time_matches_whole_buffer() {
        let mut encoded = Vec::new();
        encoded.extend(encode(1, b"first").unwrap());
        encoded.extend(encode(2, b"second-packet").unwrap());
        encoded.extend(encode(3, b"").unwrap());

        let mut whole = Reassembler::new();
        whole.push(&encoded);
        let expected = whole.poll_all().unwrap();

        let mut chunked = Reassembler::new();
        let mut got = Vec::new();
        for byte in &encoded {
            chunked.push(std::slice::from_ref(byte));
            got.extend(chunked.poll_all().unwrap());
        }

        assert_eq!(got, expected);
        assert_eq!(got.len(), 3);
    }

    #[test]
    fn streaming_reassembly_arbitrary_chunk_sizes_match() {
        let mut encoded = Vec::new();
        encoded.extend(encode(10, b"alpha").unwrap());
        encoded.extend(encode(20, b"beta-beta").unwrap());

        let mut whole = Reassembler::new();
        whole.push(&encoded);
        let expected = whole.poll_all().unwrap();

        for chunk_size in [1usize, 2, 3, 5, 7, 11, 13, 17] {
            let mut r = Reassembler::new();
            let mut got = Vec::new();
            for chunk in encoded.chunks(chunk_size) {
                r.push(chunk);
                got.extend(r.poll_all().unwrap());
            }
            assert_eq!(got, expected, "mismatch at chunk_size={chunk_size}");
        }
    }

    #[test]
    fn crc_mismatch_resets_reassembly_and_recovers_on_next_packet() {
        let mut corrupt = encode(1, b"bad").unwrap();
        corrupt[HEADER_SIZE] ^= 0x01;
        let good = encode(2, b"good").unwrap();

        let mut r = Reassembler::new();
        r.push(&corrupt);
        assert!(matches!(r.poll(), Err(ProtocolError::CrcMismatch { .. })));

        r.push(&good);
        let packet = r.poll().unwrap().expect("good packet should decode");
        assert_eq!(packet.packet_type, 2);
        assert_eq!(packet.payload, b"good");
    }

    #[test]
    fn unknown_type_still_decodes_for_caller_to_ignore() {
        let encoded = encode(0xFFFF_FFFF, b"mystery").unwrap();
        let (t, p) = decode_one(&encoded).unwrap();
        assert_eq!(t, 0xFFFF_FFFF);
        assert_eq!(p, b"mystery");
    }
}
