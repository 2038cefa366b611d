//! Wire format for the tidepool storage protocol.
//!
//! Every frame is `[length:4][body:N]` where `length` is the body size in
//! bytes, excluding the length field itself. The body starts with a packed
//! 32-bit packet header; all integers are big-endian.
//!
//! Requests (client → server):
//!
//! | op | body |
//! |----|------|
//! | ADD_ENTRY | `header, master_key[20], payload` |
//! | READ_ENTRY | `header, ledger:8, entry:8` (+ `master_key[20]` when fencing) |
//! | TRIM | `header, ledger:8, last_entry:8` |
//! | AUTH | `header, opaque auth payload` |
//!
//! Responses (server → client) carry `header, status:4, ledger:8, entry:8,
//! payload` for ADD/READ; AUTH responses carry only the opaque payload.

/// Ledger identifier.
pub type LedgerId = u64;

/// Entry identifier within a ledger.
pub type EntryId = u64;

/// Sentinel entry id: ask the server for whichever entry is the last
/// committed one. All-ones bit pattern (the signed -1 of the wire protocol).
pub const LAST_ADD_CONFIRMED: EntryId = u64::MAX;

/// Fixed width of the master key token presented on writes and fencing
/// reads. The token is opaque to this layer.
pub const MASTER_KEY_LENGTH: usize = 20;

/// Master key token, fixed width enforced by the type.
pub type MasterKey = [u8; MASTER_KEY_LENGTH];

/// Protocol version emitted in every packet header.
pub const PROTOCOL_VERSION: u8 = 2;

/// Maximum inbound frame body length. Larger frames are rejected as corrupt
/// and their bytes discarded.
pub const MAX_FRAME_LENGTH: usize = 110 * 1024 * 1024;

/// Request/response opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Append an entry to a ledger.
    AddEntry = 1,
    /// Read an entry from a ledger.
    ReadEntry = 2,
    /// Authentication handshake message.
    Auth = 3,
    /// Drop entries up to an id; fire-and-forget.
    Trim = 4,
}

impl OpCode {
    /// Decode a raw opcode byte.
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(OpCode::AddEntry),
            2 => Some(OpCode::ReadEntry),
            3 => Some(OpCode::Auth),
            4 => Some(OpCode::Trim),
            _ => None,
        }
    }
}

/// Packet header flags.
pub mod flags {
    /// No flags set.
    pub const FLAG_NONE: u16 = 0;
    /// Read must also mark the ledger fenced on the server.
    pub const FLAG_DO_FENCING: u16 = 1;
}

/// Status codes reported by the server.
pub mod status {
    /// Operation succeeded.
    pub const EOK: u32 = 0;
    /// No such ledger on this server.
    pub const ENOLEDGER: u32 = 1;
    /// No such entry in the ledger.
    pub const ENOENTRY: u32 = 2;
    /// Malformed request.
    pub const EBADREQ: u32 = 100;
    /// Server-side I/O error.
    pub const EIO: u32 = 101;
    /// Unauthorized access.
    pub const EUA: u32 = 102;
    /// Protocol version mismatch.
    pub const EBADVERSION: u32 = 103;
    /// Ledger is fenced; writes refused.
    pub const EFENCED: u32 = 104;
    /// Server is read-only.
    pub const EREADONLY: u32 = 105;
    /// Entry has been trimmed away.
    pub const ETRIMMED: u32 = 106;
}

/// Wire format error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WireError {
    /// Inbound frame body exceeds [`MAX_FRAME_LENGTH`].
    #[error("frame too large: {length} bytes (max {max})")]
    FrameTooLarge {
        /// Advertised body length.
        length: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Frame body too short for the layout its opcode requires.
    #[error("short frame: need {needed} bytes, have {have}")]
    ShortFrame {
        /// Minimum bytes required.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },
}

/// Packed packet header: protocol version, opcode, flags.
///
/// Layout, most significant to least: 8-bit version, 8-bit opcode, 16-bit
/// flags. The opcode is kept raw so unknown opcodes survive decoding and can
/// be logged by the dispatcher instead of failing the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Protocol version.
    pub version: u8,
    /// Raw opcode byte.
    pub opcode: u8,
    /// Flag bits.
    pub flags: u16,
}

impl PacketHeader {
    /// Header for an outbound request of the given op.
    pub fn request(op: OpCode, flags: u16) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            opcode: op as u8,
            flags,
        }
    }

    /// Pack into the wire representation.
    pub fn to_u32(self) -> u32 {
        ((self.version as u32) << 24) | ((self.opcode as u32) << 16) | self.flags as u32
    }

    /// Unpack from the wire representation.
    pub fn from_u32(raw: u32) -> Self {
        Self {
            version: (raw >> 24) as u8,
            opcode: (raw >> 16) as u8,
            flags: raw as u16,
        }
    }

    /// Decoded opcode, if recognized.
    pub fn op(&self) -> Option<OpCode> {
        OpCode::from_u8(self.opcode)
    }
}

fn frame_with_body_len(body_len: usize) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + body_len);
    frame.extend_from_slice(&(body_len as u32).to_be_bytes());
    frame
}

/// Encode an ADD_ENTRY request. The ledger and entry ids travel inside the
/// payload, which this layer treats as opaque.
pub fn encode_add_request(master_key: &MasterKey, payload: &[u8], flags: u16) -> Vec<u8> {
    let body_len = 4 + MASTER_KEY_LENGTH + payload.len();
    let mut frame = frame_with_body_len(body_len);
    frame.extend_from_slice(&PacketHeader::request(OpCode::AddEntry, flags).to_u32().to_be_bytes());
    frame.extend_from_slice(master_key);
    frame.extend_from_slice(payload);
    frame
}

/// Encode a READ_ENTRY request.
pub fn encode_read_request(ledger_id: LedgerId, entry_id: EntryId) -> Vec<u8> {
    let mut frame = frame_with_body_len(4 + 8 + 8);
    frame.extend_from_slice(
        &PacketHeader::request(OpCode::ReadEntry, flags::FLAG_NONE)
            .to_u32()
            .to_be_bytes(),
    );
    frame.extend_from_slice(&ledger_id.to_be_bytes());
    frame.extend_from_slice(&entry_id.to_be_bytes());
    frame
}

/// Encode a READ_ENTRY request that also fences the ledger.
pub fn encode_read_fence_request(
    ledger_id: LedgerId,
    master_key: &MasterKey,
    entry_id: EntryId,
) -> Vec<u8> {
    let mut frame = frame_with_body_len(4 + 8 + 8 + MASTER_KEY_LENGTH);
    frame.extend_from_slice(
        &PacketHeader::request(OpCode::ReadEntry, flags::FLAG_DO_FENCING)
            .to_u32()
            .to_be_bytes(),
    );
    frame.extend_from_slice(&ledger_id.to_be_bytes());
    frame.extend_from_slice(&entry_id.to_be_bytes());
    frame.extend_from_slice(master_key);
    frame
}

/// Encode a TRIM request.
pub fn encode_trim_request(ledger_id: LedgerId, last_entry_id: EntryId, flags: u16) -> Vec<u8> {
    let mut frame = frame_with_body_len(4 + 8 + 8);
    frame.extend_from_slice(&PacketHeader::request(OpCode::Trim, flags).to_u32().to_be_bytes());
    frame.extend_from_slice(&ledger_id.to_be_bytes());
    frame.extend_from_slice(&last_entry_id.to_be_bytes());
    frame
}

/// Encode an AUTH request carrying an opaque auth payload.
pub fn encode_auth_request(payload: &[u8]) -> Vec<u8> {
    let mut frame = frame_with_body_len(4 + payload.len());
    frame.extend_from_slice(
        &PacketHeader::request(OpCode::Auth, flags::FLAG_NONE)
            .to_u32()
            .to_be_bytes(),
    );
    frame.extend_from_slice(payload);
    frame
}

/// A parsed server → client frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// An authentication handshake message; payload is opaque to this layer.
    Auth {
        /// Serialized auth envelope.
        payload: Vec<u8>,
    },
    /// An operation response.
    Op {
        /// The packet header, opcode possibly unrecognized.
        header: PacketHeader,
        /// Wire status code.
        status: u32,
        /// Ledger the response refers to.
        ledger_id: LedgerId,
        /// Entry the response refers to.
        entry_id: EntryId,
        /// Remaining body; the entry payload on successful reads.
        payload: Vec<u8>,
    },
}

/// Parse a server → client frame body (length prefix already stripped).
///
/// # Errors
///
/// Returns `ShortFrame` if the body is too short for its layout. Frames with
/// unrecognized opcodes still parse as `Op`; the dispatcher decides what to
/// do with them.
pub fn parse_response(body: &[u8]) -> Result<Response, WireError> {
    if body.len() < 4 {
        return Err(WireError::ShortFrame {
            needed: 4,
            have: body.len(),
        });
    }
    let header = PacketHeader::from_u32(u32::from_be_bytes([body[0], body[1], body[2], body[3]]));

    if header.op() == Some(OpCode::Auth) {
        return Ok(Response::Auth {
            payload: body[4..].to_vec(),
        });
    }

    if body.len() < 28 {
        return Err(WireError::ShortFrame {
            needed: 28,
            have: body.len(),
        });
    }
    let status = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
    let ledger_id = u64::from_be_bytes([
        body[8], body[9], body[10], body[11], body[12], body[13], body[14], body[15],
    ]);
    let entry_id = u64::from_be_bytes([
        body[16], body[17], body[18], body[19], body[20], body[21], body[22], body[23],
    ]);

    Ok(Response::Op {
        header,
        status,
        ledger_id,
        entry_id,
        payload: body[24..].to_vec(),
    })
}

/// Incremental length-prefixed frame decoder.
///
/// Feed it raw bytes as they arrive; pull complete frame bodies out with
/// [`next_frame`](FrameDecoder::next_frame). A frame whose advertised body
/// length exceeds the maximum is reported once as
/// [`WireError::FrameTooLarge`] and its bytes are discarded as they stream
/// in, so the decoder resynchronizes at the next frame boundary.
pub struct FrameDecoder {
    buf: Vec<u8>,
    discard_remaining: usize,
    max_frame: usize,
}

impl FrameDecoder {
    /// Create a decoder with the given maximum frame body length.
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            discard_remaining: 0,
            max_frame,
        }
    }

    /// Feed inbound bytes into the decoder.
    pub fn extend(&mut self, mut data: &[u8]) {
        if self.discard_remaining > 0 {
            let skip = self.discard_remaining.min(data.len());
            self.discard_remaining -= skip;
            data = &data[skip..];
        }
        if !data.is_empty() {
            self.buf.extend_from_slice(data);
        }
    }

    /// Try to extract the next complete frame body.
    ///
    /// # Errors
    ///
    /// Returns `FrameTooLarge` exactly once per oversized frame; the decoder
    /// remains usable and keeps discarding that frame's bytes.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, WireError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;

        if length > self.max_frame {
            let have = self.buf.len() - 4;
            if have >= length {
                self.buf.drain(..4 + length);
            } else {
                self.discard_remaining = length - have;
                self.buf.clear();
            }
            return Err(WireError::FrameTooLarge {
                length,
                max: self.max_frame,
            });
        }

        if self.buf.len() < 4 + length {
            return Ok(None);
        }
        let frame = self.buf[4..4 + length].to_vec();
        self.buf.drain(..4 + length);
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master_key(fill: u8) -> MasterKey {
        [fill; MASTER_KEY_LENGTH]
    }

    #[test]
    fn test_packet_header_roundtrip() {
        let header = PacketHeader {
            version: PROTOCOL_VERSION,
            opcode: OpCode::ReadEntry as u8,
            flags: flags::FLAG_DO_FENCING,
        };
        let decoded = PacketHeader::from_u32(header.to_u32());
        assert_eq!(header, decoded);
        assert_eq!(decoded.op(), Some(OpCode::ReadEntry));
    }

    #[test]
    fn test_packet_header_bit_layout() {
        let header = PacketHeader {
            version: 2,
            opcode: 1,
            flags: 1,
        };
        assert_eq!(header.to_u32(), 0x0201_0001);
    }

    #[test]
    fn test_unknown_opcode_survives_header_decode() {
        let header = PacketHeader {
            version: PROTOCOL_VERSION,
            opcode: 0x7f,
            flags: flags::FLAG_NONE,
        };
        let decoded = PacketHeader::from_u32(header.to_u32());
        assert_eq!(decoded.opcode, 0x7f);
        assert_eq!(decoded.op(), None);
    }

    #[test]
    fn test_add_request_layout() {
        let key = master_key(0xAB);
        let frame = encode_add_request(&key, b"hi", flags::FLAG_NONE);

        // length field excludes itself
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
        assert_eq!(len, 4 + MASTER_KEY_LENGTH + 2);

        let header = PacketHeader::from_u32(u32::from_be_bytes([
            frame[4], frame[5], frame[6], frame[7],
        ]));
        assert_eq!(header.version, PROTOCOL_VERSION);
        assert_eq!(header.op(), Some(OpCode::AddEntry));
        assert_eq!(header.flags, flags::FLAG_NONE);

        assert_eq!(&frame[8..8 + MASTER_KEY_LENGTH], &key);
        assert_eq!(&frame[8 + MASTER_KEY_LENGTH..], b"hi");
    }

    #[test]
    fn test_read_request_layout() {
        let frame = encode_read_request(5, 7);
        let mut dec = FrameDecoder::new(MAX_FRAME_LENGTH);
        dec.extend(&frame);
        let body = dec.next_frame().expect("decode").expect("complete frame");

        let header = PacketHeader::from_u32(u32::from_be_bytes([body[0], body[1], body[2], body[3]]));
        assert_eq!(header.op(), Some(OpCode::ReadEntry));
        assert_eq!(header.flags, flags::FLAG_NONE);
        assert_eq!(u64::from_be_bytes(body[4..12].try_into().expect("slice")), 5);
        assert_eq!(u64::from_be_bytes(body[12..20].try_into().expect("slice")), 7);
    }

    #[test]
    fn test_read_fence_request_appends_master_key() {
        let key = master_key(0x11);
        let frame = encode_read_fence_request(5, &key, LAST_ADD_CONFIRMED);
        let body = &frame[4..];

        let header = PacketHeader::from_u32(u32::from_be_bytes([body[0], body[1], body[2], body[3]]));
        assert_eq!(header.flags, flags::FLAG_DO_FENCING);
        assert_eq!(
            u64::from_be_bytes(body[12..20].try_into().expect("slice")),
            LAST_ADD_CONFIRMED
        );
        assert_eq!(&body[20..], &key);
    }

    #[test]
    fn test_trim_request_layout() {
        let frame = encode_trim_request(9, 100, flags::FLAG_NONE);
        let body = &frame[4..];
        let header = PacketHeader::from_u32(u32::from_be_bytes([body[0], body[1], body[2], body[3]]));
        assert_eq!(header.op(), Some(OpCode::Trim));
        assert_eq!(body.len(), 20);
    }

    #[test]
    fn test_parse_op_response() {
        let mut body = Vec::new();
        body.extend_from_slice(
            &PacketHeader::request(OpCode::ReadEntry, flags::FLAG_NONE)
                .to_u32()
                .to_be_bytes(),
        );
        body.extend_from_slice(&status::EOK.to_be_bytes());
        body.extend_from_slice(&5u64.to_be_bytes());
        body.extend_from_slice(&42u64.to_be_bytes());
        body.extend_from_slice(b"payload");

        match parse_response(&body).expect("parse") {
            Response::Op {
                header,
                status: rc,
                ledger_id,
                entry_id,
                payload,
            } => {
                assert_eq!(header.op(), Some(OpCode::ReadEntry));
                assert_eq!(rc, status::EOK);
                assert_eq!(ledger_id, 5);
                assert_eq!(entry_id, 42);
                assert_eq!(payload, b"payload");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_parse_auth_response_has_no_status_fields() {
        let frame = encode_auth_request(b"{}");
        match parse_response(&frame[4..]).expect("parse") {
            Response::Auth { payload } => assert_eq!(payload, b"{}"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_parse_short_response_rejected() {
        let result = parse_response(&[0, 0]);
        assert!(matches!(result, Err(WireError::ShortFrame { .. })));

        // valid header but truncated status fields
        let mut body = Vec::new();
        body.extend_from_slice(
            &PacketHeader::request(OpCode::AddEntry, flags::FLAG_NONE)
                .to_u32()
                .to_be_bytes(),
        );
        body.extend_from_slice(&[0u8; 10]);
        assert!(matches!(
            parse_response(&body),
            Err(WireError::ShortFrame { needed: 28, .. })
        ));
    }

    #[test]
    fn test_decoder_incremental() {
        let frame = encode_read_request(1, 2);
        let mut dec = FrameDecoder::new(MAX_FRAME_LENGTH);

        dec.extend(&frame[..3]);
        assert!(dec.next_frame().expect("partial").is_none());

        dec.extend(&frame[3..10]);
        assert!(dec.next_frame().expect("partial").is_none());

        dec.extend(&frame[10..]);
        let body = dec.next_frame().expect("decode").expect("complete frame");
        assert_eq!(body.len(), 20);
        assert!(dec.next_frame().expect("drained").is_none());
    }

    #[test]
    fn test_decoder_two_frames_in_one_read() {
        let mut data = encode_read_request(1, 2);
        data.extend_from_slice(&encode_read_request(3, 4));

        let mut dec = FrameDecoder::new(MAX_FRAME_LENGTH);
        dec.extend(&data);
        let first = dec.next_frame().expect("decode").expect("first frame");
        let second = dec.next_frame().expect("decode").expect("second frame");
        assert_eq!(u64::from_be_bytes(first[4..12].try_into().expect("slice")), 1);
        assert_eq!(u64::from_be_bytes(second[4..12].try_into().expect("slice")), 3);
    }

    #[test]
    fn test_frame_at_max_length_parses() {
        let max = 64;
        let mut dec = FrameDecoder::new(max);
        let body = vec![0xCD; max];
        let mut data = (max as u32).to_be_bytes().to_vec();
        data.extend_from_slice(&body);

        dec.extend(&data);
        let frame = dec.next_frame().expect("decode").expect("complete frame");
        assert_eq!(frame, body);
    }

    #[test]
    fn test_frame_over_max_length_rejected_and_discarded() {
        let max = 64;
        let mut dec = FrameDecoder::new(max);
        let mut data = ((max + 1) as u32).to_be_bytes().to_vec();
        data.extend_from_slice(&vec![0xEE; max + 1]);
        // a valid frame right behind the oversized one
        data.extend_from_slice(&encode_read_request(5, 6));

        dec.extend(&data);
        assert!(matches!(
            dec.next_frame(),
            Err(WireError::FrameTooLarge { length, .. }) if length == max + 1
        ));

        let body = dec.next_frame().expect("decode").expect("next frame survives");
        assert_eq!(body.len(), 20);
    }

    #[test]
    fn test_oversized_frame_discarded_across_reads() {
        let max = 16;
        let mut dec = FrameDecoder::new(max);
        let mut data = (1000u32).to_be_bytes().to_vec();
        data.extend_from_slice(&[0u8; 100]);

        dec.extend(&data);
        assert!(matches!(dec.next_frame(), Err(WireError::FrameTooLarge { .. })));

        // stream the remaining 900 junk bytes, then a good frame
        dec.extend(&[0u8; 500]);
        assert!(dec.next_frame().expect("still discarding").is_none());
        dec.extend(&[0u8; 400]);
        dec.extend(&encode_read_request(8, 9));
        let body = dec.next_frame().expect("decode").expect("resynchronized");
        assert_eq!(u64::from_be_bytes(body[4..12].try_into().expect("slice")), 8);
    }

    #[test]
    fn test_add_request_roundtrip_through_decoder() {
        let key = master_key(0x42);
        let payload = b"entry bytes";
        let frame = encode_add_request(&key, payload, flags::FLAG_NONE);

        let mut dec = FrameDecoder::new(MAX_FRAME_LENGTH);
        dec.extend(&frame);
        let body = dec.next_frame().expect("decode").expect("complete frame");

        let header = PacketHeader::from_u32(u32::from_be_bytes([body[0], body[1], body[2], body[3]]));
        assert_eq!(header.op(), Some(OpCode::AddEntry));
        assert_eq!(&body[4..4 + MASTER_KEY_LENGTH], &key);
        assert_eq!(&body[4 + MASTER_KEY_LENGTH..], payload);
    }
}
