use std::io::{Read as _, Write as _};

use bytes::{BufMut, Bytes, BytesMut};

use crate::codes::ResultCode;

/// Protocol version accepted on both directions of the wire.
pub const PROTO_VERSION: u8 = 2;

/// Size of the protocol header prepended to every message.
pub const PROTO_HEADER_SIZE: usize = 8;

/// Digest length in bytes.
pub const DIGEST_LEN: usize = 20;

/// Largest payload expressible in the 6-byte header size field.
const MAX_PROTO_BODY: u64 = (1 << 48) - 1;

/// Protocol-level message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtoType {
    /// A plain framed message.
    Message = 3,
    /// A zlib-compressed message; the body carries the uncompressed length
    /// followed by the deflated plain message.
    Compressed = 4,
}

bitflags::bitflags! {
    /// Per-frame flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        /// Terminal fin frame; the result code is the job's abandon reason.
        const LAST = 0x01;
        /// Per-partition completion marker.
        const PARTITION_DONE = 0x02;
        /// Aggregation value frame.
        const AGGR_VALUE = 0x04;
        /// Record frame carries metadata only.
        const NO_BIN_DATA = 0x08;
    }
}

/// A bin name and its serialized value, as carried by a record frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinValue {
    /// Bin name.
    pub name: String,
    /// Serialized bin value, opaque at this layer.
    pub value: Bytes,
}

/// One frame of the scan response stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseFrame {
    /// One record, with metadata and optionally its bins.
    Record {
        /// Record digest.
        digest: [u8; DIGEST_LEN],
        /// Record generation.
        generation: u32,
        /// Expiration, epoch seconds (0 = never).
        expiration: u32,
        /// Set name, empty when the record has no set.
        set_name: String,
        /// True when bin data was withheld (metadata-only scan).
        no_bin_data: bool,
        /// Bin values; empty for metadata-only frames.
        bins: Vec<BinValue>,
    },
    /// Completion marker for one requested partition.
    PartitionDone {
        /// Partition outcome.
        result: ResultCode,
        /// Partition id.
        pid: u32,
    },
    /// One aggregation result value.
    Value {
        /// `Ok` for values, an error code for a failure report.
        result: ResultCode,
        /// Serialized value (or error message for a failure report).
        data: Bytes,
    },
    /// Terminal frame carrying the job's abandon code.
    Fin {
        /// Abandon reason, `Ok` for a clean completion.
        result: ResultCode,
    },
}

/// Frame or header decoding failure.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Ran out of bytes mid-structure.
    #[error("truncated message")]
    Truncated,
    /// Header carried an unsupported protocol version.
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    /// Header carried an unknown message type.
    #[error("unknown message type {0}")]
    BadType(u8),
    /// Frame carried an unknown result code.
    #[error("unknown result code {0}")]
    BadCode(u8),
    /// Frame carried unknown flag bits.
    #[error("unknown frame flags {0:#04x}")]
    BadFlags(u8),
    /// Message body exceeds the 6-byte size field.
    #[error("message exceeds maximum size")]
    Oversize,
    /// A name does not fit its length prefix.
    #[error("name exceeds length limit")]
    NameTooLong,
    /// Zlib inflation failed.
    #[error("decompression failed: {0}")]
    Inflate(#[source] std::io::Error),
    /// Zlib deflation failed.
    #[error("compression failed: {0}")]
    Deflate(#[source] std::io::Error),
}

impl ResponseFrame {
    /// Appends the encoded frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Self::Record { digest, generation, expiration, set_name, no_bin_data, bins } => {
                let mut flags = FrameFlags::empty();
                if *no_bin_data {
                    flags |= FrameFlags::NO_BIN_DATA;
                }
                buf.put_u8(ResultCode::Ok.as_u8());
                buf.put_u8(flags.bits());
                buf.put_slice(digest);
                buf.put_u32(*generation);
                buf.put_u32(*expiration);
                buf.put_u8(set_name.len().min(u8::MAX as usize) as u8);
                buf.put_slice(&set_name.as_bytes()[..set_name.len().min(u8::MAX as usize)]);
                buf.put_u16(bins.len().min(u16::MAX as usize) as u16);
                for bin in bins {
                    buf.put_u8(bin.name.len().min(u8::MAX as usize) as u8);
                    buf.put_slice(&bin.name.as_bytes()[..bin.name.len().min(u8::MAX as usize)]);
                    buf.put_u32(bin.value.len() as u32);
                    buf.put_slice(&bin.value);
                }
            }
            Self::PartitionDone { result, pid } => {
                buf.put_u8(result.as_u8());
                buf.put_u8(FrameFlags::PARTITION_DONE.bits());
                buf.put_u16(*pid as u16);
            }
            Self::Value { result, data } => {
                buf.put_u8(result.as_u8());
                buf.put_u8(FrameFlags::AGGR_VALUE.bits());
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
            }
            Self::Fin { result } => {
                buf.put_u8(result.as_u8());
                buf.put_u8(FrameFlags::LAST.bits());
            }
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            return Err(CodecError::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16_be(&mut self) -> Result<u16, CodecError> {
        let raw = self.take(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn u32_be(&mut self) -> Result<u32, CodecError> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn name(&mut self) -> Result<String, CodecError> {
        let len = self.u8()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::NameTooLong)
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

fn decode_one(reader: &mut Reader<'_>) -> Result<ResponseFrame, CodecError> {
    let raw_code = reader.u8()?;
    let result = ResultCode::from_u8(raw_code).ok_or(CodecError::BadCode(raw_code))?;
    let raw_flags = reader.u8()?;
    let flags = FrameFlags::from_bits(raw_flags).ok_or(CodecError::BadFlags(raw_flags))?;

    if flags.contains(FrameFlags::LAST) {
        return Ok(ResponseFrame::Fin { result });
    }
    if flags.contains(FrameFlags::PARTITION_DONE) {
        let pid = reader.u16_be()? as u32;
        return Ok(ResponseFrame::PartitionDone { result, pid });
    }
    if flags.contains(FrameFlags::AGGR_VALUE) {
        let len = reader.u32_be()? as usize;
        let data = Bytes::copy_from_slice(reader.take(len)?);
        return Ok(ResponseFrame::Value { result, data });
    }

    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(reader.take(DIGEST_LEN)?);
    let generation = reader.u32_be()?;
    let expiration = reader.u32_be()?;
    let set_name = reader.name()?;
    let n_bins = reader.u16_be()? as usize;
    let mut bins = Vec::with_capacity(n_bins);
    for _ in 0..n_bins {
        let name = reader.name()?;
        let len = reader.u32_be()? as usize;
        let value = Bytes::copy_from_slice(reader.take(len)?);
        bins.push(BinValue { name, value });
    }
    Ok(ResponseFrame::Record {
        digest,
        generation,
        expiration,
        set_name,
        no_bin_data: flags.contains(FrameFlags::NO_BIN_DATA),
        bins,
    })
}

/// Decodes all frames from one message payload.
pub fn decode_frames(payload: &[u8]) -> Result<Vec<ResponseFrame>, CodecError> {
    let mut reader = Reader { buf: payload };
    let mut frames = Vec::new();
    while !reader.is_empty() {
        frames.push(decode_one(&mut reader)?);
    }
    Ok(frames)
}

/// Fills the protocol header at the front of `message`.
///
/// `message` must start with [`PROTO_HEADER_SIZE`] reserved bytes followed by
/// the frame payload.
pub fn seal_message(message: &mut [u8]) -> Result<(), CodecError> {
    if message.len() < PROTO_HEADER_SIZE {
        return Err(CodecError::Truncated);
    }
    let body = (message.len() - PROTO_HEADER_SIZE) as u64;
    if body > MAX_PROTO_BODY {
        return Err(CodecError::Oversize);
    }
    message[0] = PROTO_VERSION;
    message[1] = ProtoType::Message as u8;
    message[2..PROTO_HEADER_SIZE].copy_from_slice(&body.to_be_bytes()[2..]);
    Ok(())
}

/// Parses a protocol header, returning the message type and body length.
pub fn parse_header(raw: &[u8]) -> Result<(ProtoType, usize), CodecError> {
    if raw.len() < PROTO_HEADER_SIZE {
        return Err(CodecError::Truncated);
    }
    if raw[0] != PROTO_VERSION {
        return Err(CodecError::BadVersion(raw[0]));
    }
    let ptype = match raw[1] {
        3 => ProtoType::Message,
        4 => ProtoType::Compressed,
        other => return Err(CodecError::BadType(other)),
    };
    let mut sz = [0u8; 8];
    sz[2..].copy_from_slice(&raw[2..PROTO_HEADER_SIZE]);
    Ok((ptype, u64::from_be_bytes(sz) as usize))
}

/// Wraps a sealed message into a compressed message.
pub fn compress_message(sealed: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder =
        flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(sealed).map_err(CodecError::Deflate)?;
    let deflated = encoder.finish().map_err(CodecError::Deflate)?;

    let body = 8 + deflated.len();
    let mut out = Vec::with_capacity(PROTO_HEADER_SIZE + body);
    out.extend_from_slice(&[0u8; PROTO_HEADER_SIZE]);
    out.extend_from_slice(&(sealed.len() as u64).to_be_bytes());
    out.extend_from_slice(&deflated);
    if body as u64 > MAX_PROTO_BODY {
        return Err(CodecError::Oversize);
    }
    out[0] = PROTO_VERSION;
    out[1] = ProtoType::Compressed as u8;
    let sz = (body as u64).to_be_bytes();
    out[2..PROTO_HEADER_SIZE].copy_from_slice(&sz[2..]);
    Ok(out)
}

/// Decodes a whole response stream (a concatenation of sealed, possibly
/// compressed messages) into its frames.
pub fn decode_stream(stream: &[u8]) -> Result<Vec<ResponseFrame>, CodecError> {
    let mut frames = Vec::new();
    let mut rest = stream;
    while !rest.is_empty() {
        let (ptype, body_len) = parse_header(rest)?;
        rest = &rest[PROTO_HEADER_SIZE..];
        if rest.len() < body_len {
            return Err(CodecError::Truncated);
        }
        let (body, tail) = rest.split_at(body_len);
        rest = tail;
        match ptype {
            ProtoType::Message => frames.extend(decode_frames(body)?),
            ProtoType::Compressed => {
                if body.len() < 8 {
                    return Err(CodecError::Truncated);
                }
                let mut inflated = Vec::new();
                flate2::read::ZlibDecoder::new(&body[8..])
                    .read_to_end(&mut inflated)
                    .map_err(CodecError::Inflate)?;
                let (inner_type, inner_len) = parse_header(&inflated)?;
                if inner_type != ProtoType::Message
                    || inflated.len() != PROTO_HEADER_SIZE + inner_len
                {
                    return Err(CodecError::Truncated);
                }
                frames.extend(decode_frames(&inflated[PROTO_HEADER_SIZE..])?);
            }
        }
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed(frames: &[ResponseFrame]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0u8; PROTO_HEADER_SIZE]);
        for frame in frames {
            frame.encode_into(&mut buf);
        }
        let mut out = buf.to_vec();
        seal_message(&mut out).unwrap();
        out
    }

    #[test]
    fn header_round_trip() {
        let msg = sealed(&[ResponseFrame::Fin { result: ResultCode::Ok }]);
        let (ptype, body) = parse_header(&msg).unwrap();
        assert_eq!(ptype, ProtoType::Message);
        assert_eq!(body, msg.len() - PROTO_HEADER_SIZE);
    }

    #[test]
    fn record_frame_round_trip() {
        let frame = ResponseFrame::Record {
            digest: [7u8; DIGEST_LEN],
            generation: 3,
            expiration: 86_400,
            set_name: "events".to_string(),
            no_bin_data: false,
            bins: vec![
                BinValue { name: "a".to_string(), value: Bytes::from_static(b"one") },
                BinValue { name: "b".to_string(), value: Bytes::from_static(b"") },
            ],
        };
        let msg = sealed(&[frame.clone()]);
        let frames = decode_stream(&msg).unwrap();
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn marker_frames_round_trip() {
        let input = vec![
            ResponseFrame::PartitionDone { result: ResultCode::Unavailable, pid: 4095 },
            ResponseFrame::Value {
                result: ResultCode::Ok,
                data: Bytes::from_static(b"\x01\x02"),
            },
            ResponseFrame::Fin { result: ResultCode::UserAbort },
        ];
        let msg = sealed(&input);
        assert_eq!(decode_stream(&msg).unwrap(), input);
    }

    #[test]
    fn compressed_message_round_trip() {
        let frame = ResponseFrame::Record {
            digest: [1u8; DIGEST_LEN],
            generation: 1,
            expiration: 0,
            set_name: String::new(),
            no_bin_data: true,
            bins: Vec::new(),
        };
        let plain = sealed(&[frame.clone()]);
        let compressed = compress_message(&plain).unwrap();
        let (ptype, _) = parse_header(&compressed).unwrap();
        assert_eq!(ptype, ProtoType::Compressed);

        // A stream may interleave plain and compressed messages.
        let mut stream = compressed;
        stream.extend_from_slice(&sealed(&[ResponseFrame::Fin { result: ResultCode::Ok }]));
        let frames = decode_stream(&stream).unwrap();
        assert_eq!(frames, vec![frame, ResponseFrame::Fin { result: ResultCode::Ok }]);
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let msg = sealed(&[ResponseFrame::Fin { result: ResultCode::Ok }]);
        assert!(matches!(
            decode_stream(&msg[..msg.len() - 1]),
            Err(CodecError::Truncated)
        ));
    }
}
