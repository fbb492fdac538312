#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Wire vocabulary for the `lattice` scan protocol: result codes, request
//! message fields, and the framed response stream.

/// Result codes shared between responses and job abandon reasons.
pub mod codes;
/// Response frames, protocol headers, and message compression.
pub mod frame;
/// Request message representation and typed field access.
pub mod msg;

pub use codes::ResultCode;
pub use frame::{
    BinValue, CodecError, FrameFlags, ProtoType, ResponseFrame, DIGEST_LEN, PROTO_HEADER_SIZE,
    PROTO_VERSION, compress_message, decode_frames, decode_stream, parse_header, seal_message,
};
pub use msg::{
    FieldType, Info1, Info2, Info3, MsgError, MsgField, MsgOp, OpType, ScanMessage, MAX_SET_NAME_LEN,
};
