use bytes::Bytes;

/// Longest accepted set name, in bytes.
pub const MAX_SET_NAME_LEN: usize = 31;

bitflags::bitflags! {
    /// Read-side info bits of a request message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Info1: u8 {
        /// Request reads record data.
        const READ = 0x01;
        /// Return record metadata only, no bin data.
        const GET_NO_BINS = 0x20;
    }
}

bitflags::bitflags! {
    /// Write-side info bits of a request message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Info2: u8 {
        /// Request writes record data.
        const WRITE = 0x01;
        /// Deletes leave a durable tombstone.
        const DURABLE_DELETE = 0x10;
    }
}

bitflags::bitflags! {
    /// Extended info bits of a request message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Info3: u8 {
        /// Writes may only update existing records.
        const UPDATE_ONLY = 0x08;
        /// Writes replace the record instead of merging bins.
        const REPLACE_ONLY = 0x20;
    }
}

impl Default for Info1 {
    fn default() -> Self {
        Self::empty()
    }
}

impl Default for Info2 {
    fn default() -> Self {
        Self::empty()
    }
}

impl Default for Info3 {
    fn default() -> Self {
        Self::empty()
    }
}

/// Typed field tags carried by a request message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldType {
    /// Target namespace name.
    Namespace = 0,
    /// Target set name.
    Set = 1,
    /// Client-assigned job id (big-endian u64).
    Trid = 7,
    /// Two option bytes: priority nibble + cluster-change bit, sample percent.
    ScanOptions = 8,
    /// Socket timeout in milliseconds (big-endian u32, 0 = infinite).
    SocketTimeout = 9,
    /// Target records per second (big-endian u32, 0 = unlimited).
    RecsPerSec = 10,
    /// Little-endian u16 partition ids.
    PidArray = 11,
    /// 20-byte resume digests, one partition inferred per digest.
    DigestArray = 12,
    /// Absolute sample cap (big-endian u64).
    SampleMax = 13,
    /// Opaque compiled-predicate bytes.
    Predexp = 21,
    /// UDF module file name.
    UdfFilename = 30,
    /// UDF function name.
    UdfFunction = 31,
    /// Serialized UDF argument list.
    UdfArglist = 32,
    /// UDF scan sub-operation (1 = aggregate, 2 = background).
    UdfOp = 33,
}

/// One typed field of a request message.
#[derive(Debug, Clone)]
pub struct MsgField {
    /// Field tag.
    pub ftype: FieldType,
    /// Raw field payload.
    pub data: Bytes,
}

/// Bin operation codes carried by a request message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpType {
    /// Read a bin (used as a projection list on basic scans).
    Read = 1,
    /// Write a bin.
    Write = 2,
    /// Arithmetic increment.
    Incr = 5,
    /// Append to a bin value.
    Append = 9,
    /// Prepend to a bin value.
    Prepend = 10,
    /// Delete a bin.
    Delete = 14,
}

/// One bin operation of a request message.
#[derive(Debug, Clone)]
pub struct MsgOp {
    /// Operation code.
    pub op: OpType,
    /// Target bin name.
    pub bin: String,
    /// Operand payload, opaque to the scan core.
    pub value: Bytes,
}

/// Field decoding failure. Maps onto a `Parameter` result code.
#[derive(Debug, thiserror::Error)]
pub enum MsgError {
    /// A field payload has an unexpected byte length.
    #[error("field {0:?} has invalid size {1}")]
    FieldSize(FieldType, usize),
    /// A string field is not valid UTF-8.
    #[error("field {0:?} is not valid UTF-8")]
    FieldUtf8(FieldType),
}

/// A parsed scan request message.
///
/// Wire framing happens upstream; the scan core receives the info bits, the
/// typed field list, and the bin operations, then validates field shapes
/// itself.
#[derive(Debug, Clone, Default)]
pub struct ScanMessage {
    /// Read-side info bits.
    pub info1: Info1,
    /// Write-side info bits.
    pub info2: Info2,
    /// Extended info bits.
    pub info3: Info3,
    /// Typed fields, at most one per tag.
    pub fields: Vec<MsgField>,
    /// Bin operations.
    pub ops: Vec<MsgOp>,
}

impl ScanMessage {
    /// Returns the raw payload of `ftype`, if the field is present.
    pub fn field(&self, ftype: FieldType) -> Option<&Bytes> {
        self.fields.iter().find(|f| f.ftype == ftype).map(|f| &f.data)
    }

    /// Adds a field, replacing any prior field of the same tag.
    pub fn set_field(&mut self, ftype: FieldType, data: impl Into<Bytes>) {
        self.fields.retain(|f| f.ftype != ftype);
        self.fields.push(MsgField { ftype, data: data.into() });
    }

    /// Decodes `ftype` as UTF-8 text.
    pub fn str_field(&self, ftype: FieldType) -> Result<Option<&str>, MsgError> {
        match self.field(ftype) {
            None => Ok(None),
            Some(data) => std::str::from_utf8(data)
                .map(Some)
                .map_err(|_| MsgError::FieldUtf8(ftype)),
        }
    }

    /// Decodes `ftype` as a single byte.
    pub fn u8_field(&self, ftype: FieldType) -> Result<Option<u8>, MsgError> {
        match self.field(ftype) {
            None => Ok(None),
            Some(data) if data.len() == 1 => Ok(Some(data[0])),
            Some(data) => Err(MsgError::FieldSize(ftype, data.len())),
        }
    }

    /// Decodes `ftype` as a big-endian u32.
    pub fn u32_be_field(&self, ftype: FieldType) -> Result<Option<u32>, MsgError> {
        match self.field(ftype) {
            None => Ok(None),
            Some(data) => {
                let raw: [u8; 4] = data
                    .as_ref()
                    .try_into()
                    .map_err(|_| MsgError::FieldSize(ftype, data.len()))?;
                Ok(Some(u32::from_be_bytes(raw)))
            }
        }
    }

    /// Decodes `ftype` as a big-endian u64.
    pub fn u64_be_field(&self, ftype: FieldType) -> Result<Option<u64>, MsgError> {
        match self.field(ftype) {
            None => Ok(None),
            Some(data) => {
                let raw: [u8; 8] = data
                    .as_ref()
                    .try_into()
                    .map_err(|_| MsgError::FieldSize(ftype, data.len()))?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
        }
    }

    /// Decodes `ftype` as little-endian u16 values.
    pub fn u16_le_array_field(&self, ftype: FieldType) -> Result<Option<Vec<u16>>, MsgError> {
        match self.field(ftype) {
            None => Ok(None),
            Some(data) => {
                if data.len() % 2 != 0 {
                    return Err(MsgError::FieldSize(ftype, data.len()));
                }
                Ok(Some(
                    data.chunks_exact(2)
                        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                        .collect(),
                ))
            }
        }
    }
}
