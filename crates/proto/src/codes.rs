use std::fmt;

/// Wire result code.
///
/// The same numeric space is used for synchronous request rejections, for
/// per-partition completion markers, and as the abandon reason carried by a
/// scan's terminal fin message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ResultCode {
    /// Success.
    Ok = 0,
    /// Unclassified server-side failure.
    Unknown = 1,
    /// Named entity (e.g. a set on a whole-namespace scan) does not exist.
    NotFound = 2,
    /// Malformed or out-of-range request parameter.
    Parameter = 4,
    /// Cluster key diverged while a fail-on-cluster-change scan was running,
    /// or migrations were in progress when one was started.
    ClusterKeyMismatch = 7,
    /// Request-level timeout.
    Timeout = 9,
    /// Partition is not mastered by this node.
    Unavailable = 11,
    /// Job was cancelled by an operator or client abort.
    UserAbort = 15,
    /// Feature combination the variant does not support.
    UnsupportedFeature = 16,
    /// Operation administratively disabled.
    Forbidden = 22,
    /// Per-namespace active job cap reached for the variant.
    JobLimit = 54,
    /// Streaming write to the client failed.
    ResponseError = 61,
    /// Streaming write to the client timed out.
    ResponseTimeout = 62,
}

impl ResultCode {
    /// Wire value.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses a wire value back into a code.
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Ok),
            1 => Some(Self::Unknown),
            2 => Some(Self::NotFound),
            4 => Some(Self::Parameter),
            7 => Some(Self::ClusterKeyMismatch),
            9 => Some(Self::Timeout),
            11 => Some(Self::Unavailable),
            15 => Some(Self::UserAbort),
            16 => Some(Self::UnsupportedFeature),
            22 => Some(Self::Forbidden),
            54 => Some(Self::JobLimit),
            61 => Some(Self::ResponseError),
            62 => Some(Self::ResponseTimeout),
            _ => None,
        }
    }

    /// Lowercase tag used in logs.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Unknown => "unknown",
            Self::NotFound => "not-found",
            Self::Parameter => "parameter",
            Self::ClusterKeyMismatch => "cluster-key-mismatch",
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
            Self::UserAbort => "user-abort",
            Self::UnsupportedFeature => "unsupported-feature",
            Self::Forbidden => "forbidden",
            Self::JobLimit => "job-limit",
            Self::ResponseError => "response-error",
            Self::ResponseTimeout => "response-timeout",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
