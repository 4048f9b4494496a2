use thiserror::Error;

/// Errors reported by RMA submission paths and completion events.
///
/// The engine keeps its error set small on purpose: anything the transport
/// reports is assumed reliable, so the only failure sources are bad
/// arguments, resource exhaustion, and inject-size violations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RmaError {
    /// Bad arguments, missing MR, or an access violation.
    #[error("invalid argument")]
    Inval,

    /// Allocation failure for a request, a trigger, or a CQ event.
    #[error("out of memory")]
    Nomem,

    /// Inject over the inject limit, or inject requested on a
    /// multi-fragment vector send.
    #[error("message too long")]
    Msgsize,
}

impl RmaError {
    /// The stable wire encoding of this error. Zero is reserved for success.
    #[inline]
    pub fn code(self) -> u32 {
        match self {
            RmaError::Inval => 22,
            RmaError::Nomem => 12,
            RmaError::Msgsize => 90,
        }
    }

    /// Decode a wire error field. Zero decodes to `None` (success); unknown
    /// non-zero codes collapse to [`RmaError::Inval`] so that decoding is
    /// total over whatever a peer may send.
    #[inline]
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => None,
            12 => Some(RmaError::Nomem),
            90 => Some(RmaError::Msgsize),
            _ => Some(RmaError::Inval),
        }
    }

    /// Encode an optional error the way reply packets carry it.
    #[inline]
    pub fn to_code(err: Option<Self>) -> u32 {
        err.map_or(0, Self::code)
    }
}
