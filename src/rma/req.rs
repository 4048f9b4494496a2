//! Request records: the unit of lifetime tracking for in-flight RMA.

use std::sync::Arc;

use super::cq::CqFlags;
use super::ep::Endpoint;
use super::error::RmaError;
use super::mr::{LocalSlice, Mr};
use super::types::{EpId, MrKey, UserContext, Vl};
use super::wire::AmOp;

/// Destination of an initiator read.
pub(crate) enum ReadDst {
    Flat(LocalSlice),
    Vector(Box<[LocalSlice]>),
}

/// Initiator-side write bookkeeping.
///
/// `addr` and `key` are not consulted by the reply path; they are kept for
/// trace diagnostics at completion.
pub(crate) struct WriteReq {
    pub len: usize,
    pub addr: u64,
    pub key: MrKey,
    pub context: UserContext,
}

/// Initiator-side read bookkeeping.
pub(crate) struct ReadReq {
    pub dst: ReadDst,
    pub len: usize,
    pub len_read: usize,
    pub addr: u64,
    pub key: MrKey,
    pub context: UserContext,
}

/// Target-side capture of an accepted long write, pending its MQ receive.
pub(crate) struct RemoteWriteReq {
    /// Destination window inside the validated MR.
    pub window: LocalSlice,
    pub len: usize,
    pub context: u64,
    pub peer: EpId,
    pub vl: Vl,
    pub peer_vl: Vl,
    pub data: Option<u64>,
    /// Borrowed for the life of the request so a concurrent deregistration
    /// cannot invalidate the window mid-transfer.
    pub mr: Arc<Mr>,
}

/// Target-side capture of an accepted long read, pending its MQ send.
pub(crate) struct RemoteReadReq {
    pub window: LocalSlice,
    pub context: u64,
    pub peer: EpId,
    pub vl: Vl,
    pub peer_vl: Vl,
    /// Borrowed for the life of the request, as in [`RemoteWriteReq`].
    pub mr: Arc<Mr>,
}

/// Variant payload of a request record.
pub(crate) enum ReqPayload {
    Write(WriteReq),
    Read(ReadReq),
    RemoteWrite(RemoteWriteReq),
    RemoteRead(RemoteReadReq),
}

/// A request record. The shared prefix tracks the opcode that created the
/// request, the owning endpoint, the sticky error, and completion
/// reporting; the payload is per-opcode.
pub(crate) struct Request {
    pub op: AmOp,
    pub ep: Arc<Endpoint>,
    /// First error observed; write-once.
    pub error: Option<RmaError>,
    /// Selective-completion suppression of the send CQ event.
    pub no_event: bool,
    pub cq_flags: CqFlags,
    pub payload: ReqPayload,
}

impl Request {
    /// Fold an operation error into the sticky error: the first non-zero
    /// error wins.
    #[inline]
    pub fn fold_error(&mut self, err: Option<RmaError>) {
        if self.error.is_none() {
            self.error = err;
        }
    }
}
