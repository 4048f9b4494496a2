//! Deferred (triggered) operation capture.
//!
//! An operation submitted with [`crate::OpFlags::TRIGGER`] is not executed;
//! it is captured whole and handed to an external registry together with
//! its firing condition. Scheduling is the registry's business — when the
//! condition is met it calls [`TriggeredOp::submit`] to run the operation
//! as if it had just been issued.

use std::sync::Arc;

use super::cq::Cntr;
use super::ep::{Endpoint, PeerAddr};
use super::error::RmaError;
use super::initiator::OpFlags;
use super::mr::LocalSlice;
use super::types::{MrKey, UserContext};

/// The firing condition of a triggered operation.
#[derive(Clone)]
pub struct TriggerCond {
    pub cntr: Arc<Cntr>,
    pub threshold: u64,
}

/// A captured RMA operation. `flags` no longer carries the trigger marker.
pub enum TriggeredOp {
    Write {
        ep: Arc<Endpoint>,
        buf: LocalSlice,
        dest: PeerAddr,
        addr: u64,
        key: MrKey,
        context: UserContext,
        flags: OpFlags,
        data: u64,
    },
    Writev {
        ep: Arc<Endpoint>,
        iov: Box<[LocalSlice]>,
        dest: PeerAddr,
        addr: u64,
        key: MrKey,
        context: UserContext,
        flags: OpFlags,
        data: u64,
    },
    Read {
        ep: Arc<Endpoint>,
        buf: LocalSlice,
        src: PeerAddr,
        addr: u64,
        key: MrKey,
        context: UserContext,
        flags: OpFlags,
    },
    Readv {
        ep: Arc<Endpoint>,
        iov: Box<[LocalSlice]>,
        src: PeerAddr,
        addr: u64,
        key: MrKey,
        context: UserContext,
        flags: OpFlags,
    },
}

impl TriggeredOp {
    /// Run the captured operation.
    pub fn submit(self) -> Result<(), RmaError> {
        match self {
            TriggeredOp::Write {
                ep,
                buf,
                dest,
                addr,
                key,
                context,
                flags,
                data,
            } => ep.write_generic(buf, dest, addr, key, context, flags, data, None),
            TriggeredOp::Writev {
                ep,
                iov,
                dest,
                addr,
                key,
                context,
                flags,
                data,
            } => ep.writev_generic(&iov, dest, addr, key, context, flags, data, None),
            TriggeredOp::Read {
                ep,
                buf,
                src,
                addr,
                key,
                context,
                flags,
            } => ep.read_generic(buf, src, addr, key, context, flags, None),
            TriggeredOp::Readv {
                ep,
                iov,
                src,
                addr,
                key,
                context,
                flags,
            } => ep.readv_generic(&iov, src, addr, key, context, flags, None),
        }
    }
}

/// External registry of pending triggered operations.
pub trait TriggerRegistry: Send + Sync {
    /// Hold `op` until `cond` is satisfied.
    fn register(&self, cond: TriggerCond, op: TriggeredOp);
}
