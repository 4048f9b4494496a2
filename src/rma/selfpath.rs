//! The self path: RMA executed fully in-process when the peer is local.
//!
//! When a destination resolves to the initiating domain there is no wire
//! to cross; the engine validates the MR, copies directly, and posts the
//! exact completion set the wired path would produce, all before the
//! submitting call returns.

use std::sync::Arc;

use super::cq::{CqEvent, CqFlags};
use super::ep::Endpoint;
use super::error::RmaError;
use super::mr::{iov_len, LocalSlice, Permission, RmaMem};
use super::types::{MrKey, UserContext, Vl};
use super::wire::AmOp;
use crate::OpFlags;

/// The local buffer of a self-path operation.
pub(crate) enum SelfBuf<'a> {
    Flat(&'a LocalSlice),
    Vector(&'a [LocalSlice]),
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn rma_self(
    op: AmOp,
    ep: &Arc<Endpoint>,
    dst_vl: Vl,
    buf: SelfBuf<'_>,
    addr: u64,
    key: MrKey,
    context: UserContext,
    flags: OpFlags,
    data: u64,
) -> Result<(), RmaError> {
    let domain = ep.domain();
    let dst_ep = domain.ep(dst_vl);

    let (access, cq_flags, is_write) = match op {
        AmOp::ReqWrite | AmOp::ReqWritev => (
            Permission::REMOTE_WRITE,
            CqFlags::WRITE | CqFlags::RMA,
            true,
        ),
        AmOp::ReqRead | AmOp::ReqReadv => {
            (Permission::REMOTE_READ, CqFlags::READ | CqFlags::RMA, false)
        }
        _ => return Err(RmaError::Inval),
    };
    let len = match buf {
        SelfBuf::Flat(s) => s.len(),
        SelfBuf::Vector(v) => iov_len(v),
    };

    let mut err = Ok(());
    let mut op_error = None;
    match domain.mr(key) {
        None => op_error = Some(RmaError::Inval),
        Some(mr) => match mr.validate(addr, len, access) {
            Err(e) => op_error = Some(e),
            Ok(()) => {
                let window = mr.locate(addr, len)?;
                match (&buf, is_write) {
                    (SelfBuf::Flat(s), true) => copy(s, 0, &window, 0, s.len())?,
                    (SelfBuf::Flat(s), false) => copy(&window, 0, s, 0, s.len())?,
                    (SelfBuf::Vector(iov), true) => {
                        let mut off = 0;
                        for seg in *iov {
                            copy(seg, 0, &window, off, seg.len())?;
                            off += seg.len();
                        }
                    }
                    (SelfBuf::Vector(iov), false) => {
                        let mut off = 0;
                        for seg in *iov {
                            copy(&window, off, seg, 0, seg.len())?;
                            off += seg.len();
                        }
                    }
                }

                if is_write {
                    if let Some(dst_ep) = &dst_ep {
                        if flags.contains(OpFlags::REMOTE_CQ_DATA) {
                            if let Some(cq) = dst_ep.recv_cq() {
                                let event = CqEvent {
                                    context: 0,
                                    flags: CqFlags::REMOTE_WRITE
                                        | CqFlags::RMA
                                        | CqFlags::REMOTE_CQ_DATA,
                                    len,
                                    data,
                                    olen: 0,
                                    error: None,
                                };
                                if cq.post(event).is_err() {
                                    err = Err(RmaError::Nomem);
                                }
                            }
                        }
                        if let Some(cntr) = dst_ep.remote_write_cntr() {
                            cntr.inc();
                        }
                    }
                    let ep_cntr = dst_ep.as_ref().and_then(|e| e.remote_write_cntr());
                    if let Some(mr_cntr) = mr.cntr() {
                        if !ep_cntr.is_some_and(|c| Arc::ptr_eq(c, mr_cntr)) {
                            mr_cntr.inc();
                        }
                    }
                } else if let Some(dst_ep) = &dst_ep {
                    if let Some(cntr) = dst_ep.remote_read_cntr() {
                        cntr.inc();
                    }
                }
            }
        },
    }

    if !ep.write_no_event(flags) {
        if let Some(cq) = ep.send_cq() {
            let event = CqEvent {
                context,
                flags: cq_flags,
                len,
                data: 0,
                olen: 0,
                error: op_error,
            };
            if cq.post(event).is_err() {
                err = Err(RmaError::Nomem);
            }
        }
    }

    let cntr = if is_write {
        ep.write_cntr()
    } else {
        ep.read_cntr()
    };
    if let Some(cntr) = cntr {
        cntr.inc();
    }

    err
}

#[inline]
fn copy(
    src: &LocalSlice,
    src_off: usize,
    dst: &LocalSlice,
    dst_off: usize,
    len: usize,
) -> Result<(), RmaError> {
    RmaMem::copy(
        src.mem(),
        src.offset() + src_off,
        dst.mem(),
        dst.offset() + dst_off,
        len,
    )
}
