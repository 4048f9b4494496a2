//! The AM handler: target-side request processing and initiator-side
//! reply processing.
//!
//! The transport invokes [`Domain::handle_am`] for every packet arriving
//! on the RMA handler id, requests and replies alike; dispatch is purely
//! by opcode. Handler upcalls never block: short writes copy inline,
//! long-protocol requests are captured and parked on the deferred queue
//! for [`Domain::progress`] to pump.

use std::sync::Arc;

use super::arena::ReqToken;
use super::cq::{CqEvent, CqFlags};
use super::ep::Domain;
use super::error::RmaError;
use super::mr::{iov_scatter, Permission};
use super::req::{ReadDst, RemoteReadReq, RemoteWriteReq, ReqPayload, Request, WriteReq};
use super::transport::AmToken;
use super::wire::{AmArgs, AmFlags, AmOp};
use crate::utils::lock;

impl Domain {
    /// Handle one incoming AM packet.
    ///
    /// The returned error reports handler-local trouble (an undeliverable
    /// CQ event, a malformed packet); data-transfer failures travel back
    /// to the initiator in the reply's error field instead.
    pub fn handle_am(
        &self,
        token: &AmToken,
        args: &AmArgs,
        payload: &[u8],
    ) -> Result<(), RmaError> {
        match args.op()? {
            AmOp::ReqWrite => self.on_req_write(token, args, payload),
            AmOp::ReqWriteLong => self.on_req_write_long(token, args),
            AmOp::ReqRead => self.on_req_read(token, args),
            AmOp::ReqReadLong => self.on_req_read_long(token, args),
            AmOp::RepWrite => self.on_rep_write(args),
            AmOp::RepRead => self.on_rep_read(args, payload),
            // The vector opcodes are synthetic and never cross the wire.
            AmOp::ReqWritev | AmOp::ReqReadv => Err(RmaError::Inval),
        }
    }

    /// Short write fragment: validate, copy, and on the terminal fragment
    /// post the remote completion set and reply.
    fn on_req_write(
        &self,
        token: &AmToken,
        args: &AmArgs,
        payload: &[u8],
    ) -> Result<(), RmaError> {
        let hdr = args.header()?;
        let eom = hdr.flags.contains(AmFlags::EOM);
        let has_data = hdr.flags.contains(AmFlags::DATA);
        let rma_len = hdr.len as usize;

        let mut err = Ok(());
        let mut op_error = None;
        match self.mr(args.key()) {
            None => op_error = Some(RmaError::Inval),
            Some(mr) => match mr.validate(args.addr(), payload.len(), Permission::REMOTE_WRITE) {
                Err(e) => op_error = Some(e),
                Ok(()) => {
                    mr.locate(args.addr(), payload.len())?.fill_from(payload)?;
                    if eom {
                        let ep = self.ep(hdr.dst_vl);
                        if let Some(ep) = &ep {
                            if has_data {
                                if let Some(cq) = ep.recv_cq() {
                                    let event = CqEvent {
                                        context: 0,
                                        flags: CqFlags::REMOTE_WRITE
                                            | CqFlags::RMA
                                            | CqFlags::REMOTE_CQ_DATA,
                                        len: rma_len,
                                        data: args.data(),
                                        olen: 0,
                                        error: None,
                                    };
                                    if cq.post(event).is_err() {
                                        err = Err(RmaError::Nomem);
                                    }
                                }
                            }
                            if let Some(cntr) = ep.remote_write_cntr() {
                                cntr.inc();
                            }
                        }
                        let ep_cntr = ep.as_ref().and_then(|e| e.remote_write_cntr());
                        if let Some(mr_cntr) = mr.cntr() {
                            if !ep_cntr.is_some_and(|c| Arc::ptr_eq(c, mr_cntr)) {
                                mr_cntr.inc();
                            }
                        }
                    }
                }
            },
        }

        if eom || op_error.is_some() {
            let flags = if eom { AmFlags::EOM } else { AmFlags::EMPTY };
            let rep = AmArgs::write_rep(flags, op_error, args.token());
            self.transport().am_reply_short(token, &rep, &[])?;
        }
        err
    }

    /// Long write announcement: validate, then capture and park the
    /// request; the reply comes from the ack path once the MQ receive has
    /// filled the window.
    fn on_req_write_long(&self, token: &AmToken, args: &AmArgs) -> Result<(), RmaError> {
        let hdr = args.header()?;
        let has_data = hdr.flags.contains(AmFlags::DATA);
        let rma_len = hdr.len as usize;

        let checked = match self.mr(args.key()) {
            None => Err(RmaError::Inval),
            Some(mr) => mr
                .validate(args.addr(), rma_len, Permission::REMOTE_WRITE)
                .map(|()| mr),
        };
        let mr = match checked {
            Ok(mr) => mr,
            Err(e) => {
                // A refused long write completes the initiator right away.
                let rep = AmArgs::write_rep(AmFlags::EOM, Some(e), args.token());
                return self.transport().am_reply_short(token, &rep, &[]);
            }
        };

        let Some(ep) = self.ep(hdr.dst_vl) else {
            let rep = AmArgs::write_rep(AmFlags::EOM, Some(RmaError::Inval), args.token());
            return self.transport().am_reply_short(token, &rep, &[]);
        };

        let window = mr.locate(args.addr(), rma_len)?;
        let mut cq_flags = CqFlags::REMOTE_WRITE | CqFlags::RMA;
        if has_data {
            cq_flags |= CqFlags::REMOTE_CQ_DATA;
        }
        let req_token = self.alloc_req(Request {
            op: AmOp::ReqWriteLong,
            ep,
            error: None,
            no_event: false,
            cq_flags,
            payload: ReqPayload::RemoteWrite(RemoteWriteReq {
                window,
                len: rma_len,
                context: args.token(),
                peer: token.peer,
                vl: hdr.dst_vl,
                peer_vl: hdr.src_vl,
                data: has_data.then(|| args.data()),
                mr,
            }),
        })?;
        self.enqueue_rma(req_token);
        Ok(())
    }

    /// Short read fragment: validate and reply with the window bytes.
    fn on_req_read(&self, token: &AmToken, args: &AmArgs) -> Result<(), RmaError> {
        let hdr = args.header()?;
        let eom = hdr.flags.contains(AmFlags::EOM);
        let rma_len = hdr.len as usize;
        let offset = args.offset();

        let mut op_error = None;
        let mut payload = Vec::new();
        match self.mr(args.key()) {
            None => op_error = Some(RmaError::Inval),
            Some(mr) => match mr.validate(args.addr(), rma_len, Permission::REMOTE_READ) {
                Err(e) => op_error = Some(e),
                Ok(()) => payload = mr.locate(args.addr(), rma_len)?.to_vec(),
            },
        }

        let flags = if eom { AmFlags::EOM } else { AmFlags::EMPTY };
        let rep = AmArgs::read_rep(flags, op_error, args.token(), offset);
        self.transport().am_reply_short(token, &rep, &payload)?;

        if eom && op_error.is_none() {
            if let Some(ep) = self.ep(hdr.dst_vl) {
                if let Some(cntr) = ep.remote_read_cntr() {
                    cntr.inc();
                }
            }
        }
        Ok(())
    }

    /// Long read announcement: validate, then capture and park; the pump
    /// will push the window over the MQ.
    fn on_req_read_long(&self, token: &AmToken, args: &AmArgs) -> Result<(), RmaError> {
        let hdr = args.header()?;
        let rma_len = hdr.len as usize;

        let checked = match self.mr(args.key()) {
            None => Err(RmaError::Inval),
            Some(mr) => mr
                .validate(args.addr(), rma_len, Permission::REMOTE_READ)
                .map(|()| mr),
        };
        let mr = match checked {
            Ok(mr) => mr,
            Err(e) => {
                let rep = AmArgs::read_rep(AmFlags::EOM, Some(e), args.token(), 0);
                return self.transport().am_reply_short(token, &rep, &[]);
            }
        };

        let Some(ep) = self.ep(hdr.dst_vl) else {
            let rep = AmArgs::read_rep(AmFlags::EOM, Some(RmaError::Inval), args.token(), 0);
            return self.transport().am_reply_short(token, &rep, &[]);
        };

        let window = mr.locate(args.addr(), rma_len)?;
        let req_token = self.alloc_req(Request {
            op: AmOp::ReqReadLong,
            ep,
            error: None,
            no_event: false,
            cq_flags: CqFlags::EMPTY,
            payload: ReqPayload::RemoteRead(RemoteReadReq {
                window,
                context: args.token(),
                peer: token.peer,
                vl: hdr.dst_vl,
                peer_vl: hdr.src_vl,
                mr,
            }),
        })?;
        self.enqueue_rma(req_token);
        Ok(())
    }

    /// Write reply: fold the error; the EOM reply completes the request.
    fn on_rep_write(&self, args: &AmArgs) -> Result<(), RmaError> {
        let eom = args.rep_flags().contains(AmFlags::EOM);
        let op_error = args.rep_error();
        let token = ReqToken::from_wire(args.token());

        let mut arena = lock(&self.arena);
        let Some(req) = arena.get_mut(token) else {
            log::debug!("remma: dropping write reply for a stale request token");
            return Ok(());
        };
        if !matches!(req.payload, ReqPayload::Write(_)) {
            log::warn!("remma: write reply names a non-write request, dropping");
            return Ok(());
        }
        req.fold_error(op_error);
        if !eom {
            return Ok(());
        }
        let Some(req) = arena.remove(token) else {
            return Ok(());
        };
        drop(arena);
        self.complete_write(req)
    }

    /// Read reply: scatter the bytes, account the length, and complete on
    /// EOM or when every requested byte has arrived (the vector case,
    /// where a long tail may land before or after the short fragments).
    fn on_rep_read(&self, args: &AmArgs, payload: &[u8]) -> Result<(), RmaError> {
        let eom = args.rep_flags().contains(AmFlags::EOM);
        let op_error = args.rep_error();
        let offset = args.rep_offset() as usize;
        let token = ReqToken::from_wire(args.token());

        let mut arena = lock(&self.arena);
        let Some(req) = arena.get_mut(token) else {
            log::debug!("remma: dropping read reply for a stale request token");
            return Ok(());
        };
        let done = match &mut req.payload {
            ReqPayload::Read(rd) => {
                if op_error.is_none() {
                    match &rd.dst {
                        ReadDst::Flat(buf) => buf
                            .sub(offset, payload.len())
                            .ok_or(RmaError::Inval)?
                            .fill_from(payload)?,
                        ReadDst::Vector(iov) => iov_scatter(iov, offset, payload)?,
                    }
                    rd.len_read += payload.len();
                }
                eom || rd.len_read == rd.len
            }
            _ => {
                log::warn!("remma: read reply names a non-read request, dropping");
                return Ok(());
            }
        };
        req.fold_error(op_error);
        if !done {
            return Ok(());
        }
        if !eom {
            log::debug!("remma: readv short protocol finished after long protocol");
        }
        let Some(req) = arena.remove(token) else {
            return Ok(());
        };
        drop(arena);
        self.complete_read(req)
    }

    /// Post the initiator-side completion of a finished write request.
    pub(crate) fn complete_write(&self, req: Request) -> Result<(), RmaError> {
        let ReqPayload::Write(WriteReq {
            len,
            addr,
            key,
            context,
        }) = req.payload
        else {
            return Err(RmaError::Inval);
        };
        log::trace!(
            "remma: {:?} to addr {addr:#x} key {key:#x} complete",
            req.op
        );

        let mut err = Ok(());
        if !req.no_event {
            if let Some(cq) = req.ep.send_cq() {
                let event = CqEvent {
                    context,
                    flags: req.cq_flags,
                    len,
                    data: 0,
                    olen: 0,
                    error: req.error,
                };
                if cq.post(event).is_err() {
                    err = Err(RmaError::Nomem);
                }
            }
        }
        if let Some(cntr) = req.ep.write_cntr() {
            cntr.inc();
        }
        err
    }

    /// Post the initiator-side completion of a finished read request.
    /// Undelivered bytes are reported as truncation.
    pub(crate) fn complete_read(&self, req: Request) -> Result<(), RmaError> {
        let ReqPayload::Read(rd) = req.payload else {
            return Err(RmaError::Inval);
        };
        log::trace!(
            "remma: {:?} from addr {:#x} key {:#x} complete",
            req.op,
            rd.addr,
            rd.key
        );

        let mut err = Ok(());
        if !req.no_event {
            if let Some(cq) = req.ep.send_cq() {
                let event = CqEvent {
                    context: rd.context,
                    flags: req.cq_flags,
                    len: rd.len_read,
                    data: 0,
                    olen: rd.len.saturating_sub(rd.len_read),
                    error: req.error,
                };
                if cq.post(event).is_err() {
                    err = Err(RmaError::Nomem);
                }
            }
        }
        if let Some(cntr) = req.ep.read_cntr() {
            cntr.inc();
        }
        err
    }
}
