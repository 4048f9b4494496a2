//! The deferred-RMA pump and MQ completion handling.
//!
//! Long-protocol requests accepted by the AM handler wait on a per-domain
//! FIFO; a progress poll pumps each one into its MQ operation. The MQ
//! completions then finish the story: filled long writes are acknowledged
//! back to the initiator, initiator-side records fire their CQ events.

use std::sync::Arc;

use super::arena::ReqToken;
use super::cq::CqEvent;
use super::ep::Domain;
use super::error::RmaError;
use super::mr::LocalSlice;
use super::req::{RemoteWriteReq, ReqPayload, Request};
use super::transport::MqContext;
use super::types::EpId;
use super::wire::{AmArgs, AmFlags, MqTag};
use crate::utils::lock;

enum MqOp {
    Recv {
        peer: EpId,
        tag: MqTag,
        window: LocalSlice,
    },
    Send {
        peer: EpId,
        tag: MqTag,
        window: LocalSlice,
    },
}

enum Terminal {
    Pending,
    Write,
    Read,
    RemoteWrite,
    RemoteRead,
}

impl Domain {
    pub(crate) fn enqueue_rma(&self, token: ReqToken) {
        lock(&self.rma_queue).push_back(token);
    }

    /// Pump the deferred-RMA queue: post the MQ operation of every parked
    /// long-protocol request, in FIFO order.
    ///
    /// Draining happens in batches so the queue lock is never held across
    /// a transport call. Polling with nothing queued is a no-op.
    pub fn progress(&self) -> Result<(), RmaError> {
        let mut first_err = Ok(());
        loop {
            let batch: Vec<ReqToken> = lock(&self.rma_queue).drain(..).collect();
            if batch.is_empty() {
                break;
            }
            for token in batch {
                if let Err(e) = self.pump_one(token) {
                    log::warn!("remma: deferred RMA pump failed: {e}");
                    if first_err.is_ok() {
                        first_err = Err(e);
                    }
                }
            }
        }
        first_err
    }

    fn pump_one(&self, token: ReqToken) -> Result<(), RmaError> {
        let op = {
            let mut arena = lock(&self.arena);
            let Some(req) = arena.get_mut(token) else {
                log::debug!("remma: dropping a stale deferred request token");
                return Ok(());
            };
            match &req.payload {
                ReqPayload::RemoteWrite(rw) => MqOp::Recv {
                    peer: rw.peer,
                    tag: MqTag::rma(rw.peer_vl, rw.vl, rw.context),
                    window: rw.window.clone(),
                },
                ReqPayload::RemoteRead(rr) => MqOp::Send {
                    peer: rr.peer,
                    tag: MqTag::rma(rr.vl, rr.peer_vl, rr.context),
                    window: rr.window.clone(),
                },
                _ => {
                    log::warn!("remma: initiator request on the deferred queue, dropping");
                    return Ok(());
                }
            }
        };

        match op {
            MqOp::Recv { peer, tag, window } => self.transport().mq_irecv(
                peer,
                tag,
                MqTag::MASK_ALL,
                window,
                MqContext::new(token),
            ),
            MqOp::Send { peer, tag, window } => {
                self.transport()
                    .mq_isend(peer, tag, window, Some(MqContext::new(token)))
            }
        }
    }

    /// Deliver the completion of an MQ operation this domain posted.
    ///
    /// `nbytes` is the number of bytes actually transferred. Stale
    /// contexts are dropped silently; on a long write without forced
    /// acknowledgment both the local MQ completion and the mirror ack
    /// observe the request, and whichever runs second finds it gone.
    pub fn mq_complete(&self, ctx: MqContext, nbytes: usize) -> Result<(), RmaError> {
        let token = ctx.0;
        let mut arena = lock(&self.arena);
        let Some(req) = arena.get_mut(token) else {
            log::debug!("remma: dropping MQ completion for a stale request token");
            return Ok(());
        };

        let terminal = match &mut req.payload {
            ReqPayload::Write(_) => Terminal::Write,
            ReqPayload::Read(rd) => {
                rd.len_read += nbytes;
                if rd.len_read == rd.len {
                    Terminal::Read
                } else {
                    Terminal::Pending
                }
            }
            ReqPayload::RemoteWrite(_) => Terminal::RemoteWrite,
            ReqPayload::RemoteRead(_) => Terminal::RemoteRead,
        };
        if matches!(terminal, Terminal::Pending) {
            return Ok(());
        }

        let Some(req) = arena.remove(token) else {
            return Ok(());
        };
        drop(arena);

        match terminal {
            Terminal::Pending => Ok(()),
            Terminal::Write => self.complete_write(req),
            Terminal::Read => self.complete_read(req),
            Terminal::RemoteWrite => self.finish_remote_write(req),
            Terminal::RemoteRead => {
                if let ReqPayload::RemoteRead(rr) = &req.payload {
                    log::trace!("remma: long read of key {:#x} served", rr.mr.key());
                }
                if let Some(cntr) = req.ep.remote_read_cntr() {
                    cntr.inc();
                }
                Ok(())
            }
        }
    }

    /// A long write has landed in the MR: post the remote completion set,
    /// then acknowledge the initiator with its original context so its
    /// request can fire.
    fn finish_remote_write(&self, req: Request) -> Result<(), RmaError> {
        let ReqPayload::RemoteWrite(RemoteWriteReq {
            len,
            context,
            peer,
            data,
            mr,
            ..
        }) = req.payload
        else {
            return Err(RmaError::Inval);
        };

        let mut err = Ok(());
        if let Some(data) = data {
            if let Some(cq) = req.ep.recv_cq() {
                let event = CqEvent {
                    context: 0,
                    flags: req.cq_flags,
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
        if let Some(cntr) = req.ep.remote_write_cntr() {
            cntr.inc();
        }
        if let Some(mr_cntr) = mr.cntr() {
            let ep_cntr = req.ep.remote_write_cntr();
            if !ep_cntr.is_some_and(|c| Arc::ptr_eq(c, mr_cntr)) {
                mr_cntr.inc();
            }
        }

        // The ack travels as a fresh AM request: the handler call that
        // accepted the write is long gone.
        let rep = AmArgs::write_rep(AmFlags::EOM, req.error, context);
        self.transport().am_request_short(peer, &rep, &[])?;
        err
    }
}
