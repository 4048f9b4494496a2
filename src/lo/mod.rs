//! In-process loopback transport.
//!
//! Connects any number of domains living in one process, identified by
//! endpoint id. Nothing is delivered from inside a submission call:
//! AM packets and MQ completions queue up and land when the owner drives
//! [`Loopback::poll`] (or [`Loopback::step`] for one event at a time),
//! which keeps the progress model identical to a real fabric and makes
//! interleavings testable.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use crate::rma::ep::Domain;
use crate::rma::error::RmaError;
use crate::rma::mr::{LocalSlice, RmaMem};
use crate::rma::transport::{AmToken, MqContext, Transport};
use crate::rma::types::EpId;
use crate::rma::wire::{AmArgs, MqTag};
use crate::utils::lock;

/// Packet and operation counters, mainly for tests and debugging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoStats {
    pub am_requests: u64,
    pub am_replies: u64,
    pub mq_sends: u64,
    pub mq_recvs: u64,
}

enum LoEvent {
    Am {
        src: EpId,
        dst: EpId,
        args: AmArgs,
        payload: Vec<u8>,
    },
    MqDone {
        epid: EpId,
        ctx: MqContext,
        nbytes: usize,
    },
}

struct PostedRecv {
    src: EpId,
    tag: MqTag,
    mask: MqTag,
    buf: LocalSlice,
    ctx: MqContext,
}

struct UnexpectedSend {
    src: EpId,
    tag: MqTag,
    payload: Vec<u8>,
    ctx: Option<MqContext>,
}

/// Tagged-matching state of one receiving endpoint.
#[derive(Default)]
struct MqState {
    posted: Vec<PostedRecv>,
    unexpected: Vec<UnexpectedSend>,
}

#[derive(Default)]
struct LoInner {
    domains: HashMap<EpId, Weak<Domain>>,
    events: VecDeque<LoEvent>,
    mq: HashMap<EpId, MqState>,
    stats: LoStats,
}

/// The in-process transport hub.
pub struct Loopback {
    inner: Mutex<LoInner>,
}

impl Loopback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(LoInner::default()),
        })
    }

    /// The transport handle a domain with id `epid` should be built on.
    pub fn port(self: &Arc<Self>, epid: EpId) -> Arc<LoPort> {
        Arc::new(LoPort {
            lo: self.clone(),
            epid,
        })
    }

    /// Register a domain for delivery. The loopback holds it weakly;
    /// events addressed to a dropped domain are discarded.
    pub fn attach(&self, domain: &Arc<Domain>) {
        lock(&self.inner)
            .domains
            .insert(domain.epid(), Arc::downgrade(domain));
    }

    pub fn stats(&self) -> LoStats {
        lock(&self.inner).stats
    }

    fn domain(&self, epid: EpId) -> Option<Arc<Domain>> {
        lock(&self.inner).domains.get(&epid)?.upgrade()
    }

    /// Deliver one queued event. Returns `false` when the queue is empty.
    ///
    /// The queue lock is released before the engine upcall, so handlers
    /// are free to send replies and post MQ operations.
    pub fn step(&self) -> Result<bool, RmaError> {
        let Some(event) = lock(&self.inner).events.pop_front() else {
            return Ok(false);
        };
        match event {
            LoEvent::Am {
                src,
                dst,
                args,
                payload,
            } => match self.domain(dst) {
                Some(domain) => domain.handle_am(&AmToken { peer: src }, &args, &payload)?,
                None => log::debug!("remma: loopback dropping AM for unknown endpoint {dst}"),
            },
            LoEvent::MqDone { epid, ctx, nbytes } => match self.domain(epid) {
                Some(domain) => domain.mq_complete(ctx, nbytes)?,
                None => {
                    log::debug!("remma: loopback dropping MQ completion for unknown endpoint {epid}")
                }
            },
        }
        Ok(true)
    }

    /// Deliver queued events until the queue drains, including any that
    /// delivery itself enqueues.
    pub fn poll(&self) -> Result<(), RmaError> {
        while self.step()? {}
        Ok(())
    }
}

/// A [`Transport`] handle binding one endpoint id to a [`Loopback`].
pub struct LoPort {
    lo: Arc<Loopback>,
    epid: EpId,
}

impl Transport for LoPort {
    fn am_request_short(
        &self,
        peer: EpId,
        args: &AmArgs,
        payload: &[u8],
    ) -> Result<(), RmaError> {
        let mut inner = lock(&self.lo.inner);
        inner.stats.am_requests += 1;
        inner.events.push_back(LoEvent::Am {
            src: self.epid,
            dst: peer,
            args: *args,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn am_reply_short(
        &self,
        token: &AmToken,
        args: &AmArgs,
        payload: &[u8],
    ) -> Result<(), RmaError> {
        let mut inner = lock(&self.lo.inner);
        inner.stats.am_replies += 1;
        inner.events.push_back(LoEvent::Am {
            src: self.epid,
            dst: token.peer,
            args: *args,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn mq_isend(
        &self,
        peer: EpId,
        tag: MqTag,
        buf: LocalSlice,
        context: Option<MqContext>,
    ) -> Result<(), RmaError> {
        let mut guard = lock(&self.lo.inner);
        let inner = &mut *guard;
        inner.stats.mq_sends += 1;

        let state = inner.mq.entry(peer).or_default();
        let matched = state
            .posted
            .iter()
            .position(|r| r.src == self.epid && r.tag.matches(tag, r.mask));
        match matched {
            Some(idx) => {
                let recv = state.posted.remove(idx);
                let nbytes = recv.buf.len().min(buf.len());
                RmaMem::copy(
                    buf.mem(),
                    buf.offset(),
                    recv.buf.mem(),
                    recv.buf.offset(),
                    nbytes,
                )?;
                inner.events.push_back(LoEvent::MqDone {
                    epid: peer,
                    ctx: recv.ctx,
                    nbytes,
                });
                if let Some(ctx) = context {
                    inner.events.push_back(LoEvent::MqDone {
                        epid: self.epid,
                        ctx,
                        nbytes: buf.len(),
                    });
                }
            }
            None => state.unexpected.push(UnexpectedSend {
                src: self.epid,
                tag,
                payload: buf.to_vec(),
                ctx: context,
            }),
        }
        Ok(())
    }

    fn mq_irecv(
        &self,
        peer: EpId,
        tag: MqTag,
        mask: MqTag,
        buf: LocalSlice,
        context: MqContext,
    ) -> Result<(), RmaError> {
        let mut guard = lock(&self.lo.inner);
        let inner = &mut *guard;
        inner.stats.mq_recvs += 1;

        let state = inner.mq.entry(self.epid).or_default();
        let matched = state
            .unexpected
            .iter()
            .position(|s| s.src == peer && tag.matches(s.tag, mask));
        match matched {
            Some(idx) => {
                let send = state.unexpected.remove(idx);
                let nbytes = buf.len().min(send.payload.len());
                buf.fill_from(&send.payload[..nbytes])?;
                inner.events.push_back(LoEvent::MqDone {
                    epid: self.epid,
                    ctx: context,
                    nbytes,
                });
                if let Some(ctx) = send.ctx {
                    inner.events.push_back(LoEvent::MqDone {
                        epid: send.src,
                        ctx,
                        nbytes: send.payload.len(),
                    });
                }
            }
            None => state.posted.push(PostedRecv {
                src: peer,
                tag,
                mask,
                buf,
                ctx: context,
            }),
        }
        Ok(())
    }
}
