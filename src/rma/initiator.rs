//! Initiator-side RMA entry points.
//!
//! Every operation resolves its destination, takes the self path when the
//! peer is local, captures triggered submissions, and otherwise picks
//! between the short protocol (payload fragmented into AM packets) and the
//! long protocol (one AM announcement plus a tagged MQ transfer).
//!
//! Submission never blocks: a zero return means the operation is in
//! flight and will complete through the endpoint's CQ and counters.

use std::ops::{BitOr, BitOrAssign, Sub, SubAssign};
use std::sync::Arc;

use super::cq::CqFlags;
use super::ep::{Endpoint, PeerAddr};
use super::error::RmaError;
use super::mr::{iov_len, LocalSlice, RmaMem};
use super::req::{ReadDst, ReadReq, ReqPayload, Request, WriteReq};
use super::selfpath::{rma_self, SelfBuf};
use super::transport::MqContext;
use super::trigger::{TriggerCond, TriggeredOp};
use super::types::{MrKey, UserContext};
use super::wire::{AmArgs, AmFlags, AmHeader, AmOp, MqTag};

/// Per-operation flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct OpFlags(u32);

impl OpFlags {
    pub const EMPTY: Self = Self(0);
    /// Bounded-size write whose buffer may be reused as soon as the call
    /// returns.
    pub const INJECT: Self = Self(0x1);
    /// Demand a send CQ event even on a selective-completion endpoint.
    pub const COMPLETION: Self = Self(0x2);
    /// Carry a 64-bit immediate to the peer's receive CQ.
    pub const REMOTE_CQ_DATA: Self = Self(0x4);
    /// Long writes only: complete at the initiator only after the target
    /// acknowledges delivery.
    pub const DELIVERY_COMPLETE: Self = Self(0x8);
    /// Defer the operation to the domain's trigger registry.
    pub const TRIGGER: Self = Self(0x10);
    /// Never post a send CQ event for this operation.
    pub const NO_COMPLETION: Self = Self(0x20);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpFlags {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl Sub for OpFlags {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 & !rhs.0)
    }
}

impl SubAssign for OpFlags {
    #[inline]
    fn sub_assign(&mut self, rhs: Self) {
        self.0 &= !rhs.0;
    }
}

/// Descriptor form of an RMA operation, for the `*msg` entry points.
pub struct RmaMsg {
    /// Local gather/scatter list.
    pub iov: Vec<LocalSlice>,
    /// The remote peer (destination of a write, source of a read).
    pub peer: PeerAddr,
    /// Remote address within the MR window.
    pub addr: u64,
    pub key: MrKey,
    pub context: UserContext,
    /// Immediate data, sent when the flags carry
    /// [`OpFlags::REMOTE_CQ_DATA`].
    pub data: u64,
    /// Firing condition, required when the flags carry
    /// [`OpFlags::TRIGGER`].
    pub trigger: Option<TriggerCond>,
}

impl Endpoint {
    /// Read `buf.len()` bytes from `(addr, key)` at `src` into `buf`.
    pub fn read(
        self: &Arc<Self>,
        buf: LocalSlice,
        src: PeerAddr,
        addr: u64,
        key: MrKey,
        context: UserContext,
    ) -> Result<(), RmaError> {
        self.read_generic(buf, src, addr, key, context, self.tx_flags(), None)
    }

    /// Read into a scatter list.
    pub fn readv(
        self: &Arc<Self>,
        iov: &[LocalSlice],
        src: PeerAddr,
        addr: u64,
        key: MrKey,
        context: UserContext,
    ) -> Result<(), RmaError> {
        match iov {
            [] => Err(RmaError::Inval),
            [one] => self.read(one.clone(), src, addr, key, context),
            _ => self.readv_generic(iov, src, addr, key, context, self.tx_flags(), None),
        }
    }

    /// Read, descriptor form.
    pub fn readmsg(self: &Arc<Self>, msg: &RmaMsg, flags: OpFlags) -> Result<(), RmaError> {
        match msg.iov.as_slice() {
            [] => Err(RmaError::Inval),
            [one] => self.read_generic(
                one.clone(),
                msg.peer,
                msg.addr,
                msg.key,
                msg.context,
                flags,
                msg.trigger.clone(),
            ),
            iov => self.readv_generic(
                iov,
                msg.peer,
                msg.addr,
                msg.key,
                msg.context,
                flags,
                msg.trigger.clone(),
            ),
        }
    }

    /// Write `buf` to `(addr, key)` at `dest`.
    pub fn write(
        self: &Arc<Self>,
        buf: LocalSlice,
        dest: PeerAddr,
        addr: u64,
        key: MrKey,
        context: UserContext,
    ) -> Result<(), RmaError> {
        self.write_generic(buf, dest, addr, key, context, self.tx_flags(), 0, None)
    }

    /// Write from a gather list.
    pub fn writev(
        self: &Arc<Self>,
        iov: &[LocalSlice],
        dest: PeerAddr,
        addr: u64,
        key: MrKey,
        context: UserContext,
    ) -> Result<(), RmaError> {
        match iov {
            [] => Err(RmaError::Inval),
            [one] => self.write(one.clone(), dest, addr, key, context),
            _ => self.writev_generic(iov, dest, addr, key, context, self.tx_flags(), 0, None),
        }
    }

    /// Write, descriptor form.
    pub fn writemsg(self: &Arc<Self>, msg: &RmaMsg, flags: OpFlags) -> Result<(), RmaError> {
        match msg.iov.as_slice() {
            [] => Err(RmaError::Inval),
            [one] => self.write_generic(
                one.clone(),
                msg.peer,
                msg.addr,
                msg.key,
                msg.context,
                flags,
                msg.data,
                msg.trigger.clone(),
            ),
            iov => self.writev_generic(
                iov,
                msg.peer,
                msg.addr,
                msg.key,
                msg.context,
                flags,
                msg.data,
                msg.trigger.clone(),
            ),
        }
    }

    /// Small write whose buffer is reusable on return; never posts a send
    /// CQ event.
    pub fn inject(
        self: &Arc<Self>,
        buf: LocalSlice,
        dest: PeerAddr,
        addr: u64,
        key: MrKey,
    ) -> Result<(), RmaError> {
        let flags = self.tx_flags() | OpFlags::INJECT | OpFlags::NO_COMPLETION;
        self.write_generic(buf, dest, addr, key, 0, flags, 0, None)
    }

    /// Write carrying a 64-bit immediate to the peer's receive CQ.
    pub fn writedata(
        self: &Arc<Self>,
        buf: LocalSlice,
        data: u64,
        dest: PeerAddr,
        addr: u64,
        key: MrKey,
        context: UserContext,
    ) -> Result<(), RmaError> {
        let flags = self.tx_flags() | OpFlags::REMOTE_CQ_DATA;
        self.write_generic(buf, dest, addr, key, context, flags, data, None)
    }

    /// [`Endpoint::inject`] with immediate data.
    pub fn injectdata(
        self: &Arc<Self>,
        buf: LocalSlice,
        data: u64,
        dest: PeerAddr,
        addr: u64,
        key: MrKey,
    ) -> Result<(), RmaError> {
        let flags = self.tx_flags() | OpFlags::INJECT | OpFlags::NO_COMPLETION;
        self.write_generic(buf, dest, addr, key, 0, flags, data, None)
    }

    fn defer_trigger(
        &self,
        trigger: Option<TriggerCond>,
        op: TriggeredOp,
    ) -> Result<(), RmaError> {
        let cond = trigger.ok_or(RmaError::Inval)?;
        let registry = self.domain().trigger_registry().ok_or(RmaError::Inval)?;
        registry.register(cond, op);
        Ok(())
    }

    pub(crate) fn write_no_event(&self, flags: OpFlags) -> bool {
        flags.contains(OpFlags::NO_COMPLETION)
            || (self.selective_completion() && !flags.contains(OpFlags::COMPLETION))
    }

    fn read_no_event(&self, flags: OpFlags) -> bool {
        self.selective_completion() && !flags.contains(OpFlags::COMPLETION)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn write_generic(
        self: &Arc<Self>,
        buf: LocalSlice,
        dest: PeerAddr,
        addr: u64,
        key: MrKey,
        context: UserContext,
        flags: OpFlags,
        data: u64,
        trigger: Option<TriggerCond>,
    ) -> Result<(), RmaError> {
        if flags.contains(OpFlags::TRIGGER) {
            return self.defer_trigger(
                trigger,
                TriggeredOp::Write {
                    ep: self.clone(),
                    buf,
                    dest,
                    addr,
                    key,
                    context,
                    flags: flags - OpFlags::TRIGGER,
                    data,
                },
            );
        }

        let domain = self.domain().clone();
        if dest.epid == domain.epid() {
            return rma_self(
                AmOp::ReqWrite,
                self,
                dest.vl,
                SelfBuf::Flat(&buf),
                addr,
                key,
                context,
                flags,
                data,
            );
        }

        let tunables = domain.tunables();
        let chunk = tunables.max_request_short;
        let len = buf.len();
        let no_event = self.write_no_event(flags);

        let src = if flags.contains(OpFlags::INJECT) {
            if len > tunables.inject_max {
                return Err(RmaError::Msgsize);
            }
            // Private copy: the caller may reuse `buf` immediately.
            LocalSlice::whole(&RmaMem::with_content(&buf.to_vec()))
        } else {
            buf
        };

        let token = domain.alloc_req(Request {
            op: AmOp::ReqWrite,
            ep: self.clone(),
            error: None,
            no_event,
            cq_flags: CqFlags::WRITE | CqFlags::RMA,
            payload: ReqPayload::Write(WriteReq {
                len,
                addr,
                key,
                context,
            }),
        })?;
        let wire_tok = token.to_wire();
        let transport = domain.transport();

        if tunables.tagged_rma && len > chunk {
            let tag = MqTag::rma(self.vl(), dest.vl, wire_tok);
            let mut hdr = AmHeader::new(AmOp::ReqWriteLong, self.vl(), dest.vl);
            hdr.len = len as u32;
            let force_ack = flags.contains(OpFlags::DELIVERY_COMPLETE);
            if force_ack {
                hdr.flags |= AmFlags::FORCE_ACK;
            }
            let data = flags.contains(OpFlags::REMOTE_CQ_DATA).then_some(data);
            let args = AmArgs::write_req(hdr, wire_tok, addr, key, data);
            transport.am_request_short(dest.epid, &args, &[])?;

            // Under delivery-complete semantics the ack is the sole
            // completion signal, so the MQ send completes contextless.
            let mq_ctx = (!force_ack).then(|| MqContext::new(token));
            transport.mq_isend(dest.epid, tag, src, mq_ctx)?;
            return Ok(());
        }

        let mut hdr = AmHeader::new(AmOp::ReqWrite, self.vl(), dest.vl);
        let mut addr = addr;
        let mut off = 0;
        let mut rem = len;
        while rem > chunk {
            hdr.len = chunk as u32;
            let args = AmArgs::write_req(hdr, wire_tok, addr, key, None);
            let payload = src.sub(off, chunk).ok_or(RmaError::Inval)?.to_vec();
            transport.am_request_short(dest.epid, &args, &payload)?;
            addr += chunk as u64;
            off += chunk;
            rem -= chunk;
        }

        hdr.flags |= AmFlags::EOM;
        hdr.len = rem as u32;
        let data = flags.contains(OpFlags::REMOTE_CQ_DATA).then_some(data);
        let args = AmArgs::write_req(hdr, wire_tok, addr, key, data);
        let payload = src.sub(off, rem).ok_or(RmaError::Inval)?.to_vec();
        transport.am_request_short(dest.epid, &args, &payload)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn writev_generic(
        self: &Arc<Self>,
        iov: &[LocalSlice],
        dest: PeerAddr,
        addr: u64,
        key: MrKey,
        context: UserContext,
        flags: OpFlags,
        data: u64,
        trigger: Option<TriggerCond>,
    ) -> Result<(), RmaError> {
        if flags.contains(OpFlags::TRIGGER) {
            return self.defer_trigger(
                trigger,
                TriggeredOp::Writev {
                    ep: self.clone(),
                    iov: iov.to_vec().into_boxed_slice(),
                    dest,
                    addr,
                    key,
                    context,
                    flags: flags - OpFlags::TRIGGER,
                    data,
                },
            );
        }

        let domain = self.domain().clone();
        if dest.epid == domain.epid() {
            return rma_self(
                AmOp::ReqWritev,
                self,
                dest.vl,
                SelfBuf::Vector(iov),
                addr,
                key,
                context,
                flags,
                data,
            );
        }

        let tunables = domain.tunables();
        let chunk = tunables.max_request_short;
        let total_len = iov_len(iov);
        let no_event = self.write_no_event(flags);

        // A vector that fits one packet is packed and sent as a plain
        // short write.
        if total_len <= chunk {
            let mut packed = Vec::with_capacity(total_len);
            for seg in iov {
                packed.extend_from_slice(&seg.to_vec());
            }

            let token = domain.alloc_req(Request {
                op: AmOp::ReqWrite,
                ep: self.clone(),
                error: None,
                no_event,
                cq_flags: CqFlags::WRITE | CqFlags::RMA,
                payload: ReqPayload::Write(WriteReq {
                    len: total_len,
                    addr,
                    key,
                    context,
                }),
            })?;

            let mut hdr = AmHeader::new(AmOp::ReqWrite, self.vl(), dest.vl);
            hdr.flags |= AmFlags::EOM;
            hdr.len = total_len as u32;
            let data = flags.contains(OpFlags::REMOTE_CQ_DATA).then_some(data);
            let args = AmArgs::write_req(hdr, token.to_wire(), addr, key, data);
            domain
                .transport()
                .am_request_short(dest.epid, &args, &packed)?;
            return Ok(());
        }

        if flags.contains(OpFlags::INJECT) {
            return Err(RmaError::Msgsize);
        }

        let token = domain.alloc_req(Request {
            op: AmOp::ReqWrite,
            ep: self.clone(),
            error: None,
            no_event,
            cq_flags: CqFlags::WRITE | CqFlags::RMA,
            payload: ReqPayload::Write(WriteReq {
                len: total_len,
                addr,
                key,
                context,
            }),
        })?;
        let wire_tok = token.to_wire();
        let transport = domain.transport();

        // Segments go out in sequence over the short protocol; a final
        // segment larger than one packet goes over the long protocol
        // instead.
        let mut addr = addr;
        let mut len_sent = 0;
        for seg in iov {
            if seg.is_empty() {
                continue;
            }
            let is_last = len_sent + seg.len() == total_len;

            if tunables.tagged_rma && seg.len() > chunk && is_last {
                let tag = MqTag::rma(self.vl(), dest.vl, wire_tok);
                let mut hdr = AmHeader::new(AmOp::ReqWriteLong, self.vl(), dest.vl);
                hdr.len = seg.len() as u32;
                let force_ack = flags.contains(OpFlags::DELIVERY_COMPLETE);
                if force_ack {
                    hdr.flags |= AmFlags::FORCE_ACK;
                }
                let data = flags.contains(OpFlags::REMOTE_CQ_DATA).then_some(data);
                let args = AmArgs::write_req(hdr, wire_tok, addr, key, data);
                transport.am_request_short(dest.epid, &args, &[])?;

                let mq_ctx = (!force_ack).then(|| MqContext::new(token));
                transport.mq_isend(dest.epid, tag, seg.clone(), mq_ctx)?;
                return Ok(());
            }

            let mut hdr = AmHeader::new(AmOp::ReqWrite, self.vl(), dest.vl);
            let mut off = 0;
            let mut rem = seg.len();
            while rem > chunk {
                hdr.len = chunk as u32;
                let args = AmArgs::write_req(hdr, wire_tok, addr, key, None);
                let payload = seg.sub(off, chunk).ok_or(RmaError::Inval)?.to_vec();
                transport.am_request_short(dest.epid, &args, &payload)?;
                addr += chunk as u64;
                off += chunk;
                rem -= chunk;
                len_sent += chunk;
            }

            hdr.len = rem as u32;
            let mut data_arg = None;
            if len_sent + rem == total_len {
                hdr.flags |= AmFlags::EOM;
                data_arg = flags.contains(OpFlags::REMOTE_CQ_DATA).then_some(data);
            }
            let args = AmArgs::write_req(hdr, wire_tok, addr, key, data_arg);
            let payload = seg.sub(off, rem).ok_or(RmaError::Inval)?.to_vec();
            transport.am_request_short(dest.epid, &args, &payload)?;
            addr += rem as u64;
            len_sent += rem;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn read_generic(
        self: &Arc<Self>,
        buf: LocalSlice,
        src: PeerAddr,
        addr: u64,
        key: MrKey,
        context: UserContext,
        flags: OpFlags,
        trigger: Option<TriggerCond>,
    ) -> Result<(), RmaError> {
        if flags.contains(OpFlags::TRIGGER) {
            return self.defer_trigger(
                trigger,
                TriggeredOp::Read {
                    ep: self.clone(),
                    buf,
                    src,
                    addr,
                    key,
                    context,
                    flags: flags - OpFlags::TRIGGER,
                },
            );
        }

        let domain = self.domain().clone();
        if src.epid == domain.epid() {
            return rma_self(
                AmOp::ReqRead,
                self,
                src.vl,
                SelfBuf::Flat(&buf),
                addr,
                key,
                context,
                flags,
                0,
            );
        }

        let tunables = domain.tunables();
        let chunk = tunables.max_reply_short;
        let len = buf.len();

        let token = domain.alloc_req(Request {
            op: AmOp::ReqRead,
            ep: self.clone(),
            error: None,
            no_event: self.read_no_event(flags),
            cq_flags: CqFlags::READ | CqFlags::RMA,
            payload: ReqPayload::Read(ReadReq {
                dst: ReadDst::Flat(buf.clone()),
                len,
                len_read: 0,
                addr,
                key,
                context,
            }),
        })?;
        let wire_tok = token.to_wire();
        let transport = domain.transport();

        if tunables.tagged_rma && len > chunk {
            // Post the landing buffer first so the target's send can never
            // race past it.
            let tag = MqTag::rma(src.vl, self.vl(), wire_tok);
            transport.mq_irecv(src.epid, tag, MqTag::MASK_ALL, buf, MqContext::new(token))?;

            let mut hdr = AmHeader::new(AmOp::ReqReadLong, self.vl(), src.vl);
            hdr.len = len as u32;
            let args = AmArgs::read_req(hdr, wire_tok, addr, key, None);
            transport.am_request_short(src.epid, &args, &[])?;
            return Ok(());
        }

        let mut hdr = AmHeader::new(AmOp::ReqRead, self.vl(), src.vl);
        let mut addr = addr;
        let mut offset = 0u64;
        let mut rem = len;
        while rem > chunk {
            hdr.len = chunk as u32;
            let args = AmArgs::read_req(hdr, wire_tok, addr, key, Some(offset));
            transport.am_request_short(src.epid, &args, &[])?;
            addr += chunk as u64;
            offset += chunk as u64;
            rem -= chunk;
        }

        hdr.flags |= AmFlags::EOM;
        hdr.len = rem as u32;
        let args = AmArgs::read_req(hdr, wire_tok, addr, key, Some(offset));
        transport.am_request_short(src.epid, &args, &[])?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn readv_generic(
        self: &Arc<Self>,
        iov: &[LocalSlice],
        src: PeerAddr,
        addr: u64,
        key: MrKey,
        context: UserContext,
        flags: OpFlags,
        trigger: Option<TriggerCond>,
    ) -> Result<(), RmaError> {
        if flags.contains(OpFlags::TRIGGER) {
            return self.defer_trigger(
                trigger,
                TriggeredOp::Readv {
                    ep: self.clone(),
                    iov: iov.to_vec().into_boxed_slice(),
                    src,
                    addr,
                    key,
                    context,
                    flags: flags - OpFlags::TRIGGER,
                },
            );
        }

        let domain = self.domain().clone();
        if src.epid == domain.epid() {
            return rma_self(
                AmOp::ReqReadv,
                self,
                src.vl,
                SelfBuf::Vector(iov),
                addr,
                key,
                context,
                flags,
                0,
            );
        }

        let tunables = domain.tunables();
        let chunk = tunables.max_reply_short;
        let total_len = iov_len(iov);

        let token = domain.alloc_req(Request {
            op: AmOp::ReqReadv,
            ep: self.clone(),
            error: None,
            no_event: self.read_no_event(flags),
            cq_flags: CqFlags::READ | CqFlags::RMA,
            payload: ReqPayload::Read(ReadReq {
                dst: ReadDst::Vector(iov.to_vec().into_boxed_slice()),
                len: total_len,
                len_read: 0,
                addr,
                key,
                context,
            }),
        })?;
        let wire_tok = token.to_wire();
        let transport = domain.transport();

        // Scan from the tail: the last non-empty segment rides the long
        // protocol iff it exceeds one packet.
        let mut long_seg = None;
        if tunables.tagged_rma {
            for seg in iov.iter().rev() {
                if seg.len() > chunk {
                    long_seg = Some(seg.clone());
                    break;
                } else if !seg.is_empty() {
                    break;
                }
            }
        }
        let long_len = long_seg.as_ref().map_or(0, LocalSlice::len);

        // Everything before the long segment travels the short protocol.
        let mut short_len = total_len - long_len;
        let mut hdr = AmHeader::new(AmOp::ReqRead, self.vl(), src.vl);
        let mut addr = addr;
        let mut offset = 0u64;
        while short_len > chunk {
            hdr.len = chunk as u32;
            let args = AmArgs::read_req(hdr, wire_tok, addr, key, Some(offset));
            transport.am_request_short(src.epid, &args, &[])?;
            addr += chunk as u64;
            offset += chunk as u64;
            short_len -= chunk;
        }

        // With a long tail in flight the short part carries no EOM;
        // completion is detected by accumulated length instead.
        if long_len == 0 {
            hdr.flags |= AmFlags::EOM;
        }
        hdr.len = short_len as u32;
        let args = AmArgs::read_req(hdr, wire_tok, addr, key, Some(offset));
        transport.am_request_short(src.epid, &args, &[])?;

        if let Some(seg) = long_seg {
            let tag = MqTag::rma(src.vl, self.vl(), wire_tok);
            transport.mq_irecv(src.epid, tag, MqTag::MASK_ALL, seg, MqContext::new(token))?;

            let mut hdr = AmHeader::new(AmOp::ReqReadLong, self.vl(), src.vl);
            hdr.len = long_len as u32;
            let args = AmArgs::read_req(hdr, wire_tok, addr + short_len as u64, key, None);
            transport.am_request_short(src.epid, &args, &[])?;
        }

        Ok(())
    }
}
