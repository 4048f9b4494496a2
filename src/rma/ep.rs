//! Domains and endpoints.
//!
//! A domain is one progress context: it owns the MR table, the request
//! arena, the deferred-RMA queue, and the transport handle, and it is what
//! the transport calls back into (`handle_am`, `mq_complete`). Endpoints
//! are the per-lane completion surfaces hanging off a domain.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use super::arena::{ReqToken, RequestArena};
use super::cq::{Cntr, Cq};
use super::error::RmaError;
use super::initiator::OpFlags;
use super::mr::{Mr, MrTable, Permission, RmaMem};
use super::req::Request;
use super::transport::Transport;
use super::trigger::TriggerRegistry;
use super::types::{EpId, MrKey, Vl};
use crate::config::Tunables;
use crate::utils::lock;

/// Fabric address of a remote endpoint: the peer process plus the lane of
/// the endpoint within its domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr {
    pub epid: EpId,
    pub vl: Vl,
}

/// One progress domain.
pub struct Domain {
    epid: EpId,
    tunables: Tunables,
    transport: Arc<dyn Transport>,
    mrs: MrTable,
    eps: Mutex<Vec<Option<Weak<Endpoint>>>>,
    pub(crate) arena: Mutex<RequestArena>,
    /// Long-protocol requests accepted by the AM handler, waiting for the
    /// pump to post their MQ operation. FIFO per domain.
    pub(crate) rma_queue: Mutex<VecDeque<ReqToken>>,
    triggers: Mutex<Option<Arc<dyn TriggerRegistry>>>,
}

impl Domain {
    /// Create a domain identified by `epid` on the given transport.
    pub fn new(epid: EpId, tunables: Tunables, transport: Arc<dyn Transport>) -> Arc<Self> {
        let arena = RequestArena::new(tunables.max_requests);
        Arc::new(Self {
            epid,
            tunables,
            transport,
            mrs: MrTable::new(),
            eps: Mutex::new(Vec::new()),
            arena: Mutex::new(arena),
            rma_queue: Mutex::new(VecDeque::new()),
            triggers: Mutex::new(None),
        })
    }

    /// The endpoint id shared by every endpoint of this domain.
    #[inline]
    pub fn epid(&self) -> EpId {
        self.epid
    }

    #[inline]
    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    #[inline]
    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Expose `mem` to remote peers under `key`, with the window starting
    /// at remote-visible address `addr`. Replaces any previous
    /// registration under the same key.
    pub fn register_mr(
        &self,
        key: MrKey,
        addr: u64,
        access: Permission,
        mem: &Arc<RmaMem>,
        cntr: Option<Arc<Cntr>>,
    ) -> Arc<Mr> {
        let mr = Mr::new(key, addr, access, mem, cntr);
        self.mrs.insert(mr.clone());
        mr
    }

    /// Look up an MR by key.
    pub fn mr(&self, key: MrKey) -> Option<Arc<Mr>> {
        self.mrs.get(key)
    }

    /// Drop the registration under `key`. In-flight handler calls that
    /// already resolved the MR keep their reference until they finish.
    pub fn deregister_mr(&self, key: MrKey) -> Option<Arc<Mr>> {
        self.mrs.remove(key)
    }

    /// Install the external registry that triggered operations are
    /// deferred to.
    pub fn set_trigger_registry(&self, registry: Arc<dyn TriggerRegistry>) {
        *lock(&self.triggers) = Some(registry);
    }

    pub(crate) fn trigger_registry(&self) -> Option<Arc<dyn TriggerRegistry>> {
        lock(&self.triggers).clone()
    }

    /// The live endpoint on `vl`, if any.
    pub(crate) fn ep(&self, vl: Vl) -> Option<Arc<Endpoint>> {
        let eps = lock(&self.eps);
        eps.get(usize::from(vl))?.as_ref()?.upgrade()
    }

    fn bind_ep(&self, vl: Vl, ep: &Arc<Endpoint>) -> Result<(), RmaError> {
        let mut eps = lock(&self.eps);
        let idx = usize::from(vl);
        if eps.len() <= idx {
            eps.resize_with(idx + 1, || None);
        }
        if eps[idx].as_ref().is_some_and(|w| w.strong_count() > 0) {
            return Err(RmaError::Inval);
        }
        eps[idx] = Some(Arc::downgrade(ep));
        Ok(())
    }

    pub(crate) fn alloc_req(&self, req: Request) -> Result<ReqToken, RmaError> {
        lock(&self.arena).insert(req)
    }
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain").field("epid", &self.epid).finish()
    }
}

/// Completion resources and default flags of a new endpoint.
#[derive(Default)]
pub struct EndpointConfig {
    pub send_cq: Option<Arc<Cq>>,
    pub recv_cq: Option<Arc<Cq>>,
    pub write_cntr: Option<Arc<Cntr>>,
    pub read_cntr: Option<Arc<Cntr>>,
    pub remote_write_cntr: Option<Arc<Cntr>>,
    pub remote_read_cntr: Option<Arc<Cntr>>,
    /// When set, send CQ events are suppressed unless the operation
    /// carries [`OpFlags::COMPLETION`].
    pub send_selective_completion: bool,
    /// Flags implicitly added to every operation issued on the endpoint.
    pub tx_flags: OpFlags,
}

/// One endpoint on a domain lane.
pub struct Endpoint {
    domain: Arc<Domain>,
    vl: Vl,
    send_cq: Option<Arc<Cq>>,
    recv_cq: Option<Arc<Cq>>,
    write_cntr: Option<Arc<Cntr>>,
    read_cntr: Option<Arc<Cntr>>,
    remote_write_cntr: Option<Arc<Cntr>>,
    remote_read_cntr: Option<Arc<Cntr>>,
    send_selective_completion: bool,
    tx_flags: OpFlags,
}

impl Endpoint {
    /// Create an endpoint on lane `vl` of `domain`. Fails with
    /// [`RmaError::Inval`] if the lane is already bound.
    pub fn new(
        domain: &Arc<Domain>,
        vl: Vl,
        config: EndpointConfig,
    ) -> Result<Arc<Self>, RmaError> {
        let ep = Arc::new(Self {
            domain: domain.clone(),
            vl,
            send_cq: config.send_cq,
            recv_cq: config.recv_cq,
            write_cntr: config.write_cntr,
            read_cntr: config.read_cntr,
            remote_write_cntr: config.remote_write_cntr,
            remote_read_cntr: config.remote_read_cntr,
            send_selective_completion: config.send_selective_completion,
            tx_flags: config.tx_flags,
        });
        domain.bind_ep(vl, &ep)?;
        Ok(ep)
    }

    #[inline]
    pub fn domain(&self) -> &Arc<Domain> {
        &self.domain
    }

    #[inline]
    pub fn vl(&self) -> Vl {
        self.vl
    }

    #[inline]
    pub fn tx_flags(&self) -> OpFlags {
        self.tx_flags
    }

    #[inline]
    pub(crate) fn send_cq(&self) -> Option<&Arc<Cq>> {
        self.send_cq.as_ref()
    }

    #[inline]
    pub(crate) fn recv_cq(&self) -> Option<&Arc<Cq>> {
        self.recv_cq.as_ref()
    }

    #[inline]
    pub(crate) fn write_cntr(&self) -> Option<&Arc<Cntr>> {
        self.write_cntr.as_ref()
    }

    #[inline]
    pub(crate) fn read_cntr(&self) -> Option<&Arc<Cntr>> {
        self.read_cntr.as_ref()
    }

    #[inline]
    pub(crate) fn remote_write_cntr(&self) -> Option<&Arc<Cntr>> {
        self.remote_write_cntr.as_ref()
    }

    #[inline]
    pub(crate) fn remote_read_cntr(&self) -> Option<&Arc<Cntr>> {
        self.remote_read_cntr.as_ref()
    }

    #[inline]
    pub(crate) fn selective_completion(&self) -> bool {
        self.send_selective_completion
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("epid", &self.domain.epid())
            .field("vl", &self.vl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rma::transport::tests::NullTransport;

    #[test]
    fn test_lane_binding() {
        let domain = Domain::new(1, Tunables::default(), NullTransport::new());
        let ep = Endpoint::new(&domain, 2, EndpointConfig::default()).unwrap();
        assert!(domain.ep(2).is_some());
        assert!(domain.ep(0).is_none());
        // Lane already bound.
        assert!(Endpoint::new(&domain, 2, EndpointConfig::default()).is_err());
        // Dropping the endpoint frees the lane.
        drop(ep);
        assert!(domain.ep(2).is_none());
        assert!(Endpoint::new(&domain, 2, EndpointConfig::default()).is_ok());
    }
}
