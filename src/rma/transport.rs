//! The transport capability interface.
//!
//! The engine drives exactly four transport operations: short AM requests,
//! short AM replies, and non-blocking tagged MQ sends and receives.
//! Keeping them behind a trait lets the engine run over anything from a
//! real fabric to the in-process [`crate::lo::Loopback`].

use super::arena::ReqToken;
use super::error::RmaError;
use super::mr::LocalSlice;
use super::types::EpId;
use super::wire::{AmArgs, MqTag};

/// Identifies the source of an incoming AM and routes the reply back to it.
#[derive(Debug, Clone, Copy)]
pub struct AmToken {
    /// Endpoint id of the requesting peer.
    pub peer: EpId,
}

/// Opaque per-operation context attached to MQ submissions; handed back
/// verbatim in [`crate::Domain::mq_complete`].
#[derive(Debug, Clone, Copy)]
pub struct MqContext(pub(crate) ReqToken);

impl MqContext {
    pub(crate) fn new(token: ReqToken) -> Self {
        Self(token)
    }
}

/// The transport operations the engine depends on.
///
/// Contract:
/// - AM payload bytes are captured during the call; the engine's buffers
///   need not outlive it.
/// - MQ buffers are referenced until the matching completion is delivered
///   through [`crate::Domain::mq_complete`]; the [`LocalSlice`] handle
///   keeps the backing memory alive.
/// - Delivery is reliable and fragments of one request stay in send order.
pub trait Transport: Send + Sync {
    /// Send a short AM request carrying `args` and inline `payload` to the
    /// RMA handler of `peer`.
    fn am_request_short(&self, peer: EpId, args: &AmArgs, payload: &[u8])
        -> Result<(), RmaError>;

    /// Reply to an AM currently being handled.
    fn am_reply_short(&self, token: &AmToken, args: &AmArgs, payload: &[u8])
        -> Result<(), RmaError>;

    /// Post a non-blocking tagged send to `peer`. A completion is
    /// delivered only when `context` is supplied.
    fn mq_isend(
        &self,
        peer: EpId,
        tag: MqTag,
        buf: LocalSlice,
        context: Option<MqContext>,
    ) -> Result<(), RmaError>;

    /// Post a non-blocking tagged receive for a message from `peer`
    /// matching `tag` under `mask`.
    fn mq_irecv(
        &self,
        peer: EpId,
        tag: MqTag,
        mask: MqTag,
        buf: LocalSlice,
        context: MqContext,
    ) -> Result<(), RmaError>;
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use super::*;

    /// A transport that accepts and discards everything. Enough for tests
    /// that never poll the wire.
    pub(crate) struct NullTransport;

    impl NullTransport {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self)
        }
    }

    impl Transport for NullTransport {
        fn am_request_short(&self, _: EpId, _: &AmArgs, _: &[u8]) -> Result<(), RmaError> {
            Ok(())
        }

        fn am_reply_short(&self, _: &AmToken, _: &AmArgs, _: &[u8]) -> Result<(), RmaError> {
            Ok(())
        }

        fn mq_isend(
            &self,
            _: EpId,
            _: MqTag,
            _: LocalSlice,
            _: Option<MqContext>,
        ) -> Result<(), RmaError> {
            Ok(())
        }

        fn mq_irecv(
            &self,
            _: EpId,
            _: MqTag,
            _: MqTag,
            _: LocalSlice,
            _: MqContext,
        ) -> Result<(), RmaError> {
            Ok(())
        }
    }
}
