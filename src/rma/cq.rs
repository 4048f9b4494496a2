//! Completion queues and counters.

use std::collections::VecDeque;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::error::RmaError;
use super::types::UserContext;
use crate::utils::lock;

/// Event flags describing what kind of operation completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct CqFlags(u32);

impl CqFlags {
    pub const EMPTY: Self = Self(0);
    pub const READ: Self = Self(0x1);
    pub const WRITE: Self = Self(0x2);
    pub const RMA: Self = Self(0x4);
    pub const REMOTE_WRITE: Self = Self(0x8);
    pub const REMOTE_CQ_DATA: Self = Self(0x10);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CqFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CqFlags {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqEvent {
    /// The user context of the completed operation; zero for remote events.
    pub context: UserContext,
    pub flags: CqFlags,
    /// Bytes transferred.
    pub len: usize,
    /// Immediate data, when `flags` carries [`CqFlags::REMOTE_CQ_DATA`].
    pub data: u64,
    /// Bytes short of the requested length (truncation), zero normally.
    pub olen: usize,
    /// `None` on success, the sticky operation error otherwise.
    pub error: Option<RmaError>,
}

/// A bounded completion queue.
///
/// Posting to a full queue fails with [`RmaError::Nomem`]; the engine
/// treats that as an event-delivery failure, never as a transfer failure.
pub struct Cq {
    capacity: usize,
    queue: Mutex<VecDeque<CqEvent>>,
}

impl Cq {
    /// The default CQ depth.
    pub const DEFAULT_CQ_DEPTH: usize = 128;

    /// Create a new completion queue holding up to `capacity` events.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
        })
    }

    /// Append an event.
    pub fn post(&self, event: CqEvent) -> Result<(), RmaError> {
        let mut queue = lock(&self.queue);
        if queue.len() >= self.capacity {
            return Err(RmaError::Nomem);
        }
        queue.push_back(event);
        Ok(())
    }

    /// Take the oldest event, if any.
    pub fn poll(&self) -> Option<CqEvent> {
        lock(&self.queue).pop_front()
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity of the queue.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// An event counter. Increments are best-effort and never fail.
#[derive(Debug, Default)]
pub struct Cntr {
    count: AtomicU64,
}

impl Cntr {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[inline]
    pub fn inc(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}
