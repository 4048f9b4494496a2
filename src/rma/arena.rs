//! The request arena.
//!
//! The wire carries request handles as opaque 64-bit tokens. Rather than
//! round-tripping raw addresses, requests live in a per-domain slab and the
//! token encodes `(slot, generation)`; a reply holding a token whose
//! generation no longer matches the slot is stale and is rejected instead
//! of touching freed state.

use super::error::RmaError;
use super::req::Request;

/// A generational handle to a request record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReqToken {
    slot: u32,
    gen: u32,
}

impl ReqToken {
    /// Encode for the wire. Generations start at 1, so zero never names a
    /// live request.
    #[inline]
    pub fn to_wire(self) -> u64 {
        (u64::from(self.gen) << 32) | u64::from(self.slot)
    }

    /// Decode a wire token. Validity is established by the arena lookup,
    /// not here.
    #[inline]
    pub fn from_wire(raw: u64) -> Self {
        Self {
            slot: raw as u32,
            gen: (raw >> 32) as u32,
        }
    }
}

struct Slot {
    gen: u32,
    req: Option<Request>,
}

/// A bounded slab of request records.
pub(crate) struct RequestArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    limit: usize,
}

impl RequestArena {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            limit,
        }
    }

    /// Store a request, handing back its token. Fails with
    /// [`RmaError::Nomem`] once `limit` requests are live.
    pub(crate) fn insert(&mut self, req: Request) -> Result<ReqToken, RmaError> {
        if self.live >= self.limit {
            return Err(RmaError::Nomem);
        }
        self.live += 1;
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            entry.req = Some(req);
            return Ok(ReqToken {
                slot,
                gen: entry.gen,
            });
        }
        let slot = self.slots.len() as u32;
        self.slots.push(Slot { gen: 1, req: Some(req) });
        Ok(ReqToken { slot, gen: 1 })
    }

    /// Look up a live request; `None` for stale or unknown tokens.
    pub(crate) fn get_mut(&mut self, token: ReqToken) -> Option<&mut Request> {
        let entry = self.slots.get_mut(token.slot as usize)?;
        if entry.gen != token.gen {
            return None;
        }
        entry.req.as_mut()
    }

    /// Remove a live request, bumping the slot generation so that the
    /// token can never resolve again.
    pub(crate) fn remove(&mut self, token: ReqToken) -> Option<Request> {
        let entry = self.slots.get_mut(token.slot as usize)?;
        if entry.gen != token.gen {
            return None;
        }
        let req = entry.req.take()?;
        entry.gen = entry.gen.wrapping_add(1).max(1);
        self.free.push(token.slot);
        self.live -= 1;
        Some(req)
    }

    /// Number of live requests.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.live
    }
}
