//! Type aliases for RMA-related operations.

/// Virtual lane (VL) is a [`u8`] that selects one endpoint inside a multi-endpoint domain.
pub type Vl = u8;

/// Endpoint id (EpId) is a [`u64`] that identifies a peer process on the fabric.
pub type EpId = u64;

/// MR key (MrKey) is a [`u64`] that identifies a registered remote memory region.
pub type MrKey = u64;

/// User context (UserContext) is a [`u64`] that can be designated by the user to identify
/// an operation in its completion event.
pub type UserContext = u64;
