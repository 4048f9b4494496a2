//! A one-sided remote memory access (RMA) engine layered over an
//! active-message transport and a tagged message queue.
//!
//! An initiator issues reads and writes against remote registered memory
//! identified by an MR key. Small transfers travel inline in AM packets
//! (the short protocol, fragmented at the packet limit); large transfers
//! are announced with a single AM control packet and carried out of band
//! over the tagged message queue (the long protocol). When the peer turns
//! out to be local, the engine skips the wire and copies in-process.
//!
//! Submission never blocks; completions arrive asynchronously through
//! completion queues ([`Cq`]) and counters ([`Cntr`]). The engine owns no
//! threads: everything happens inside submission calls, transport
//! upcalls ([`Domain::handle_am`], [`Domain::mq_complete`]), and progress
//! polls ([`Domain::progress`]).
//!
//! The transport is abstract (the [`Transport`] trait); the [`lo`] module
//! provides an in-process loopback implementation.
//!
//! # Example
//!
//! ```
//! use remma::{Cq, Domain, Endpoint, EndpointConfig, LocalSlice, PeerAddr,
//!             Permission, RmaMem, Tunables};
//! use remma::lo::Loopback;
//!
//! # fn main() -> Result<(), remma::RmaError> {
//! let lo = Loopback::new();
//! let initiator = Domain::new(1, Tunables::default(), lo.port(1));
//! let target = Domain::new(2, Tunables::default(), lo.port(2));
//! lo.attach(&initiator);
//! lo.attach(&target);
//!
//! // The target exposes a 4 KiB window at address 0x1000 under key 7.
//! let window = RmaMem::new(4096);
//! target.register_mr(7, 0x1000, Permission::default(), &window, None);
//! let _tep = Endpoint::new(&target, 0, EndpointConfig::default())?;
//!
//! let send_cq = Cq::new(16);
//! let mut config = EndpointConfig::default();
//! config.send_cq = Some(send_cq.clone());
//! let ep = Endpoint::new(&initiator, 0, config)?;
//!
//! let buf = RmaMem::with_content(b"hello");
//! ep.write(LocalSlice::whole(&buf), PeerAddr { epid: 2, vl: 0 }, 0x1000, 7, 0)?;
//! lo.poll()?;
//!
//! assert_eq!(&window.to_vec()[..5], b"hello");
//! assert!(send_cq.poll().is_some());
//! # Ok(()) }
//! ```

/// Engine tunables and configuration loading.
mod config;

/// The RMA engine.
/// Not to be publicly exposed, instead `pub use` necessary items.
mod rma;

/// Shared utility functions.
mod utils;

pub use config::*;
pub use rma::arena::ReqToken;
pub use rma::cq::*;
pub use rma::ep::*;
pub use rma::error::*;
pub use rma::initiator::*;
pub use rma::mr::{LocalSlice, Mr, Permission, RmaMem};
pub use rma::transport::*;
pub use rma::trigger::*;
pub use rma::wire::*;

/// Type aliases for RMA-related operations.
pub use rma::types;

/// In-process loopback transport.
pub mod lo;
