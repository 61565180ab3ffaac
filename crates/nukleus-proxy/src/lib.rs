//! Paired half-stream state machine, shared access grants, and the
//! expiry/challenge timer: the core of a nukleus proxy, independent of any
//! particular event-loop or wire codec.
//!
//! The surrounding event-loop/router is a deliberately external
//! collaborator — this crate only ever calls [`FrameSink`] to emit frames
//! and [`SignalingExecutor`] to schedule the expiry/challenge timer.

#[macro_use]
extern crate tracing;

mod frame_writer;
mod grant;
mod pair;

pub use frame_writer::{challenge_extension, unauthorized_extension, FrameSink};
pub use grant::{AccessGrant, GrantTable, NEVER};
pub use pair::{Clock, HalfRole, HalfState, Pair, Proxy, ProxyHalf, SignalingExecutor};
