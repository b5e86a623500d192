//! A userspace reliable, ordered byte-stream transport.
//!
//! This library implements a TCP-like protocol on top of an arbitrary
//! unreliable datagram substrate, for example the payload channel of an
//! encrypted tunnel. It owns no sockets and starts no threads: the caller
//! feeds inbound datagrams into an [`Endpoint`], supplies an egress hook
//! that carries outbound datagrams to the substrate, and drives timers by
//! calling the sweep whenever its own event loop wakes up.
//!
//! ## Table of contents
//!
//! 1. [The wire module](wire/index.html) — the segment header codec and
//!    sequence number arithmetic.
//! 2. [The host module](host/index.html) — connection state machines and
//!    the endpoint that multiplexes them.
//! 3. [Time structures](time/index.html) — instants and expirations, all
//!    passed in by the caller.
//!
//! ## Design
//!
//! The endpoint is reentered only through its public methods and never
//! suspends; every operation completes synchronously, possibly invoking
//! the caller-supplied handlers along the way. All state lives in the
//! [`Endpoint`]; there are no global variables and no internal clock.
//!
//! Nothing here requires `std` (see the `std` feature, on by default),
//! but connection tables and send buffers do allocate.
//!
//! [`Endpoint`]: host/struct.Endpoint.html
#![warn(missing_docs)]
#![warn(unreachable_pub)]

// tests should be able to use `std`
#![cfg_attr(all(
    not(feature = "std"),
    not(test)),
no_std)]

extern crate alloc;

#[macro_use]
mod macros;

pub mod host;
pub mod time;
pub mod wire;

pub use host::{
    Cause, Connection, Egress, Endpoint, Error, FnHandler, IsnGenerator, Listen, Operator, Poll,
    PortPair, Recv, State,
};
