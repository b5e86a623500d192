//! The transport layer abstraction.
//!
//! Offers a connection-oriented, reliable, ordered byte stream on top of
//! whatever datagram substrate the caller provides. The [`Endpoint`]
//! never owns a socket: outbound segments leave through the caller's
//! [`Egress`] hook and inbound datagrams are handed in through
//! [`Endpoint::ingest`]. Timers are driven by [`Endpoint::tick`].
//!
//! ## Structure
//!
//! The main functionality of the [`Endpoint`] structure is storing the
//! connection states. Connections are kept in one dense table sorted by
//! their [`PortPair`], which doubles as the public connection key; an
//! incoming segment is matched to its connection by binary search.
//! Connections hold no reference back to the endpoint, so no ownership
//! cycle exists: everything the per-connection operations need travels in
//! an [`Operator`], the borrowed capability handle that is also what all
//! callbacks receive.
//!
//! ## Creating a connection
//!
//! An active open sends the initial SYN from [`Endpoint::connect`], which
//! picks a free local port with the high bit set and returns the pair
//! identifying the new connection. Delivery is taken by the [`Recv`]
//! handler supplied to the call.
//!
//! ## Accepting connections
//!
//! Accepting occurs as a reaction to an incoming SYN instead of
//! proactively, and the decision is deferred to the user: a cheap
//! [`Listen::pre_accept`] predicate may refuse the port before any state
//! is allocated, and [`Listen::accept`] fires once the three-way
//! handshake completes. The accept handler takes delivery by installing a
//! [`Recv`] handler through [`Operator::accept`]; if it declines, the
//! connection is reset and reaped.
//!
//! ## Deviations
//!
//! A few simplifications are deliberate in this revision:
//!
//! * Segments are accepted only exactly at the next expected sequence
//!   number; out-of-order segments are dropped and provoke an ACK. A
//!   reassembly window may lift this later.
//! * Three duplicate ACKs are counted and logged but do not yet trigger a
//!   fast retransmit.
//! * Retransmission is implemented for the handshake states and the
//!   established/closing-send path only.
//! * Header fields travel in host byte order, so both peers must share
//!   endianness.
//!
//! An incoming RST for an unknown connection is simply dropped; answering
//! resets with resets would loop two confused peers forever.
//!
//! [`Endpoint`]: struct.Endpoint.html
//! [`Endpoint::ingest`]: struct.Endpoint.html#method.ingest
//! [`Endpoint::tick`]: struct.Endpoint.html#method.tick
//! [`Endpoint::connect`]: struct.Endpoint.html#method.connect
//! [`Egress`]: trait.Egress.html
//! [`Listen`]: trait.Listen.html
//! [`Listen::pre_accept`]: trait.Listen.html#method.pre_accept
//! [`Listen::accept`]: trait.Listen.html#tymethod.accept
//! [`Recv`]: trait.Recv.html
//! [`Operator`]: struct.Operator.html
//! [`Operator::accept`]: struct.Operator.html#method.accept
//! [`PortPair`]: struct.PortPair.html
use core::fmt;

mod connection;
mod endpoint;
mod isn;
#[cfg(test)]
mod tests;

pub use connection::{Connection, Operator, Receive, Send, State};
pub use endpoint::{Endpoint, PortPair};
pub use isn::IsnGenerator;

/// The result type for endpoint operations.
pub type Result<T> = core::result::Result<T, Error>;

/// The error type for endpoint operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// An inbound datagram was shorter than a segment header or carried
    /// unknown control bits.
    BadMessage,

    /// The requested connection pair is already in use.
    AddressInUse,

    /// The action could not be completed because there were not enough
    /// resources, e.g. all local ports are taken.
    Exhausted,

    /// The operation requires an established connection.
    NotConnected,

    /// The sending direction of the stream has already been closed.
    BrokenPipe,

    /// The connection no longer exists or was already closed locally.
    Closed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::BadMessage => write!(f, "bad segment"),
            Error::AddressInUse => write!(f, "address in use"),
            Error::Exhausted => write!(f, "not enough resources"),
            Error::NotConnected => write!(f, "not connected"),
            Error::BrokenPipe => write!(f, "stream closed for sending"),
            Error::Closed => write!(f, "connection closed"),
        }
    }
}

/// A parse failure surfaces to the caller of `ingest` as one error kind.
impl From<crate::wire::Error> for Error {
    fn from(_: crate::wire::Error) -> Self {
        Error::BadMessage
    }
}

/// Why a stream ended.
///
/// Delivered to [`Recv::end`], unifying the graceful stream end with the
/// failure causes.
///
/// [`Recv::end`]: trait.Recv.html#tymethod.end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cause {
    /// The remote closed its half of the stream; no more data will
    /// arrive, sending may still proceed.
    Finished,

    /// The remote refused the connection attempt.
    Refused,

    /// The remote reset the connection.
    Reset,

    /// The user timeout expired before the connection made progress.
    TimedOut,
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Cause::Finished => write!(f, "finished"),
            Cause::Refused => write!(f, "connection refused"),
            Cause::Reset => write!(f, "connection reset"),
            Cause::TimedOut => write!(f, "timed out"),
        }
    }
}

/// The egress path towards the datagram substrate.
///
/// Each call hands over one complete outbound datagram: a segment header
/// and its payload. The hook is invoked synchronously and must not
/// reenter the endpoint it was installed on.
pub trait Egress {
    /// Carry one datagram to the substrate.
    fn send(&mut self, datagram: &[u8]);
}

/// The listener policy for incoming connection attempts.
pub trait Listen {
    /// Cheap filter invoked on the initial SYN, before any state is
    /// allocated for the attempt. Returning `false` answers with a reset.
    fn pre_accept(&mut self, port: u16) -> bool {
        let _ = port;
        true
    }

    /// Take delivery of a connection whose handshake just completed.
    ///
    /// The handler is expected to install a [`Recv`] handler via
    /// [`Operator::accept`]; a connection left unaccepted is reset.
    ///
    /// [`Recv`]: trait.Recv.html
    /// [`Operator::accept`]: struct.Operator.html#method.accept
    fn accept(&mut self, conn: Operator<'_>, port: u16);
}

/// A per-connection consumer of the inbound byte stream.
///
/// Both methods may operate on the connection through the supplied
/// [`Operator`], e.g. answer by queueing data right away.
///
/// [`Operator`]: struct.Operator.html
pub trait Recv {
    /// Deliver in-order payload bytes.
    ///
    /// All bytes are consumed by this call; there is no partial take.
    fn receive(&mut self, conn: Operator<'_>, data: &[u8]);

    /// The stream ended, gracefully or not.
    fn end(&mut self, conn: Operator<'_>, cause: Cause);
}

/// A writability notification for a connection.
///
/// Invoked from the timer sweep when a good amount of send buffer is
/// available again, so the application may enqueue more data.
pub trait Poll {
    /// The connection can take roughly `free` more bytes.
    fn poll(&mut self, conn: Operator<'_>, free: usize);
}

/// A standard wrapper for a function implementing one of the handler
/// traits.
///
/// Keeps the type alias overhead low by providing a single wrapper type
/// that implements the single-method traits where applicable.
pub struct FnHandler<F>(pub F);

impl<F: FnMut(&[u8])> Egress for FnHandler<F> {
    fn send(&mut self, datagram: &[u8]) {
        self.0(datagram)
    }
}

impl<F: FnMut(Operator<'_>, usize)> Poll for FnHandler<F> {
    fn poll(&mut self, conn: Operator<'_>, free: usize) {
        self.0(conn, free)
    }
}
