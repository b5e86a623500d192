/*! Low-level segment access and construction.

The `wire` module deals with the representation of the one datagram format
this library speaks: a fixed-size segment header optionally followed by
payload bytes. It provides two levels of functionality.

 * First, the [`Packet`] wrapper extracts fields from a sequence of octets
   and inserts fields into a sequence of octets.
 * Second, [`Repr`] is a compact high-level representation of the header
   that can be created by parsing and emitted back into a buffer.

[`Packet`]: struct.Packet.html
[`Repr`]: struct.Repr.html

Header fields are encoded in **host byte order**. That keeps the codec a
plain copy but restricts interoperation to peers of the same endianness;
the integrity of the bytes themselves is the substrate's responsibility.

In the `Repr` family of data structures, `Repr::parse()` never panics and
`Repr::emit()` never panics as long as the target buffer holds at least
[`HEADER_LEN`] octets.

[`HEADER_LEN`]: constant.HEADER_LEN.html
*/
use core::fmt;

mod segment;

pub use segment::{Flags, Packet, Repr, SeqNumber, HEADER_LEN};

/// A range of octets within a segment buffer.
pub(crate) type Field = core::ops::Range<usize>;

/// The error type for parsing of inbound datagrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An incoming datagram was shorter than the segment header.
    Truncated,

    /// An incoming datagram was recognized but self-contradictory.
    ///
    /// The only way a fixed-layout segment can contradict itself is by
    /// carrying control bits outside the defined flag set.
    Malformed,
}

/// The result type for the wire layer.
pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Truncated => write!(f, "truncated segment"),
            Error::Malformed => write!(f, "malformed segment"),
        }
    }
}
