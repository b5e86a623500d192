use core::{cmp, fmt, ops};
use byteorder::{ByteOrder, NativeEndian};

use super::{Error, Result};

/// A sequence number.
///
/// A sequence number is a monotonically advancing integer modulo
/// 2<sup>32</sup>. Sequence numbers do not have a discontiguity when
/// compared pairwise across an overflow.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct SeqNumber(pub u32);

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNumber {
    /// The number of sequence slots between `other` and `self`, signed.
    ///
    /// Negative when `self` lies before `other` in sequence space. All
    /// orderings of sequence numbers reduce to the sign of this value.
    pub fn dist(self, other: SeqNumber) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }
}

impl ops::Add<u32> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: u32) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(rhs))
    }
}

impl ops::Add<usize> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: usize) -> SeqNumber {
        if rhs > i32::max_value() as usize {
            panic!("attempt to add to sequence number with unsigned overflow")
        }
        SeqNumber(self.0.wrapping_add(rhs as u32))
    }
}

impl ops::AddAssign<u32> for SeqNumber {
    fn add_assign(&mut self, rhs: u32) {
        *self = *self + rhs;
    }
}

impl ops::AddAssign<usize> for SeqNumber {
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl ops::Sub for SeqNumber {
    type Output = i32;

    fn sub(self, rhs: SeqNumber) -> i32 {
        self.dist(rhs)
    }
}

impl cmp::PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &SeqNumber) -> Option<cmp::Ordering> {
        self.dist(*other).partial_cmp(&0)
    }
}

/// A set of segment control flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags(pub u16);

mod field {
    use crate::wire::Field;

    pub(crate) const SRC_PORT: Field = 0..2;
    pub(crate) const DST_PORT: Field = 2..4;
    pub(crate) const SEQ_NUM:  Field = 4..8;
    pub(crate) const ACK_NUM:  Field = 8..12;
    pub(crate) const WIN_SIZE: Field = 12..16;
    pub(crate) const FLAGS:    Field = 16..18;
    pub(crate) const AUX:      Field = 18..20;

    pub(crate) const FLG_SYN: u16 = 0x1;
    pub(crate) const FLG_ACK: u16 = 0x2;
    pub(crate) const FLG_FIN: u16 = 0x4;
    pub(crate) const FLG_RST: u16 = 0x8;

    pub(crate) const FLG_ALL: u16 = FLG_SYN | FLG_ACK | FLG_FIN | FLG_RST;
}

/// Length of the fixed segment header, in octets.
pub const HEADER_LEN: usize = field::AUX.end;

/// A read/write wrapper around a segment buffer.
#[derive(Debug, PartialEq, Clone)]
pub struct Packet<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with segment structure.
    pub fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no header accessor method will panic if called.
    ///
    /// Returns `Err(Error::Truncated)` if the buffer is shorter than the
    /// fixed header.
    pub fn check_len(&self) -> Result<()> {
        if self.buffer.as_ref().len() < HEADER_LEN {
            Err(Error::Truncated)
        } else {
            Ok(())
        }
    }

    /// Consume the packet, returning the underlying buffer.
    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the source port field.
    #[inline]
    pub fn src_port(&self) -> u16 {
        let data = self.buffer.as_ref();
        NativeEndian::read_u16(&data[field::SRC_PORT])
    }

    /// Return the destination port field.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        let data = self.buffer.as_ref();
        NativeEndian::read_u16(&data[field::DST_PORT])
    }

    /// Return the sequence number field.
    #[inline]
    pub fn seq_number(&self) -> SeqNumber {
        let data = self.buffer.as_ref();
        SeqNumber(NativeEndian::read_u32(&data[field::SEQ_NUM]))
    }

    /// Return the acknowledgement number field.
    #[inline]
    pub fn ack_number(&self) -> SeqNumber {
        let data = self.buffer.as_ref();
        SeqNumber(NativeEndian::read_u32(&data[field::ACK_NUM]))
    }

    /// Return the window size field.
    #[inline]
    pub fn window(&self) -> u32 {
        let data = self.buffer.as_ref();
        NativeEndian::read_u32(&data[field::WIN_SIZE])
    }

    /// Read all flags at once.
    #[inline]
    pub fn flags(&self) -> Flags {
        let data = self.buffer.as_ref();
        Flags(NativeEndian::read_u16(&data[field::FLAGS]))
    }

    /// Return the reserved auxiliary field.
    #[inline]
    pub fn aux(&self) -> u16 {
        let data = self.buffer.as_ref();
        NativeEndian::read_u16(&data[field::AUX])
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Packet<&'a T> {
    /// Return a pointer to the payload.
    #[inline]
    pub fn payload_slice(&self) -> &'a [u8] {
        let data = <T as AsRef<[u8]>>::as_ref(self.buffer);
        &data[HEADER_LEN..]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    /// Set the source port field.
    #[inline]
    pub fn set_src_port(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NativeEndian::write_u16(&mut data[field::SRC_PORT], value)
    }

    /// Set the destination port field.
    #[inline]
    pub fn set_dst_port(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NativeEndian::write_u16(&mut data[field::DST_PORT], value)
    }

    /// Set the sequence number field.
    #[inline]
    pub fn set_seq_number(&mut self, value: SeqNumber) {
        let data = self.buffer.as_mut();
        NativeEndian::write_u32(&mut data[field::SEQ_NUM], value.0)
    }

    /// Set the acknowledgement number field.
    #[inline]
    pub fn set_ack_number(&mut self, value: SeqNumber) {
        let data = self.buffer.as_mut();
        NativeEndian::write_u32(&mut data[field::ACK_NUM], value.0)
    }

    /// Set the window size field.
    #[inline]
    pub fn set_window(&mut self, value: u32) {
        let data = self.buffer.as_mut();
        NativeEndian::write_u32(&mut data[field::WIN_SIZE], value)
    }

    /// Set a combination of flags.
    #[inline]
    pub fn set_flags(&mut self, Flags(flags): Flags) {
        let data = self.buffer.as_mut();
        NativeEndian::write_u16(&mut data[field::FLAGS], flags)
    }

    /// Set the reserved auxiliary field.
    #[inline]
    pub fn set_aux(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NativeEndian::write_u16(&mut data[field::AUX], value)
    }

    /// Return a mutable pointer to the payload data.
    #[inline]
    pub fn payload_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer.as_mut()[HEADER_LEN..]
    }
}

impl Flags {
    /// Return the SYN flag.
    #[inline]
    pub fn syn(&self) -> bool {
        self.0 & field::FLG_SYN != 0
    }

    /// Return the ACK flag.
    #[inline]
    pub fn ack(&self) -> bool {
        self.0 & field::FLG_ACK != 0
    }

    /// Return the FIN flag.
    #[inline]
    pub fn fin(&self) -> bool {
        self.0 & field::FLG_FIN != 0
    }

    /// Return the RST flag.
    #[inline]
    pub fn rst(&self) -> bool {
        self.0 & field::FLG_RST != 0
    }

    /// Set the SYN flag.
    #[inline]
    pub fn set_syn(&mut self, value: bool) {
        let flag = if value { field::FLG_SYN } else { 0 };
        self.0 = (self.0 & !field::FLG_SYN) | flag;
    }

    /// Set the ACK flag.
    #[inline]
    pub fn set_ack(&mut self, value: bool) {
        let flag = if value { field::FLG_ACK } else { 0 };
        self.0 = (self.0 & !field::FLG_ACK) | flag;
    }

    /// Set the FIN flag.
    #[inline]
    pub fn set_fin(&mut self, value: bool) {
        let flag = if value { field::FLG_FIN } else { 0 };
        self.0 = (self.0 & !field::FLG_FIN) | flag;
    }

    /// Set the RST flag.
    #[inline]
    pub fn set_rst(&mut self, value: bool) {
        let flag = if value { field::FLG_RST } else { 0 };
        self.0 = (self.0 & !field::FLG_RST) | flag;
    }

    /// Whether any bit outside the defined flag set is present.
    #[inline]
    pub fn has_unknown(&self) -> bool {
        self.0 & !field::FLG_ALL != 0
    }
}

/// A high-level representation of a segment header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    /// Source connection identifier.
    pub src_port: u16,
    /// Destination connection identifier.
    pub dst_port: u16,
    /// Control flags of the segment.
    pub flags: Flags,
    /// Sequence number of the first payload byte, or of the control flag
    /// when the segment carries none.
    pub seq_number: SeqNumber,
    /// Next sequence number the sender expects to receive.
    ///
    /// `Some` exactly when the ACK flag is set.
    pub ack_number: Option<SeqNumber>,
    /// The window advertised by the sender.
    pub window: u32,
    /// Number of payload octets following the header.
    pub payload_len: usize,
}

impl Repr {
    /// Parse a datagram and return a high-level representation.
    pub fn parse<T: AsRef<[u8]> + ?Sized>(packet: &Packet<&T>) -> Result<Repr> {
        packet.check_len()?;

        let flags = packet.flags();
        if flags.has_unknown() {
            return Err(Error::Malformed);
        }

        let ack_number = if flags.ack() {
            Some(packet.ack_number())
        } else {
            None
        };
        // The aux field is reserved and ignored on receive.

        Ok(Repr {
            src_port: packet.src_port(),
            dst_port: packet.dst_port(),
            flags,
            seq_number: packet.seq_number(),
            ack_number,
            window: packet.window(),
            payload_len: packet.payload_slice().len(),
        })
    }

    /// Return the length of a datagram that will be emitted from this
    /// high-level representation.
    pub fn buffer_len(&self) -> usize {
        HEADER_LEN + self.payload_len
    }

    /// Emit a high-level representation into a segment buffer.
    ///
    /// The buffer must hold at least [`HEADER_LEN`] octets; payload bytes
    /// are the caller's business.
    ///
    /// [`HEADER_LEN`]: constant.HEADER_LEN.html
    pub fn emit<T: AsRef<[u8]> + AsMut<[u8]>>(&self, packet: &mut Packet<T>) {
        packet.set_src_port(self.src_port);
        packet.set_dst_port(self.dst_port);
        packet.set_seq_number(self.seq_number);
        packet.set_ack_number(self.ack_number.unwrap_or(SeqNumber(0)));
        packet.set_window(self.window);
        let mut flags = self.flags;
        flags.set_ack(self.ack_number.is_some());
        packet.set_flags(flags);
        packet.set_aux(0);
    }
}

impl fmt::Display for Repr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "src={} dst={}", self.src_port, self.dst_port)?;
        if self.flags.syn() { write!(f, " syn")? }
        if self.flags.fin() { write!(f, " fin")? }
        if self.flags.rst() { write!(f, " rst")? }
        write!(f, " seq={}", self.seq_number)?;
        if let Some(ack_number) = self.ack_number {
            write!(f, " ack={}", ack_number)?;
        }
        write!(f, " win={}", self.window)?;
        write!(f, " len={}", self.payload_len)
    }
}
