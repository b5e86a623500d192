use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::time::Expiration;
use crate::wire::{Flags, Packet, Repr, SeqNumber, HEADER_LEN};

use super::endpoint::PortPair;
use super::{Egress, Error, Poll, Recv, Result};

/// Initial capacity of a connection's send buffer.
const DEFAULT_SNDBUF: usize = 4096;

/// Upper bound the send buffer grows towards, unless reconfigured.
const DEFAULT_MAX_SNDBUF: usize = 131_072;

/// Number of duplicate ACKs regarded as a loss signal.
const DUPACK_SIGNAL: u32 = 3;

/// The state of a connection.
///
/// Includes the current state machine state, the two transmission control
/// blocks, the send buffer and the timers. The control blocks are public:
/// it poses no problem for this library to allow inspection of internal
/// state beyond the transitions mandated by the protocol.
pub struct Connection {
    /// The port pair, unique within an endpoint.
    pub(super) pair: PortPair,

    /// The current state of the state machine.
    pub(super) state: State,

    /// The sending state.
    ///
    /// In RFC793 terms this is `SND`.
    pub snd: Send,

    /// The receiving state.
    ///
    /// In RFC793 terms this is `RCV`.
    pub rcv: Receive,

    /// Bytes enqueued but not yet acknowledged.
    pub(super) sndbuf: SendBuffer,

    /// The user timeout, also reused as the TIME_WAIT expiry.
    pub(super) conn_timeout: Expiration,

    /// The retransmission timer, armed while anything is in flight.
    pub(super) rtrx_timeout: Expiration,

    /// Count of consecutive duplicate ACKs.
    pub(super) dupack: u32,

    /// Whether the application is done with this connection and the next
    /// sweep may free it.
    pub(super) reapable: bool,

    pub(super) nodelay: bool,
    pub(super) keepalive: bool,

    pub(super) recv_handler: Option<Box<dyn Recv>>,
    pub(super) poll_handler: Option<Box<dyn Poll>>,
}

/// The send direction control block.
#[derive(Clone, Copy, Debug, Default)]
pub struct Send {
    /// The initial sequence number.
    ///
    /// Read-only after creation; kept around since it documents where the
    /// stream started. In RFC793 terms this is `ISS`.
    pub initial_seq: SeqNumber,

    /// The oldest not yet acknowledged sequence number.
    ///
    /// In RFC793 terms this is `SND.UNA`.
    pub unacked: SeqNumber,

    /// The next sequence number to use for transmission.
    ///
    /// In RFC793 terms this is `SND.NXT`.
    pub next: SeqNumber,

    /// One past the last sequence number the application has enqueued,
    /// including a queued FIN.
    pub last: SeqNumber,

    /// The window size most recently advertised by the receiver.
    pub window: u32,

    /// The congestion window, a self-imposed bound on in-flight bytes.
    ///
    /// Grows by one MTU whenever an ACK makes progress, capped at the
    /// maximum send buffer size.
    pub congestion_window: u32,
}

/// The receive direction control block.
#[derive(Clone, Copy, Debug, Default)]
pub struct Receive {
    /// The peer's initial sequence number.
    ///
    /// In RFC793 terms this is `IRS`.
    pub initial_seq: SeqNumber,

    /// The next expected sequence number.
    ///
    /// In RFC793 terms this is `RCV.NXT`. Segments elsewhere in sequence
    /// space are not acceptable.
    pub next: SeqNumber,

    /// The window this side advertises, currently constant one MTU.
    pub window: u32,
}

/// State enum of the statemachine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    /// Marker state of a connection not (or no longer) in use.
    Closed,

    /// A passively opened connection waiting for a SYN.
    ///
    /// Not entered by this revision: listening is a property of the
    /// endpoint, connections spring into existence in `SynReceived`.
    Listen,

    /// An open connection request.
    SynSent,

    /// Connection request we intend to answer, waiting on the ACK.
    SynReceived,

    /// An open connection.
    Established,

    /// Closed our side of the connection.
    FinWait1,

    /// Our close was acknowledged, awaiting the peer's.
    FinWait2,

    /// Both sides closed but the peer doesn't know we know.
    Closing,

    /// Both sides recognized the connection as closed.
    TimeWait,

    /// The peer closed its side of the connection.
    CloseWait,

    /// Connection closed after the peer closed its side already.
    ///
    /// Not entered by this revision: closing out of `CloseWait` proceeds
    /// through `Closing` instead.
    LastAck,
}

impl Default for State {
    fn default() -> Self {
        State::Closed
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            State::Closed => "CLOSED",
            State::Listen => "LISTEN",
            State::SynSent => "SYN_SENT",
            State::SynReceived => "SYN_RECEIVED",
            State::Established => "ESTABLISHED",
            State::FinWait1 => "FIN_WAIT_1",
            State::FinWait2 => "FIN_WAIT_2",
            State::Closing => "CLOSING",
            State::TimeWait => "TIME_WAIT",
            State::CloseWait => "CLOSE_WAIT",
            State::LastAck => "LAST_ACK",
        };
        write!(f, "{}", name)
    }
}

/// The per-connection send queue.
///
/// A contiguous buffer holding every byte between `snd.unacked` and
/// `snd.last`; the byte at offset `k` corresponds to sequence number
/// `snd.unacked + k`. The logical capacity grows by doubling up to the
/// configured maximum and never shrinks again.
#[derive(Debug)]
pub(super) struct SendBuffer {
    data: Vec<u8>,
    cap: usize,
    max: usize,
}

impl SendBuffer {
    fn new() -> Self {
        SendBuffer {
            data: Vec::with_capacity(DEFAULT_SNDBUF),
            cap: DEFAULT_SNDBUF,
            max: DEFAULT_MAX_SNDBUF,
        }
    }

    pub(super) fn capacity(&self) -> usize {
        self.cap
    }

    pub(super) fn max(&self) -> usize {
        self.max
    }

    pub(super) fn set_max(&mut self, max: usize) {
        self.max = max;
    }

    /// Append as much of `buf` as fits, growing the capacity on demand.
    ///
    /// Returns the number of bytes taken; zero means the buffer is full
    /// at its maximum size.
    fn enqueue(&mut self, buf: &[u8]) -> usize {
        let used = self.data.len();

        if buf.len() > self.cap - used && self.cap < self.max {
            let mut newcap = if self.cap > self.max / 2 {
                self.max
            } else {
                self.cap * 2
            };
            if used + buf.len() > newcap {
                newcap = (used + buf.len()).min(self.max);
            }
            self.cap = newcap;
        }

        let take = buf.len().min(self.cap - used);
        self.data.extend_from_slice(&buf[..take]);
        take
    }

    /// Drop `n` sequence slots from the front after they were
    /// acknowledged.
    ///
    /// A slot taken by a queued FIN has no byte stored for it, so the
    /// count is clamped to the bytes actually present.
    fn release(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.drain(..n);
    }

    fn slice(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }
}

impl Connection {
    pub(super) fn new(pair: PortPair, initial_seq: SeqNumber, mtu: u16) -> Self {
        Connection {
            pair,
            state: State::Closed,
            snd: Send {
                initial_seq,
                unacked: initial_seq,
                next: initial_seq + 1u32,
                last: initial_seq + 1u32,
                window: 0,
                congestion_window: u32::from(mtu),
            },
            rcv: Receive {
                initial_seq: SeqNumber(0),
                next: SeqNumber(0),
                window: u32::from(mtu),
            },
            sndbuf: SendBuffer::new(),
            conn_timeout: Expiration::Never,
            rtrx_timeout: Expiration::Never,
            dupack: 0,
            reapable: false,
            nodelay: false,
            keepalive: false,
            recv_handler: None,
            poll_handler: None,
        }
    }

    /// The port pair identifying this connection on its endpoint.
    pub fn pair(&self) -> PortPair {
        self.pair
    }

    /// The current state machine state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Whether the application has released the connection and the next
    /// sweep may free it.
    pub fn is_reapable(&self) -> bool {
        self.reapable
    }

    /// The maximum size the send buffer may grow to.
    pub fn sndbuf(&self) -> usize {
        self.sndbuf.max()
    }

    /// Reconfigure the maximum send buffer size.
    pub fn set_sndbuf(&mut self, max: usize) {
        self.sndbuf.set_max(max);
    }

    /// How far the send buffer may still grow.
    pub fn sndbuf_free(&self) -> usize {
        self.sndbuf.max().saturating_sub(self.sndbuf.capacity())
    }

    /// The number of sent but not yet acknowledged sequence slots.
    pub fn outq(&self) -> usize {
        (self.snd.next - self.snd.unacked) as usize
    }

    /// Whether segments are pushed out as soon as data is enqueued.
    ///
    /// Recorded per connection; this revision always behaves eagerly.
    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    /// Set the nodelay flag.
    pub fn set_nodelay(&mut self, nodelay: bool) {
        self.nodelay = nodelay;
    }

    /// Whether idle keepalive probing is requested.
    ///
    /// Recorded per connection; this revision does not yet probe.
    pub fn keepalive(&self) -> bool {
        self.keepalive
    }

    /// Set the keepalive flag.
    pub fn set_keepalive(&mut self, keepalive: bool) {
        self.keepalive = keepalive;
    }

    /// Install or remove the handler taking delivery of the stream.
    pub fn set_recv_handler(&mut self, handler: Option<Box<dyn Recv>>) {
        self.recv_handler = handler;
    }

    /// Install or remove the handler notified of send buffer headroom.
    pub fn set_poll_handler(&mut self, handler: Option<Box<dyn Poll>>) {
        self.poll_handler = handler;
    }

    pub(super) fn set_state(&mut self, state: State) {
        self.state = state;
        if state == State::Established {
            self.conn_timeout = Expiration::Never;
        }
        net_debug!("{} -> {} new state: {}", self.pair.local, self.pair.remote, state);
    }

    /// Push out buffered data as far as the congestion window allows.
    ///
    /// With `force`, at least one segment is emitted even if it ends up
    /// carrying nothing, acknowledging the current receive progress.
    pub(super) fn ack(&mut self, force: bool, egress: &mut dyn Egress, mtu: u16) {
        let mut left = self.snd.last - self.snd.next;
        let cwnd_left = self.snd.congestion_window as i32 - (self.snd.next - self.snd.unacked);

        assert!(left >= 0);

        if cwnd_left < left {
            left = cwnd_left.max(0);
        }

        if left == 0 && !force {
            return;
        }

        let mut dgram = vec![0u8; HEADER_LEN + usize::from(mtu)];

        loop {
            let seglen = (left as usize).min(usize::from(mtu));
            let seq = self.snd.next;
            self.snd.next += seglen;
            left -= seglen as i32;

            // When the tail of the buffered span goes out while a close
            // is pending, its final sequence slot is the FIN, not a byte.
            let mut flags = Flags::default();
            let mut datalen = seglen;
            if left == 0 && seglen > 0 {
                match self.state {
                    State::FinWait1 | State::Closing => {
                        datalen = seglen - 1;
                        flags.set_fin(true);
                    }
                    _ => {}
                }
            }

            let repr = Repr {
                src_port: self.pair.local,
                dst_port: self.pair.remote,
                flags,
                seq_number: seq,
                ack_number: Some(self.rcv.next),
                window: self.snd.window,
                payload_len: datalen,
            };

            let used = HEADER_LEN + datalen;
            {
                let mut packet = Packet::new_unchecked(&mut dgram[..used]);
                repr.emit(&mut packet);
                if datalen > 0 {
                    // The slot after the last byte may be a queued FIN,
                    // so only resolve the offset for real payload.
                    let offset = (seq - self.snd.unacked) as usize;
                    packet
                        .payload_mut_slice()
                        .copy_from_slice(self.sndbuf.slice(offset, datalen));
                }
            }
            net_trace!("send {}", repr);
            egress.send(&dgram[..used]);

            if left == 0 {
                break;
            }
        }
    }

    /// Rebuild and re-emit the earliest unacknowledged segment.
    ///
    /// Does not advance any sequence variable and does not touch the
    /// retransmission timer; the sweep re-arms it on its next pass.
    pub(super) fn retransmit(&mut self, egress: &mut dyn Egress, mtu: u16) {
        if self.state == State::Closed || self.snd.next == self.snd.unacked {
            return;
        }

        match self.state {
            State::SynSent => {
                let repr = Repr {
                    src_port: self.pair.local,
                    dst_port: self.pair.remote,
                    flags: {
                        let mut flags = Flags::default();
                        flags.set_syn(true);
                        flags
                    },
                    seq_number: self.snd.initial_seq,
                    ack_number: None,
                    window: self.rcv.window,
                    payload_len: 0,
                };
                net_trace!("rtrx {}", repr);
                emit_segment(egress, &repr, &[]);
            }

            State::SynReceived => {
                let repr = Repr {
                    src_port: self.pair.local,
                    dst_port: self.pair.remote,
                    flags: {
                        let mut flags = Flags::default();
                        flags.set_syn(true);
                        flags
                    },
                    seq_number: self.snd.next,
                    ack_number: Some(self.rcv.next),
                    window: self.rcv.window,
                    payload_len: 0,
                };
                net_trace!("rtrx {}", repr);
                emit_segment(egress, &repr, &[]);
            }

            State::Established | State::FinWait1 => {
                let mut len = (self.snd.next - self.snd.unacked) as usize;
                if self.state == State::FinWait1 {
                    len -= 1;
                }
                let mut flags = Flags::default();
                if len > usize::from(mtu) {
                    len = usize::from(mtu);
                } else if self.state == State::FinWait1 {
                    flags.set_fin(true);
                }
                let repr = Repr {
                    src_port: self.pair.local,
                    dst_port: self.pair.remote,
                    flags,
                    seq_number: self.snd.unacked,
                    ack_number: Some(self.rcv.next),
                    window: self.snd.window,
                    payload_len: len,
                };
                net_trace!("rtrx {}", repr);
                emit_segment(egress, &repr, self.sndbuf.slice(0, len));
            }

            _ => unimplemented!(),
        }
    }

    /// Queue application bytes for transmission.
    pub(super) fn enqueue(&mut self, data: &[u8], egress: &mut dyn Egress, mtu: u16) -> Result<usize> {
        if self.reapable {
            net_debug!("send on closed connection {} -> {}", self.pair.local, self.pair.remote);
            return Err(Error::Closed);
        }

        match self.state {
            State::Closed | State::Listen | State::SynSent | State::SynReceived => {
                return Err(Error::NotConnected);
            }
            State::Established | State::CloseWait => {}
            State::FinWait1
            | State::FinWait2
            | State::Closing
            | State::LastAck
            | State::TimeWait => {
                return Err(Error::BrokenPipe);
            }
        }

        if data.is_empty() {
            return Ok(0);
        }

        let taken = self.sndbuf.enqueue(data);
        if taken == 0 {
            // Buffer full at its maximum; zero bytes accepted.
            return Ok(0);
        }

        self.snd.last += taken;
        self.ack(false, egress, mtu);
        Ok(taken)
    }

    /// Close the sending direction, queueing a FIN behind any buffered
    /// data. Idempotent.
    pub(super) fn shutdown(&mut self, egress: &mut dyn Egress, mtu: u16) -> Result<()> {
        if self.reapable {
            net_debug!("shutdown on closed connection {} -> {}", self.pair.local, self.pair.remote);
            return Err(Error::Closed);
        }

        match self.state {
            State::Closed => return Ok(()),
            State::Listen | State::SynSent => {
                self.set_state(State::Closed);
                return Ok(());
            }
            State::SynReceived | State::Established => self.set_state(State::FinWait1),
            State::FinWait1 | State::FinWait2 => return Ok(()),
            State::CloseWait => self.set_state(State::Closing),
            State::Closing | State::LastAck | State::TimeWait => return Ok(()),
        }

        // The FIN occupies one sequence slot but no buffer byte.
        self.snd.last += 1u32;

        self.ack(false, egress, mtu);
        Ok(())
    }

    /// Graceful close: shutdown plus releasing the connection to the
    /// reaper.
    pub(super) fn close(&mut self, egress: &mut dyn Egress, mtu: u16) -> Result<()> {
        self.shutdown(egress, mtu)?;
        self.reapable = true;
        Ok(())
    }

    /// Tear the connection down immediately, notifying the peer with a
    /// reset when it may still hold state for it.
    pub(super) fn abort(&mut self, egress: &mut dyn Egress) -> Result<()> {
        if self.reapable {
            net_debug!("abort on closed connection {} -> {}", self.pair.local, self.pair.remote);
            return Err(Error::Closed);
        }

        self.reapable = true;

        match self.state {
            State::Closed => return Ok(()),
            State::Listen
            | State::SynSent
            | State::Closing
            | State::LastAck
            | State::TimeWait => {
                self.set_state(State::Closed);
                return Ok(());
            }
            State::SynReceived
            | State::Established
            | State::FinWait1
            | State::FinWait2
            | State::CloseWait => {
                self.set_state(State::Closed);
            }
        }

        let repr = Repr {
            src_port: self.pair.local,
            dst_port: self.pair.remote,
            flags: {
                let mut flags = Flags::default();
                flags.set_rst(true);
                flags
            },
            seq_number: self.snd.next,
            ack_number: None,
            window: 0,
            payload_len: 0,
        };
        net_trace!("send {}", repr);
        emit_segment(egress, &repr, &[]);
        Ok(())
    }

    /// Advance `snd.unacked` after the validity checks, releasing
    /// acknowledged bytes and growing the congestion window.
    ///
    /// `advanced` is the acknowledged sequence distance, already known to
    /// be positive.
    pub(super) fn advance_unacked(&mut self, ack: SeqNumber, advanced: i32, mtu: u16) {
        let mut data_acked = advanced;

        match self.state {
            // The SYN consumes one sequence slot.
            State::SynSent | State::SynReceived => data_acked -= 1,
            _ => {}
        }

        assert!(data_acked >= 0);
        assert!(data_acked <= self.snd.last - self.snd.unacked);

        self.sndbuf.release(data_acked as usize);
        self.snd.unacked = ack;

        self.dupack = 0;
        self.snd.congestion_window = (self.snd.congestion_window + u32::from(mtu))
            .min(self.sndbuf.max() as u32);
    }

    /// Count a duplicate ACK.
    pub(super) fn count_dupack(&mut self) {
        self.dupack += 1;
        if self.dupack >= DUPACK_SIGNAL {
            // Hook for a future fast retransmit, currently inert.
            net_debug!("{} -> {} triplicate ack", self.pair.local, self.pair.remote);
        }
    }
}

/// Emit one complete segment through the egress hook.
pub(super) fn emit_segment(egress: &mut dyn Egress, repr: &Repr, payload: &[u8]) {
    debug_assert_eq!(repr.payload_len, payload.len());
    let mut dgram = vec![0u8; repr.buffer_len()];
    {
        let mut packet = Packet::new_unchecked(&mut dgram[..]);
        repr.emit(&mut packet);
        packet.payload_mut_slice().copy_from_slice(payload);
    }
    egress.send(&dgram);
}

/// The interface to a single active connection on an endpoint.
///
/// This is what every callback receives and what [`Endpoint::operator`]
/// hands out: a borrow of the connection together with the egress hook,
/// so the holder can operate the connection immediately, e.g. queue an
/// answer from inside a [`Recv::receive`] invocation.
///
/// [`Endpoint::operator`]: struct.Endpoint.html#method.operator
/// [`Recv::receive`]: trait.Recv.html#tymethod.receive
pub struct Operator<'a> {
    pub(super) connection: &'a mut Connection,
    pub(super) egress: &'a mut dyn Egress,
    pub(super) mtu: u16,
}

impl Operator<'_> {
    /// Get the pair identifying the operated connection.
    pub fn key(&self) -> PortPair {
        self.connection.pair
    }

    /// Inspect the operated connection.
    pub fn connection(&self) -> &Connection {
        &*self.connection
    }

    /// Modify the operated connection.
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut *self.connection
    }

    /// Take delivery of a connection offered through [`Listen::accept`].
    ///
    /// Installs the stream handler and completes the connection setup.
    /// Invalid on anything but a connection amid its passive open, where
    /// it is ignored.
    ///
    /// [`Listen::accept`]: trait.Listen.html#tymethod.accept
    pub fn accept(&mut self, handler: Box<dyn Recv>) {
        if self.connection.reapable || self.connection.state != State::SynReceived {
            net_debug!(
                "accept called on invalid connection {} -> {} in state {}",
                self.connection.pair.local,
                self.connection.pair.remote,
                self.connection.state
            );
            return;
        }

        self.connection.recv_handler = Some(handler);
        self.connection.set_state(State::Established);
    }

    /// Queue application bytes; returns how many were accepted.
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.connection.enqueue(data, &mut *self.egress, self.mtu)
    }

    /// Close the sending direction of the stream.
    pub fn shutdown(&mut self) -> Result<()> {
        self.connection.shutdown(&mut *self.egress, self.mtu)
    }

    /// Gracefully close the connection and release it to the reaper.
    pub fn close(&mut self) -> Result<()> {
        self.connection.close(&mut *self.egress, self.mtu)
    }

    /// Reset the connection immediately.
    pub fn abort(&mut self) -> Result<()> {
        self.connection.abort(&mut *self.egress)
    }
}
