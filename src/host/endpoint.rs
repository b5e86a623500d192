use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use crate::time::{Duration, Expiration, Instant};
use crate::wire::{Flags, Packet, Repr, SeqNumber};

use super::connection::{emit_segment, Connection, Operator, State};
use super::isn::IsnGenerator;
use super::{Cause, Egress, Error, Listen, Recv, Result};

/// The mtu of an endpoint, before a caller reconfigures it.
const DEFAULT_MTU: u16 = 1000;

/// The user timeout of an endpoint, before a caller reconfigures it.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a connection lingers in TIME_WAIT.
const TIME_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// The retransmission timeout, re-armed while anything is in flight.
const RETRANSMIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Sweep return value when no connection has a pending timer.
const IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Ports are drawn from the upper half of the range, leaving at most this
/// many concurrently live connections.
const MAX_CONNECTIONS: usize = 32767;

/// The pair of endpoint identifiers a connection runs between.
///
/// Unique within an endpoint for the lifetime of the connection and
/// therefore usable as its key. The ordering sorts by local and then
/// remote port, the order the connection table is kept in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortPair {
    /// The identifier on this side.
    pub local: u16,
    /// The identifier on the peer's side.
    pub remote: u16,
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

/// Handles the connection states of one transport instance.
///
/// Owns the set of connections, demultiplexes inbound datagrams onto
/// them and drives their timers. The datagram substrate stays fully
/// external: one [`Egress`] hook carries outbound segments, and inbound
/// datagrams are handed to [`ingest`] by the caller.
///
/// [`Egress`]: trait.Egress.html
/// [`ingest`]: #method.ingest
pub struct Endpoint {
    /// Connections sorted by their pair, for lookup by binary search.
    connections: Vec<Connection>,
    mtu: u16,
    timeout: Duration,
    egress: Box<dyn Egress>,
    listen: Option<Box<dyn Listen>>,
    isn_generator: IsnGenerator,
}

impl Endpoint {
    /// Create an endpoint emitting datagrams through `egress`.
    ///
    /// With a [`Listen`] handler the endpoint answers incoming connection
    /// attempts; without one every stray segment is refused. Starts out
    /// with an MTU of 1000 bytes and a user timeout of 60 seconds.
    ///
    /// [`Listen`]: trait.Listen.html
    pub fn new(
        egress: Box<dyn Egress>,
        listen: Option<Box<dyn Listen>>,
        isn_generator: IsnGenerator,
    ) -> Self {
        Endpoint {
            connections: Vec::new(),
            mtu: DEFAULT_MTU,
            timeout: DEFAULT_TIMEOUT,
            egress,
            listen,
            isn_generator,
        }
    }

    /// The maximum number of payload bytes per segment.
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Set the maximum number of payload bytes per segment.
    pub fn set_mtu(&mut self, mtu: u16) {
        self.mtu = mtu;
    }

    /// The user timeout applied to new connections.
    pub fn user_timeout(&self) -> Duration {
        self.timeout
    }

    /// Set the user timeout applied to new connections.
    pub fn set_user_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Look up a connection by its pair.
    pub fn get(&self, pair: PortPair) -> Option<&Connection> {
        self.lookup(pair).map(move |idx| &self.connections[idx])
    }

    /// Look up a connection by its pair, mutably.
    pub fn get_mut(&mut self, pair: PortPair) -> Option<&mut Connection> {
        match self.lookup(pair) {
            Some(idx) => Some(&mut self.connections[idx]),
            None => None,
        }
    }

    /// Operate a connection: the handle combines the connection state
    /// with the egress hook, like the one passed to callbacks.
    pub fn operator(&mut self, pair: PortPair) -> Option<Operator<'_>> {
        let mtu = self.mtu;
        let idx = self.lookup(pair)?;
        Some(Operator {
            connection: &mut self.connections[idx],
            egress: &mut *self.egress,
            mtu,
        })
    }

    /// Actively open a connection towards `remote`.
    ///
    /// Picks an unused local port with the high bit set, sends the SYN
    /// and arms the user timeout. The returned pair identifies the
    /// connection from here on; `handler` takes delivery of the stream.
    pub fn connect(
        &mut self,
        remote: u16,
        handler: Box<dyn Recv>,
        now: Instant,
    ) -> Result<PortPair> {
        let idx = self.allocate(0, remote, now)?;

        let conn = &mut self.connections[idx];
        conn.set_recv_handler(Some(handler));
        conn.set_state(State::SynSent);

        let repr = Repr {
            src_port: conn.pair.local,
            dst_port: conn.pair.remote,
            flags: {
                let mut flags = Flags::default();
                flags.set_syn(true);
                flags
            },
            seq_number: conn.snd.initial_seq,
            ack_number: None,
            window: conn.rcv.window,
            payload_len: 0,
        };
        net_trace!("send {}", repr);

        conn.conn_timeout = Expiration::When(now + self.timeout);
        let pair = conn.pair;

        emit_segment(&mut *self.egress, &repr, &[]);
        Ok(pair)
    }

    /// Queue bytes on a connection; returns how many were accepted.
    ///
    /// Zero means the send buffer is full at its maximum size; the
    /// [`Poll`] handler reports when trying again is worthwhile.
    ///
    /// [`Poll`]: trait.Poll.html
    pub fn send(&mut self, pair: PortPair, data: &[u8]) -> Result<usize> {
        self.operator(pair).ok_or(Error::Closed)?.send(data)
    }

    /// Close the sending direction of a connection.
    pub fn shutdown(&mut self, pair: PortPair) -> Result<()> {
        self.operator(pair).ok_or(Error::Closed)?.shutdown()
    }

    /// Gracefully close a connection and release it to the reaper.
    pub fn close(&mut self, pair: PortPair) -> Result<()> {
        self.operator(pair).ok_or(Error::Closed)?.close()
    }

    /// Reset a connection immediately.
    pub fn abort(&mut self, pair: PortPair) -> Result<()> {
        self.operator(pair).ok_or(Error::Closed)?.abort()
    }

    /// Ingest one inbound datagram.
    ///
    /// Empty datagrams are ignored. Datagrams shorter than a segment
    /// header or with unknown control bits are rejected as
    /// [`Error::BadMessage`]; everything else is consumed, processing the
    /// matched connection's state machine and possibly invoking handlers
    /// and the egress hook along the way.
    ///
    /// [`Error::BadMessage`]: enum.Error.html#variant.BadMessage
    pub fn ingest(&mut self, datagram: &[u8], now: Instant) -> Result<()> {
        if datagram.is_empty() {
            return Ok(());
        }

        let packet = Packet::new_unchecked(datagram);
        let hdr = Repr::parse(&packet)?;
        let payload = packet.payload_slice();
        net_trace!("recv {}", hdr);

        let pair = PortPair {
            local: hdr.dst_port,
            remote: hdr.src_port,
        };
        match self.lookup(pair) {
            Some(idx) => self.arrives(idx, &hdr, payload, now),
            None => self.arrives_stray(&hdr, now),
        }
        Ok(())
    }

    /// Handle timeouts.
    ///
    /// One call walks all connections, reaping, expiring, retransmitting
    /// and polling as required. The return value is the time until the
    /// next pending timer, capped at an hour when no timer is armed.
    pub fn tick(&mut self, now: Instant) -> Duration {
        let mut next = now + IDLE_TIMEOUT;

        let mut i = 0;
        while i < self.connections.len() {
            if self.connections[i].state() == State::Closed {
                if self.connections[i].is_reapable() {
                    net_debug!("reaping {}", self.connections[i].pair());
                    self.connections.remove(i);
                    continue;
                }
                i += 1;
                continue;
            }

            if self.connections[i].conn_timeout.is_elapsed(now) {
                self.connections[i].set_state(State::Closed);
                self.notify_end(i, Cause::TimedOut);
                i += 1;
                continue;
            }

            if self.connections[i].rtrx_timeout.is_elapsed(now) {
                let conn = &mut self.connections[i];
                conn.retransmit(&mut *self.egress, self.mtu);
            }

            let (poll, free) = {
                let conn = &self.connections[i];
                let wanted = conn.poll_handler.is_some()
                    && conn.sndbuf.capacity() < conn.sndbuf.max() / 2
                    && (conn.state() == State::Established || conn.state() == State::CloseWait);
                (wanted, conn.sndbuf_free())
            };
            if poll {
                self.notify_poll(i, free);
            }

            let conn = &mut self.connections[i];
            if let Expiration::When(at) = conn.conn_timeout {
                if at < next {
                    next = at;
                }
            }

            conn.rtrx_timeout = if conn.snd.next != conn.snd.unacked {
                Expiration::When(now + RETRANSMIT_TIMEOUT)
            } else {
                Expiration::Never
            };
            if let Expiration::When(at) = conn.rtrx_timeout {
                if at < next {
                    next = at;
                }
            }

            i += 1;
        }

        if next < now {
            Duration::from_millis(0)
        } else {
            next - now
        }
    }

    fn lookup(&self, pair: PortPair) -> Option<usize> {
        self.connections
            .binary_search_by(|conn| conn.pair().cmp(&pair))
            .ok()
    }

    /// Reserve the slot for a new connection.
    ///
    /// A `local` of zero picks a random unused port with the high bit
    /// set, the active-open convention distinguishing both sides' port
    /// spaces.
    fn allocate(&mut self, local: u16, remote: u16, now: Instant) -> Result<usize> {
        let local = if local != 0 {
            if self.lookup(PortPair { local, remote }).is_some() {
                return Err(Error::AddressInUse);
            }
            local
        } else {
            if self.connections.len() >= MAX_CONNECTIONS {
                return Err(Error::Exhausted);
            }
            let mut port = self
                .isn_generator
                .local_port(remote, self.connections.len() as u32, now);
            while self.lookup(PortPair { local: port, remote }).is_some() {
                port = port.wrapping_add(1);
            }
            port
        };

        let pair = PortPair { local, remote };
        let iss = self.isn_generator.get_isn(pair, now);
        let conn = Connection::new(pair, iss, self.mtu);

        let at = match self.connections.binary_search_by(|c| c.pair().cmp(&pair)) {
            // Guarded by the lookups above.
            Ok(_) => return Err(Error::AddressInUse),
            Err(at) => at,
        };
        self.connections.insert(at, conn);
        Ok(at)
    }

    fn remove(&mut self, idx: usize) {
        net_debug!("freeing connection {}", self.connections[idx].pair());
        self.connections.remove(idx);
    }

    /// A segment that matched no connection: either the start of a new
    /// one, or something to refuse.
    fn arrives_stray(&mut self, hdr: &Repr, now: Instant) {
        // Never answer a reset with a reset.
        if hdr.flags.rst() {
            return;
        }

        if hdr.flags.syn() && hdr.ack_number.is_none() && self.listen.is_some() {
            let wanted = match self.listen.as_mut() {
                Some(listen) => listen.pre_accept(hdr.dst_port),
                None => false,
            };
            if !wanted {
                self.reset_reply(hdr, 1);
                return;
            }

            let idx = match self.allocate(hdr.dst_port, hdr.src_port, now) {
                Ok(idx) => idx,
                Err(_) => {
                    self.reset_reply(hdr, 1);
                    return;
                }
            };

            let conn = &mut self.connections[idx];
            conn.snd.window = hdr.window;
            conn.rcv.initial_seq = hdr.seq_number;
            conn.rcv.next = hdr.seq_number + 1u32;
            conn.set_state(State::SynReceived);

            let answer = Repr {
                src_port: conn.pair.local,
                dst_port: conn.pair.remote,
                flags: {
                    let mut flags = Flags::default();
                    flags.set_syn(true);
                    flags
                },
                seq_number: conn.snd.initial_seq,
                ack_number: Some(conn.rcv.next),
                // Echoes the window of the offending segment.
                window: hdr.window,
                payload_len: 0,
            };
            net_trace!("send {}", answer);
            emit_segment(&mut *self.egress, &answer, &[]);
        } else {
            self.reset_reply(hdr, 1);
        }
    }

    /// Inbound processing for a segment matched to the connection at
    /// `idx`.
    fn arrives(&mut self, idx: usize, hdr: &Repr, payload: &[u8], now: Instant) {
        // Anything arriving for a closed connection is silently dropped
        // until the reaper gets to it.
        if self.connections[idx].state() == State::Closed {
            return;
        }

        // Step 1: a segment is acceptable only exactly at the next
        // expected sequence number. During the active open any segment
        // passes, the peer's numbering is not yet known.
        let acceptable = self.connections[idx].state() == State::SynSent
            || hdr.seq_number == self.connections[idx].rcv.next;

        if !acceptable {
            net_debug!(
                "{} not acceptable at {}",
                hdr,
                self.connections[idx].rcv.next
            );
            if hdr.flags.rst() {
                return;
            }
            // An ACK carrying the current receive progress may sort the
            // peer out.
            let conn = &mut self.connections[idx];
            conn.ack(true, &mut *self.egress, self.mtu);
            return;
        }

        self.connections[idx].snd.window = hdr.window;

        // Step 2: the acknowledgement must not roll back behind
        // `snd.unacked` nor overtake `snd.next`.
        if let Some(ack) = hdr.ack_number {
            let conn = &self.connections[idx];
            if ack.dist(conn.snd.next) > 0 || ack.dist(conn.snd.unacked) < 0 {
                net_debug!(
                    "{} ack out of range, unacked {} next {}",
                    hdr,
                    conn.snd.unacked,
                    conn.snd.next
                );
                if hdr.flags.rst() {
                    return;
                }
                self.reset_reply(hdr, payload.len());
                return;
            }
        }

        // Step 3: resets.
        if hdr.flags.rst() {
            self.arrives_rst(idx, hdr);
            return;
        }

        let prev_rcv_next = self.connections[idx].rcv.next;

        // Step 4: advance `snd.unacked`.
        let advanced = match hdr.ack_number {
            Some(ack) => ack.dist(self.connections[idx].snd.unacked),
            None => 0,
        };

        if advanced > 0 {
            let mtu = self.mtu;
            let conn = &mut self.connections[idx];
            conn.advance_unacked(hdr.ack_number.unwrap_or(SeqNumber(0)), advanced, mtu);

            // Progress was made, so the user timeout starts over; the
            // sweep re-arms the retransmission timer while anything is
            // still in flight.
            conn.conn_timeout = Expiration::Never;
            if conn.snd.unacked == conn.snd.next {
                conn.rtrx_timeout = Expiration::Never;
            }

            // A FIN of ours may just have been acknowledged.
            match conn.state() {
                State::FinWait1 if conn.snd.unacked == conn.snd.last => {
                    conn.set_state(State::FinWait2);
                }
                State::Closing if conn.snd.unacked == conn.snd.last => {
                    conn.conn_timeout = Expiration::When(now + TIME_WAIT_TIMEOUT);
                    conn.set_state(State::TimeWait);
                }
                _ => {}
            }
        } else if payload.is_empty() {
            self.connections[idx].count_dupack();
        }

        // Step 5: a SYN is only ever legal as the answer to ours.
        if hdr.flags.syn() {
            match self.connections[idx].state() {
                State::SynSent => {
                    if advanced == 0 {
                        self.reset_reply(hdr, payload.len());
                        return;
                    }
                    let conn = &mut self.connections[idx];
                    conn.rcv.initial_seq = hdr.seq_number;
                    conn.rcv.next = hdr.seq_number;
                    conn.set_state(State::Established);
                }
                State::SynReceived
                | State::Established
                | State::FinWait1
                | State::FinWait2
                | State::CloseWait
                | State::Closing
                | State::LastAck
                | State::TimeWait => {
                    self.reset_reply(hdr, payload.len());
                    return;
                }
                State::Closed | State::Listen => unreachable!(),
            }

            // The SYN occupies one sequence slot.
            self.connections[idx].rcv.next += 1u32;
        }

        // Step 6: the ACK completing a passive open delivers the
        // connection to the application, then new data.
        if self.connections[idx].state() == State::SynReceived {
            if advanced == 0 {
                self.reset_reply(hdr, payload.len());
                return;
            }

            self.notify_accept(idx);

            if self.connections[idx].state() != State::Established {
                // The application declined to take delivery.
                self.connections[idx].set_state(State::Closed);
                self.connections[idx].reapable = true;
                self.reset_reply(hdr, payload.len());
                return;
            }
        }

        if !payload.is_empty() {
            match self.connections[idx].state() {
                State::Established | State::FinWait1 | State::FinWait2 => {}
                State::CloseWait | State::Closing | State::LastAck | State::TimeWait => {
                    // No more data after the peer's FIN.
                    self.reset_reply(hdr, payload.len());
                    return;
                }
                State::SynSent
                | State::SynReceived
                | State::Closed
                | State::Listen => unreachable!(),
            }

            self.notify_receive(idx, payload);
            self.connections[idx].rcv.next += payload.len();
        }

        // Step 7: the peer closing its half of the stream.
        if hdr.flags.fin() {
            match self.connections[idx].state() {
                State::Established => self.connections[idx].set_state(State::CloseWait),
                State::FinWait1 => self.connections[idx].set_state(State::Closing),
                State::FinWait2 => {
                    let conn = &mut self.connections[idx];
                    conn.conn_timeout = Expiration::When(now + TIME_WAIT_TIMEOUT);
                    conn.set_state(State::TimeWait);
                }
                State::CloseWait | State::Closing | State::LastAck | State::TimeWait => {
                    // Never a second FIN.
                    self.reset_reply(hdr, payload.len());
                    return;
                }
                State::SynSent
                | State::SynReceived
                | State::Closed
                | State::Listen => unreachable!(),
            }

            // The FIN occupies one sequence slot.
            self.connections[idx].rcv.next += 1u32;

            self.notify_end(idx, Cause::Finished);
        }

        // Step 8: answer. Received sequence slots must be acknowledged;
        // otherwise only send when buffered data now fits the window.
        let force = self.connections[idx].rcv.next != prev_rcv_next;
        let conn = &mut self.connections[idx];
        conn.ack(force, &mut *self.egress, self.mtu);
    }

    /// Step 3 of inbound processing, the reset table.
    fn arrives_rst(&mut self, idx: usize, hdr: &Repr) {
        match self.connections[idx].state() {
            State::SynSent => {
                // Only a reset acknowledging our SYN counts.
                if hdr.ack_number.is_none() {
                    return;
                }
                self.connections[idx].set_state(State::Closed);
                self.notify_end(idx, Cause::Refused);
            }
            State::SynReceived => {
                if hdr.ack_number.is_some() {
                    return;
                }
                // The application never saw this connection; delete it
                // silently.
                self.remove(idx);
            }
            State::Established
            | State::FinWait1
            | State::FinWait2
            | State::CloseWait => {
                if hdr.ack_number.is_some() {
                    return;
                }
                self.connections[idx].set_state(State::Closed);
                self.notify_end(idx, Cause::Reset);
            }
            State::Closing | State::LastAck | State::TimeWait => {
                if hdr.ack_number.is_some() {
                    return;
                }
                // The stream already ended as far as the application is
                // concerned; free right away when it also closed.
                if self.connections[idx].is_reapable() {
                    self.remove(idx);
                } else {
                    self.connections[idx].set_state(State::Closed);
                }
            }
            State::Closed | State::Listen => unreachable!(),
        }
    }

    /// Refuse a segment: swap the ports and reset whatever the peer
    /// believes the connection to be.
    ///
    /// `len` is the sequence length of the offending segment, one for a
    /// bare SYN.
    fn reset_reply(&mut self, hdr: &Repr, len: usize) {
        let reply = match hdr.ack_number {
            Some(ack) => Repr {
                src_port: hdr.dst_port,
                dst_port: hdr.src_port,
                flags: {
                    let mut flags = Flags::default();
                    flags.set_rst(true);
                    flags
                },
                seq_number: ack,
                ack_number: None,
                window: 0,
                payload_len: 0,
            },
            None => Repr {
                src_port: hdr.dst_port,
                dst_port: hdr.src_port,
                flags: {
                    let mut flags = Flags::default();
                    flags.set_rst(true);
                    flags
                },
                seq_number: SeqNumber(0),
                ack_number: Some(hdr.seq_number + len),
                window: 0,
                payload_len: 0,
            },
        };
        net_trace!("send {}", reply);
        emit_segment(&mut *self.egress, &reply, &[]);
    }

    /// Fire the accept callback for the connection at `idx`.
    fn notify_accept(&mut self, idx: usize) {
        let port = self.connections[idx].pair().local;
        if let Some(listen) = self.listen.as_mut() {
            let conn = Operator {
                connection: &mut self.connections[idx],
                egress: &mut *self.egress,
                mtu: self.mtu,
            };
            listen.accept(conn, port);
        }
    }

    /// Deliver payload to the connection's stream handler.
    ///
    /// The handler is taken out for the duration of the call so that it
    /// can operate the connection it is attached to.
    fn notify_receive(&mut self, idx: usize, payload: &[u8]) {
        if let Some(mut handler) = self.connections[idx].recv_handler.take() {
            {
                let conn = Operator {
                    connection: &mut self.connections[idx],
                    egress: &mut *self.egress,
                    mtu: self.mtu,
                };
                handler.receive(conn, payload);
            }
            let slot = &mut self.connections[idx].recv_handler;
            if slot.is_none() {
                *slot = Some(handler);
            }
        }
    }

    /// Notify the stream handler that the stream ended.
    fn notify_end(&mut self, idx: usize, cause: Cause) {
        if let Some(mut handler) = self.connections[idx].recv_handler.take() {
            {
                let conn = Operator {
                    connection: &mut self.connections[idx],
                    egress: &mut *self.egress,
                    mtu: self.mtu,
                };
                handler.end(conn, cause);
            }
            let slot = &mut self.connections[idx].recv_handler;
            if slot.is_none() {
                *slot = Some(handler);
            }
        }
    }

    /// Report send buffer headroom to the poll handler.
    fn notify_poll(&mut self, idx: usize, free: usize) {
        if let Some(mut handler) = self.connections[idx].poll_handler.take() {
            {
                let conn = Operator {
                    connection: &mut self.connections[idx],
                    egress: &mut *self.egress,
                    mtu: self.mtu,
                };
                handler.poll(conn, free);
            }
            let slot = &mut self.connections[idx].poll_handler;
            if slot.is_none() {
                *slot = Some(handler);
            }
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        for conn in &self.connections {
            if !conn.is_reapable() {
                net_debug!("freeing unclosed connection {}", conn.pair());
            }
        }
    }
}
