use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use super::*;
use crate::time::{Duration, Instant};
use crate::wire::{Packet, Repr};

/// The substrate stand-in: an egress hook queueing every datagram.
#[derive(Clone, Default)]
struct Queue {
    dgrams: Rc<RefCell<VecDeque<Vec<u8>>>>,
}

impl Egress for Queue {
    fn send(&mut self, datagram: &[u8]) {
        self.dgrams.borrow_mut().push_back(datagram.to_vec());
    }
}

impl Queue {
    fn len(&self) -> usize {
        self.dgrams.borrow().len()
    }

    fn pop(&self) -> Option<Vec<u8>> {
        self.dgrams.borrow_mut().pop_front()
    }

    /// Deliver everything queued so far to `peer`, returning how many
    /// datagrams crossed.
    fn deliver_all(&self, peer: &mut Endpoint, now: Instant) -> usize {
        let mut crossed = 0;
        while let Some(dgram) = self.pop() {
            peer.ingest(&dgram, now).unwrap();
            crossed += 1;
        }
        crossed
    }
}

/// A stream handler recording everything it is given.
#[derive(Clone, Default)]
struct Record {
    data: Rc<RefCell<Vec<u8>>>,
    ends: Rc<RefCell<Vec<Cause>>>,
}

impl Recv for Record {
    fn receive(&mut self, _: Operator<'_>, data: &[u8]) {
        self.data.borrow_mut().extend_from_slice(data);
    }

    fn end(&mut self, _: Operator<'_>, cause: Cause) {
        self.ends.borrow_mut().push(cause);
    }
}

/// A listener accepting everything (or nothing) with a shared `Record`.
#[derive(Clone)]
struct Acceptor {
    refuse: bool,
    accepted: Rc<RefCell<Vec<PortPair>>>,
    stream: Record,
}

impl Acceptor {
    fn new(stream: Record) -> Self {
        Acceptor {
            refuse: false,
            accepted: Rc::default(),
            stream,
        }
    }
}

impl Listen for Acceptor {
    fn pre_accept(&mut self, _: u16) -> bool {
        !self.refuse
    }

    fn accept(&mut self, mut conn: Operator<'_>, _: u16) {
        self.accepted.borrow_mut().push(conn.key());
        conn.accept(Box::new(self.stream.clone()));
    }
}

fn parse(dgram: &[u8]) -> Repr {
    Repr::parse(&Packet::new_unchecked(&dgram[..])).unwrap()
}

fn payload_of(dgram: &[u8]) -> Vec<u8> {
    Packet::new_unchecked(&dgram[..]).payload_slice().to_vec()
}

struct Pair {
    a: Endpoint,
    b: Endpoint,
    qa: Queue,
    qb: Queue,
    record_a: Record,
    record_b: Record,
    accepted: Rc<RefCell<Vec<PortPair>>>,
}

fn pair() -> Pair {
    let qa = Queue::default();
    let qb = Queue::default();
    let record_a = Record::default();
    let record_b = Record::default();
    let acceptor = Acceptor::new(record_b.clone());
    let accepted = acceptor.accepted.clone();

    let a = Endpoint::new(
        Box::new(qa.clone()),
        None,
        IsnGenerator::from_key(0x0123, 0x4567),
    );
    let b = Endpoint::new(
        Box::new(qb.clone()),
        Some(Box::new(acceptor)),
        IsnGenerator::from_key(0x89ab, 0xcdef),
    );

    Pair { a, b, qa, qb, record_a, record_b, accepted }
}

/// Run the three-way handshake and return both connection keys.
fn establish(pair: &mut Pair, now: Instant) -> (PortPair, PortPair) {
    let key_a = pair
        .a
        .connect(7, Box::new(pair.record_a.clone()), now)
        .unwrap();
    pair.qa.deliver_all(&mut pair.b, now);
    pair.qb.deliver_all(&mut pair.a, now);
    pair.qa.deliver_all(&mut pair.b, now);

    let key_b = pair.accepted.borrow()[0];
    assert_eq!(pair.a.get(key_a).unwrap().state(), State::Established);
    assert_eq!(pair.b.get(key_b).unwrap().state(), State::Established);
    (key_a, key_b)
}

#[test]
fn handshake() {
    let mut pair = pair();
    let t0 = Instant::from_millis(0);

    let key_a = pair
        .a
        .connect(7, Box::new(pair.record_a.clone()), t0)
        .unwrap();
    assert!(key_a.local & 0x8000 != 0);
    assert_eq!(key_a.remote, 7);
    assert_eq!(pair.a.get(key_a).unwrap().state(), State::SynSent);

    // First segment: the SYN.
    assert_eq!(pair.qa.len(), 1);
    let syn = pair.qa.pop().unwrap();
    let syn = parse(&syn);
    assert!(syn.flags.syn() && !syn.flags.fin() && !syn.flags.rst());
    assert_eq!(syn.ack_number, None);
    let x = pair.a.get(key_a).unwrap().snd.initial_seq;
    assert_eq!(syn.seq_number, x);

    pair.b
        .ingest(&{
            let mut dgram = vec![0; syn.buffer_len()];
            syn.emit(&mut Packet::new_unchecked(&mut dgram[..]));
            dgram
        }, t0)
        .unwrap();

    // Second segment: the SYN+ACK of the passive open.
    assert_eq!(pair.qb.len(), 1);
    let synack = pair.qb.pop().unwrap();
    let synack = parse(&synack);
    assert!(synack.flags.syn());
    assert_eq!(synack.ack_number, Some(x + 1u32));
    assert_eq!(pair.accepted.borrow().len(), 0);

    pair.a
        .ingest(&{
            let mut dgram = vec![0; synack.buffer_len()];
            synack.emit(&mut Packet::new_unchecked(&mut dgram[..]));
            dgram
        }, t0)
        .unwrap();
    assert_eq!(pair.a.get(key_a).unwrap().state(), State::Established);

    // Third segment: the ACK completing the handshake; only now does the
    // accept callback fire.
    assert_eq!(pair.qa.len(), 1);
    let ack = pair.qa.pop().unwrap();
    let ack = parse(&ack);
    assert!(!ack.flags.syn() && !ack.flags.fin());
    assert_eq!(ack.seq_number, x + 1u32);
    assert_eq!(ack.ack_number, Some(synack.seq_number + 1u32));

    pair.b
        .ingest(&{
            let mut dgram = vec![0; ack.buffer_len()];
            ack.emit(&mut Packet::new_unchecked(&mut dgram[..]));
            dgram
        }, t0)
        .unwrap();

    assert_eq!(pair.accepted.borrow().len(), 1);
    let key_b = pair.accepted.borrow()[0];
    assert_eq!(key_b, PortPair { local: 7, remote: key_a.local });
    assert_eq!(pair.b.get(key_b).unwrap().state(), State::Established);

    // Nothing further crosses; both sides sit at iss+1.
    assert_eq!(pair.qa.len(), 0);
    assert_eq!(pair.qb.len(), 0);
    assert_eq!(pair.a.get(key_a).unwrap().snd.unacked, x + 1u32);
    assert_eq!(
        pair.b.get(key_b).unwrap().snd.unacked,
        synack.seq_number + 1u32
    );
}

#[test]
fn byte_delivery() {
    let mut pair = pair();
    let t0 = Instant::from_millis(0);
    let (key_a, _key_b) = establish(&mut pair, t0);

    let x = pair.a.get(key_a).unwrap().snd.initial_seq;
    assert_eq!(pair.a.send(key_a, b"hello").unwrap(), 5);

    // One segment of five bytes payload.
    assert_eq!(pair.qa.len(), 1);
    let dgram = pair.qa.pop().unwrap();
    let seg = parse(&dgram);
    assert_eq!(seg.payload_len, 5);
    assert_eq!(seg.seq_number, x + 1u32);
    assert_eq!(payload_of(&dgram), b"hello");

    pair.b.ingest(&dgram, t0).unwrap();
    assert_eq!(&*pair.record_b.data.borrow(), b"hello");

    // One pure ACK back, covering all five bytes.
    assert_eq!(pair.qb.len(), 1);
    let ack = parse(&pair.qb.pop().unwrap());
    assert_eq!(ack.payload_len, 0);
    assert_eq!(ack.ack_number, Some(x + 6u32));

    // Delivery happened exactly once.
    assert_eq!(pair.record_b.data.borrow().len(), 5);
}

#[test]
fn graceful_close() {
    let mut pair = pair();
    let t0 = Instant::from_millis(0);
    let (key_a, key_b) = establish(&mut pair, t0);

    pair.a.send(key_a, b"hello").unwrap();
    pair.qa.deliver_all(&mut pair.b, t0);
    pair.qb.deliver_all(&mut pair.a, t0);

    let x = pair.a.get(key_a).unwrap().snd.initial_seq;
    let y = pair.b.get(key_b).unwrap().snd.initial_seq;

    // A closes: the FIN takes the next sequence slot after the data.
    pair.a.close(key_a).unwrap();
    assert_eq!(pair.qa.len(), 1);
    let fin = pair.qa.pop().unwrap();
    let repr = parse(&fin);
    assert!(repr.flags.fin());
    assert_eq!(repr.seq_number, x + 6u32);
    assert_eq!(repr.payload_len, 0);
    assert_eq!(pair.a.get(key_a).unwrap().state(), State::FinWait1);

    // B learns of the half-close and acknowledges it.
    pair.b.ingest(&fin, t0).unwrap();
    assert_eq!(&*pair.record_b.ends.borrow(), &[Cause::Finished]);
    assert_eq!(pair.b.get(key_b).unwrap().state(), State::CloseWait);
    pair.qb.deliver_all(&mut pair.a, t0);
    assert_eq!(pair.a.get(key_a).unwrap().state(), State::FinWait2);

    // B closes as well.
    pair.b.close(key_b).unwrap();
    assert_eq!(pair.qb.len(), 1);
    let fin = pair.qb.pop().unwrap();
    let repr = parse(&fin);
    assert!(repr.flags.fin());
    assert_eq!(repr.seq_number, y + 1u32);
    assert_eq!(repr.ack_number, Some(x + 7u32));

    pair.a.ingest(&fin, t0).unwrap();
    assert_eq!(&*pair.record_a.ends.borrow(), &[Cause::Finished]);
    assert_eq!(pair.a.get(key_a).unwrap().state(), State::TimeWait);
    pair.qa.deliver_all(&mut pair.b, t0);
    assert_eq!(pair.b.get(key_b).unwrap().state(), State::TimeWait);

    // TIME_WAIT runs out via the sweep; the connections are then reaped.
    let later = t0 + Duration::from_secs(61);
    pair.a.tick(later);
    pair.b.tick(later);
    assert_eq!(pair.a.get(key_a).unwrap().state(), State::Closed);
    assert_eq!(pair.b.get(key_b).unwrap().state(), State::Closed);

    pair.a.tick(later);
    pair.b.tick(later);
    assert!(pair.a.get(key_a).is_none());
    assert!(pair.b.get(key_b).is_none());
}

#[test]
fn retransmission() {
    let mut pair = pair();
    let t0 = Instant::from_millis(0);
    let (key_a, _key_b) = establish(&mut pair, t0);

    let data = vec![0x5a; 500];
    pair.a.send(key_a, &data).unwrap();

    // The substrate loses the segment.
    assert_eq!(pair.qa.len(), 1);
    let lost = parse(&pair.qa.pop().unwrap());

    // The first sweep arms the retransmission timer, the next one past
    // the second fires it.
    let wait = pair.a.tick(t0);
    assert_eq!(wait, Duration::from_secs(1));
    pair.a.tick(t0 + Duration::from_millis(1100));

    assert_eq!(pair.qa.len(), 1);
    let again = pair.qa.pop().unwrap();
    let repr = parse(&again);
    assert_eq!(repr.seq_number, lost.seq_number);
    assert_eq!(repr.payload_len, 500);
    assert_eq!(payload_of(&again), &data[..]);

    pair.b.ingest(&again, t0 + Duration::from_millis(1100)).unwrap();
    assert_eq!(&*pair.record_b.data.borrow(), &data[..]);
}

#[test]
fn reset_on_bad_ack() {
    let mut pair = pair();
    let t0 = Instant::from_millis(0);
    let (key_a, _key_b) = establish(&mut pair, t0);

    let conn = pair.a.get(key_a).unwrap();
    let bad_ack = conn.snd.next + 100u32;
    let evil = Repr {
        src_port: key_a.remote,
        dst_port: key_a.local,
        flags: Default::default(),
        seq_number: conn.rcv.next,
        ack_number: Some(bad_ack),
        window: 1000,
        payload_len: 0,
    };
    let mut dgram = vec![0; evil.buffer_len()];
    evil.emit(&mut Packet::new_unchecked(&mut dgram[..]));
    pair.a.ingest(&dgram, t0).unwrap();

    // Exactly one answer: a reset claiming the bogus sequence number.
    assert_eq!(pair.qa.len(), 1);
    let rst = parse(&pair.qa.pop().unwrap());
    assert!(rst.flags.rst());
    assert_eq!(rst.seq_number, bad_ack);
    assert_eq!(rst.ack_number, None);

    // The connection itself is unharmed.
    assert_eq!(pair.a.get(key_a).unwrap().state(), State::Established);
}

#[test]
fn connection_refused() {
    let mut pair = pair();
    let t0 = Instant::from_millis(0);

    // Rebuild B with a refusing listener.
    let acceptor = Acceptor {
        refuse: true,
        accepted: Rc::default(),
        stream: pair.record_b.clone(),
    };
    pair.b = Endpoint::new(
        Box::new(pair.qb.clone()),
        Some(Box::new(acceptor)),
        IsnGenerator::from_key(0x89ab, 0xcdef),
    );

    let key_a = pair
        .a
        .connect(7, Box::new(pair.record_a.clone()), t0)
        .unwrap();
    let x = pair.a.get(key_a).unwrap().snd.initial_seq;

    pair.qa.deliver_all(&mut pair.b, t0);

    // The refusal is a reset acknowledging the SYN.
    assert_eq!(pair.qb.len(), 1);
    let rst = parse(&pair.qb.dgrams.borrow()[0].clone());
    assert!(rst.flags.rst());
    assert_eq!(rst.ack_number, Some(x + 1u32));

    pair.qb.deliver_all(&mut pair.a, t0);
    assert_eq!(&*pair.record_a.ends.borrow(), &[Cause::Refused]);
    assert_eq!(pair.a.get(key_a).unwrap().state(), State::Closed);
}

#[test]
fn shutdown_is_idempotent() {
    let mut pair = pair();
    let t0 = Instant::from_millis(0);
    let (key_a, _key_b) = establish(&mut pair, t0);

    pair.a.shutdown(key_a).unwrap();
    assert_eq!(pair.qa.len(), 1);
    assert_eq!(pair.a.get(key_a).unwrap().state(), State::FinWait1);

    // A second shutdown changes nothing and emits nothing.
    pair.a.shutdown(key_a).unwrap();
    assert_eq!(pair.qa.len(), 1);
    assert_eq!(pair.a.get(key_a).unwrap().state(), State::FinWait1);
}

#[test]
fn out_of_order_segment_provokes_ack() {
    let mut pair = pair();
    let t0 = Instant::from_millis(0);
    let (key_a, key_b) = establish(&mut pair, t0);

    let expected = pair.b.get(key_b).unwrap().rcv.next;
    let stray = Repr {
        src_port: key_a.local,
        dst_port: 7,
        flags: Default::default(),
        seq_number: expected + 100u32,
        ack_number: Some(pair.b.get(key_b).unwrap().snd.unacked),
        window: 1000,
        payload_len: 3,
    };
    let mut dgram = vec![0; stray.buffer_len()];
    stray.emit(&mut Packet::new_unchecked(&mut dgram[..]));
    dgram[crate::wire::HEADER_LEN..].copy_from_slice(b"ooo");

    pair.b.ingest(&dgram, t0).unwrap();

    // The data is dropped, answered by an ACK restating the expected
    // sequence number.
    assert!(pair.record_b.data.borrow().is_empty());
    assert_eq!(pair.b.get(key_b).unwrap().rcv.next, expected);
    assert_eq!(pair.qb.len(), 1);
    let ack = parse(&pair.qb.pop().unwrap());
    assert_eq!(ack.payload_len, 0);
    assert_eq!(ack.ack_number, Some(expected));
}

#[test]
fn send_before_handshake_completes() {
    let mut pair = pair();
    let t0 = Instant::from_millis(0);

    let key_a = pair
        .a
        .connect(7, Box::new(pair.record_a.clone()), t0)
        .unwrap();
    assert_eq!(pair.a.send(key_a, b"early"), Err(Error::NotConnected));
    assert_eq!(
        pair.a.send(PortPair { local: 1, remote: 2 }, b"nobody"),
        Err(Error::Closed)
    );
}

#[test]
fn send_after_shutdown_is_a_broken_pipe() {
    let mut pair = pair();
    let t0 = Instant::from_millis(0);
    let (key_a, _key_b) = establish(&mut pair, t0);

    pair.a.shutdown(key_a).unwrap();
    assert_eq!(pair.a.send(key_a, b"late"), Err(Error::BrokenPipe));
}

#[test]
fn send_buffer_fills_up() {
    let mut pair = pair();
    let t0 = Instant::from_millis(0);
    let (key_a, _key_b) = establish(&mut pair, t0);

    pair.a.get_mut(key_a).unwrap().set_sndbuf(4096);
    let chunk = vec![1u8; 5000];
    assert_eq!(pair.a.send(key_a, &chunk).unwrap(), 4096);
    // Full at its maximum: zero bytes accepted.
    assert_eq!(pair.a.send(key_a, &chunk).unwrap(), 0);
}

#[test]
fn duplicate_acks_are_counted() {
    let mut pair = pair();
    let t0 = Instant::from_millis(0);
    let (key_a, _key_b) = establish(&mut pair, t0);

    pair.a.send(key_a, b"hello").unwrap();
    pair.qa.deliver_all(&mut pair.b, t0);

    // Replay the same ACK three times.
    let ack = pair.qb.pop().unwrap();
    for _ in 0..3 {
        pair.a.ingest(&ack, t0).unwrap();
    }
    // The first delivery advanced `snd.unacked`, the two replays were
    // duplicates.
    assert_eq!(pair.a.get(key_a).unwrap().dupack, 2);

    pair.a.send(key_a, b" again").unwrap();
    pair.qa.deliver_all(&mut pair.b, t0);
    pair.qb.deliver_all(&mut pair.a, t0);
    assert_eq!(pair.a.get(key_a).unwrap().dupack, 0);
    assert_eq!(&*pair.record_b.data.borrow(), b"hello again");
}

#[test]
fn large_writes_fragment_along_the_mtu() {
    let mut pair = pair();
    let t0 = Instant::from_millis(0);
    let (key_a, _key_b) = establish(&mut pair, t0);

    let data = vec![7u8; 1500];
    assert_eq!(pair.a.send(key_a, &data).unwrap(), 1500);

    // Two segments: one full MTU, one with the remainder.
    assert_eq!(pair.qa.len(), 2);
    let first = parse(&pair.qa.dgrams.borrow()[0].clone());
    let second = parse(&pair.qa.dgrams.borrow()[1].clone());
    assert_eq!(first.payload_len, 1000);
    assert_eq!(second.payload_len, 500);
    assert_eq!(second.seq_number, first.seq_number + 1000u32);

    pair.qa.deliver_all(&mut pair.b, t0);
    assert_eq!(pair.record_b.data.borrow().len(), 1500);
}

#[test]
fn abort_resets_the_peer() {
    let mut pair = pair();
    let t0 = Instant::from_millis(0);
    let (key_a, key_b) = establish(&mut pair, t0);

    pair.a.abort(key_a).unwrap();
    assert_eq!(pair.a.get(key_a).unwrap().state(), State::Closed);
    assert!(pair.a.get(key_a).unwrap().is_reapable());

    assert_eq!(pair.qa.len(), 1);
    let rst = parse(&pair.qa.dgrams.borrow()[0].clone());
    assert!(rst.flags.rst());
    assert_eq!(rst.ack_number, None);

    pair.qa.deliver_all(&mut pair.b, t0);
    assert_eq!(&*pair.record_b.ends.borrow(), &[Cause::Reset]);
    assert_eq!(pair.b.get(key_b).unwrap().state(), State::Closed);
}

#[test]
fn echo_from_inside_the_recv_handler() {
    // Answering from inside the handler is the expected way to write
    // request/response protocols on top.
    struct EchoBack;

    impl Recv for EchoBack {
        fn receive(&mut self, mut conn: Operator<'_>, data: &[u8]) {
            conn.send(data).unwrap();
        }

        fn end(&mut self, _: Operator<'_>, _: Cause) {}
    }

    struct EchoListen;

    impl Listen for EchoListen {
        fn accept(&mut self, mut conn: Operator<'_>, _: u16) {
            conn.accept(Box::new(EchoBack));
        }
    }

    let qa = Queue::default();
    let qb = Queue::default();
    let record = Record::default();
    let mut a = Endpoint::new(
        Box::new(qa.clone()),
        None,
        IsnGenerator::from_key(1, 2),
    );
    let mut b = Endpoint::new(
        Box::new(qb.clone()),
        Some(Box::new(EchoListen)),
        IsnGenerator::from_key(3, 4),
    );

    let t0 = Instant::from_millis(0);
    let key_a = a.connect(7, Box::new(record.clone()), t0).unwrap();
    qa.deliver_all(&mut b, t0);
    qb.deliver_all(&mut a, t0);
    qa.deliver_all(&mut b, t0);

    a.send(key_a, b"ping").unwrap();
    qa.deliver_all(&mut b, t0);
    qb.deliver_all(&mut a, t0);
    qa.deliver_all(&mut b, t0);

    assert_eq!(&*record.data.borrow(), b"ping");
}

#[test]
fn sweep_reports_the_next_timer() {
    let mut pair = pair();
    let t0 = Instant::from_millis(0);

    // Nothing to wait for on an idle endpoint.
    assert_eq!(pair.a.tick(t0), Duration::from_secs(3600));

    let key_a = pair
        .a
        .connect(7, Box::new(pair.record_a.clone()), t0)
        .unwrap();

    // The SYN is in flight: the retransmission timer dominates.
    assert_eq!(pair.a.tick(t0), Duration::from_secs(1));

    // Left alone, the user timeout eventually kills the attempt.
    let late = t0 + Duration::from_secs(61);
    pair.a.tick(late);
    assert_eq!(pair.a.get(key_a).unwrap().state(), State::Closed);
    assert_eq!(&*pair.record_a.ends.borrow(), &[Cause::TimedOut]);
}
