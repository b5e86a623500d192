//! Initial sequence number generation, as recommended by rfc6528.
//!
//! Uses a keyed cryptographic hash function (SipHash-2-4) instead of
//! appending the secret key to the connection tuple for hashing. That
//! should be better anyways. Hash function SipHash-2-4 from:
//!
//! > SipHash: a fast short-input PRF, Jean-Philippe Aumasson and Daniel J. Bernstein
use crate::time::Instant;
use crate::wire::SeqNumber;

use super::endpoint::PortPair;

/// An initial sequence number generator based on SipHash-2-4.
///
/// Implements most of RFC6528 but with a particular choice of keyed hash
/// function (instead of MD5):
///
/// > ISN = M + SipHash-2-4(secretkey, localport, remoteport)
///
/// The same generator also derives the local ports for actively opened
/// connections, keeping all randomness of an endpoint in one keyed
/// primitive instead of a process wide random number generator.
pub struct IsnGenerator {
    keys: (u64, u64),
}

// Yes, that's the initial values, as ASCII text.
const IV: [&[u8; 8]; 4] = [
    b"somepseu",
    b"dorandom",
    b"lygenera",
    b"tedbytes"];

struct State {
    v0: u64,
    v1: u64,
    v2: u64,
    v3: u64,
}

impl IsnGenerator {
    /// Create a generator by deriving a key from the standard `RandomState`.
    ///
    /// This is done by individually hashing the numbers `0u64` and `1u64`
    /// each with the same hasher created from a new instance of
    /// `RandomState`. The two output tags are then used as the internal
    /// key state.
    #[cfg(feature = "std")]
    pub fn from_std_hash() -> Self {
        use std::hash::{Hasher, BuildHasher};
        use std::collections::hash_map::RandomState;

        let hash = RandomState::new().build_hasher();
        let x0 = {
            let mut hash = hash.clone();
            hash.write_u64(0);
            hash.finish()
        };
        let x1 = {
            let mut hash = hash.clone();
            hash.write_u64(1);
            hash.finish()
        };

        IsnGenerator {
            keys: (x0, x1),
        }
    }

    /// Create a generator with some pre-defined secret key.
    ///
    /// Really, create the key with some cryptographic random means or
    /// derive it from some other key with a key derivation function.
    pub fn from_secret_key_bytes(bytes: [u8; 16]) -> Self {
        use core::convert::TryInto;
        let a = u64::from_le_bytes(bytes[..8].try_into().unwrap());
        let b = u64::from_le_bytes(bytes[8..].try_into().unwrap());
        IsnGenerator { keys: (a, b), }
    }

    /// Create a generator with a pre-defined key.
    #[cfg(test)]
    pub(crate) fn from_key(a: u64, b: u64) -> Self {
        IsnGenerator { keys: (a, b), }
    }

    /// Get the initial sequence number for a connection.
    ///
    /// The value varies every 4ms or when the underlying secret key is
    /// updated.
    pub fn get_isn(&self, connection: PortPair, time: Instant) -> SeqNumber {
        let mut state = State::init(self.keys.0, self.keys.1);

        let m = u64::from(connection.local)
            | u64::from(connection.remote) << 16
            // Message length = 4
            | 4_u64 << 56;
        state.absorb(m);
        let num = state.finalize();

        SeqNumber((num as u32).wrapping_add((time.total_millis() / 4000) as u32))
    }

    /// Derive a candidate local port for a new active open.
    ///
    /// The high bit is always set, separating actively chosen ports from
    /// the passively accepted space. The caller probes for collisions.
    pub fn local_port(&self, remote: u16, nonce: u32, time: Instant) -> u16 {
        let mut state = State::init(self.keys.0, self.keys.1);

        let m = u64::from(remote)
            | u64::from(nonce) << 16
            | (time.total_millis() as u64 & 0xff) << 48
            // Message length = 7
            | 7_u64 << 56;
        state.absorb(m);

        (state.finalize() >> 32) as u16 | 0x8000
    }
}

impl State {
    const SIP_C: usize = 2;
    const SIP_D: usize = 4;

    fn init(k0: u64, k1: u64) -> Self {
        State {
            v0: u64::from_be_bytes(*IV[0]) ^ k0,
            v1: u64::from_be_bytes(*IV[1]) ^ k1,
            v2: u64::from_be_bytes(*IV[2]) ^ k0,
            v3: u64::from_be_bytes(*IV[3]) ^ k1,
        }
    }

    fn round(&mut self) {
        self.v0 = self.v0.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(13);
        self.v1 ^= self.v0;
        self.v0 = self.v0.rotate_left(32);
        self.v2 = self.v2.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(16);
        self.v3 ^= self.v2;
        self.v0 = self.v0.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(21);
        self.v3 ^= self.v0;
        self.v2 = self.v2.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(17);
        self.v1 ^= self.v2;
        self.v2 = self.v2.rotate_left(32);
    }

    /// Process a single portion of the message.
    ///
    /// Note that all users need to manually add absorbing the length in
    /// the last block. This is slightly easier to read since it arranges
    /// the input to only have 8-byte blocks in all cases which separates
    /// the length block completely and makes it a constant.
    fn absorb(&mut self, m: u64) {
        self.v3 ^= m;
        (0..Self::SIP_C).for_each(|_| self.round());
        self.v0 ^= m;
    }

    /// Do the finalization rounds.
    fn finalize(mut self) -> u64 {
        self.v2 ^= 0xff;
        (0..Self::SIP_D).for_each(|_| self.round());
        self.v0 ^ self.v1 ^ self.v2 ^ self.v3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// See the paper, Appendix A.
    #[test]
    fn manual_test_vectors() {
        let k0 = u64::from_le_bytes(0x0001020304050607_u64.to_be_bytes());
        let k1 = u64::from_le_bytes(0x08090a0b0c0d0e0f_u64.to_be_bytes());

        let mut state = State::init(k0, k1);
        let m0 = u64::from_le_bytes(0x0001020304050607_u64.to_be_bytes());
        state.absorb(m0);
        let m1 = u64::from_le_bytes(0x08090a0b0c0d0e0f_u64.to_be_bytes());
        state.absorb(m1);

        assert_eq!(state.finalize(), 0xa129ca6149be45e5);
    }

    #[test]
    fn port_has_high_bit() {
        let isn = IsnGenerator::from_key(0xdead, 0xbeef);
        for nonce in 0..32 {
            let port = isn.local_port(7, nonce, Instant::from_millis(0));
            assert!(port & 0x8000 != 0);
        }
    }

    #[test]
    fn isn_depends_on_pair() {
        let isn = IsnGenerator::from_key(1, 2);
        let now = Instant::from_millis(0);
        let a = isn.get_isn(PortPair { local: 0x8001, remote: 7 }, now);
        let b = isn.get_isn(PortPair { local: 0x8002, remote: 7 }, now);
        assert_ne!(a, b);
    }
}
