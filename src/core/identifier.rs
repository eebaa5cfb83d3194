use ethereum_types::H160;
use std::fmt;

use sha1::{Digest, Sha1};

/// Width of the identifier ring. Matches SHA1's output length.
pub const RING_BITS: usize = 160;
pub const ID_BYTES: usize = RING_BITS / 8;

/// A position on the identifier ring. Ids are 160-bit unsigned integers,
/// big-endian, with all arithmetic modulo 2^160.
///
/// The all-zero id is reserved: it addresses a node pool rather than a
/// virtual node and never identifies content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SwarmId(pub H160);

impl SwarmId {
    pub fn zero() -> Self {
        SwarmId(H160::zero())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(H160::from_slice(bytes))
    }

    /// Id of a piece of content: SHA1 over the exact byte sequence.
    pub fn from_value<S: AsRef<[u8]>>(value: &S) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(value.as_ref());
        let digest = hasher.finalize();
        Self(H160::from_slice(&digest))
    }

    pub fn from_hex(s: &str) -> anyhow::Result<Self> {
        let raw = hex::decode(s)?;
        anyhow::ensure!(
            raw.len() == ID_BYTES,
            "id must be {} hex characters, got {}",
            ID_BYTES * 2,
            s.len()
        );
        Ok(Self(H160::from_slice(&raw)))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    /// Return a short, human-friendly hex for logging, like ab12cd34…ef90a1b2
    pub fn short_hex(&self) -> String {
        let b = self.0.to_fixed_bytes();
        format!(
            "{:02x}{:02x}{:02x}{:02x}…{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[16], b[17], b[18], b[19]
        )
    }

    /// self + 2^k mod 2^160.
    pub fn advance_pow2(&self, k: usize) -> Self {
        debug_assert!(k < RING_BITS);
        let mut bytes = self.0.to_fixed_bytes();
        let mut byte_index = ID_BYTES - 1 - k / 8;
        let mut carry = 1u16 << (k % 8);
        loop {
            let sum = bytes[byte_index] as u16 + carry;
            bytes[byte_index] = sum as u8;
            carry = sum >> 8;
            if carry == 0 || byte_index == 0 {
                break;
            }
            byte_index -= 1;
        }
        SwarmId(H160::from(bytes))
    }

    /// self - 1 mod 2^160.
    pub fn prev(&self) -> Self {
        let mut bytes = self.0.to_fixed_bytes();
        for b in bytes.iter_mut().rev() {
            let (v, borrow) = b.overflowing_sub(1);
            *b = v;
            if !borrow {
                break;
            }
        }
        SwarmId(H160::from(bytes))
    }

    /// Clockwise-backward distance from `target`: (target - self) mod 2^160.
    /// The node "closest to target from below" is the one minimizing this.
    pub fn dist_back(&self, target: &SwarmId) -> Distance {
        Distance(H160::from(ring_sub(
            &target.0.to_fixed_bytes(),
            &self.0.to_fixed_bytes(),
        )))
    }

    /// Membership in the wrapping half-open interval `(a, b]`. Empty when
    /// a == b.
    pub fn in_open_closed(&self, a: &SwarmId, b: &SwarmId) -> bool {
        let to_self = a.forward_to(self);
        !to_self.is_zero() && to_self <= a.forward_to(b)
    }

    /// Membership in the wrapping half-open interval `[a, b)`. Empty when
    /// a == b.
    pub fn in_closed_open(&self, a: &SwarmId, b: &SwarmId) -> bool {
        a.forward_to(self) < a.forward_to(b)
    }

    /// Clockwise distance from self to `other`: (other - self) mod 2^160.
    fn forward_to(&self, other: &SwarmId) -> Distance {
        other.dist_back(self)
    }
}

impl fmt::Display for SwarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_hex())
    }
}

/// A ring distance. Ordering is numeric (big-endian bytes compare the same
/// way).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance(H160);

impl Distance {
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

fn ring_sub(a: &[u8; ID_BYTES], b: &[u8; ID_BYTES]) -> [u8; ID_BYTES] {
    let mut out = [0u8; ID_BYTES];
    let mut borrow = 0u16;
    for i in (0..ID_BYTES).rev() {
        let lhs = a[i] as i16;
        let rhs = b[i] as i16 + borrow as i16;
        if lhs >= rhs {
            out[i] = (lhs - rhs) as u8;
            borrow = 0;
        } else {
            out[i] = (lhs + 256 - rhs) as u8;
            borrow = 1;
        }
    }
    out
}

/// From `candidates`, the id closest to `target` from below (minimum
/// clockwise-backward distance). Ties broken by lowest raw id.
pub fn closest_below<'a, I>(target: &SwarmId, candidates: I) -> Option<&'a RemoteNode>
where
    I: IntoIterator<Item = &'a RemoteNode>,
{
    candidates
        .into_iter()
        .min_by_key(|c| (c.id.dist_back(target), c.id))
}

/// A (id, address) pair naming a ring participant. Purely descriptive;
/// constructing one performs no I/O. The address is the ASCII `host:port`
/// form and compares by exact byte string, never canonicalized.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteNode {
    pub id: SwarmId,
    pub address: String,
}

impl RemoteNode {
    pub fn new(id: SwarmId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
        }
    }

    /// Handle for a pool rather than a specific virtual node; bootstrap
    /// entries are built this way.
    pub fn pool(address: impl Into<String>) -> Self {
        Self::new(SwarmId::zero(), address)
    }
}

impl fmt::Display for RemoteNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::test_support::id_with_first_byte;

    fn id_with_last_byte(b: u8) -> SwarmId {
        let mut raw = [0u8; ID_BYTES];
        raw[ID_BYTES - 1] = b;
        SwarmId(H160::from(raw))
    }

    #[test]
    fn advance_and_prev_round_the_ring() {
        let id = id_with_last_byte(5);
        assert_eq!(id.advance_pow2(0), id_with_last_byte(6));
        assert_eq!(id.advance_pow2(3), id_with_last_byte(13));
        assert_eq!(id.prev(), id_with_last_byte(4));

        // carry across a byte boundary
        let id = id_with_last_byte(0xFF);
        let bumped = id.advance_pow2(0);
        let raw = bumped.0.to_fixed_bytes();
        assert_eq!(raw[ID_BYTES - 1], 0);
        assert_eq!(raw[ID_BYTES - 2], 1);

        // zero wraps to the top of the ring
        let top = SwarmId::zero().prev();
        assert_eq!(top.0.to_fixed_bytes(), [0xFF; ID_BYTES]);
        assert_eq!(top.advance_pow2(0), SwarmId::zero());
    }

    #[test]
    fn high_bit_advance_wraps() {
        let id = id_with_first_byte(0x80);
        assert_eq!(id.advance_pow2(RING_BITS - 1), SwarmId::zero());
    }

    #[test]
    fn intervals_wrap_across_zero() {
        let a = id_with_first_byte(0xF0);
        let b = id_with_first_byte(0x10);
        let inside = SwarmId::zero();
        let outside = id_with_first_byte(0x80);

        assert!(inside.in_open_closed(&a, &b));
        assert!(!outside.in_open_closed(&a, &b));
        assert!(b.in_open_closed(&a, &b));
        assert!(!a.in_open_closed(&a, &b));

        assert!(inside.in_closed_open(&a, &b));
        assert!(a.in_closed_open(&a, &b));
        assert!(!b.in_closed_open(&a, &b));
    }

    #[test]
    fn degenerate_intervals_are_empty() {
        let a = id_with_first_byte(0x42);
        let x = id_with_first_byte(0x43);
        assert!(!x.in_open_closed(&a, &a));
        assert!(!a.in_open_closed(&a, &a));
        assert!(!x.in_closed_open(&a, &a));
    }

    #[test]
    fn closest_below_prefers_smallest_backward_distance() {
        let target = id_with_first_byte(0x50);
        let near = RemoteNode::new(id_with_first_byte(0x4F), "127.0.0.1:1");
        let exact = RemoteNode::new(id_with_first_byte(0x50), "127.0.0.1:2");
        let past = RemoteNode::new(id_with_first_byte(0x51), "127.0.0.1:3");

        let nodes = [near.clone(), exact.clone(), past.clone()];
        assert_eq!(closest_below(&target, nodes.iter()), Some(&exact));

        let nodes = [near.clone(), past.clone()];
        assert_eq!(closest_below(&target, nodes.iter()), Some(&near));

        // a node "past" the target is maximally far, but still eligible
        let nodes = [past.clone()];
        assert_eq!(closest_below(&target, nodes.iter()), Some(&past));
    }

    #[test]
    fn content_hash_matches_sha1() {
        let id = SwarmId::from_value(b"hello");
        assert_eq!(id.to_hex(), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
        assert_eq!(SwarmId::from_hex(&id.to_hex()).unwrap(), id);
    }
}
