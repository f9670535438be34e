use std::fmt;
use std::str::FromStr;

use thiserror::Error;

const CLASS_SHIFT: u32 = 60;
const CLASS_STORED: u64 = 0x0;
const CLASS_HEAP: u64 = 0x1;
const CLASS_SPARSE: u64 = 0x2;

/// Heap ids occupy 60 bits; the allocation counter wraps there.
pub(crate) const HEAP_ID_MASK: u64 = (1 << 60) - 1;

const ADDRESS_HIGH_MASK: u64 = (1 << 60) - 1;

/// Opaque 128-bit node identity.
///
/// The top 4 bits carry the lifecycle class:
///
/// * `0000` stored: the remaining 124 bits are the backing-store address
///   of an immutable node image;
/// * `0001` heap: a transaction-private mutable node, id in the low word;
/// * `0010` sparse: a synthetic immutable leaf holding a run of one
///   repeated byte, encoded entirely in the reference (byte value in the
///   high word, run length in the low word).
///
/// Heap references are never serialized; sparse references are
/// self-contained and may appear inside stored branch images.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeReference {
    high: u64,
    low: u64,
}

impl NodeReference {
    /// Reference to a stored node image. The address must fit in 124 bits.
    pub fn stored(address: u128) -> NodeReference {
        debug_assert_eq!(address >> 124, 0, "store address does not fit 124 bits");
        NodeReference {
            high: (address >> 64) as u64 & ADDRESS_HIGH_MASK,
            low: address as u64,
        }
    }

    pub(crate) fn heap(id: u64) -> NodeReference {
        NodeReference {
            high: CLASS_HEAP << CLASS_SHIFT,
            low: id & HEAP_ID_MASK,
        }
    }

    /// Synthetic leaf of `length` copies of `byte`.
    pub fn sparse(byte: u8, length: u64) -> NodeReference {
        NodeReference {
            high: (CLASS_SPARSE << CLASS_SHIFT) | byte as u64,
            low: length,
        }
    }

    pub fn from_parts(high: u64, low: u64) -> NodeReference {
        NodeReference { high, low }
    }

    pub fn parts(&self) -> (u64, u64) {
        (self.high, self.low)
    }

    fn class(&self) -> u64 {
        self.high >> CLASS_SHIFT
    }

    pub fn is_stored(&self) -> bool {
        self.class() == CLASS_STORED
    }

    pub fn is_heap(&self) -> bool {
        self.class() == CLASS_HEAP
    }

    pub fn is_sparse(&self) -> bool {
        self.class() == CLASS_SPARSE
    }

    /// Backing-store address of a stored reference.
    pub fn stored_address(&self) -> u128 {
        debug_assert!(self.is_stored());
        ((self.high & ADDRESS_HIGH_MASK) as u128) << 64 | self.low as u128
    }

    pub(crate) fn heap_id(&self) -> u64 {
        debug_assert!(self.is_heap());
        self.low
    }

    pub fn sparse_byte(&self) -> u8 {
        debug_assert!(self.is_sparse());
        (self.high & 0xff) as u8
    }

    pub fn sparse_length(&self) -> u64 {
        debug_assert!(self.is_sparse());
        self.low
    }

    /// Explicit fold of both halves into a 64-bit hash; node identity must
    /// never rely on a default pointer/object hash.
    pub fn hash64(&self) -> u64 {
        (self.high ^ self.low.rotate_left(31)).wrapping_mul(0x9e37_79b9_7f4a_7c15)
    }
}

impl fmt::Display for NodeReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}.{:x}", self.high, self.low)
    }
}

// Debug mirrors Display: references are opaque and the hex form is the one
// diagnostic format.
impl fmt::Debug for NodeReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Failure to parse the `high.low` hex form of a reference.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("malformed node reference '{0}'")]
pub struct ParseReferenceError(String);

impl FromStr for NodeReference {
    type Err = ParseReferenceError;

    fn from_str(s: &str) -> Result<NodeReference, ParseReferenceError> {
        let (high, low) = s
            .split_once('.')
            .ok_or_else(|| ParseReferenceError(s.to_string()))?;
        // from_str_radix is case-insensitive for hex digits, which gives us
        // the lenient parse for free
        let high =
            u64::from_str_radix(high, 16).map_err(|_| ParseReferenceError(s.to_string()))?;
        let low = u64::from_str_radix(low, 16).map_err(|_| ParseReferenceError(s.to_string()))?;
        Ok(NodeReference { high, low })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes() {
        let s = NodeReference::stored(0x1234);
        assert!(s.is_stored() && !s.is_heap() && !s.is_sparse());
        assert_eq!(s.stored_address(), 0x1234);

        let h = NodeReference::heap(7);
        assert!(h.is_heap() && !h.is_stored());
        assert_eq!(h.heap_id(), 7);

        let sp = NodeReference::sparse(0x42, 1000);
        assert!(sp.is_sparse());
        assert_eq!(sp.sparse_byte(), 0x42);
        assert_eq!(sp.sparse_length(), 1000);
    }

    #[test]
    fn heap_id_wraps_at_60_bits() {
        let r = NodeReference::heap(u64::MAX);
        assert_eq!(r.heap_id(), HEAP_ID_MASK);
        assert!(r.is_heap());
    }

    #[test]
    fn wide_store_address() {
        let addr: u128 = (0x0abc_u128 << 64) | 0xdead_beef;
        let r = NodeReference::stored(addr);
        assert!(r.is_stored());
        assert_eq!(r.stored_address(), addr);
    }

    #[test]
    fn hex_display_no_leading_zeros() {
        assert_eq!(NodeReference::from_parts(0, 0).to_string(), "0.0");
        assert_eq!(
            NodeReference::from_parts(0x1a, 0x2b00).to_string(),
            "1a.2b00"
        );
    }

    #[test]
    fn hex_round_trip() {
        for r in [
            NodeReference::stored(0),
            NodeReference::stored(0x0fff_ffff_ffff_ffff_ffff_ffff_ffff_ffff),
            NodeReference::heap(42),
            NodeReference::sparse(0xff, u64::MAX),
        ] {
            assert_eq!(r.to_string().parse::<NodeReference>().unwrap(), r);
        }
    }

    #[test]
    fn parse_is_case_lenient() {
        let r: NodeReference = "1A2b.DEADbeef".parse().unwrap();
        assert_eq!(r.parts(), (0x1a2b, 0xdead_beef));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<NodeReference>().is_err());
        assert!("12".parse::<NodeReference>().is_err());
        assert!("12.zz".parse::<NodeReference>().is_err());
        assert!("g.0".parse::<NodeReference>().is_err());
    }

    #[test]
    fn hash_separates_close_values() {
        let a = NodeReference::heap(1).hash64();
        let b = NodeReference::heap(2).hash64();
        let c = NodeReference::stored(1).hash64();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
