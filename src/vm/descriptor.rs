//! Reference descriptors.
//!
//! One encoding serves both root records and object reference bitmaps. The
//! low two bits select the kind; the payload depends on the kind:
//!
//! * `Bitmap`: the remaining bits are an inline bitmap. Bit `i` (counted
//!   after the tag shift) marks word `i` of the described range as a
//!   reference slot. For objects, word 0 and word 1 are the header and must
//!   not be set.
//! * `Complex`: the payload is a word-aligned pointer to a bitmap block laid
//!   out as `[word_count, bitmap_0, .., bitmap_{word_count-1}]`, each bitmap
//!   word covering `BITS_IN_WORD` consecutive slots.
//! * `User`: the payload is a marker function provided by the runtime. The
//!   collector calls it with the range start and a relay; the function
//!   reports each reference slot through the relay.
//! * `RunLen` is reserved and never constructed; decoding it is a fatal
//!   error.

use crate::util::constants::*;
use crate::util::Address;

pub const DESC_TAG_BITS: usize = 2;
pub const DESC_TAG_MASK: usize = (1 << DESC_TAG_BITS) - 1;

const TAG_BITMAP: usize = 0b00;
const TAG_COMPLEX: usize = 0b01;
const TAG_USER: usize = 0b10;
const TAG_RUN_LEN: usize = 0b11;

/// Most slots an inline bitmap descriptor can describe.
pub const MAX_BITMAP_SLOTS: usize = BITS_IN_WORD - DESC_TAG_BITS;

/// A runtime marker function for `User` descriptors. Reports each reference
/// slot of the range starting at the given address through the relay.
pub type UserMarkFn = fn(start: Address, relay: &mut dyn FnMut(Address));

#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Descriptor(usize);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DescriptorKind {
    Bitmap,
    Complex,
    User,
    RunLen,
}

impl Descriptor {
    /// A bitmap descriptor with no reference slots at all.
    pub const EMPTY: Descriptor = Descriptor(TAG_BITMAP);

    /// Builds an inline bitmap descriptor. Bit `i` of `bits` marks word `i`
    /// of the range as a reference slot.
    pub fn bitmap(bits: usize) -> Descriptor {
        assert!(
            bits >> MAX_BITMAP_SLOTS == 0,
            "bitmap descriptor overflow: {:#x}",
            bits
        );
        Descriptor((bits << DESC_TAG_BITS) | TAG_BITMAP)
    }

    /// Builds a descriptor pointing at a `[count, bitmaps..]` block owned by
    /// the runtime. The block must stay valid while the descriptor is
    /// registered.
    pub fn complex(block: Address) -> Descriptor {
        assert!(block.is_aligned_to(BYTES_IN_WORD) && !block.is_zero());
        Descriptor(block.as_usize() | TAG_COMPLEX)
    }

    /// Builds a descriptor around a runtime marker function.
    pub fn user(mark: UserMarkFn) -> Descriptor {
        let raw = mark as usize;
        assert!(raw & DESC_TAG_MASK == 0, "marker function misaligned");
        Descriptor(raw | TAG_USER)
    }

    pub fn kind(self) -> DescriptorKind {
        match self.0 & DESC_TAG_MASK {
            TAG_BITMAP => DescriptorKind::Bitmap,
            TAG_COMPLEX => DescriptorKind::Complex,
            TAG_USER => DescriptorKind::User,
            TAG_RUN_LEN => DescriptorKind::RunLen,
            _ => unreachable!(),
        }
    }

    /// Inline bitmap payload (the tag is already shifted out).
    pub fn bitmap_bits(self) -> usize {
        debug_assert_eq!(self.kind(), DescriptorKind::Bitmap);
        self.0 >> DESC_TAG_BITS
    }

    /// Reads the bitmap block of a `Complex` descriptor.
    ///
    /// # Safety
    /// The runtime must keep the block alive and well-formed.
    pub unsafe fn complex_block(self) -> &'static [usize] {
        debug_assert_eq!(self.kind(), DescriptorKind::Complex);
        let base = Address::from_usize(self.0 & !DESC_TAG_MASK);
        let count: usize = base.load();
        std::slice::from_raw_parts((base + BYTES_IN_WORD).to_ptr(), count)
    }

    pub fn user_mark_fn(self) -> UserMarkFn {
        debug_assert_eq!(self.kind(), DescriptorKind::User);
        unsafe { std::mem::transmute::<usize, UserMarkFn>(self.0 & !DESC_TAG_MASK) }
    }

    pub fn as_raw(self) -> usize {
        self.0
    }

    pub fn from_raw(raw: usize) -> Descriptor {
        let d = Descriptor(raw);
        assert!(
            d.kind() != DescriptorKind::RunLen,
            "reserved RunLen descriptor {:#x}",
            raw
        );
        d
    }
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Descriptor({:?}, {:#x})", self.kind(), self.0)
    }
}

/// Walks the reference slots of `[start, start + words)` described by
/// `descr`, invoking `relay` on each slot address. Slots are visited in
/// ascending order for the bitmap kinds; `User` order is up to the runtime.
pub fn walk_slots(descr: Descriptor, start: Address, words: usize, relay: &mut dyn FnMut(Address)) {
    match descr.kind() {
        DescriptorKind::Bitmap => {
            let mut bits = descr.bitmap_bits();
            while bits != 0 {
                let i = bits.trailing_zeros() as usize;
                if i >= words {
                    break;
                }
                relay(start + i * BYTES_IN_WORD);
                bits &= bits - 1;
            }
        }
        DescriptorKind::Complex => {
            let block = unsafe { descr.complex_block() };
            for (w, mut bits) in block.iter().copied().enumerate() {
                while bits != 0 {
                    let i = w * BITS_IN_WORD + bits.trailing_zeros() as usize;
                    if i >= words {
                        break;
                    }
                    relay(start + i * BYTES_IN_WORD);
                    bits &= bits - 1;
                }
            }
        }
        DescriptorKind::User => {
            (descr.user_mark_fn())(start, relay);
        }
        DescriptorKind::RunLen => {
            panic!("reserved RunLen descriptor reached the slot walker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_walk_order() {
        let d = Descriptor::bitmap(0b1011 << 2); // slots 2, 3, 5
        let base = Address::from_usize(0x1000);
        let mut seen = vec![];
        walk_slots(d, base, 8, &mut |s| seen.push(s));
        assert_eq!(
            seen,
            vec![
                base + 2 * BYTES_IN_WORD,
                base + 3 * BYTES_IN_WORD,
                base + 5 * BYTES_IN_WORD
            ]
        );
    }

    #[test]
    fn bitmap_respects_range_length() {
        let d = Descriptor::bitmap(0b1000_0100);
        let base = Address::from_usize(0x2000);
        let mut seen = vec![];
        walk_slots(d, base, 3, &mut |s| seen.push(s));
        assert_eq!(seen, vec![base + 2 * BYTES_IN_WORD]);
    }

    #[test]
    fn complex_walk() {
        let block: Vec<usize> = vec![2, 0b1, 0b10];
        let d = Descriptor::complex(Address::from_ptr(block.as_ptr()));
        let base = Address::from_usize(0x3000);
        let mut seen = vec![];
        walk_slots(d, base, 2 * BITS_IN_WORD, &mut |s| seen.push(s));
        assert_eq!(
            seen,
            vec![base, base + (BITS_IN_WORD + 1) * BYTES_IN_WORD]
        );
    }

    #[test]
    fn user_walk() {
        fn marker(start: Address, relay: &mut dyn FnMut(Address)) {
            relay(start + 4 * BYTES_IN_WORD);
        }
        let d = Descriptor::user(marker);
        let base = Address::from_usize(0x4000);
        let mut seen = vec![];
        walk_slots(d, base, 8, &mut |s| seen.push(s));
        assert_eq!(seen, vec![base + 4 * BYTES_IN_WORD]);
    }

    #[test]
    #[should_panic]
    fn run_len_is_reserved() {
        Descriptor::from_raw(0b11);
    }
}
