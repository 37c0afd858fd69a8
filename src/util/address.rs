use bytemuck::NoUninit;

use std::fmt;
use std::num::NonZeroUsize;
use std::ops::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// size in bytes
pub type ByteSize = usize;
/// offset in bytes
pub type ByteOffset = isize;

/// Address represents an arbitrary heap address. It exists so that address
/// arithmetic is explicit and so that the small number of places that
/// dereference raw memory are marked unsafe, while the type itself stays
/// zero overhead.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq, NoUninit)]
pub struct Address(usize);

/// Address + ByteSize (positive)
impl Add<ByteSize> for Address {
    type Output = Address;
    fn add(self, offset: ByteSize) -> Address {
        Address(self.0 + offset)
    }
}

/// Address += ByteSize (positive)
impl AddAssign<ByteSize> for Address {
    fn add_assign(&mut self, offset: ByteSize) {
        self.0 += offset;
    }
}

/// Address + ByteOffset (positive or negative)
impl Add<ByteOffset> for Address {
    type Output = Address;
    fn add(self, offset: ByteOffset) -> Address {
        Address((self.0 as isize + offset) as usize)
    }
}

/// Address - ByteSize (positive)
impl Sub<ByteSize> for Address {
    type Output = Address;
    fn sub(self, offset: ByteSize) -> Address {
        Address(self.0 - offset)
    }
}

/// Address - Address (the first address must be higher)
impl Sub<Address> for Address {
    type Output = ByteSize;
    fn sub(self, other: Address) -> ByteSize {
        debug_assert!(
            self.0 >= other.0,
            "for (addr_a - addr_b), a({}) needs to be larger than b({})",
            self,
            other
        );
        self.0 - other.0
    }
}

/// Address & mask
impl BitAnd<usize> for Address {
    type Output = usize;
    fn bitand(self, other: usize) -> usize {
        self.0 & other
    }
}

/// Address >> shift (get an index)
impl Shr<usize> for Address {
    type Output = usize;
    fn shr(self, shift: usize) -> usize {
        self.0 >> shift
    }
}

impl Address {
    /// The lowest possible address.
    pub const ZERO: Self = Address(0);
    /// The highest possible address.
    pub const MAX: Self = Address(usize::MAX);

    /// creates Address from a pointer
    pub fn from_ptr<T>(ptr: *const T) -> Address {
        Address(ptr as usize)
    }

    /// creates Address from a Rust reference
    pub fn from_ref<T>(r: &T) -> Address {
        Address(r as *const T as usize)
    }

    /// creates Address from a mutable pointer
    pub fn from_mut_ptr<T>(ptr: *mut T) -> Address {
        Address(ptr as usize)
    }

    /// creates a null Address (0)
    pub const fn zero() -> Address {
        Address(0)
    }

    /// creates an Address of (usize::MAX)
    pub const fn max() -> Address {
        Address(usize::MAX)
    }

    /// creates an arbitrary Address
    pub const fn from_usize(raw: usize) -> Address {
        Address(raw)
    }

    /// Bit-inverts the address. Disappearing links store their target in this
    /// hidden form so conservative scans do not keep the referent alive.
    pub const fn hide(self) -> Address {
        Address(!self.0)
    }

    /// Recovers a hidden (bit-inverted) address.
    pub const fn reveal(self) -> Address {
        Address(!self.0)
    }

    /// shifts the address by N bytes
    pub fn offset(self, offset: ByteOffset) -> Address {
        Address((self.0 as isize + offset) as usize)
    }

    /// is this address zero?
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// aligns up the address to the given alignment
    pub fn align_up(self, align: ByteSize) -> Address {
        debug_assert!(align.is_power_of_two());
        Address((self.0 + align - 1) & !(align - 1))
    }

    /// aligns down the address to the given alignment
    pub fn align_down(self, align: ByteSize) -> Address {
        debug_assert!(align.is_power_of_two());
        Address(self.0 & !(align - 1))
    }

    /// is this address aligned to the given alignment?
    pub fn is_aligned_to(self, align: usize) -> bool {
        debug_assert!(align.is_power_of_two());
        self.0 & (align - 1) == 0
    }

    /// converts the Address to a pointer
    pub fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// converts the Address to a mutable pointer
    pub fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// converts the Address to a raw usize
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Loads a value of type T from the address.
    ///
    /// # Safety
    /// The caller must guarantee the address is valid and readable as a T.
    pub unsafe fn load<T: Copy>(self) -> T {
        *(self.0 as *const T)
    }

    /// Stores a value of type T to the address.
    ///
    /// # Safety
    /// The caller must guarantee the address is valid and writable as a T.
    pub unsafe fn store<T>(self, value: T) {
        *(self.0 as *mut T) = value;
    }

    /// Views the word at this address as an atomic.
    ///
    /// # Safety
    /// The caller must guarantee the address holds a live machine word.
    pub unsafe fn as_atomic_word(self) -> &'static AtomicUsize {
        &*(self.0 as *const AtomicUsize)
    }

    /// Atomic CAS on the word at this address.
    ///
    /// # Safety
    /// The caller must guarantee the address holds a live machine word.
    pub unsafe fn compare_exchange_word(
        self,
        current: usize,
        new: usize,
        success: Ordering,
        failure: Ordering,
    ) -> Result<usize, usize> {
        self.as_atomic_word()
            .compare_exchange(current, new, success, failure)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A reference to a managed object: a non-null, `ALLOC_ALIGN`-aligned address
/// of the object's first header word. Nullable slots are `Option<ObjectReference>`;
/// the niche makes that a plain word.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq)]
pub struct ObjectReference(NonZeroUsize);

impl ObjectReference {
    /// Cast the object reference to its raw address.
    pub fn to_raw_address(self) -> Address {
        Address(self.0.get())
    }

    /// Cast a raw address to an object reference. A zero address yields `None`.
    pub fn from_raw_address(addr: Address) -> Option<ObjectReference> {
        debug_assert!(
            addr.is_aligned_to(crate::util::constants::ALLOC_ALIGN),
            "ObjectReference must be allocation aligned. addr: {}",
            addr
        );
        NonZeroUsize::new(addr.0).map(ObjectReference)
    }

    /// Like `from_raw_address`, but assumes `addr` is not zero.
    ///
    /// # Safety
    /// `addr` must not be zero.
    pub unsafe fn from_raw_address_unchecked(addr: Address) -> ObjectReference {
        debug_assert!(!addr.is_zero());
        ObjectReference(NonZeroUsize::new_unchecked(addr.0))
    }

    /// Reads the object reference stored in a slot. Returns `None` for a null
    /// slot.
    ///
    /// # Safety
    /// `slot` must be a valid reference slot.
    pub unsafe fn load_from_slot(slot: Address) -> Option<ObjectReference> {
        let word: usize = slot.load();
        NonZeroUsize::new(word).map(ObjectReference)
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
