//! Cell layout, tagged values and the type registry.
//!
//! Every managed object ("cell") starts with a [`CellHeader`]. The collector
//! treats the rest of the fixed part as opaque bytes except for the reference
//! fields listed in the cell's [`TypeInfo`]. Slot and element arrays hang off
//! the header and may live inline after the fixed part, in the nursery, or in
//! the general-purpose heap.

use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};

/// Size of one storage unit of a slot or element array.
pub const WORD: usize = mem::size_of::<usize>();

/// Size of the header every cell starts with.
pub const HEADER_SIZE: usize = mem::size_of::<CellHeader>();

// ============================================================================
// Value - a tagged machine word
// ============================================================================

/// A tagged word stored in reference fields, slots and array elements.
///
/// `0` is null, odd words are immediate integers and every other word is
/// the address of a cell.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Value(usize);

impl Value {
    /// The null value.
    pub const NULL: Self = Self(0);

    /// Create an immediate integer. The top bit of `n` is lost.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn from_int(n: isize) -> Self {
        Self(((n as usize) << 1) | 1)
    }

    /// Create a reference to `cell`.
    #[must_use]
    pub fn from_cell(cell: CellPtr) -> Self {
        Self(cell.addr())
    }

    /// Returns the raw word.
    #[must_use]
    pub const fn bits(self) -> usize {
        self.0
    }

    /// Returns `true` for the null value.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` for an immediate integer.
    #[must_use]
    pub const fn is_int(self) -> bool {
        self.0 & 1 == 1
    }

    /// Returns the integer payload, if this is an immediate integer.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn as_int(self) -> Option<isize> {
        if self.is_int() {
            Some((self.0 as isize) >> 1)
        } else {
            None
        }
    }

    /// Returns the referenced cell, if this is a reference.
    #[must_use]
    pub fn as_cell(self) -> Option<CellPtr> {
        if self.is_int() {
            return None;
        }
        CellPtr::from_addr(self.0)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("Null")
        } else if let Some(n) = self.as_int() {
            write!(f, "Int({n})")
        } else {
            write!(f, "Cell({:#x})", self.0)
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// Identity of a registered type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TypeId(pub u32);

/// Storage kind of a cell's element array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// No element array.
    Plain,
    /// Elements are `Value`s; length and capacity count words.
    Array,
    /// Elements are raw bytes; length and capacity count bytes. Never traced.
    ByteBuffer,
}

/// Layout description of a registered type.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    /// Identity assigned at registration.
    pub id: TypeId,
    /// Name used in diagnostics.
    pub name: &'static str,
    /// Element storage kind.
    pub kind: ObjectKind,
    /// Size of header plus body in bytes.
    pub fixed_size: usize,
    /// Byte offsets of `Value` fields inside the body.
    pub ref_offsets: Vec<usize>,
}

impl TypeInfo {
    /// Number of words needed to store `len` element units of this type.
    #[must_use]
    pub const fn element_words(&self, len: usize) -> usize {
        match self.kind {
            ObjectKind::Plain => 0,
            ObjectKind::Array => len,
            ObjectKind::ByteBuffer => len.div_ceil(WORD),
        }
    }
}

/// All types known to a runtime, indexed by [`TypeId`].
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: Vec<TypeInfo>,
}

impl TypeRegistry {
    /// Create an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self { types: Vec::new() }
    }

    /// Register a type and return its identity.
    ///
    /// # Panics
    ///
    /// Panics if `fixed_size` is smaller than the cell header or not word
    /// aligned, or if a reference offset is unaligned, overlaps the header or
    /// lies outside the fixed part.
    pub fn register(
        &mut self,
        name: &'static str,
        kind: ObjectKind,
        fixed_size: usize,
        ref_offsets: &[usize],
    ) -> TypeId {
        assert!(
            fixed_size >= HEADER_SIZE && fixed_size % WORD == 0,
            "type {name}: fixed size {fixed_size} must be a word multiple of at least {HEADER_SIZE}"
        );
        for &offset in ref_offsets {
            assert!(
                offset >= HEADER_SIZE && offset % WORD == 0 && offset + WORD <= fixed_size,
                "type {name}: bad reference offset {offset}"
            );
        }

        let id = TypeId(u32::try_from(self.types.len()).expect("too many types"));
        self.types.push(TypeInfo {
            id,
            name,
            kind,
            fixed_size,
            ref_offsets: ref_offsets.to_vec(),
        });
        id
    }

    /// Look up a registered type.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not produced by this registry.
    #[must_use]
    pub fn get(&self, id: TypeId) -> &TypeInfo {
        &self.types[id.0 as usize]
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns `true` if no type has been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

// ============================================================================
// CellHeader / CellPtr
// ============================================================================

/// Header at the start of every cell.
#[repr(C)]
#[derive(Debug)]
pub struct CellHeader {
    /// Type of the cell.
    pub type_id: TypeId,
    /// Number of words in the slot array.
    pub slot_count: u32,
    /// Slot array, or null when `slot_count` is zero.
    pub slots: *mut Value,
    /// Element array, or null when there is no element storage.
    pub elements: *mut Value,
    /// Initialized element units (words or bytes, see [`ObjectKind`]).
    pub element_len: u32,
    /// Allocated element units.
    pub element_capacity: u32,
}

/// Address of a cell.
///
/// `CellPtr` is a plain address: it does not keep the cell alive and becomes
/// stale when a minor collection moves the cell. All accessors are `unsafe`
/// for that reason.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CellPtr(NonNull<CellHeader>);

impl CellPtr {
    /// Wrap a raw cell pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must point to an initialized cell header.
    #[must_use]
    pub const unsafe fn from_raw(ptr: NonNull<CellHeader>) -> Self {
        Self(ptr)
    }

    pub(crate) fn from_addr(addr: usize) -> Option<Self> {
        NonNull::new(addr as *mut CellHeader).map(Self)
    }

    /// Returns the address of the cell.
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Returns the raw header pointer.
    #[must_use]
    pub const fn as_ptr(self) -> *mut CellHeader {
        self.0.as_ptr()
    }

    /// Returns the cell's type.
    ///
    /// # Safety
    ///
    /// The cell must be live.
    #[must_use]
    pub unsafe fn type_id(self) -> TypeId {
        unsafe { (*self.as_ptr()).type_id }
    }

    /// Address of the reference field at byte `offset`.
    ///
    /// # Safety
    ///
    /// The cell must be live and `offset` must be one of its reference offsets.
    #[must_use]
    pub unsafe fn field_ptr(self, offset: usize) -> *mut Value {
        unsafe { self.as_ptr().cast::<u8>().add(offset).cast::<Value>() }
    }

    /// Read the reference field at byte `offset`.
    ///
    /// # Safety
    ///
    /// See [`CellPtr::field_ptr`].
    #[must_use]
    pub unsafe fn field(self, offset: usize) -> Value {
        unsafe { ptr::read(self.field_ptr(offset)) }
    }

    /// Write the reference field at byte `offset`.
    ///
    /// # Safety
    ///
    /// See [`CellPtr::field_ptr`]. Storing a nursery reference into a tenured
    /// cell requires a store buffer entry.
    pub unsafe fn set_field(self, offset: usize, value: Value) {
        unsafe { ptr::write(self.field_ptr(offset), value) };
    }

    /// Returns the slot array pointer.
    ///
    /// # Safety
    ///
    /// The cell must be live.
    #[must_use]
    pub unsafe fn slots(self) -> *mut Value {
        unsafe { (*self.as_ptr()).slots }
    }

    /// Returns the number of slots.
    ///
    /// # Safety
    ///
    /// The cell must be live.
    #[must_use]
    pub unsafe fn slot_count(self) -> usize {
        unsafe { (*self.as_ptr()).slot_count as usize }
    }

    /// Replace the slot array, e.g. after reallocating it.
    ///
    /// # Safety
    ///
    /// The cell must be live and `slots` must hold `count` initialized words.
    ///
    /// # Panics
    ///
    /// Panics if `count` does not fit in 32 bits.
    pub unsafe fn set_slots(self, slots: *mut Value, count: usize) {
        let header = self.as_ptr();
        unsafe {
            (*header).slots = slots;
            (*header).slot_count = u32::try_from(count).expect("slot count overflow");
        }
    }

    /// Read slot `index`.
    ///
    /// # Safety
    ///
    /// The cell must be live and `index < slot_count`.
    #[must_use]
    pub unsafe fn slot(self, index: usize) -> Value {
        debug_assert!(index < unsafe { self.slot_count() });
        unsafe { ptr::read(self.slots().add(index)) }
    }

    /// Write slot `index`.
    ///
    /// # Safety
    ///
    /// The cell must be live and `index < slot_count`.
    pub unsafe fn set_slot(self, index: usize, value: Value) {
        debug_assert!(index < unsafe { self.slot_count() });
        unsafe { ptr::write(self.slots().add(index), value) };
    }

    /// Returns the element array pointer.
    ///
    /// # Safety
    ///
    /// The cell must be live.
    #[must_use]
    pub unsafe fn elements(self) -> *mut Value {
        unsafe { (*self.as_ptr()).elements }
    }

    /// Returns the initialized element length.
    ///
    /// # Safety
    ///
    /// The cell must be live.
    #[must_use]
    pub unsafe fn element_len(self) -> usize {
        unsafe { (*self.as_ptr()).element_len as usize }
    }

    /// Returns the element capacity.
    ///
    /// # Safety
    ///
    /// The cell must be live.
    #[must_use]
    pub unsafe fn element_capacity(self) -> usize {
        unsafe { (*self.as_ptr()).element_capacity as usize }
    }

    /// Set the initialized element length.
    ///
    /// # Safety
    ///
    /// The cell must be live and `len` must not exceed the capacity.
    pub unsafe fn set_element_len(self, len: usize) {
        debug_assert!(len <= unsafe { self.element_capacity() });
        #[allow(clippy::cast_possible_truncation)]
        unsafe {
            (*self.as_ptr()).element_len = len as u32;
        }
    }

    /// Replace the element array.
    ///
    /// # Safety
    ///
    /// The cell must be live and `elements` must hold `capacity` units.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` does not fit in 32 bits.
    pub unsafe fn set_elements(self, elements: *mut Value, capacity: usize) {
        let header = self.as_ptr();
        unsafe {
            (*header).elements = elements;
            (*header).element_capacity =
                u32::try_from(capacity).expect("element capacity overflow");
        }
    }

    /// Read element `index` of an array cell.
    ///
    /// # Safety
    ///
    /// The cell must be a live array and `index` must be below its capacity.
    #[must_use]
    pub unsafe fn element(self, index: usize) -> Value {
        unsafe { ptr::read(self.elements().add(index)) }
    }

    /// Write element `index` of an array cell.
    ///
    /// # Safety
    ///
    /// The cell must be a live array and `index` must be below its capacity.
    pub unsafe fn set_element(self, index: usize, value: Value) {
        unsafe { ptr::write(self.elements().add(index), value) };
    }
}

impl fmt::Debug for CellPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellPtr({:#x})", self.addr())
    }
}
