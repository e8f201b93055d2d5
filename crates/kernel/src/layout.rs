//! Ports-record layout.
//!
//! Every kernel node owns a contiguous "ports record" in the arena. The
//! record holds one slot per port (per array index): inline storage for
//! outputs, a patched pointer for inputs, and a [RawBuf] pair for every
//! buffer field. The layout is a pure function of the port declarations; it
//! is computed once per kernel type and cached.

use crate::port::{Direction, Kind, Port};

/// The in-record representation of a buffer field: a pointer into the arena
/// plus the element count. Patched after every commit.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct RawBuf {
    pub ptr: *mut u8,
    pub len: usize,
}

impl RawBuf {
    pub const fn empty() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            len: 0,
        }
    }

    /// View the pointed-to elements.
    ///
    /// # Safety
    ///
    /// The pair must have been patched by the engine for the current
    /// execution window, and `T` must match the declared element shape.
    pub unsafe fn as_slice<T>(&self) -> &[T] {
        if self.ptr.is_null() || self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ptr.cast(), self.len) }
    }

    /// Mutable view of the pointed-to elements.
    ///
    /// # Safety
    ///
    /// As [RawBuf::as_slice], and the field must be exclusively owned by
    /// the caller (a kernel's own state field, or its output).
    pub unsafe fn as_mut_slice<T>(&mut self) -> &mut [T] {
        if self.ptr.is_null() || self.len == 0 {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.ptr.cast(), self.len) }
    }
}

impl Default for RawBuf {
    fn default() -> Self {
        Self::empty()
    }
}

// Kernel state may embed pairs; the engine guarantees a pair is only
// dereferenced by the one invocation that owns its record.
unsafe impl Send for RawBuf {}

const PTR_SIZE: usize = size_of::<*mut u8>();
const PAIR_SIZE: usize = size_of::<RawBuf>();
const PAIR_ALIGN: usize = align_of::<RawBuf>();

/// Placement of one port within the record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SlotInfo {
    pub offset: usize,
    pub stride: usize,
    pub count: usize,
    /// Backing storage for unconnected or directly assigned inputs.
    pub default_offset: Option<usize>,
    pub default_stride: usize,
}

/// Placement of one output-owned buffer (ptr, len) pair within the record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PlacedField {
    pub port: u16,
    pub slot: u16,
    /// Byte offset of the pair from the start of the record.
    pub offset: usize,
    pub elem_size: usize,
    pub elem_align: usize,
}

#[derive(Clone, Debug)]
pub struct RecordLayout {
    pub size: usize,
    pub align: usize,
    pub slots: Box<[SlotInfo]>,
    pub buffer_fields: Box<[PlacedField]>,
}

const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

impl RecordLayout {
    /// Compute the record layout for a port list. Panics on a malformed
    /// declaration (a nested field that does not fit its aggregate); that is
    /// a kernel-authoring bug, caught the first time the type is registered.
    pub fn compute(ports: &[Port]) -> Self {
        assert!(ports.len() <= u16::MAX as usize, "too many ports");
        let mut size = 0usize;
        let mut align = PAIR_ALIGN;
        let mut slots = Vec::with_capacity(ports.len());

        for port in ports {
            let (slot_size, slot_align) = match (&port.kind, port.direction) {
                (Kind::Message(_), _) => (0, 1),
                (Kind::Scalar(_), Direction::Input) => (PTR_SIZE, PTR_SIZE),
                (Kind::Scalar(s), Direction::Output) => (s.size, s.align),
                (Kind::Buffer(_), _) => (PAIR_SIZE, PAIR_ALIGN),
                (Kind::Aggregate(_), Direction::Input) => (PTR_SIZE, PTR_SIZE),
                (Kind::Aggregate(a), Direction::Output) => (a.size, a.align),
            };
            if slot_size == 0 {
                slots.push(SlotInfo {
                    offset: 0,
                    stride: 0,
                    count: 0,
                    default_offset: None,
                    default_stride: 0,
                });
                continue;
            }
            let offset = align_up(size, slot_align);
            let stride = align_up(slot_size, slot_align);
            size = offset + stride * port.slots();
            align = align.max(slot_align);
            slots.push(SlotInfo {
                offset,
                stride,
                count: port.slots(),
                default_offset: None,
                default_stride: 0,
            });
        }

        // Defaults region: inline storage behind every pointer-patched input,
        // so unconnected inputs always resolve to zeroed (or directly
        // assigned) memory the node owns.
        for (index, port) in ports.iter().enumerate() {
            if port.direction != Direction::Input {
                continue;
            }
            let (default_size, default_align) = match &port.kind {
                Kind::Scalar(s) => (s.size, s.align),
                Kind::Aggregate(a) => (a.size, a.align),
                Kind::Buffer(_) | Kind::Message(_) => continue,
            };
            let offset = align_up(size, default_align);
            let stride = align_up(default_size, default_align);
            size = offset + stride * port.slots();
            align = align.max(default_align);
            slots[index].default_offset = Some(offset);
            slots[index].default_stride = stride;
        }

        let size = align_up(size, align);

        let mut buffer_fields = Vec::new();
        for (index, port) in ports.iter().enumerate() {
            if port.direction != Direction::Output {
                continue;
            }
            let info = &slots[index];
            match &port.kind {
                Kind::Buffer(b) => {
                    for slot in 0..info.count {
                        buffer_fields.push(PlacedField {
                            port: index as u16,
                            slot: slot as u16,
                            offset: info.offset + slot * info.stride,
                            elem_size: b.elem_size,
                            elem_align: b.elem_align,
                        });
                    }
                }
                Kind::Aggregate(a) => {
                    for field in a.buffers {
                        assert!(
                            field.offset % PAIR_ALIGN == 0
                                && field.offset + PAIR_SIZE <= a.size,
                            "nested buffer field at {} does not fit aggregate `{}`",
                            field.offset,
                            port.name(),
                        );
                        for slot in 0..info.count {
                            buffer_fields.push(PlacedField {
                                port: index as u16,
                                slot: slot as u16,
                                offset: info.offset + slot * info.stride + field.offset,
                                elem_size: field.elem_size,
                                elem_align: field.elem_align,
                            });
                        }
                    }
                }
                Kind::Scalar(_) | Kind::Message(_) => {}
            }
        }

        Self {
            size,
            align,
            slots: slots.into_boxed_slice(),
            buffer_fields: buffer_fields.into_boxed_slice(),
        }
    }

    pub fn slot_offset(&self, port: u16, index: u16) -> usize {
        let info = &self.slots[port as usize];
        debug_assert!((index as usize) < info.count);
        info.offset + info.stride * index as usize
    }

    pub fn default_offset(&self, port: u16, index: u16) -> Option<usize> {
        let info = &self.slots[port as usize];
        debug_assert!((index as usize) < info.count.max(1));
        Some(info.default_offset? + info.default_stride * index as usize)
    }

    /// Locate the output-owned buffer field whose pair sits at `offset`
    /// bytes into the record.
    pub fn field_at(&self, offset: usize) -> Option<(usize, &PlacedField)> {
        self.buffer_fields
            .iter()
            .enumerate()
            .find(|(_, field)| field.offset == offset)
    }

    /// Fields belonging to one port, in slot order.
    pub fn fields_of(&self, port: u16) -> impl Iterator<Item = (usize, &PlacedField)> {
        self.buffer_fields
            .iter()
            .enumerate()
            .filter(move |(_, field)| field.port == port)
    }
}
