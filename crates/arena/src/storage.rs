use kernel::{KernelType, RawBuf};

use crate::block::Block;

/// Backing storage for one variable-length buffer field. Resizing never
/// preserves contents: a resized buffer starts zeroed, because resizing
/// implies the producer will fully rewrite it.
pub struct BufferStorage {
    block: Block,
    len: usize,
    elem_size: usize,
    elem_align: usize,
}

impl BufferStorage {
    pub fn empty(elem_size: usize, elem_align: usize) -> Self {
        Self {
            block: Block::zeroed(0, elem_align.max(1)),
            len: 0,
            elem_size,
            elem_align,
        }
    }

    /// Replace the backing block with a fresh zeroed allocation of
    /// `len` elements. Setting the current length is still a fresh block:
    /// idempotence of *requests* is the diff builder's job, not ours.
    pub fn resize(&mut self, len: usize) {
        self.block = Block::zeroed(len * self.elem_size, self.elem_align.max(1));
        self.len = len;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len * self.elem_size
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// The (ptr, len) pair to patch into a ports record.
    pub fn raw(&self) -> RawBuf {
        if self.len == 0 {
            return RawBuf::empty();
        }
        RawBuf {
            ptr: self.block.as_ptr(),
            len: self.len,
        }
    }

    pub fn range(&self) -> (usize, usize) {
        self.block.range()
    }
}

/// One node's arena-resident memory: the kernel-data record, the ports
/// record, and a block per declared buffer field.
pub struct NodeStorage {
    ty: &'static KernelType,
    data: Block,
    record: Block,
    buffers: Vec<BufferStorage>,
    state_buffers: Vec<BufferStorage>,
    initialized: bool,
}

impl NodeStorage {
    pub fn new(ty: &'static KernelType) -> Self {
        let layout = ty.record();
        let data = Block::zeroed(ty.state_size, ty.state_align.max(1));
        let record = Block::zeroed(layout.size, layout.align.max(1));
        let buffers = layout
            .buffer_fields
            .iter()
            .map(|field| BufferStorage::empty(field.elem_size, field.elem_align))
            .collect();
        let state_buffers = ty
            .state_fields
            .iter()
            .map(|field| BufferStorage::empty(field.elem_size, field.elem_align))
            .collect();
        let mut storage = Self {
            ty,
            data,
            record,
            buffers,
            state_buffers,
            initialized: false,
        };
        unsafe { (storage.ty.vtable.init)(storage.data.as_ptr()) };
        storage.initialized = true;
        storage.patch_own();
        storage
    }

    pub fn ty(&self) -> &'static KernelType {
        self.ty
    }

    pub fn data_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    pub fn record_ptr(&self) -> *mut u8 {
        self.record.as_ptr()
    }

    /// Number of committed elements in an output-owned buffer field.
    pub fn field_len(&self, field: usize) -> usize {
        self.buffers[field].len()
    }

    /// Resize an output-owned buffer field and re-patch its pair.
    pub fn resize_field(&mut self, field: usize, len: usize) {
        self.buffers[field].resize(len);
        let placed = self.ty.record().buffer_fields[field];
        unsafe { self.write_pair(placed.offset, self.buffers[field].raw()) };
    }

    /// Resize a buffer field embedded in the kernel-data record.
    pub fn resize_state_field(&mut self, index: usize, len: usize) {
        self.state_buffers[index].resize(len);
        let field = self.ty.state_fields[index];
        let raw = self.state_buffers[index].raw();
        unsafe {
            self.data
                .as_ptr()
                .add(field.offset)
                .cast::<RawBuf>()
                .write(raw);
        }
    }

    /// Re-write every pair this node owns: output buffer fields into the
    /// ports record, state buffer fields into the data record. Called after
    /// any resize and before input patching each commit.
    pub fn patch_own(&mut self) {
        let layout = self.ty.record();
        for (index, placed) in layout.buffer_fields.iter().enumerate() {
            let raw = self.buffers[index].raw();
            unsafe { self.write_pair(placed.offset, raw) };
        }
        for (index, field) in self.ty.state_fields.iter().enumerate() {
            let raw = self.state_buffers[index].raw();
            unsafe {
                self.data
                    .as_ptr()
                    .add(field.offset)
                    .cast::<RawBuf>()
                    .write(raw);
            }
        }
    }

    /// Patch an input pointer slot.
    ///
    /// # Safety
    ///
    /// `offset` must be a pointer-slot offset from this node's record
    /// layout, and `ptr` must stay valid for the next execution window.
    pub unsafe fn write_input_ptr(&mut self, offset: usize, ptr: *const u8) {
        debug_assert!(offset + size_of::<*const u8>() <= self.record.len());
        unsafe {
            self.record
                .as_ptr()
                .add(offset)
                .cast::<*const u8>()
                .write(ptr);
        }
    }

    /// Patch a buffer (ptr, len) pair slot.
    ///
    /// # Safety
    ///
    /// `offset` must be a pair-slot offset from this node's record layout.
    pub unsafe fn write_pair(&mut self, offset: usize, raw: RawBuf) {
        debug_assert!(offset + size_of::<RawBuf>() <= self.record.len());
        unsafe { self.record.as_ptr().add(offset).cast::<RawBuf>().write(raw) };
    }

    /// Read a pair slot back (used to resolve a consumer's view of this
    /// node's output).
    pub fn read_pair(&self, offset: usize) -> RawBuf {
        debug_assert!(offset + size_of::<RawBuf>() <= self.record.len());
        unsafe { self.record.as_ptr().add(offset).cast::<RawBuf>().read() }
    }

    /// Address of an output port's inline storage.
    pub fn output_ptr(&self, port: u16, index: u16) -> *const u8 {
        let offset = self.ty.record().slot_offset(port, index);
        unsafe { self.record.as_ptr().add(offset) }
    }

    /// Address of an input port's default backing storage.
    pub fn default_ptr(&self, port: u16, index: u16) -> Option<*mut u8> {
        let offset = self.ty.record().default_offset(port, index)?;
        Some(unsafe { self.record.as_ptr().add(offset) })
    }

    /// Copy directly assigned bytes into an input's default storage.
    /// Returns false when the port has no default region or sizes mismatch.
    pub fn write_default(&mut self, port: u16, index: u16, bytes: &[u8]) -> bool {
        let layout = self.ty.record();
        let Some(offset) = layout.default_offset(port, index) else {
            return false;
        };
        if bytes.len() > layout.slots[port as usize].default_stride {
            return false;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.record.as_ptr().add(offset),
                bytes.len(),
            );
        }
        true
    }

    /// Every non-empty address range this node owns, for aliasing audits.
    pub fn ranges(&self) -> Vec<(usize, usize)> {
        let mut ranges = Vec::new();
        for block in [&self.data, &self.record] {
            if !block.is_empty() {
                ranges.push(block.range());
            }
        }
        ranges.extend(
            self.buffers
                .iter()
                .chain(self.state_buffers.iter())
                .filter(|b| !b.is_empty())
                .map(|b| b.range()),
        );
        ranges
    }
}

impl Drop for NodeStorage {
    fn drop(&mut self) {
        if self.initialized {
            unsafe { (self.ty.vtable.drop)(self.data.as_ptr()) };
        }
    }
}

// Storage is patched on the commit thread and dereferenced by workers only
// inside the execution window.
unsafe impl Send for NodeStorage {}
