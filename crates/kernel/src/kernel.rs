//! Kernel types and their registration.
//!
//! The engine never dispatches through trait objects at execution time.
//! Registering a [Kernel] implementation monomorphizes it once into a
//! [VTable] of plain function pointers; the kernel's state lives in an arena
//! record and is reached through that table. The set of kernel types is
//! closed after registration.

use std::any::TypeId;
use std::sync::{Mutex, OnceLock};

use util::collections::Map;

use crate::context::{Invoke, Status};
use crate::layout::RecordLayout;
use crate::port::{Field, Port};

/// A per-tick compute function attached to a node's data ports.
///
/// Kernel state must be `Default`-constructible; the engine writes the
/// default state into the node's data record when the node is committed and
/// drops it when the node's storage is released.
pub trait Kernel: Default + Send + 'static {
    const NAME: &'static str;
    const PORTS: &'static [Port];

    /// Buffer fields embedded in the kernel's own state record, at
    /// explicitly declared offsets (use `mem::offset_of!`).
    const STATE_FIELDS: &'static [Field] = &[];

    /// One execution. Out-of-range access must be reported through the
    /// returned [Status], never by unwinding: execution may happen on a
    /// worker that cannot propagate a panic across the engine boundary.
    fn invoke(&mut self, cx: &mut Invoke<'_>) -> Status;

    fn reset(&mut self) {}
}

/// Monomorphized entry points for one kernel type.
#[derive(Copy, Clone)]
pub struct VTable {
    pub init: unsafe fn(*mut u8),
    pub invoke: unsafe fn(*mut u8, &mut Invoke<'_>) -> Status,
    pub reset: unsafe fn(*mut u8),
    pub drop: unsafe fn(*mut u8),
}

/// A registered kernel type: descriptors, state shape, vtable, and the
/// cached ports-record layout.
pub struct KernelType {
    pub name: &'static str,
    pub ports: &'static [Port],
    pub state_fields: &'static [Field],
    pub state_size: usize,
    pub state_align: usize,
    pub vtable: VTable,
    record: OnceLock<RecordLayout>,
}

impl KernelType {
    /// Register (or look up) the kernel type for `K`. The returned reference
    /// is stable for the life of the process.
    pub fn of<K: Kernel>() -> &'static KernelType {
        static TYPES: OnceLock<Mutex<Map<TypeId, &'static KernelType>>> = OnceLock::new();
        let mut types = TYPES
            .get_or_init(|| Mutex::new(Map::default()))
            .lock()
            .unwrap();
        *types.entry(TypeId::of::<K>()).or_insert_with(|| {
            Box::leak(Box::new(KernelType {
                name: K::NAME,
                ports: K::PORTS,
                state_fields: K::STATE_FIELDS,
                state_size: size_of::<K>(),
                state_align: align_of::<K>(),
                vtable: vtable_of::<K>(),
                record: OnceLock::new(),
            }))
        })
    }

    /// The ports-record layout, computed on first use and reused thereafter.
    pub fn record(&self) -> &RecordLayout {
        self.record.get_or_init(|| RecordLayout::compute(self.ports))
    }

    /// Look up a port id by name.
    pub fn port(&self, name: &str) -> Option<u16> {
        self.ports
            .iter()
            .position(|port| port.name() == name)
            .map(|index| index as u16)
    }
}

impl std::fmt::Debug for KernelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelType")
            .field("name", &self.name)
            .field("ports", &self.ports.len())
            .finish()
    }
}

fn vtable_of<K: Kernel>() -> VTable {
    unsafe fn init<K: Kernel>(state: *mut u8) {
        unsafe { state.cast::<K>().write(K::default()) }
    }
    unsafe fn invoke<K: Kernel>(state: *mut u8, cx: &mut Invoke<'_>) -> Status {
        unsafe { (*state.cast::<K>()).invoke(cx) }
    }
    unsafe fn reset<K: Kernel>(state: *mut u8) {
        unsafe { (*state.cast::<K>()).reset() }
    }
    unsafe fn drop<K: Kernel>(state: *mut u8) {
        unsafe { state.cast::<K>().drop_in_place() }
    }
    VTable {
        init: init::<K>,
        invoke: invoke::<K>,
        reset: reset::<K>,
        drop: drop::<K>,
    }
}
