pub mod context;
pub mod kernel;
pub mod layout;
pub mod port;

pub use context::{Invoke, Status};
pub use kernel::{Kernel, KernelType, VTable};
pub use layout::{PlacedField, RawBuf, RecordLayout, SlotInfo};
pub use port::{Direction, Field, Kind, Port};
