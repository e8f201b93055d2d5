use core::fmt;
use std::borrow::Cow;

/// A named, typed input or output slot on a kernel.
#[derive(Clone, Debug)]
pub struct Port {
    pub name: Cow<'static, str>,
    pub direction: Direction,
    pub kind: Kind,
    /// Slot count for port arrays. `None` is a plain single-slot port.
    pub array: Option<u16>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    /// A fixed-size value resolved to a memory address during execution.
    Scalar(Scalar),
    /// A variable-length array field, sized by request and resolved to arena
    /// memory after commit.
    Buffer(Buffer),
    /// A fixed-size record with nested buffer fields at declared offsets.
    Aggregate(Aggregate),
    /// Simulation-layer message endpoint; never resolved to an address.
    Message(Message),
}

#[derive(Clone, Debug)]
pub struct Scalar {
    pub description: Cow<'static, str>,
    pub size: usize,
    pub align: usize,
}

#[derive(Clone, Debug)]
pub struct Buffer {
    pub description: Cow<'static, str>,
    pub elem_size: usize,
    pub elem_align: usize,
}

#[derive(Clone, Debug)]
pub struct Aggregate {
    pub description: Cow<'static, str>,
    pub size: usize,
    pub align: usize,
    /// Buffer fields nested inside the record, at explicitly declared byte
    /// offsets. No runtime reflection: a mismatch is a declaration bug.
    pub buffers: &'static [Field],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub description: Cow<'static, str>,
    pub size: usize,
    pub align: usize,
}

/// The location of one variable-length buffer field inside an aggregate or a
/// kernel state record: the byte offset of its (ptr, len) pair plus the
/// element shape.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub offset: usize,
    pub elem_size: usize,
    pub elem_align: usize,
}

impl Port {
    pub const fn input(name: &'static str, kind: Kind) -> Self {
        Self {
            name: Cow::Borrowed(name),
            direction: Direction::Input,
            kind,
            array: None,
        }
    }

    pub const fn output(name: &'static str, kind: Kind) -> Self {
        Self {
            name: Cow::Borrowed(name),
            direction: Direction::Output,
            kind,
            array: None,
        }
    }

    /// Turn this port into a port array with `capacity` slots.
    pub const fn array(mut self, capacity: u16) -> Self {
        self.array = Some(capacity);
        self
    }

    pub fn slots(&self) -> usize {
        match self.array {
            Some(capacity) => capacity as usize,
            None => 1,
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_ref()
    }
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        self.description == other.description && self.size == other.size
    }
}

impl Eq for Scalar {}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.description == other.description && self.elem_size == other.elem_size
    }
}

impl Eq for Buffer {}

impl PartialEq for Aggregate {
    fn eq(&self, other: &Self) -> bool {
        self.description == other.description && self.size == other.size
    }
}

impl Eq for Aggregate {}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            Kind::Scalar(s) => &s.description,
            Kind::Buffer(b) => &b.description,
            Kind::Aggregate(a) => &a.description,
            Kind::Message(m) => &m.description,
        };
        write!(f, "{description}")
    }
}

impl Kind {
    /// A scalar kind shaped like `T`.
    pub const fn scalar_of<T>(name: &'static str) -> Self {
        Self::Scalar(Scalar {
            description: Cow::Borrowed(name),
            size: size_of::<T>(),
            align: align_of::<T>(),
        })
    }

    /// A buffer kind with elements shaped like `T`.
    pub const fn buffer_of<T>(name: &'static str) -> Self {
        Self::Buffer(Buffer {
            description: Cow::Borrowed(name),
            elem_size: size_of::<T>(),
            elem_align: align_of::<T>(),
        })
    }

    pub fn is_data(&self) -> bool {
        !matches!(self, Kind::Message(_))
    }
}

pub const F32: Kind = Kind::scalar_of::<f32>("f32");
pub const F64: Kind = Kind::scalar_of::<f64>("f64");
pub const U32: Kind = Kind::scalar_of::<u32>("u32");
pub const U64: Kind = Kind::scalar_of::<u64>("u64");
pub const I64: Kind = Kind::scalar_of::<i64>("i64");

pub const F32_BUFFER: Kind = Kind::buffer_of::<f32>("f32-buffer");
pub const F64_BUFFER: Kind = Kind::buffer_of::<f64>("f64-buffer");
pub const U64_BUFFER: Kind = Kind::buffer_of::<u64>("u64-buffer");
