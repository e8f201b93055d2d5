pub mod collections;
pub mod slot;

mod macros;

use std::ops::{Deref, DerefMut};

/// Asserts that the wrapped value may be shared across threads. The caller is
/// responsible for upholding whatever synchronization discipline makes that
/// true.
#[repr(transparent)]
pub struct IsSendSync<T: ?Sized>(T);

impl<T> IsSendSync<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

unsafe impl<T: ?Sized> Send for IsSendSync<T> {}
unsafe impl<T: ?Sized> Sync for IsSendSync<T> {}

impl<T: ?Sized> Deref for IsSendSync<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: ?Sized> DerefMut for IsSendSync<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<T: ?Sized> AsRef<T> for IsSendSync<T> {
    fn as_ref(&self) -> &T {
        &self.0
    }
}

/// Report an error from an execution-phase context without allocating or
/// locking.
pub fn rt_error(msg: &str) {
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
        libc::write(libc::STDERR_FILENO, b"\n".as_ptr().cast(), 1);
    }
}
