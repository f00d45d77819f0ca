//! Command buffer memory
//!
//! The transport moves command arguments and responses through two DMA
//! buffers. They're carved out of a user-supplied static [`CommandMemory`].

use core::{
    cell::UnsafeCell,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

/// Memory for the command transport's input and output buffers
///
/// Allocate a `static` object and supply it to the transport. Half of the
/// memory holds incoming commands, and the other half holds responses.
/// The default size allows for the largest libgreat command (4 KiB) in
/// each direction.
///
/// ```
/// use great_usbd::CommandMemory;
///
/// static COMMAND_MEMORY: CommandMemory = CommandMemory::new();
/// ```
#[repr(align(32))]
pub struct CommandMemory<const SIZE: usize = 8192> {
    buffer: UnsafeCell<[u8; SIZE]>,
    taken: AtomicBool,
}

// Safety: the memory is only reachable through the allocator, which
// can be taken once.
unsafe impl<const SIZE: usize> Sync for CommandMemory<SIZE> {}

impl<const SIZE: usize> CommandMemory<SIZE> {
    pub const fn new() -> Self {
        CommandMemory {
            buffer: UnsafeCell::new([0; SIZE]),
            taken: AtomicBool::new(false),
        }
    }

    /// Acquire the allocator for this memory
    ///
    /// Returns `None` if the allocator was already taken.
    pub(crate) fn allocator(&self) -> Option<Allocator> {
        if self.taken.swap(true, Ordering::SeqCst) {
            return None;
        }
        let start = NonNull::new(self.buffer.get().cast::<u8>())?;
        // Safety: the memory is static, and we just took exclusive ownership.
        Some(unsafe { Allocator::new(start, SIZE) })
    }
}

/// A region of memory the USB controller reads or writes
///
/// The region is exclusively owned by whoever holds the `Buffer`.
pub struct Buffer {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: a buffer is the unique handle to its memory.
unsafe impl Send for Buffer {}

impl Buffer {
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// View the memory
    ///
    /// The caller must make sure the controller isn't writing the memory
    /// while the view exists.
    pub fn as_slice(&self) -> &[u8] {
        // Safety: the allocator handed out this region exclusively.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutably view the memory
    ///
    /// Same caveats as [`as_slice`](Buffer::as_slice).
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: see as_slice(). The receiver guarantees uniqueness.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// Bump allocator for command buffers
pub struct Allocator {
    start: *mut u8,
    ptr: *mut u8,
}

impl Allocator {
    /// # Safety
    ///
    /// Caller must ensure `start` points to an allocation of size. Caller must
    /// ensure that no one else is using this memory for anything else.
    pub unsafe fn new(start: NonNull<u8>, size: usize) -> Self {
        let start = start.as_ptr();
        let ptr = start.add(size);
        Allocator { start, ptr }
    }

    /// Returns how many bytes are left
    pub fn remaining(&self) -> usize {
        self.ptr as usize - self.start as usize
    }

    /// Allocates a buffer of `size`
    pub fn allocate(&mut self, size: usize) -> Option<Buffer> {
        let new_ptr = (self.ptr as usize).checked_sub(size)?;
        if new_ptr < self.start as usize {
            return None;
        }
        // Same provenance as start; only the offset changes.
        self.ptr = self.ptr.wrapping_sub(size);
        Some(Buffer {
            ptr: NonNull::new(self.ptr)?,
            len: size,
        })
    }
}

#[cfg(test)]
mod test {
    use super::{Allocator, CommandMemory};
    use core::ptr::NonNull;

    #[test]
    fn allocate_entire_buffer() {
        let mut buffer = [0; 32];
        let mut alloc = unsafe { Allocator::new(NonNull::new_unchecked(buffer.as_mut_ptr()), 32) };
        let mut allocated = alloc.allocate(32).unwrap();
        assert_eq!(allocated.as_mut_ptr(), buffer.as_mut_ptr());
        assert_eq!(alloc.remaining(), 0);
        assert!(alloc.allocate(1).is_none());
    }

    #[test]
    fn allocate_halves() {
        let mut buffer = [0; 32];
        let base = buffer.as_mut_ptr();
        let mut alloc = unsafe { Allocator::new(NonNull::new_unchecked(base), 32) };

        let mut input = alloc.allocate(16).unwrap();
        let mut output = alloc.allocate(16).unwrap();
        assert_eq!(input.as_mut_ptr(), unsafe { base.add(16) });
        assert_eq!(output.as_mut_ptr(), base);

        input.as_mut_slice().fill(0xAA);
        assert!(output.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn take_memory_once() {
        let memory: CommandMemory<64> = CommandMemory::new();
        let mut alloc = memory.allocator().unwrap();
        assert_eq!(alloc.remaining(), 64);
        assert!(alloc.allocate(64).is_some());
        for _ in 0..3 {
            assert!(memory.allocator().is_none());
        }
    }
}
