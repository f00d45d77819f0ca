//! Volatile cell for memory shared with the USB DMA engine
//!
//! The cell conforms to the RAL's register API (`read()` and `write()`), so
//! `ral_registers` macros work on descriptors the same way they work on
//! peripheral registers.

use core::cell::UnsafeCell;

#[repr(transparent)]
pub struct VCell<T>(UnsafeCell<T>);

impl<T> VCell<T> {
    pub const fn new(val: T) -> Self {
        VCell(UnsafeCell::new(val))
    }
}

impl<T: Copy> VCell<T> {
    pub fn read(&self) -> T {
        // Safety: the cell always holds an initialized T, and T is Copy.
        unsafe { self.0.get().read_volatile() }
    }
    pub fn write(&self, val: T) {
        // Safety: see read().
        unsafe { self.0.get().write_volatile(val) }
    }
    /// Read, transform, and write back the value
    ///
    /// This is not atomic with respect to the controller. Only use it on
    /// memory the controller doesn't currently own.
    pub fn update(&self, f: impl FnOnce(T) -> T) {
        self.write(f(self.read()))
    }
}
