//! Device Transfer Descriptors (dTD)
//!
//! The module implements a RAL-compatible interface for working
//! with transfer descriptors, and the few operations the transfer
//! queue needs: describing a buffer, linking descriptors, and reading
//! back completion status.

#![allow(non_snake_case, non_upper_case_globals)]

use crate::{ral, vcell::VCell};

/// Size of one buffer page. The controller walks up to five of them.
const PAGE_SIZE: u32 = 0x1000;

/// The largest transfer one descriptor can describe.
///
/// Five pages, assuming the worst case alignment of the first one.
pub const MAX_TRANSFER: usize = 4 * PAGE_SIZE as usize;

#[repr(C)]
pub struct Td {
    NEXT: VCell<u32>,
    TOKEN: VCell<u32>,
    BUFFERS: [VCell<u32>; 5],
    _reserved: u32,
}

bitflags::bitflags! {
    /// Status bits reported in a descriptor's token
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Status : u32 {
        const ACTIVE = 1 << 7;
        const HALTED = 1 << 6;
        const DATA_BUS_ERROR = 1 << 5;
        const TRANSACTION_ERROR = 1 << 3;
    }
}

impl Status {
    /// Any of these conditions aborts the transfer
    pub const ABORTED: Status = Status::HALTED
        .union(Status::DATA_BUS_ERROR)
        .union(Status::TRANSACTION_ERROR);
}

impl Td {
    pub const fn new() -> Self {
        Td {
            NEXT: VCell::new(1),
            TOKEN: VCell::new(0),
            BUFFERS: [
                VCell::new(0),
                VCell::new(0),
                VCell::new(0),
                VCell::new(0),
                VCell::new(0),
            ],
            _reserved: 0,
        }
    }

    /// Mark this descriptor as the last one in its list
    pub fn set_terminate(&self) {
        ral::write_reg!(crate::td, self, NEXT, TERMINATE: 1);
    }

    /// Link `next` behind this descriptor
    ///
    /// Clears the terminate bit.
    pub fn set_next(&self, next: &Td) {
        ral::write_reg!(crate::td, self, NEXT, next.address());
    }

    /// The bus address of this descriptor, as the controller sees it
    pub fn address(&self) -> u32 {
        self as *const Td as usize as u32
    }

    /// Describe a transfer of `size` bytes at `ptr`
    ///
    /// The first page pointer carries the byte offset. Every following
    /// page pointer is 4 KiB aligned.
    pub fn set_buffer(&self, ptr: *const u8, size: usize) {
        let ptr = ptr as usize as u32;
        ral::write_reg!(crate::td, self, TOKEN, TOTAL_BYTES: size as u32);
        self.BUFFERS[0].write(ptr);
        for (idx, page) in self.BUFFERS.iter().enumerate().skip(1) {
            page.write(ptr.wrapping_add(PAGE_SIZE * idx as u32) & !(PAGE_SIZE - 1));
        }
    }

    /// Interrupt on complete
    pub fn set_interrupt_on_complete(&self, ioc: bool) {
        ral::modify_reg!(crate::td, self, TOKEN, IOC: ioc as u32);
    }

    /// Hand the descriptor to the controller, and clear any stale status
    pub fn set_active(&self) {
        ral::modify_reg!(crate::td, self, TOKEN, STATUS: Status::ACTIVE.bits());
    }

    /// Drop the ACTIVE and HALTED bits, keeping everything else
    pub fn clear_active_halted(&self) {
        let clear = (Status::ACTIVE | Status::HALTED).bits();
        self.TOKEN.update(|token| token & !clear);
    }

    pub fn status(&self) -> Status {
        Status::from_bits_truncate(ral::read_reg!(crate::td, self, TOKEN, STATUS))
    }

    /// Bytes the controller didn't move yet
    pub fn remaining(&self) -> usize {
        ral::read_reg!(crate::td, self, TOKEN, TOTAL_BYTES) as usize
    }

    /// Simulate the controller finishing this descriptor
    #[cfg(test)]
    pub fn retire(&self, remaining: usize, status: Status) {
        ral::write_reg!(crate::td, self, TOKEN, TOTAL_BYTES: remaining as u32, STATUS: status.bits());
    }
}

pub mod NEXT {
    pub mod TERMINATE {
        pub const offset: u32 = 0;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod NEXT_LINK_POINTER {
        pub const offset: u32 = 5;
        pub const mask: u32 = 0x7ffffff << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod TOKEN {
    pub mod STATUS {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0xFF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod IOC {
        pub const offset: u32 = 15;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod TOTAL_BYTES {
        pub const offset: u32 = 16;
        pub const mask: u32 = 0x7FFF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}


const _: [(); 1] = [(); (core::mem::size_of::<Td>() == 32) as usize];
