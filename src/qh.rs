//! Device endpoint Queue Head (dQH)

#![allow(non_snake_case, non_upper_case_globals)]

use crate::ral;
use crate::{td::Td, vcell::VCell};

#[repr(C, align(64))]
pub struct Qh {
    CAPABILITIES: VCell<u32>,
    // Written by the controller, never read by us.
    _current_td_pointer: u32,
    overlay: Td,
    setup: VCell<u64>,
}

impl Qh {
    /// Create a new QH, setting all bits to zero
    pub const fn new() -> Self {
        Qh {
            CAPABILITIES: VCell::new(0),
            _current_td_pointer: 0,
            overlay: Td::new(),
            setup: VCell::new(0),
        }
    }

    /// Read the value from the setup buffer
    ///
    /// Caller is responsible for managing the setup tripwire.
    #[inline(always)]
    pub fn setup(&self) -> u64 {
        self.setup.read()
    }

    /// The overlay area, which the controller treats as the working dTD
    pub fn overlay(&self) -> &Td {
        &self.overlay
    }

    /// Sets the maximum packet length
    ///
    /// Clamps `max_packet_len` to 1024.
    pub fn set_max_packet_len(&self, max_packet_len: usize) {
        ral::modify_reg!(crate::qh, self, CAPABILITIES, MAXIMUM_PACKET_LENGTH: max_packet_len.min(1024) as u32);
    }

    pub fn max_packet_len(&self) -> usize {
        ral::read_reg!(crate::qh, self, CAPABILITIES, MAXIMUM_PACKET_LENGTH) as usize
    }

    /// Enable (true) or disable (false) zero length termination
    pub fn set_zero_length_termination(&self, zlt: bool) {
        // The bit disables ZLT when set.
        ral::modify_reg!(crate::qh, self, CAPABILITIES, ZLT: !zlt as u32);
    }

    /// Enable (true) or disable (false) interrupt on setup
    pub fn set_interrupt_on_setup(&self, ios: bool) {
        ral::modify_reg!(crate::qh, self, CAPABILITIES, IOS: ios as u32);
    }
}

mod CAPABILITIES {
    pub mod ZLT {
        pub const offset: u32 = 29;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod MAXIMUM_PACKET_LENGTH {
        pub const offset: u32 = 16;
        pub const mask: u32 = 0x7FF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod IOS {
        pub const offset: u32 = 15;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

const _: [(); 1] = [(); (core::mem::size_of::<Qh>() == 64) as usize];
const _: [(); 1] = [(); (core::mem::offset_of!(Qh, setup) == 0x28) as usize];

#[cfg(test)]
mod test {
    use super::Qh;

    #[test]
    fn max_packet_len() {
        let qh = Qh::new();
        qh.set_max_packet_len(0x333);
        assert_eq!(qh.max_packet_len(), 0x333);
        assert_eq!(qh.CAPABILITIES.read(), 0x333 << 16);
    }

    #[test]
    fn max_packet_len_clamped() {
        let qh = Qh::new();
        qh.set_max_packet_len(4096);
        assert_eq!(qh.max_packet_len(), 1024);
    }

    #[test]
    fn ios() {
        let qh = Qh::new();
        qh.set_interrupt_on_setup(true);
        assert_eq!(qh.CAPABILITIES.read(), 1 << 15);
    }

    #[test]
    fn zlt() {
        let qh = Qh::new();
        qh.set_zero_length_termination(false);
        assert_eq!(qh.CAPABILITIES.read(), 1 << 29);
        qh.set_zero_length_termination(true);
        assert_eq!(qh.CAPABILITIES.read(), 0);
    }
}
