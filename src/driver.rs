//! LPC43xx USB0 device controller driver
//!
//! The driver owns the register block and the queue head list. It primes,
//! flushes, and stalls endpoints on behalf of the transfer queues, and
//! reports controller events through [`poll()`](Driver::poll).

use usb_device::{
    bus::PollResult,
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection,
};

use crate::{
    clock::Clock,
    qh::Qh,
    queue::{self, EndpointHardware},
    ral,
    td::Td,
    Error, Result,
};

/// Max packet length of the control endpoint
pub const EP0_MAX_PACKET_LEN: usize = 64;

/// USB low / full / high speed setting.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Speed {
    /// Throttle to low / full speeds.
    ///
    /// If a host is capable of high-speed, this will prevent
    /// the device from enumerating as a high-speed device.
    LowFull,
    /// High speed.
    ///
    /// A high-speed device can still interface a low / full
    /// speed host, so use this setting for the most flexibility.
    #[default]
    High,
}

/// The bit that represents `endpoint` in the ENDPTPRIME, ENDPTFLUSH,
/// ENDPTSTAT, and ENDPTCOMPLETE registers
fn endpoint_bit(endpoint: EndpointAddress) -> u32 {
    match endpoint.direction() {
        UsbDirection::Out => 1 << endpoint.index(),
        UsbDirection::In => 1 << (endpoint.index() + 16),
    }
}

/// Endpoint type encoding for ENDPTCTRL
fn endpoint_type(kind: EndpointType) -> u32 {
    match kind {
        EndpointType::Control => 0,
        EndpointType::Isochronous { .. } => 1,
        EndpointType::Bulk => 2,
        EndpointType::Interrupt => 3,
    }
}

/// A USB0 driver
///
/// After you create a `Driver` with [`new()`](Driver::new), you must
///
/// - call [`initialize()`](Driver::initialize) once
/// - call [`attach()`](Driver::attach) when you're ready to enumerate
///
/// The driver is also the [`Clock`] for transfer timeouts; supply the
/// clock on construction.
pub struct Driver<C> {
    usb: ral::usb0::Instance,
    qh_list: &'static [Qh],
    clock: C,
}

// Safety: the queue heads are uniquely owned by this driver. The driver
// only touches them from contexts that hold `&self` or `&mut self`.
unsafe impl<C: Send> Send for Driver<C> {}

impl<C: Clock> Driver<C> {
    /// Create a new `Driver`
    ///
    /// Creation does nothing except for assign static memory to the driver.
    /// Fails with [`Error::Busy`] if the endpoint state already belongs to
    /// another driver.
    pub fn new<P: crate::Peripherals>(
        peripherals: P,
        state: &'static crate::state::EndpointState,
        clock: C,
    ) -> Result<Self> {
        let Some(qh_list) = state.acquire() else {
            error!("Endpoint state already assigned");
            return Err(Error::Busy);
        };
        // Safety: the Peripherals contract says that the pointer is valid,
        // and that the implementer owns the registers.
        let usb = unsafe { ral::usb0::Instance::new(peripherals.usb0()) };
        Ok(Driver {
            usb,
            qh_list,
            clock,
        })
    }

    fn qh(&self, endpoint: EndpointAddress) -> Option<&Qh> {
        self.qh_list.get(queue::index(endpoint))
    }

    /// Reset the controller into device mode, and set up the control
    /// endpoint
    ///
    /// Assumes that the USB0 clocks and the PHY are powered.
    ///
    /// You **must** call this once, before attaching.
    pub fn initialize(&mut self, speed: Speed) {
        ral::write_reg!(ral::usb0, self.usb, USBCMD, RST: 1);
        while ral::read_reg!(ral::usb0, self.usb, USBCMD, RST == 1) {}
        // ITC is reset to some non-immediate value. Use the 'immediate' value by default.
        // (Note: this also zeros all other USBCMD fields.)
        ral::write_reg!(ral::usb0, self.usb, USBCMD, ITC: 0);

        ral::write_reg!(ral::usb0, self.usb, USBMODE, CM: ral::usb0::USBMODE::CM_DEVICE, SLOM: 1);
        ral::modify_reg!(ral::usb0, self.usb, PORTSC1, PFSC: (speed == Speed::LowFull) as u32);

        ral::modify_reg!(ral::usb0, self.usb, USBSTS, |usbsts| usbsts);
        // Disable interrupts by default
        ral::write_reg!(ral::usb0, self.usb, USBINTR, 0);

        ral::write_reg!(
            ral::usb0,
            self.usb,
            ENDPOINTLISTADDR,
            self.qh_list.as_ptr() as u32
        );

        self.initialize_control();
        debug!("USB0 initialized");
    }

    fn initialize_control(&self) {
        for direction in [UsbDirection::Out, UsbDirection::In] {
            let endpoint = EndpointAddress::from_parts(0, direction);
            if let Some(qh) = self.qh(endpoint) {
                qh.set_max_packet_len(EP0_MAX_PACKET_LEN);
                qh.set_zero_length_termination(false);
                qh.set_interrupt_on_setup(direction == UsbDirection::Out);
                qh.overlay().set_terminate();
            }
        }
    }

    /// Enable (`true`) or disable (`false`) USB interrupts
    pub fn set_interrupts(&mut self, interrupts: bool) {
        if interrupts {
            // Keep this in sync with the poll() behaviors
            ral::modify_reg!(ral::usb0, self.usb, USBINTR, UE: 1, UEE: 1, URE: 1);
        } else {
            ral::modify_reg!(ral::usb0, self.usb, USBINTR, UE: 0, UEE: 0, URE: 0);
        }
    }

    pub fn set_address(&self, address: u8) {
        // USBADRA lets the hardware apply the address after the status
        // stage, so software can set it as soon as the SETUP arrives.
        ral::write_reg!(ral::usb0, self.usb, DEVICEADDR, USBADR: address as u32, USBADRA: 1);
        debug!("ADDRESS {}", address);
    }

    /// Connect the pull-up, and start responding to the host
    pub fn attach(&mut self) {
        ral::modify_reg!(ral::usb0, self.usb, USBCMD, RS: 1);
    }

    pub fn detach(&mut self) {
        ral::modify_reg!(ral::usb0, self.usb, USBCMD, RS: 0);
    }

    /// Drop all controller state after the host reset the bus
    ///
    /// The caller is responsible for cleaning up the transfer queues.
    pub fn bus_reset(&mut self) {
        ral::modify_reg!(ral::usb0, self.usb, ENDPTSETUPSTAT, |endptsetupstat| endptsetupstat);
        ral::modify_reg!(ral::usb0, self.usb, ENDPTCOMPLETE, |endptcomplete| {
            endptcomplete
        });
        ral::modify_reg!(ral::usb0, self.usb, ENDPTNAK, |endptnak| endptnak);
        ral::write_reg!(ral::usb0, self.usb, ENDPTNAKEN, 0);

        while ral::read_reg!(ral::usb0, self.usb, ENDPTPRIME) != 0 {}
        ral::write_reg!(ral::usb0, self.usb, ENDPTFLUSH, u32::MAX);
        while ral::read_reg!(ral::usb0, self.usb, ENDPTFLUSH) != 0 {}

        ral::write_reg!(ral::usb0, self.usb, DEVICEADDR, 0);
        for endpoint in 1..ral::usb0::ENDPOINTS {
            if let Some(endptctrl) = ral::endpoint_control::register(&self.usb, endpoint) {
                ral::write_reg!(ral::endpoint_control, &endptctrl, ENDPTCTRL, 0);
            }
        }

        debug_assert!(
            ral::read_reg!(ral::usb0, self.usb, PORTSC1, PR == 1),
            "Took too long to handle bus reset"
        );
        debug!("RESET");

        self.initialize_control();
    }

    /// Read the setup packet from EP0 OUT
    ///
    /// Returns `None` if no setup packet is waiting.
    pub fn read_setup(&mut self) -> Option<u64> {
        let ep0_out = EndpointAddress::from_parts(0, UsbDirection::Out);
        if ral::read_reg!(ral::usb0, self.usb, ENDPTSETUPSTAT) & 1 == 0 {
            return None;
        }
        let qh = self.qh(ep0_out)?;
        ral::write_reg!(ral::usb0, self.usb, ENDPTSETUPSTAT, 1);
        // A SETUP that lands while we copy trips the wire; copy again.
        loop {
            ral::modify_reg!(ral::usb0, self.usb, USBCMD, SUTW: 1);
            let setup = qh.setup();
            if ral::read_reg!(ral::usb0, self.usb, USBCMD, SUTW == 1) {
                ral::modify_reg!(ral::usb0, self.usb, USBCMD, SUTW: 0);
                return Some(setup);
            }
        }
    }

    /// Describe and enable a non-control endpoint
    ///
    /// Call this when the host selects a configuration.
    pub fn configure_endpoint(
        &mut self,
        endpoint: EndpointAddress,
        kind: EndpointType,
        max_packet_len: usize,
    ) -> Result<()> {
        let qh = self.qh(endpoint).ok_or(Error::InvalidArgument)?;
        let endptctrl = ral::endpoint_control::register(&self.usb, endpoint.index())
            .ok_or(Error::InvalidArgument)?;
        qh.set_max_packet_len(max_packet_len);
        qh.set_zero_length_termination(false);
        qh.set_interrupt_on_setup(false);
        qh.overlay().set_terminate();

        let kind = endpoint_type(kind);
        match endpoint.direction() {
            UsbDirection::In => {
                ral::modify_reg!(ral::endpoint_control, &endptctrl, ENDPTCTRL, TXE: 1, TXR: 1, TXT: kind)
            }
            UsbDirection::Out => {
                ral::modify_reg!(ral::endpoint_control, &endptctrl, ENDPTCTRL, RXE: 1, RXR: 1, RXT: kind)
            }
        }
        debug!("CONFIGURED EP{:#x}", u8::from(endpoint));
        Ok(())
    }

    /// Poll for reset or USB traffic
    ///
    /// Clears the transfer-complete bits that it reports. Setup packets stay
    /// flagged until [`read_setup()`](Driver::read_setup).
    pub fn poll(&mut self) -> PollResult {
        let usbsts = ral::read_reg!(ral::usb0, self.usb, USBSTS);
        use ral::usb0::USBSTS;

        if usbsts & USBSTS::URI::mask != 0 {
            ral::write_reg!(ral::usb0, self.usb, USBSTS, URI: 1);
            return PollResult::Reset;
        }

        if usbsts & (USBSTS::UI::mask | USBSTS::UEI::mask) != 0 {
            ral::write_reg!(ral::usb0, self.usb, USBSTS, UI: 1, UEI: 1);

            let ep_out = ral::read_reg!(ral::usb0, self.usb, ENDPTCOMPLETE, ERCE);
            let ep_in_complete = ral::read_reg!(ral::usb0, self.usb, ENDPTCOMPLETE, ETCE);
            ral::write_reg!(ral::usb0, self.usb, ENDPTCOMPLETE, ERCE: ep_out, ETCE: ep_in_complete);

            let ep_setup = ral::read_reg!(ral::usb0, self.usb, ENDPTSETUPSTAT) as u16;
            trace!("{:#x} {:#x} {:#x}", ep_out, ep_in_complete, ep_setup);

            PollResult::Data {
                ep_out: ep_out as u16,
                ep_in_complete: ep_in_complete as u16,
                ep_setup,
            }
        } else {
            PollResult::None
        }
    }
}

impl<C: Clock> Clock for Driver<C> {
    fn ticks(&self) -> u32 {
        self.clock.ticks()
    }
    fn ticks_per_microsecond(&self) -> u32 {
        self.clock.ticks_per_microsecond()
    }
}

impl<C: Clock> EndpointHardware for Driver<C> {
    fn prime(&self, endpoint: EndpointAddress, first: &Td) {
        let Some(qh) = self.qh(endpoint) else {
            return;
        };
        qh.overlay().set_next(first);
        qh.overlay().clear_active_halted();
        // The descriptors must be in memory before the controller fetches them.
        cortex_m::asm::dsb();
        ral::write_reg!(ral::usb0, self.usb, ENDPTPRIME, endpoint_bit(endpoint));
    }

    fn append(&self, endpoint: EndpointAddress, next: &Td) {
        let bit = endpoint_bit(endpoint);
        cortex_m::asm::dsb();
        // A pending prime will pick up the new link.
        if ral::read_reg!(ral::usb0, self.usb, ENDPTPRIME) & bit != 0 {
            return;
        }
        let running = loop {
            ral::modify_reg!(ral::usb0, self.usb, USBCMD, ATDTW: 1);
            let running = ral::read_reg!(ral::usb0, self.usb, ENDPTSTAT) & bit != 0;
            if ral::read_reg!(ral::usb0, self.usb, USBCMD, ATDTW == 1) {
                break running;
            }
        };
        ral::modify_reg!(ral::usb0, self.usb, USBCMD, ATDTW: 0);
        if !running {
            self.prime(endpoint, next);
        }
    }

    fn flush(&self, endpoint: EndpointAddress) {
        let bit = endpoint_bit(endpoint);
        loop {
            ral::write_reg!(ral::usb0, self.usb, ENDPTFLUSH, bit);
            while ral::read_reg!(ral::usb0, self.usb, ENDPTFLUSH) & bit != 0 {}
            // A prime can race the flush; go again until the endpoint is idle.
            if ral::read_reg!(ral::usb0, self.usb, ENDPTSTAT) & bit == 0 {
                break;
            }
        }
        if let Some(qh) = self.qh(endpoint) {
            qh.overlay().set_terminate();
        }
    }

    fn stall(&self, endpoint: EndpointAddress) {
        let Some(endptctrl) = ral::endpoint_control::register(&self.usb, endpoint.index()) else {
            return;
        };
        // Control endpoints stall as a pair.
        match (endpoint.index(), endpoint.direction()) {
            (0, _) => ral::modify_reg!(ral::endpoint_control, &endptctrl, ENDPTCTRL, RXS: 1, TXS: 1),
            (_, UsbDirection::In) => ral::modify_reg!(ral::endpoint_control, &endptctrl, ENDPTCTRL, TXS: 1),
            (_, UsbDirection::Out) => ral::modify_reg!(ral::endpoint_control, &endptctrl, ENDPTCTRL, RXS: 1),
        }
    }
}

#[cfg(test)]
mod test {
    use super::{endpoint_bit, endpoint_type};
    use usb_device::{
        endpoint::{EndpointAddress, EndpointType},
        UsbDirection,
    };

    #[test]
    fn endpoint_bits() {
        assert_eq!(endpoint_bit(EndpointAddress::from_parts(0, UsbDirection::Out)), 1);
        assert_eq!(endpoint_bit(EndpointAddress::from_parts(0, UsbDirection::In)), 1 << 16);
        assert_eq!(endpoint_bit(EndpointAddress::from_parts(5, UsbDirection::In)), 1 << 21);
    }

    #[test]
    fn endpoint_types() {
        assert_eq!(endpoint_type(EndpointType::Control), 0);
        assert_eq!(endpoint_type(EndpointType::Bulk), 2);
        assert_eq!(endpoint_type(EndpointType::Interrupt), 3);
    }
}
