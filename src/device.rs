//! The USB device context
//!
//! [`Device`] owns everything the USB0 interrupt needs: the transfer
//! queues, the endpoint 0 stage tracker, and the command transport.
//! Call [`on_interrupt()`](Device::on_interrupt) from the USB0 ISR.

use usb_device::{bus::PollResult, endpoint::EndpointAddress, UsbDirection};

use crate::{
    backend::UsbCommsBackend,
    clock::Clock,
    control::{ep0_in, ep0_out, ControlPipe, RequestHandler, RequestHandlers},
    driver::Driver,
    queue::{EndpointHardware, EndpointQueues, TransferPool, MAX_ENDPOINTS},
    Result,
};

/// Controller events, as seen by the interrupt handler
///
/// [`Driver`] is the controller on hardware.
pub trait Controller: EndpointHardware {
    /// Read, and acknowledge, the pending controller events
    fn poll(&mut self) -> PollResult;
    /// Take the SETUP packet waiting on endpoint 0
    fn read_setup(&mut self) -> Option<u64>;
    /// Drop all endpoint state after a bus reset
    fn bus_reset(&mut self);
}

impl<C: Clock> Controller for Driver<C> {
    fn poll(&mut self) -> PollResult {
        Driver::poll(self)
    }
    fn read_setup(&mut self) -> Option<u64> {
        Driver::read_setup(self)
    }
    fn bus_reset(&mut self) {
        Driver::bus_reset(self)
    }
}

/// A libgreat USB device
///
/// Vendor requests go to the command transport. Standard requests go to
/// the handler installed with [`set_standard_handler()`](Device::set_standard_handler);
/// without one, they stall.
pub struct Device<'a, 'r, H, const N: usize = 16> {
    queues: EndpointQueues<'a, H>,
    pipe: ControlPipe,
    backend: UsbCommsBackend<'r, N>,
    standard: Option<&'a mut dyn RequestHandler<H>>,
}

impl<'a, 'r, H: Controller, const N: usize> Device<'a, 'r, H, N> {
    /// Create a device that runs `backend` on endpoint 0
    ///
    /// The pools back the two halves of endpoint 0. Fails if either pool
    /// is already in use.
    pub fn new<const OUT: usize, const IN: usize>(
        controller: H,
        backend: UsbCommsBackend<'r, N>,
        ep0_out_pool: &'a TransferPool<OUT>,
        ep0_in_pool: &'a TransferPool<IN>,
    ) -> Result<Self> {
        let mut queues = EndpointQueues::new(controller);
        queues.init_queue(ep0_out(), ep0_out_pool)?;
        queues.init_queue(ep0_in(), ep0_in_pool)?;
        Ok(Device {
            queues,
            pipe: ControlPipe::new(),
            backend,
            standard: None,
        })
    }

    /// Route standard requests to `handler`
    pub fn set_standard_handler(&mut self, handler: &'a mut dyn RequestHandler<H>) {
        self.standard = Some(handler);
    }

    pub fn queues(&self) -> &EndpointQueues<'a, H> {
        &self.queues
    }

    /// Add queues for other endpoints with [`EndpointQueues::init_queue`]
    pub fn queues_mut(&mut self) -> &mut EndpointQueues<'a, H> {
        &mut self.queues
    }

    pub fn controller(&self) -> &H {
        self.queues.hardware()
    }

    pub fn controller_mut(&mut self) -> &mut H {
        self.queues.hardware_mut()
    }

    pub fn backend(&self) -> &UsbCommsBackend<'r, N> {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut UsbCommsBackend<'r, N> {
        &mut self.backend
    }

    /// Handle the USB0 interrupt
    ///
    /// SETUP packets are handled before transfer completions. Completions
    /// on endpoint 0 that arrive with a SETUP belong to the transfer the
    /// SETUP replaced, and are already flushed.
    pub fn on_interrupt(&mut self) {
        match self.queues.hardware_mut().poll() {
            PollResult::Reset => self.reset(),
            PollResult::Data {
                ep_out,
                ep_in_complete,
                ep_setup,
            } => {
                let mut setup_seen = false;
                if ep_setup & 1 != 0 {
                    if let Some(setup) = self.queues.hardware_mut().read_setup() {
                        setup_seen = true;
                        let (queues, pipe, mut handlers) = self.split();
                        pipe.setup_complete(queues, &mut handlers, setup);
                    }
                }
                self.complete(ep_out, UsbDirection::Out, setup_seen);
                self.complete(ep_in_complete, UsbDirection::In, setup_seen);
            }
            _ => {}
        }
    }

    /// The queues and the pipe, with handlers that borrow the rest
    fn split(&mut self) -> (&EndpointQueues<'a, H>, &mut ControlPipe, RequestHandlers<'_, H>) {
        let Device {
            queues,
            pipe,
            backend,
            standard,
        } = self;
        let handlers = RequestHandlers {
            standard: match standard {
                Some(handler) => Some(&mut **handler),
                None => None,
            },
            class: None,
            vendor: Some(backend),
            reserved: None,
        };
        (queues, pipe, handlers)
    }

    fn complete(&mut self, mask: u16, direction: UsbDirection, setup_seen: bool) {
        for index in 0..MAX_ENDPOINTS {
            if mask & (1 << index) == 0 {
                continue;
            }
            let endpoint = EndpointAddress::from_parts(index, direction);
            if index != 0 {
                self.queues.transfer_complete(endpoint);
                continue;
            }
            if setup_seen {
                trace!("Dropping EP0 completion that raced a SETUP");
                continue;
            }
            let (queues, pipe, mut handlers) = self.split();
            match direction {
                UsbDirection::Out => pipe.control_out_complete(queues, &mut handlers),
                UsbDirection::In => pipe.control_in_complete(queues, &mut handlers),
            }
        }
    }

    /// Forget everything in flight
    fn reset(&mut self) {
        self.queues.hardware_mut().bus_reset();
        for index in 0..MAX_ENDPOINTS {
            for direction in [UsbDirection::Out, UsbDirection::In] {
                let endpoint = EndpointAddress::from_parts(index, direction);
                self.queues.clean_up_transfers(endpoint, true);
            }
        }
        self.pipe = ControlPipe::new();
        self.backend.cancel();
    }
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;

    use usb_device::{bus::PollResult, endpoint::EndpointAddress};

    use super::{Controller, Device};
    use crate::{
        backend::{Config, State, UsbCommsBackend},
        clock::Clock,
        comms::{BoardInfo, Class, CommandTransaction, Commands, Registry, Verb},
        control::{ep0_in, ep0_out, test::setup_packet},
        mock::MockHardware,
        queue::{EndpointHardware, TransferPool},
        td::Td,
        CommandMemory, Result,
    };

    /// Replays controller events
    struct Scripted {
        hardware: MockHardware,
        events: VecDeque<PollResult>,
        setup: Option<u64>,
        resets: usize,
    }

    impl Clock for Scripted {
        fn ticks(&self) -> u32 {
            self.hardware.ticks()
        }
        fn ticks_per_microsecond(&self) -> u32 {
            self.hardware.ticks_per_microsecond()
        }
    }

    impl EndpointHardware for Scripted {
        fn prime(&self, endpoint: EndpointAddress, first: &Td) {
            self.hardware.prime(endpoint, first)
        }
        fn append(&self, endpoint: EndpointAddress, next: &Td) {
            self.hardware.append(endpoint, next)
        }
        fn flush(&self, endpoint: EndpointAddress) {
            self.hardware.flush(endpoint)
        }
        fn stall(&self, endpoint: EndpointAddress) {
            self.hardware.stall(endpoint)
        }
    }

    impl Controller for Scripted {
        fn poll(&mut self) -> PollResult {
            self.events.pop_front().unwrap_or(PollResult::None)
        }
        fn read_setup(&mut self) -> Option<u64> {
            self.setup.take()
        }
        fn bus_reset(&mut self) {
            self.resets += 1;
        }
    }

    fn echo(trans: &mut CommandTransaction<'_>) -> Result<()> {
        let value: u32 = trans.parse();
        trans.respond(value);
        Ok(())
    }

    static ECHO: Class = Class {
        number: 0x100,
        name: "echo",
        doc: "",
        commands: Commands::Verbs(&[Verb::new(0, "echo", echo)]),
    };

    fn device() -> Device<'static, 'static, Scripted> {
        let mut registry = Registry::new(BoardInfo {
            board_id: 0,
            version: "test",
            part_id: [0; 2],
            serial_number: [0; 4],
        });
        registry.register_class(&ECHO).unwrap();
        let registry: &'static Registry = Box::leak(Box::new(registry));
        let memory: &'static CommandMemory<1024> = Box::leak(Box::new(CommandMemory::new()));
        let out_pool: &'static TransferPool<4> = Box::leak(Box::new(TransferPool::new()));
        let in_pool: &'static TransferPool<4> = Box::leak(Box::new(TransferPool::new()));
        let scripted = Scripted {
            hardware: MockHardware::new(),
            events: VecDeque::new(),
            setup: None,
            resets: 0,
        };
        let backend = UsbCommsBackend::new(registry, memory, Config::new()).unwrap();
        Device::new(scripted, backend, out_pool, in_pool).unwrap()
    }

    fn setup(device: &mut Device<'static, 'static, Scripted>, request_type: u8, length: u16) {
        let controller = device.controller_mut();
        controller.setup = Some(setup_packet(request_type, 0x65, 0, 0, length));
        controller.events.push_back(PollResult::Data {
            ep_out: 0,
            ep_in_complete: 0,
            ep_setup: 1,
        });
        device.on_interrupt();
    }

    fn out_complete(device: &mut Device<'static, 'static, Scripted>, data: &[u8]) {
        assert!(device.queues().complete_head(ep0_out(), data));
        device.controller_mut().events.push_back(PollResult::Data {
            ep_out: 1,
            ep_in_complete: 0,
            ep_setup: 0,
        });
        device.on_interrupt();
    }

    fn in_complete(device: &mut Device<'static, 'static, Scripted>) -> Vec<u8> {
        let sent = device.queues().head_contents(ep0_in()).unwrap_or_default();
        assert!(device.queues().complete_head(ep0_in(), &sent));
        device.controller_mut().events.push_back(PollResult::Data {
            ep_out: 0,
            ep_in_complete: 1,
            ep_setup: 0,
        });
        device.on_interrupt();
        sent
    }

    #[test]
    fn command_over_interrupts() {
        let mut device = device();
        let mut command = Vec::new();
        command.extend_from_slice(&0x100u32.to_le_bytes());
        command.extend_from_slice(&0u32.to_le_bytes());
        command.extend_from_slice(&7u32.to_le_bytes());

        setup(&mut device, 0x42, command.len() as u16);
        assert_eq!(device.backend().state(), State::OutPending);
        out_complete(&mut device, &command);
        assert_eq!(device.backend().state(), State::Dispatched);
        in_complete(&mut device);

        setup(&mut device, 0xC2, 64);
        assert_eq!(in_complete(&mut device), 7u32.to_le_bytes());
        out_complete(&mut device, &[]);
        assert_eq!(device.backend().state(), State::Idle);
        assert!(!device.controller().hardware.stalled(0x00));
    }

    #[test]
    fn reset_cancels_command() {
        let mut device = device();
        setup(&mut device, 0x42, 12);
        assert_eq!(device.backend().state(), State::OutPending);
        assert_eq!(device.queues().pending(ep0_out()), 1);

        device.controller_mut().events.push_back(PollResult::Reset);
        device.on_interrupt();
        assert_eq!(device.controller().resets, 1);
        assert_eq!(device.backend().state(), State::Idle);
        assert_eq!(device.queues().pending(ep0_out()), 0);
    }

    #[test]
    fn stale_completion_ignored_after_setup() {
        let mut device = device();
        setup(&mut device, 0x42, 12);
        // The host gave up on the OUT request, and started a new one.
        device.controller_mut().setup = Some(setup_packet(0x42, 0x65, 0, 0, 12));
        device.controller_mut().events.push_back(PollResult::Data {
            ep_out: 1,
            ep_in_complete: 0,
            ep_setup: 1,
        });
        device.on_interrupt();
        assert_eq!(device.backend().state(), State::OutPending);
        assert_eq!(device.queues().pending(ep0_out()), 1);
    }

    #[test]
    fn standard_requests_stall_without_handler() {
        let mut device = device();
        let controller = device.controller_mut();
        controller.setup = Some(setup_packet(0x80, 6, 0x0100, 0, 18));
        controller.events.push_back(PollResult::Data {
            ep_out: 0,
            ep_in_complete: 0,
            ep_setup: 1,
        });
        device.on_interrupt();
        assert!(device.controller().hardware.stalled(0x00));
        assert!(device.controller().hardware.stalled(0x80));
    }
}
