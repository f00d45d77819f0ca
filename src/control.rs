//! Control request dispatch
//!
//! The [`ControlPipe`] tracks the SETUP packet of the current control
//! transfer on endpoint 0, and routes every stage of that transfer to a
//! [`RequestHandler`] chosen by the request type. Handlers schedule the data
//! and status stages through a [`ControlEndpoint`]. A handler that rejects a
//! stage, or a request type without a handler, stalls endpoint 0.

use usb_device::{
    control::{Recipient, Request, RequestType},
    endpoint::EndpointAddress,
    UsbDirection,
};

use crate::{
    queue::{EndpointHardware, EndpointQueues},
    Result,
};

/// Endpoint 0, OUT
pub fn ep0_out() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::Out)
}

/// Endpoint 0, IN
pub fn ep0_in() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::In)
}

/// The stage of a control transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Setup,
    Data,
    Status,
}

/// How a handler answers a stage
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    Ok,
    Stall,
}

/// Decode an 8-byte SETUP packet, as the controller stores it
pub fn parse_setup(setup: u64) -> Request {
    let bytes = setup.to_le_bytes();
    let request_type = bytes[0];
    Request {
        direction: if request_type & 0x80 != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        },
        request_type: match (request_type >> 5) & 0b11 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        },
        recipient: match request_type & 0x1F {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        },
        request: bytes[1],
        value: u16::from_le_bytes([bytes[2], bytes[3]]),
        index: u16::from_le_bytes([bytes[4], bytes[5]]),
        length: u16::from_le_bytes([bytes[6], bytes[7]]),
    }
}

/// Endpoint 0, as a request handler sees it
pub struct ControlEndpoint<'c, 'a, H> {
    queues: &'c EndpointQueues<'a, H>,
    setup: &'c Request,
}

impl<'c, 'a, H: EndpointHardware> ControlEndpoint<'c, 'a, H> {
    /// The SETUP packet of the current transfer
    pub fn setup(&self) -> &'c Request {
        self.setup
    }

    pub fn queues(&self) -> &'c EndpointQueues<'a, H> {
        self.queues
    }

    /// Send `length` bytes at `data` to the host
    ///
    /// # Safety
    ///
    /// See [`EndpointQueues::schedule`].
    pub unsafe fn schedule_in(&self, data: *mut u8, length: usize, timeout_us: u32) -> Result<()> {
        // Safety: forwarded to the caller.
        unsafe { self.queues.schedule_wait(ep0_in(), data, length, None, timeout_us) }
    }

    /// Receive up to `length` bytes from the host into `data`
    ///
    /// # Safety
    ///
    /// See [`EndpointQueues::schedule`].
    pub unsafe fn schedule_out(&self, data: *mut u8, length: usize, timeout_us: u32) -> Result<()> {
        // Safety: forwarded to the caller.
        unsafe { self.queues.schedule_wait(ep0_out(), data, length, None, timeout_us) }
    }

    /// Acknowledge with a zero length packet to the host
    pub fn ack_in(&self) -> Result<()> {
        self.queues.schedule_ack(ep0_in())
    }

    /// Acknowledge with a zero length packet from the host
    pub fn ack_out(&self) -> Result<()> {
        self.queues.schedule_ack(ep0_out())
    }

    /// Drop everything queued on endpoint 0
    pub fn flush(&self) {
        self.queues.flush(ep0_out());
        self.queues.flush(ep0_in());
    }
}

/// Handles the control requests of one request type
pub trait RequestHandler<H: EndpointHardware> {
    fn handle(&mut self, endpoint: &ControlEndpoint<'_, '_, H>, stage: Stage) -> RequestStatus;
}

/// The handlers for each request type
///
/// Requests without a handler stall.
pub struct RequestHandlers<'h, H> {
    pub standard: Option<&'h mut dyn RequestHandler<H>>,
    pub class: Option<&'h mut dyn RequestHandler<H>>,
    pub vendor: Option<&'h mut dyn RequestHandler<H>>,
    pub reserved: Option<&'h mut dyn RequestHandler<H>>,
}

impl<'h, H: EndpointHardware> RequestHandlers<'h, H> {
    pub fn new() -> Self {
        RequestHandlers {
            standard: None,
            class: None,
            vendor: None,
            reserved: None,
        }
    }

    fn select(&mut self, request_type: RequestType) -> Option<&mut (dyn RequestHandler<H> + 'h)> {
        match request_type {
            RequestType::Standard => self.standard.as_deref_mut(),
            RequestType::Class => self.class.as_deref_mut(),
            RequestType::Vendor => self.vendor.as_deref_mut(),
            RequestType::Reserved => self.reserved.as_deref_mut(),
        }
    }
}

impl<H: EndpointHardware> Default for RequestHandlers<'_, H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Stage tracking for endpoint 0
#[derive(Default)]
pub struct ControlPipe {
    setup: Option<Request>,
}

impl ControlPipe {
    pub const fn new() -> Self {
        ControlPipe { setup: None }
    }

    /// The SETUP packet of the current transfer, if one arrived
    pub fn request(&self) -> Option<&Request> {
        self.setup.as_ref()
    }

    /// A SETUP packet arrived on endpoint 0
    ///
    /// Whatever the previous transfer left queued on endpoint 0 is dropped
    /// before the handler sees the new request.
    pub fn setup_complete<H: EndpointHardware>(
        &mut self,
        queues: &EndpointQueues<'_, H>,
        handlers: &mut RequestHandlers<'_, H>,
        setup: u64,
    ) {
        let request = parse_setup(setup);
        trace!(
            "SETUP {:#x} request {:#x} value {:#x} index {:#x} length {}",
            setup as u8,
            request.request,
            request.value,
            request.index,
            request.length
        );
        queues.flush(ep0_out());
        queues.flush(ep0_in());
        self.setup = Some(request);
        self.dispatch(queues, handlers, Stage::Setup);
    }

    /// A transfer on endpoint 0 OUT finished
    pub fn control_out_complete<H: EndpointHardware>(
        &mut self,
        queues: &EndpointQueues<'_, H>,
        handlers: &mut RequestHandlers<'_, H>,
    ) {
        let stage = if self.device_to_host() {
            Stage::Status
        } else {
            Stage::Data
        };
        self.dispatch(queues, handlers, stage);
        queues.transfer_complete(ep0_out());
    }

    /// A transfer on endpoint 0 IN finished
    pub fn control_in_complete<H: EndpointHardware>(
        &mut self,
        queues: &EndpointQueues<'_, H>,
        handlers: &mut RequestHandlers<'_, H>,
    ) {
        let stage = if self.device_to_host() {
            Stage::Data
        } else {
            Stage::Status
        };
        self.dispatch(queues, handlers, stage);
        queues.transfer_complete(ep0_in());
    }

    fn device_to_host(&self) -> bool {
        self.setup
            .as_ref()
            .is_some_and(|setup| setup.direction == UsbDirection::In)
    }

    fn dispatch<H: EndpointHardware>(
        &self,
        queues: &EndpointQueues<'_, H>,
        handlers: &mut RequestHandlers<'_, H>,
        stage: Stage,
    ) {
        let Some(setup) = self.setup.as_ref() else {
            return;
        };
        let endpoint = ControlEndpoint { queues, setup };
        let status = match handlers.select(setup.request_type) {
            Some(handler) => handler.handle(&endpoint, stage),
            None => {
                debug!("No handler for request {:#x}", setup.request);
                RequestStatus::Stall
            }
        };
        if status == RequestStatus::Stall {
            debug!("Stalling EP0, request {:#x}", setup.request);
            queues.stall(ep0_out());
            queues.stall(ep0_in());
            queues.flush(ep0_out());
            queues.flush(ep0_in());
        }
    }
}
