//! The USB command transport
//!
//! libgreat hosts run a command in two control requests on the same vendor
//! request number. An OUT request carries the command prelude
//! `{class: u32, verb: u32}` and the arguments, all little endian. The device
//! runs the command as soon as the data stage lands, then the host collects
//! the response with an IN request. Only one command is in flight at a time.
//!
//! A request whose `wValue` is [`CANCEL`] aborts the current command, no
//! matter what state the transport is in. When the cancel request reads four
//! or more bytes, the device answers with the errno of the last failed
//! command.

use crate::{
    buffer::Buffer,
    comms::{CommandTransaction, Registry},
    control::{ControlEndpoint, RequestHandler, RequestStatus, Stage},
    queue::{EndpointHardware, DEFAULT_TIMEOUT_US},
    CommandMemory, Error, Result,
};
use usb_device::UsbDirection;

/// `wValue` of a request that runs a command
pub const EXECUTE: u16 = 0;
/// `wValue` of a request that cancels the current command
pub const CANCEL: u16 = 0xDEAD;

/// `wIndex` flag on an OUT request: the host won't read a response
pub const SKIP_RESPONSE: u16 = 1 << 0;
/// `wIndex` flag on an IN request: run the previous command again
pub const REPEAT_LAST: u16 = 1 << 1;

/// Size of the `{class, verb}` prelude
pub const PRELUDE_SIZE: usize = 8;

/// Transport settings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// The vendor request number the transport answers
    pub request: u8,
    /// How long to wait for a free transfer, in microseconds
    pub timeout_us: u32,
}

impl Config {
    pub const fn new() -> Self {
        Config {
            request: 0x65,
            timeout_us: DEFAULT_TIMEOUT_US,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Where the transport is in the two-request exchange
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum State {
    /// No command in flight
    Idle,
    /// The command's data stage is scheduled
    OutPending,
    /// The command ran; its response waits for the host
    Dispatched,
    /// The response is scheduled
    InPending,
}

/// Runs libgreat commands received over vendor control requests
///
/// Install it as the vendor [`RequestHandler`].
pub struct UsbCommsBackend<'r, const N: usize = 16> {
    registry: &'r Registry<N>,
    config: Config,
    input: Buffer,
    output: Buffer,
    state: State,
    flags: u16,
    /// Bytes of the last command, prelude included
    command_length: usize,
    response_length: usize,
    last_error: u32,
}

impl<'r, const N: usize> UsbCommsBackend<'r, N> {
    /// Create a transport that runs commands against `registry`
    ///
    /// Splits `memory` into equal input and output buffers. Fails with
    /// [`Error::Busy`] if another transport already took the memory, and
    /// with [`Error::OutOfMemory`] if the memory can't hold a prelude.
    pub fn new<const SIZE: usize>(
        registry: &'r Registry<N>,
        memory: &'static CommandMemory<SIZE>,
        config: Config,
    ) -> Result<Self> {
        let mut allocator = memory.allocator().ok_or(Error::Busy)?;
        let half = SIZE / 2;
        if half < PRELUDE_SIZE {
            return Err(Error::OutOfMemory);
        }
        let input = allocator.allocate(half).ok_or(Error::OutOfMemory)?;
        let output = allocator.allocate(half).ok_or(Error::OutOfMemory)?;
        Ok(UsbCommsBackend {
            registry,
            config,
            input,
            output,
            state: State::Idle,
            flags: 0,
            command_length: 0,
            response_length: 0,
            last_error: 0,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The errno of the last failed command; zero if none failed
    pub fn last_error(&self) -> u32 {
        self.last_error
    }

    /// Abort the command in flight
    pub fn cancel(&mut self) {
        if self.state != State::Idle {
            info!("Cancelling command in state {}", self.state as u8);
        }
        self.state = State::Idle;
    }

    /// Run the command held in the input buffer
    fn dispatch(&mut self) -> Result<()> {
        let command = self
            .input
            .as_slice()
            .get(..self.command_length)
            .ok_or(Error::InvalidArgument)?;
        let mut prelude = CommandTransaction::new(0, 0, command, &mut []);
        let class_number: u32 = prelude.parse();
        let verb: u32 = prelude.parse();
        if !prelude.is_okay() {
            return Err(Error::MalformedMessage);
        }
        let arguments = prelude.read_remaining();

        let mut trans = CommandTransaction::new(class_number, verb, arguments, self.output.as_mut_slice());
        let result = self.registry.submit_command("USB", &mut trans);
        self.response_length = trans.data_out_length();
        result
    }

    /// Dispatch, and remember a failure for the host
    fn run_command(&mut self) -> RequestStatus {
        match self.dispatch() {
            Ok(()) => RequestStatus::Ok,
            Err(error) => {
                debug!("Command failed, errno {}", error.code());
                self.last_error = error.code();
                self.response_length = 0;
                self.state = State::Idle;
                RequestStatus::Stall
            }
        }
    }

    fn handle_cancel<H: EndpointHardware>(
        &mut self,
        endpoint: &ControlEndpoint<'_, '_, H>,
        stage: Stage,
    ) -> RequestStatus {
        let setup = endpoint.setup();
        let status = match (stage, setup.direction) {
            (Stage::Setup, _) => {
                self.cancel();
                endpoint.flush();
                if setup.length == 0 {
                    match setup.direction {
                        UsbDirection::Out => endpoint.ack_in(),
                        UsbDirection::In => endpoint.ack_out(),
                    }
                } else if setup.direction == UsbDirection::In {
                    let errno = self.last_error.to_le_bytes();
                    let length = if setup.length as usize >= errno.len() {
                        self.output.as_mut_slice()[..errno.len()].copy_from_slice(&errno);
                        self.last_error = 0;
                        errno.len()
                    } else {
                        0
                    };
                    // Safety: the output buffer is static, and the transport
                    // doesn't touch it until the next command.
                    unsafe { endpoint.schedule_in(self.output.as_mut_ptr(), length, self.config.timeout_us) }
                } else {
                    Err(Error::InvalidArgument)
                }
            }
            (Stage::Data, UsbDirection::In) => endpoint.ack_out(),
            _ => Ok(()),
        };
        match status {
            Ok(()) => RequestStatus::Ok,
            Err(_) => RequestStatus::Stall,
        }
    }

    fn handle_out<H: EndpointHardware>(
        &mut self,
        endpoint: &ControlEndpoint<'_, '_, H>,
        stage: Stage,
    ) -> RequestStatus {
        let setup = endpoint.setup();
        match stage {
            Stage::Setup => {
                if matches!(self.state, State::Dispatched | State::InPending) {
                    warn!("Command received while state is {}; resetting", self.state as u8);
                    self.state = State::Idle;
                    return RequestStatus::Stall;
                }
                let length = setup.length as usize;
                if length < PRELUDE_SIZE || length > self.input.len() {
                    warn!("Rejecting a command of {} bytes", length);
                    self.state = State::Idle;
                    return RequestStatus::Stall;
                }
                self.flags = setup.index;
                self.command_length = length;
                // Safety: the input buffer is static, and isn't read until the
                // data stage finishes.
                let scheduled = unsafe { endpoint.schedule_out(self.input.as_mut_ptr(), length, self.config.timeout_us) };
                if scheduled.is_err() {
                    self.state = State::Idle;
                    return RequestStatus::Stall;
                }
                self.state = State::OutPending;
                RequestStatus::Ok
            }
            Stage::Data => {
                if self.state != State::OutPending {
                    debug!("Ignoring command data in state {}", self.state as u8);
                    return RequestStatus::Ok;
                }
                self.state = State::Dispatched;
                if self.run_command() == RequestStatus::Stall {
                    return RequestStatus::Stall;
                }
                if self.flags & SKIP_RESPONSE != 0 {
                    self.state = State::Idle;
                }
                match endpoint.ack_in() {
                    Ok(()) => RequestStatus::Ok,
                    Err(_) => RequestStatus::Stall,
                }
            }
            Stage::Status => RequestStatus::Ok,
        }
    }

    fn handle_in<H: EndpointHardware>(
        &mut self,
        endpoint: &ControlEndpoint<'_, '_, H>,
        stage: Stage,
    ) -> RequestStatus {
        let setup = endpoint.setup();
        match stage {
            Stage::Setup => {
                if self.state == State::Idle
                    && setup.index & REPEAT_LAST != 0
                    && self.command_length >= PRELUDE_SIZE
                {
                    trace!("Repeating the last command");
                    self.state = State::Dispatched;
                    if self.run_command() == RequestStatus::Stall {
                        return RequestStatus::Stall;
                    }
                }
                if self.state != State::Dispatched {
                    warn!("Response requested in state {}", self.state as u8);
                    self.state = State::Idle;
                    return RequestStatus::Stall;
                }
                let length = (setup.length as usize)
                    .min(self.response_length)
                    .min(self.output.len());
                // Safety: the output buffer is static, and the handler that
                // filled it already returned.
                let scheduled = unsafe { endpoint.schedule_in(self.output.as_mut_ptr(), length, self.config.timeout_us) };
                if scheduled.is_err() {
                    self.state = State::Idle;
                    return RequestStatus::Stall;
                }
                self.state = State::InPending;
                RequestStatus::Ok
            }
            Stage::Data => {
                if self.state != State::InPending {
                    return RequestStatus::Ok;
                }
                self.state = State::Idle;
                match endpoint.ack_out() {
                    Ok(()) => RequestStatus::Ok,
                    Err(_) => RequestStatus::Stall,
                }
            }
            Stage::Status => RequestStatus::Ok,
        }
    }
}

impl<H: EndpointHardware, const N: usize> RequestHandler<H> for UsbCommsBackend<'_, N> {
    fn handle(&mut self, endpoint: &ControlEndpoint<'_, '_, H>, stage: Stage) -> RequestStatus {
        let setup = endpoint.setup();
        if setup.request != self.config.request {
            return RequestStatus::Stall;
        }
        match (setup.value, setup.direction) {
            (CANCEL, _) => self.handle_cancel(endpoint, stage),
            (EXECUTE, UsbDirection::Out) => self.handle_out(endpoint, stage),
            (EXECUTE, UsbDirection::In) => self.handle_in(endpoint, stage),
            _ => {
                debug!("Unknown request value {:#x}", setup.value);
                RequestStatus::Stall
            }
        }
    }
}
