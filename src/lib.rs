//! USB command transport and class/verb dispatch for libgreat devices
//!
//! `great-usbd` turns the vendor control requests issued by libgreat host
//! tooling into synchronous remote procedure calls on the device. A host
//! sends a command prelude `{class, verb}` plus arguments in an OUT request,
//! the device dispatches it to a registered [`comms::Class`], and the host
//! fetches the response with an IN request.
//!
//! The crate is layered from the hardware up:
//!
//! - [`queue`] schedules and tracks transfer descriptors per endpoint.
//! - [`control`] routes control request stages to request handlers.
//! - [`backend`] implements the two-phase command protocol as a vendor
//!   request handler.
//! - [`comms`] holds the class/verb registry and the argument / response
//!   cursors that verb handlers use.
//! - [`pins`] arbitrates pin ownership between classes.
//!
//! [`Device`] ties everything to the LPC43xx USB0 controller through a
//! [`Driver`]. To use it, define a safe implementation of [`Peripherals`].

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod log;

mod buffer;
mod qh;
mod ral;
mod state;
mod td;
mod vcell;

pub mod backend;
pub mod clock;
pub mod comms;
pub mod control;
pub mod pins;
pub mod queue;

mod device;
mod driver;

#[cfg(test)]
mod mock;

pub use buffer::CommandMemory;
pub use device::{Controller, Device};
pub use driver::{Driver, Speed};
pub use state::EndpointState;
pub use td::{Status as TransferStatus, Td};

/// A type that owns the USB0 register block
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that owns the
/// USB0 core registers. The pointer returned by `usb0()` is assumed to
/// be valid, and will be cast to a register definition.
///
/// # Example
///
/// ```
/// use great_usbd::Peripherals;
///
/// struct Usb0(());
///
/// unsafe impl Peripherals for Usb0 {
///     fn usb0(&self) -> *const () {
///         0x4000_6000 as *const ()
///     }
/// }
///
/// let usb = Usb0(());
/// assert_eq!(usb.usb0(), 0x4000_6000 as *const ());
/// ```
pub unsafe trait Peripherals {
    /// Returns the address of the USB0 registers
    fn usb0(&self) -> *const ();
}

/// Errors reported by the command core
///
/// Every error maps onto the errno value that libgreat hosts expect
/// on the wire; see [`code()`](Error::code).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum Error {
    /// A caller supplied an argument that makes no sense here
    InvalidArgument,
    /// A handler read past its arguments or wrote past its response
    MalformedMessage,
    /// The resource is owned by someone else
    Busy,
    /// No transfer descriptors (or other pool slots) left
    NoSpace,
    /// Retried until the deadline passed
    TimedOut,
    /// A fixed-size arena is full
    OutOfMemory,
    /// No class is registered with the requested number
    UnknownClass,
    /// The class exists but doesn't handle the verb
    UnhandledVerb,
    /// A class-specific failure, carrying its errno
    Handler(u32),
}

impl Error {
    pub const EINVAL: u32 = 22;
    pub const EBADMSG: u32 = 74;
    pub const EBUSY: u32 = 16;
    pub const ENOSPC: u32 = 28;
    pub const ETIMEDOUT: u32 = 110;
    pub const ENOMEM: u32 = 12;

    /// The errno value for this error
    pub const fn code(self) -> u32 {
        match self {
            Error::InvalidArgument | Error::UnknownClass | Error::UnhandledVerb => Self::EINVAL,
            Error::MalformedMessage => Self::EBADMSG,
            Error::Busy => Self::EBUSY,
            Error::NoSpace => Self::ENOSPC,
            Error::TimedOut => Self::ETIMEDOUT,
            Error::OutOfMemory => Self::ENOMEM,
            Error::Handler(code) => code,
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::Error;

    #[test]
    fn errno_values() {
        assert_eq!(Error::UnknownClass.code(), 22);
        assert_eq!(Error::MalformedMessage.code(), 74);
        assert_eq!(Error::Handler(5).code(), 5);
    }
}
