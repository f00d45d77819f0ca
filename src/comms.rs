//! Class/verb registry and command transactions
//!
//! A command names a class and a verb. Classes are registered once into a
//! [`Registry`]; transports hand each incoming command to
//! [`Registry::submit_command`] as a [`CommandTransaction`], which the verb
//! handler uses to parse arguments and write its response.
//!
//! Class 0 is always present. It identifies the board, and lets hosts list
//! the other classes and verbs.

mod class;
mod core_class;
mod registry;
mod transaction;

pub use class::{Class, Commands, Handler, Verb};
pub use core_class::Descriptor;
pub use registry::{BoardInfo, ClassEntry, Registry, RegistryView};
pub use transaction::{CommandTransaction, Scalar, Status};

/// Number of the always-present core class
pub const CORE_CLASS: u32 = core_class::CLASS_NUMBER;
