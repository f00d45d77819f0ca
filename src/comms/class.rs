//! Class and verb descriptors

use super::CommandTransaction;
use crate::Result;

/// Runs one command
///
/// Handlers run in the USB interrupt. They shouldn't block for long.
pub type Handler = fn(&mut CommandTransaction<'_>) -> Result<()>;

/// One numbered operation of a class
///
/// Everything besides `number` and `handler` only serves host-side
/// introspection. Signatures use the libgreat type tags: a byte order
/// marker (`<`), then one character per value (`B`, `H`, `I`, `S` for a
/// string, `*` for "repeats", ...). A signature of `"*"` asks the host not
/// to generate a method for the verb.
#[derive(Clone, Copy)]
pub struct Verb {
    pub number: u32,
    pub name: &'static str,
    pub handler: Handler,
    pub in_signature: &'static str,
    pub out_signature: &'static str,
    pub in_param_names: &'static str,
    pub out_param_names: &'static str,
    pub doc: &'static str,
}

impl Verb {
    /// A verb without introspection metadata
    pub const fn new(number: u32, name: &'static str, handler: Handler) -> Self {
        Verb {
            number,
            name,
            handler,
            in_signature: "",
            out_signature: "",
            in_param_names: "",
            out_param_names: "",
            doc: "",
        }
    }

    /// Describe the verb's arguments
    pub const fn takes(mut self, signature: &'static str, param_names: &'static str) -> Self {
        self.in_signature = signature;
        self.in_param_names = param_names;
        self
    }

    /// Describe the verb's response
    pub const fn returns(mut self, signature: &'static str, param_names: &'static str) -> Self {
        self.out_signature = signature;
        self.out_param_names = param_names;
        self
    }

    pub const fn doc(mut self, doc: &'static str) -> Self {
        self.doc = doc;
        self
    }
}

/// How a class handles its commands
#[derive(Clone, Copy)]
pub enum Commands {
    /// One handler sees every verb
    Handler(Handler),
    /// A table of verbs
    ///
    /// If every verb in a non-empty table has number zero, the registry
    /// numbers them by table position instead.
    Verbs(&'static [Verb]),
}

/// A named, numbered group of verbs
///
/// ```
/// use great_usbd::comms::{Class, Commands, CommandTransaction, Verb};
///
/// fn echo(trans: &mut CommandTransaction<'_>) -> great_usbd::Result<()> {
///     let value: u32 = trans.parse();
///     trans.respond(value);
///     Ok(())
/// }
///
/// static ECHO: Class = Class {
///     number: 0x100,
///     name: "echo",
///     doc: "Returns its argument",
///     commands: Commands::Verbs(&[
///         Verb::new(0, "echo", echo).takes("<I", "value").returns("<I", "value"),
///     ]),
/// };
/// ```
pub struct Class {
    pub number: u32,
    pub name: &'static str,
    pub doc: &'static str,
    pub commands: Commands,
}

impl Class {
    /// The class' verb table; empty for catch-all classes
    pub fn verbs(&self) -> &'static [Verb] {
        match self.commands {
            Commands::Verbs(verbs) => verbs,
            Commands::Handler(_) => &[],
        }
    }

    /// `true` when the registry numbers this class' verbs by position
    pub(crate) fn needs_numbering(&self) -> bool {
        let verbs = self.verbs();
        !verbs.is_empty() && verbs.iter().all(|verb| verb.number == 0)
    }
}
