//! The class registry, and command dispatch

use super::{class::Commands, core_class, Class, CommandTransaction, Verb};
use crate::{Error, Result};

/// Board identity served by the core class
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoardInfo {
    pub board_id: u32,
    pub version: &'static str,
    pub part_id: [u32; 2],
    pub serial_number: [u32; 4],
}

/// A registered class
#[derive(Clone, Copy)]
pub struct ClassEntry {
    class: &'static Class,
    numbered_by_position: bool,
}

impl ClassEntry {
    pub fn class(&self) -> &'static Class {
        self.class
    }

    /// The class' verbs, with their effective numbers
    pub fn verbs(&self) -> impl Iterator<Item = (u32, &'static Verb)> {
        let by_position = self.numbered_by_position;
        self.class
            .verbs()
            .iter()
            .enumerate()
            .map(move |(idx, verb)| (if by_position { idx as u32 } else { verb.number }, verb))
    }

    /// Find a verb by its effective number
    pub fn verb(&self, number: u32) -> Option<&'static Verb> {
        if self.numbered_by_position {
            self.class.verbs().get(number as usize)
        } else {
            self.class.verbs().iter().find(|verb| verb.number == number)
        }
    }
}

/// Holds every class the device exposes
///
/// Register classes once, at start of day. Dispatch only needs a shared
/// reference, so the registry can't change while commands are running.
///
/// ```
/// use great_usbd::comms::{BoardInfo, Registry};
///
/// let registry: Registry = Registry::new(BoardInfo {
///     board_id: 0,
///     version: "git-deadbeef",
///     part_id: [0xa000_cb3c, 0x0000_00ff],
///     serial_number: [0; 4],
/// });
/// assert_eq!(registry.class_name(0), "core");
/// ```
pub struct Registry<const N: usize = 16> {
    classes: heapless::Vec<ClassEntry, N>,
    board: BoardInfo,
}

impl<const N: usize> Registry<N> {
    /// Create a registry that holds the core class
    pub fn new(board: BoardInfo) -> Self {
        let mut registry = Registry {
            classes: heapless::Vec::new(),
            board,
        };
        if registry.register_class(&core_class::CORE).is_err() {
            error!("No room for the core class");
        }
        registry
    }

    /// Add a class
    ///
    /// Rejects classes without verbs, and class numbers that are already
    /// taken, with [`Error::InvalidArgument`]. Fails with [`Error::NoSpace`]
    /// when the registry is full.
    pub fn register_class(&mut self, class: &'static Class) -> Result<()> {
        if let Commands::Verbs([]) = class.commands {
            error!("Not registering class {} without verbs", class.name);
            return Err(Error::InvalidArgument);
        }
        if self.view().lookup_class(class.number).is_some() {
            error!("Class number {:#x} is already registered", class.number);
            return Err(Error::InvalidArgument);
        }
        let numbered_by_position = class.needs_numbering();
        if numbered_by_position {
            debug!("Numbering the verbs of class {}", class.name);
        }
        self.classes
            .push(ClassEntry {
                class,
                numbered_by_position,
            })
            .map_err(|_| Error::NoSpace)?;
        debug!("Registered class {} ({:#x})", class.name, class.number);
        Ok(())
    }

    /// A shared view of the registry for dispatch
    pub fn view(&self) -> RegistryView<'_> {
        RegistryView {
            classes: &self.classes,
            board: &self.board,
        }
    }

    pub fn lookup_class(&self, number: u32) -> Option<&ClassEntry> {
        self.view().lookup_class(number)
    }

    pub fn lookup_verb(&self, class_number: u32, verb: u32) -> Option<&'static Verb> {
        self.view().lookup_verb(class_number, verb)
    }

    pub fn class_name(&self, number: u32) -> &'static str {
        self.view().class_name(number)
    }

    /// Run the command described by `trans`
    ///
    /// See [`RegistryView::submit_command`].
    pub fn submit_command<'a>(&'a self, backend: &str, trans: &mut CommandTransaction<'a>) -> Result<()> {
        self.view().submit_command(backend, trans)
    }
}

/// Read-only access to a [`Registry`]
///
/// Verb handlers reach the registry through their transaction.
#[derive(Clone, Copy)]
pub struct RegistryView<'a> {
    classes: &'a [ClassEntry],
    board: &'a BoardInfo,
}

impl<'a> RegistryView<'a> {
    pub fn board(&self) -> &'a BoardInfo {
        self.board
    }

    /// Every class, most recently registered first
    pub fn classes(&self) -> impl Iterator<Item = &'a ClassEntry> {
        self.classes.iter().rev()
    }

    pub fn lookup_class(&self, number: u32) -> Option<&'a ClassEntry> {
        self.classes().find(|entry| entry.class.number == number)
    }

    pub fn lookup_verb(&self, class_number: u32, verb: u32) -> Option<&'static Verb> {
        self.lookup_class(class_number)?.verb(verb)
    }

    /// The class' name, or `"unknown"`
    pub fn class_name(&self, number: u32) -> &'static str {
        self.lookup_class(number)
            .map_or("unknown", |entry| entry.class.name)
    }

    /// Run the command described by `trans`
    ///
    /// Fails with [`Error::UnknownClass`] or [`Error::UnhandledVerb`] when
    /// the command doesn't resolve; the handler doesn't run. A handler that
    /// succeeds on a transaction with bounds errors fails with
    /// [`Error::MalformedMessage`]. `backend` names the transport in logs.
    pub fn submit_command(self, backend: &str, trans: &mut CommandTransaction<'a>) -> Result<()> {
        let Some(entry) = self.lookup_class(trans.class_number) else {
            warn!("{}: command for unknown class {:#x}", backend, trans.class_number);
            return Err(Error::UnknownClass);
        };
        let handler = match entry.class.commands {
            Commands::Handler(handler) => handler,
            Commands::Verbs(_) => match entry.verb(trans.verb) {
                Some(verb) => verb.handler,
                None => {
                    warn!(
                        "{}: class {} doesn't handle verb {}",
                        backend, entry.class.name, trans.verb
                    );
                    return Err(Error::UnhandledVerb);
                }
            },
        };

        trans.attach_registry(self);
        match handler(trans) {
            Ok(()) if !trans.is_okay() => {
                warn!(
                    "{}: {} verb {} succeeded on a malformed transaction ({:#x})",
                    backend,
                    entry.class.name,
                    trans.verb,
                    trans.status().bits()
                );
                Err(Error::MalformedMessage)
            }
            result => result,
        }
    }
}

#[cfg(test)]
mod test {
    use super::{BoardInfo, Registry};
    use crate::comms::{Class, CommandTransaction, Commands, Verb};
    use crate::{Error, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BOARD: BoardInfo = BoardInfo {
        board_id: 0,
        version: "v2024.0.1",
        part_id: [0xa000_cb3c, 0xff],
        serial_number: [1, 2, 3, 4],
    };

    fn echo(trans: &mut CommandTransaction<'_>) -> Result<()> {
        let value: u32 = trans.parse();
        trans.respond(value);
        Ok(())
    }

    fn careless(trans: &mut CommandTransaction<'_>) -> Result<()> {
        let _: u32 = trans.parse();
        Ok(())
    }

    static ECHO: Class = Class {
        number: 0x100,
        name: "echo",
        doc: "",
        commands: Commands::Verbs(&[Verb::new(0, "echo", echo), Verb::new(0, "careless", careless)]),
    };

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn counted(_: &mut CommandTransaction<'_>) -> Result<()> {
        CALLS.fetch_add(1, Ordering::SeqCst);
        Err(Error::Handler(5))
    }

    static FIXED: Class = Class {
        number: 0x101,
        name: "fixed",
        doc: "",
        commands: Commands::Verbs(&[Verb::new(7, "seven", counted), Verb::new(0, "zero", echo)]),
    };

    static CATCH_ALL: Class = Class {
        number: 0x102,
        name: "catch-all",
        doc: "",
        commands: Commands::Handler(counted),
    };

    static EMPTY: Class = Class {
        number: 0x103,
        name: "empty",
        doc: "",
        commands: Commands::Verbs(&[]),
    };

    static DUPLICATE: Class = Class {
        number: 0x100,
        name: "duplicate",
        doc: "",
        commands: Commands::Handler(counted),
    };

    fn registry() -> Registry {
        let mut registry = Registry::new(BOARD);
        registry.register_class(&ECHO).unwrap();
        registry.register_class(&FIXED).unwrap();
        registry.register_class(&CATCH_ALL).unwrap();
        registry
    }

    #[test]
    fn echo_scenario() {
        let registry = registry();
        let args = 42u32.to_le_bytes();
        let mut out = [0; 16];
        let mut trans = CommandTransaction::new(0x100, 0, &args, &mut out);
        assert_eq!(registry.submit_command("test", &mut trans), Ok(()));
        assert_eq!(trans.response(), &42u32.to_le_bytes());
    }

    #[test]
    fn unknown_class() {
        let registry = registry();
        let mut out = [0; 16];
        let mut trans = CommandTransaction::new(0x999, 0, &[], &mut out);
        assert_eq!(registry.submit_command("test", &mut trans), Err(Error::UnknownClass));
        assert_eq!(trans.data_out_length(), 0);
        assert!(trans.registry().is_none());
    }

    #[test]
    fn unhandled_verb() {
        let registry = registry();
        let mut out = [0; 16];
        let mut trans = CommandTransaction::new(0x101, 3, &[], &mut out);
        assert_eq!(registry.submit_command("test", &mut trans), Err(Error::UnhandledVerb));
        assert!(trans.registry().is_none());
    }

    #[test]
    fn careless_handler_fails() {
        let registry = registry();
        let mut out = [0; 16];
        let mut trans = CommandTransaction::new(0x100, 1, &[], &mut out);
        assert_eq!(registry.submit_command("test", &mut trans), Err(Error::MalformedMessage));
    }

    #[test]
    fn handler_errors_pass_through() {
        let registry = registry();
        let mut out = [0; 16];
        let mut trans = CommandTransaction::new(0x101, 7, &[], &mut out);
        assert_eq!(registry.submit_command("test", &mut trans), Err(Error::Handler(5)));
        let mut trans = CommandTransaction::new(0x102, 0xABCD, &[], &mut out);
        assert_eq!(registry.submit_command("test", &mut trans), Err(Error::Handler(5)));
    }

    #[test]
    fn auto_numbering() {
        let registry = registry();
        assert_eq!(registry.lookup_verb(0x100, 0).unwrap().name, "echo");
        assert_eq!(registry.lookup_verb(0x100, 1).unwrap().name, "careless");
        assert!(registry.lookup_verb(0x100, 2).is_none());

        // Explicit numbers stay, even if one of them is zero.
        assert_eq!(registry.lookup_verb(0x101, 7).unwrap().name, "seven");
        assert_eq!(registry.lookup_verb(0x101, 0).unwrap().name, "zero");
        assert!(registry.lookup_verb(0x101, 1).is_none());
    }

    #[test]
    fn rejected_classes() {
        let mut registry = registry();
        assert_eq!(registry.register_class(&EMPTY), Err(Error::InvalidArgument));
        assert_eq!(registry.register_class(&DUPLICATE), Err(Error::InvalidArgument));
        assert_eq!(registry.class_name(0x100), "echo");
        assert_eq!(registry.class_name(0x103), "unknown");
    }

    #[test]
    fn full_registry() {
        let mut registry: Registry<2> = Registry::new(BOARD);
        registry.register_class(&ECHO).unwrap();
        assert_eq!(registry.register_class(&FIXED), Err(Error::NoSpace));
        assert!(registry.lookup_class(0x101).is_none());
    }

    #[test]
    fn newest_first() {
        let registry = registry();
        let numbers: Vec<u32> = registry
            .view()
            .classes()
            .map(|entry| entry.class().number)
            .collect();
        assert_eq!(numbers, [0x102, 0x101, 0x100, 0]);
    }
}
