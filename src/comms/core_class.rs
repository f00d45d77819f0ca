//! The core class: board identification and API introspection
//!
//! Every libgreat device exposes class 0. Host tooling uses it to identify
//! the board, and to discover the other classes and their verbs.

use super::{Class, CommandTransaction, Commands, RegistryView, Verb};
use crate::{Error, Result};

pub const CLASS_NUMBER: u32 = 0;

/// Selects the string returned by `get_verb_descriptor`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Descriptor {
    OutSignature = 0,
    InSignature = 1,
    Doc = 2,
    OutParamNames = 3,
    InParamNames = 4,
}

impl Descriptor {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Descriptor::OutSignature,
            1 => Descriptor::InSignature,
            2 => Descriptor::Doc,
            3 => Descriptor::OutParamNames,
            4 => Descriptor::InParamNames,
            _ => return None,
        })
    }

    fn of(self, verb: &Verb) -> &'static str {
        match self {
            Descriptor::OutSignature => verb.out_signature,
            Descriptor::InSignature => verb.in_signature,
            Descriptor::Doc => verb.doc,
            Descriptor::OutParamNames => verb.out_param_names,
            Descriptor::InParamNames => verb.in_param_names,
        }
    }
}

fn registry<'a>(trans: &CommandTransaction<'a>) -> Result<RegistryView<'a>> {
    trans.registry().ok_or(Error::InvalidArgument)
}

/// Parse a class number, then a verb number, and find the verb
fn parse_verb(trans: &mut CommandTransaction<'_>) -> Result<&'static Verb> {
    let class_number: u32 = trans.parse();
    let verb_number: u32 = trans.parse();
    if !trans.is_okay() {
        return Err(Error::MalformedMessage);
    }
    registry(trans)?
        .lookup_verb(class_number, verb_number)
        .ok_or(Error::InvalidArgument)
}

/// Parse a class number, and find the class
fn parse_class(trans: &mut CommandTransaction<'_>) -> Result<&'static Class> {
    let class_number: u32 = trans.parse();
    if !trans.is_okay() {
        return Err(Error::MalformedMessage);
    }
    registry(trans)?
        .lookup_class(class_number)
        .map(|entry| entry.class())
        .ok_or(Error::InvalidArgument)
}

fn read_board_id(trans: &mut CommandTransaction<'_>) -> Result<()> {
    let board_id = registry(trans)?.board().board_id;
    trans.respond(board_id);
    Ok(())
}

fn read_version_string(trans: &mut CommandTransaction<'_>) -> Result<()> {
    let version = registry(trans)?.board().version;
    trans.respond_str(version);
    Ok(())
}

fn read_part_id(trans: &mut CommandTransaction<'_>) -> Result<()> {
    for word in registry(trans)?.board().part_id {
        trans.respond(word);
    }
    Ok(())
}

fn read_serial_number(trans: &mut CommandTransaction<'_>) -> Result<()> {
    for word in registry(trans)?.board().serial_number {
        trans.respond(word);
    }
    Ok(())
}

fn get_available_classes(trans: &mut CommandTransaction<'_>) -> Result<()> {
    for entry in registry(trans)?.classes() {
        trans.respond(entry.class().number);
    }
    Ok(())
}

fn get_available_verbs(trans: &mut CommandTransaction<'_>) -> Result<()> {
    let class_number: u32 = trans.parse();
    if !trans.is_okay() {
        return Err(Error::MalformedMessage);
    }
    let entry = registry(trans)?
        .lookup_class(class_number)
        .ok_or(Error::InvalidArgument)?;
    for (number, _) in entry.verbs() {
        trans.respond(number);
    }
    Ok(())
}

fn get_verb_name(trans: &mut CommandTransaction<'_>) -> Result<()> {
    let verb = parse_verb(trans)?;
    trans.respond_str(verb.name);
    Ok(())
}

fn get_verb_descriptor(trans: &mut CommandTransaction<'_>) -> Result<()> {
    let verb = parse_verb(trans)?;
    let selector: u8 = trans.parse();
    if !trans.is_okay() {
        return Err(Error::MalformedMessage);
    }
    let descriptor = Descriptor::from_u8(selector).ok_or(Error::InvalidArgument)?;
    trans.respond_str(descriptor.of(verb));
    Ok(())
}

fn get_class_name(trans: &mut CommandTransaction<'_>) -> Result<()> {
    let class = parse_class(trans)?;
    trans.respond_str(class.name);
    Ok(())
}

fn get_class_docs(trans: &mut CommandTransaction<'_>) -> Result<()> {
    let class = parse_class(trans)?;
    trans.respond_str(class.doc);
    Ok(())
}

static VERBS: [Verb; 10] = [
    Verb::new(0x0, "read_board_id", read_board_id)
        .returns("<I", "board_id")
        .doc("Returns the board's numeric type identifier."),
    Verb::new(0x1, "read_version_string", read_version_string)
        .returns("<S", "version")
        .doc("Returns the firmware's version string."),
    Verb::new(0x2, "read_part_id", read_part_id)
        .returns("<2I", "part_id")
        .doc("Returns the microcontroller's part identifiers."),
    Verb::new(0x3, "read_serial_number", read_serial_number)
        .returns("<4I", "serial_number")
        .doc("Returns the device's unique serial number."),
    Verb::new(0x4, "get_available_classes", get_available_classes)
        .returns("<*I", "classes")
        .doc("Lists the numbers of every class the device supports."),
    Verb::new(0x5, "get_available_verbs", get_available_verbs)
        .takes("<I", "class_number")
        .returns("<*I", "verbs")
        .doc("Lists the verb numbers a class supports."),
    Verb::new(0x6, "get_verb_name", get_verb_name)
        .takes("<II", "class_number, verb_number")
        .returns("<S", "name")
        .doc("Returns the name of a verb."),
    Verb::new(0x7, "get_verb_descriptor", get_verb_descriptor)
        .takes("<IIB", "class_number, verb_number, descriptor_number")
        .returns("<S", "descriptor")
        .doc("Returns a signature, parameter list, or documentation of a verb."),
    Verb::new(0x8, "get_class_name", get_class_name)
        .takes("<I", "class_number")
        .returns("<S", "class_name")
        .doc("Returns the name of a class."),
    Verb::new(0x9, "get_class_docs", get_class_docs)
        .takes("<I", "class_number")
        .returns("<S", "class_docs")
        .doc("Returns the documentation of a class."),
];

pub static CORE: Class = Class {
    number: CLASS_NUMBER,
    name: "core",
    doc: "Core API: board identification and API introspection.",
    commands: Commands::Verbs(&VERBS),
};

#[cfg(test)]
mod test {
    use crate::comms::{BoardInfo, Class, CommandTransaction, Commands, Registry, Verb};
    use crate::{Error, Result};

    const BOARD: BoardInfo = BoardInfo {
        board_id: 0,
        version: "git-2024.0.1",
        part_id: [0xa000_cb3c, 0xff],
        serial_number: [0x1111, 0x2222, 0x3333, 0x4444],
    };

    fn noop(_: &mut CommandTransaction<'_>) -> Result<()> {
        Ok(())
    }

    static LEDS: Class = Class {
        number: 0x107,
        name: "leds",
        doc: "Controls the board's LEDs.",
        commands: Commands::Verbs(&[
            Verb::new(0, "toggle", noop).takes("<B", "led_number"),
            Verb::new(0, "on", noop).takes("<B", "led_number").doc("Turns an LED on."),
        ]),
    };

    fn call(registry: &Registry, verb: u32, args: &[u8]) -> Result<Vec<u8>> {
        let mut out = [0; 256];
        let mut trans = CommandTransaction::new(0, verb, args, &mut out);
        registry.submit_command("test", &mut trans)?;
        Ok(trans.response().to_vec())
    }

    fn args(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|word| word.to_le_bytes()).collect()
    }

    fn registry() -> Registry {
        let mut registry = Registry::new(BOARD);
        registry.register_class(&LEDS).unwrap();
        registry
    }

    #[test]
    fn identification() {
        let registry = registry();
        assert_eq!(call(&registry, 0, &[]).unwrap(), args(&[0]));
        assert_eq!(call(&registry, 1, &[]).unwrap(), b"git-2024.0.1\0");
        assert_eq!(call(&registry, 2, &[]).unwrap(), args(&[0xa000_cb3c, 0xff]));
        assert_eq!(
            call(&registry, 3, &[]).unwrap(),
            args(&[0x1111, 0x2222, 0x3333, 0x4444])
        );
    }

    #[test]
    fn available_classes_and_verbs() {
        let registry = registry();
        assert_eq!(call(&registry, 4, &[]).unwrap(), args(&[0x107, 0]));
        assert_eq!(call(&registry, 5, &args(&[0x107])).unwrap(), args(&[0, 1]));
        assert_eq!(
            call(&registry, 5, &args(&[0])).unwrap(),
            args(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9])
        );
        assert_eq!(call(&registry, 5, &args(&[0x999])), Err(Error::InvalidArgument));
        assert_eq!(call(&registry, 5, &[]), Err(Error::MalformedMessage));
    }

    #[test]
    fn names_and_descriptors() {
        let registry = registry();
        assert_eq!(call(&registry, 6, &args(&[0x107, 1])).unwrap(), b"on\0");
        assert_eq!(call(&registry, 8, &args(&[0x107])).unwrap(), b"leds\0");
        assert_eq!(
            call(&registry, 9, &args(&[0x107])).unwrap(),
            b"Controls the board's LEDs.\0"
        );

        let mut descriptor = args(&[0x107, 1]);
        descriptor.push(1);
        assert_eq!(call(&registry, 7, &descriptor).unwrap(), b"<B\0");
        *descriptor.last_mut().unwrap() = 2;
        assert_eq!(call(&registry, 7, &descriptor).unwrap(), b"Turns an LED on.\0");
        *descriptor.last_mut().unwrap() = 0;
        assert_eq!(call(&registry, 7, &descriptor).unwrap(), b"\0");
        *descriptor.last_mut().unwrap() = 9;
        assert_eq!(call(&registry, 7, &descriptor), Err(Error::InvalidArgument));

        assert_eq!(call(&registry, 6, &args(&[0x107, 5])), Err(Error::InvalidArgument));
    }

    #[test]
    fn outside_a_registry() {
        let mut out = [0; 4];
        let mut trans = CommandTransaction::new(0, 0, &[], &mut out);
        assert_eq!(super::read_board_id(&mut trans), Err(Error::InvalidArgument));
    }
}
