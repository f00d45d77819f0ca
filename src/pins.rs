//! Pin ownership
//!
//! Classes that drive physical pins reserve them first, with their class
//! number as the owner tag. A pin has at most one owner. Reserving a pin the
//! caller already owns is a no-op; reserving someone else's pin fails with
//! [`Error::Busy`], and the caller must leave the pin alone.
//!
//! Reservations live in a fixed-capacity arena, one list per pin group.
//! Every operation runs inside a critical section, so verb handlers may
//! reserve pins from the USB interrupt.

use core::cell::RefCell;

use critical_section::Mutex;

use crate::{comms::RegistryView, Error, Result};

/// Pin groups on the LPC43xx SCU, P0 through PF
pub const GROUPS: usize = 16;

/// Pins per group
pub const PINS_PER_GROUP: u8 = 32;

#[derive(Clone, Copy)]
struct Reservation {
    pin: u8,
    owner: u32,
    next: Option<u16>,
}

impl Reservation {
    const EMPTY: Reservation = Reservation {
        pin: 0,
        owner: 0,
        next: None,
    };
}

struct Arena<const CAPACITY: usize> {
    nodes: [Reservation; CAPACITY],
    heads: [Option<u16>; GROUPS],
    /// Released nodes, linked through `next`
    free: Option<u16>,
    /// Nodes below this index have been handed out at least once
    high_water: u16,
    count: usize,
}

impl<const CAPACITY: usize> Arena<CAPACITY> {
    const fn new() -> Self {
        Arena {
            nodes: [Reservation::EMPTY; CAPACITY],
            heads: [None; GROUPS],
            free: None,
            high_water: 0,
            count: 0,
        }
    }

    fn node(&self, index: u16) -> Option<&Reservation> {
        self.nodes.get(index as usize)
    }

    /// Find `pin` in `group`, along with its predecessor
    fn find(&self, group: usize, pin: u8) -> Option<(Option<u16>, u16)> {
        let mut previous = None;
        let mut current = self.heads[group];
        while let Some(index) = current {
            let node = self.node(index)?;
            if node.pin == pin {
                return Some((previous, index));
            }
            previous = Some(index);
            current = node.next;
        }
        None
    }

    fn allocate(&mut self) -> Option<u16> {
        if let Some(index) = self.free {
            self.free = self.node(index)?.next;
            return Some(index);
        }
        if (self.high_water as usize) < CAPACITY {
            let index = self.high_water;
            self.high_water += 1;
            return Some(index);
        }
        None
    }

    fn push(&mut self, group: usize, pin: u8, owner: u32) -> Result<()> {
        let index = self.allocate().ok_or(Error::OutOfMemory)?;
        self.nodes[index as usize] = Reservation {
            pin,
            owner,
            next: self.heads[group],
        };
        self.heads[group] = Some(index);
        self.count += 1;
        Ok(())
    }

    fn unlink(&mut self, group: usize, previous: Option<u16>, index: u16) {
        let next = self.nodes[index as usize].next;
        match previous {
            None => self.heads[group] = next,
            Some(previous) => self.nodes[previous as usize].next = next,
        }
        self.nodes[index as usize] = Reservation {
            next: self.free,
            ..Reservation::EMPTY
        };
        self.free = Some(index);
        self.count -= 1;
    }
}

fn check(group: u8, pin: u8) -> Result<usize> {
    if (group as usize) < GROUPS && pin < PINS_PER_GROUP {
        Ok(group as usize)
    } else {
        Err(Error::InvalidArgument)
    }
}

/// Tracks which class owns each reserved pin
///
/// `CAPACITY` bounds how many pins can be reserved at once; it must be
/// less than 65536.
///
/// ```
/// use great_usbd::pins::PinManager;
///
/// static PINS: PinManager = PinManager::new();
///
/// PINS.reserve_for_class(1, 4, 0x104).unwrap();
/// assert_eq!(PINS.get_owning_class(1, 4), 0x104);
/// assert!(PINS.reserve_for_class(1, 4, 0x105).is_err());
/// PINS.release_reservation(1, 4).unwrap();
/// ```
pub struct PinManager<'r, const CAPACITY: usize = 64> {
    arena: Mutex<RefCell<Arena<CAPACITY>>>,
    names: Option<RegistryView<'r>>,
}

impl<'r, const CAPACITY: usize> PinManager<'r, CAPACITY> {
    pub const fn new() -> Self {
        PinManager {
            arena: Mutex::new(RefCell::new(Arena::new())),
            names: None,
        }
    }

    /// Name owners in diagnostics with the classes in `registry`
    pub const fn with_names(registry: RegistryView<'r>) -> Self {
        PinManager {
            arena: Mutex::new(RefCell::new(Arena::new())),
            names: Some(registry),
        }
    }

    fn class_name(&self, class: u32) -> &'static str {
        self.names.map_or("unknown", |names| names.class_name(class))
    }

    /// Reserve `pin` in `group` for `class`
    ///
    /// Succeeds without change when `class` already owns the pin. Fails with
    /// [`Error::Busy`] when another class owns it, [`Error::OutOfMemory`] when
    /// every reservation slot is taken, and [`Error::InvalidArgument`] for
    /// pins that don't exist.
    pub fn reserve_for_class(&self, group: u8, pin: u8, class: u32) -> Result<()> {
        let group_index = check(group, pin)?;
        critical_section::with(|cs| {
            let mut arena = self.arena.borrow_ref_mut(cs);
            if let Some((_, index)) = arena.find(group_index, pin) {
                let owner = arena.nodes[index as usize].owner;
                if owner == class {
                    return Ok(());
                }
                warn!(
                    "{} can't reserve P{}_{}; {} owns it",
                    self.class_name(class),
                    group,
                    pin,
                    self.class_name(owner)
                );
                return Err(Error::Busy);
            }
            arena.push(group_index, pin, class).map_err(|err| {
                error!("No room to reserve P{}_{} for {}", group, pin, self.class_name(class));
                err
            })
        })
    }

    /// Release `pin` in `group`, whoever owns it
    ///
    /// Fails with [`Error::InvalidArgument`] when nobody owns the pin.
    pub fn release_reservation(&self, group: u8, pin: u8) -> Result<()> {
        let group_index = check(group, pin)?;
        critical_section::with(|cs| {
            let mut arena = self.arena.borrow_ref_mut(cs);
            let Some((previous, index)) = arena.find(group_index, pin) else {
                warn!("Releasing P{}_{}, which isn't reserved", group, pin);
                return Err(Error::InvalidArgument);
            };
            arena.unlink(group_index, previous, index);
            Ok(())
        })
    }

    /// The class that owns `pin` in `group`; zero when the pin is free
    pub fn get_owning_class(&self, group: u8, pin: u8) -> u32 {
        let Ok(group_index) = check(group, pin) else {
            return 0;
        };
        critical_section::with(|cs| {
            let arena = self.arena.borrow_ref(cs);
            arena
                .find(group_index, pin)
                .map_or(0, |(_, index)| arena.nodes[index as usize].owner)
        })
    }

    /// `true` if `class` owns the pin, reserving it if it was free
    pub fn ensure_reservation(&self, group: u8, pin: u8, class: u32) -> bool {
        self.reserve_for_class(group, pin, class).is_ok()
    }

    /// How many pins are reserved
    pub fn reservations(&self) -> usize {
        critical_section::with(|cs| self.arena.borrow_ref(cs).count)
    }
}

impl<const CAPACITY: usize> Default for PinManager<'_, CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::PinManager;
    use crate::{
        comms::{BoardInfo, Class, CommandTransaction, Commands, Registry, Verb},
        Error, Result,
    };

    fn noop(_: &mut CommandTransaction<'_>) -> Result<()> {
        Ok(())
    }

    static SPI: Class = Class {
        number: 0x101,
        name: "spi",
        doc: "",
        commands: Commands::Verbs(&[Verb::new(0, "init", noop)]),
    };

    #[test]
    fn reserve_twice() {
        let pins: PinManager = PinManager::new();
        pins.reserve_for_class(1, 4, 0x101).unwrap();
        pins.reserve_for_class(1, 4, 0x101).unwrap();
        assert_eq!(pins.reservations(), 1);
        assert_eq!(pins.get_owning_class(1, 4), 0x101);
    }

    #[test]
    fn conflict_keeps_owner() {
        let pins: PinManager = PinManager::new();
        pins.reserve_for_class(2, 0, 0x101).unwrap();
        assert_eq!(pins.reserve_for_class(2, 0, 0x102), Err(Error::Busy));
        assert_eq!(pins.get_owning_class(2, 0), 0x101);
        assert!(!pins.ensure_reservation(2, 0, 0x102));
        assert!(pins.ensure_reservation(2, 0, 0x101));
    }

    #[test]
    fn release_then_reserve_elsewhere() {
        let pins: PinManager = PinManager::new();
        pins.reserve_for_class(3, 7, 0x101).unwrap();
        pins.release_reservation(3, 7).unwrap();
        assert_eq!(pins.get_owning_class(3, 7), 0);
        pins.reserve_for_class(3, 7, 0x102).unwrap();
        assert_eq!(pins.get_owning_class(3, 7), 0x102);
        assert_eq!(pins.reservations(), 1);
    }

    #[test]
    fn release_unowned() {
        let pins: PinManager = PinManager::new();
        assert_eq!(pins.release_reservation(0, 0), Err(Error::InvalidArgument));
        pins.reserve_for_class(0, 1, 0x101).unwrap();
        assert_eq!(pins.release_reservation(0, 0), Err(Error::InvalidArgument));
    }

    #[test]
    fn release_mid_list() {
        let pins: PinManager = PinManager::new();
        for pin in 0..4 {
            pins.reserve_for_class(5, pin, 0x100 + pin as u32).unwrap();
        }
        // The list runs 3, 2, 1, 0; drop from the middle, the head, and the tail.
        pins.release_reservation(5, 2).unwrap();
        pins.release_reservation(5, 3).unwrap();
        pins.release_reservation(5, 0).unwrap();
        assert_eq!(pins.get_owning_class(5, 1), 0x101);
        assert_eq!(pins.reservations(), 1);
        for pin in [0, 2, 3] {
            assert_eq!(pins.get_owning_class(5, pin), 0);
        }
    }

    #[test]
    fn groups_are_separate() {
        let pins: PinManager = PinManager::new();
        pins.reserve_for_class(0, 3, 0x101).unwrap();
        pins.reserve_for_class(15, 3, 0x102).unwrap();
        assert_eq!(pins.get_owning_class(0, 3), 0x101);
        assert_eq!(pins.get_owning_class(15, 3), 0x102);
    }

    #[test]
    fn out_of_range() {
        let pins: PinManager = PinManager::new();
        assert_eq!(pins.reserve_for_class(16, 0, 0x101), Err(Error::InvalidArgument));
        assert_eq!(pins.reserve_for_class(0, 32, 0x101), Err(Error::InvalidArgument));
        assert_eq!(pins.release_reservation(16, 0), Err(Error::InvalidArgument));
        assert_eq!(pins.get_owning_class(16, 0), 0);
    }

    #[test]
    fn arena_exhaustion_and_reuse() {
        let pins: PinManager<'_, 3> = PinManager::new();
        for pin in 0..3 {
            pins.reserve_for_class(4, pin, 0x101).unwrap();
        }
        assert_eq!(pins.reserve_for_class(4, 3, 0x101), Err(Error::OutOfMemory));
        // Re-reserving an owned pin needs no new slot.
        pins.reserve_for_class(4, 1, 0x101).unwrap();

        pins.release_reservation(4, 1).unwrap();
        pins.reserve_for_class(6, 9, 0x102).unwrap();
        assert_eq!(pins.reserve_for_class(6, 10, 0x102), Err(Error::OutOfMemory));
        assert_eq!(pins.get_owning_class(6, 9), 0x102);
    }

    #[test]
    fn names_from_registry() {
        let mut registry: Registry = Registry::new(BoardInfo {
            board_id: 0,
            version: "",
            part_id: [0; 2],
            serial_number: [0; 4],
        });
        registry.register_class(&SPI).unwrap();
        let pins: PinManager = PinManager::with_names(registry.view());
        assert_eq!(pins.class_name(0x101), "spi");
        assert_eq!(pins.class_name(0x999), "unknown");
        pins.reserve_for_class(1, 1, 0x101).unwrap();
        assert_eq!(pins.reserve_for_class(1, 1, 0), Err(Error::Busy));
    }

    #[test]
    fn shared_between_threads() {
        static PINS: PinManager = PinManager::new();
        std::thread::scope(|scope| {
            for class in 0..4u32 {
                scope.spawn(move || {
                    for _ in 0..100 {
                        if PINS.ensure_reservation(7, 0, 0x200 + class) {
                            assert_eq!(PINS.get_owning_class(7, 0), 0x200 + class);
                            PINS.release_reservation(7, 0).unwrap();
                        }
                    }
                });
            }
        });
        assert_eq!(PINS.reservations(), 0);
    }
}
