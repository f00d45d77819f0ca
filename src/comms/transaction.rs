//! Command transactions, and the argument / response cursors

use super::registry::RegistryView;

bitflags::bitflags! {
    /// Sticky bounds errors recorded on a transaction
    ///
    /// A transaction starts without errors. The first parse past the end
    /// of the arguments sets `UNDERRUN`; the first write past the end of
    /// the response buffer sets `OVERRUN`. Nothing clears them.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Status : u8 {
        const UNDERRUN = 1 << 0;
        const OVERRUN = 1 << 1;
    }
}

/// A fixed-size, little-endian argument or response value
pub trait Scalar: Copy {
    /// Bytes on the wire
    const SIZE: usize;
    /// Placeholder handed out when parsing fails
    const ZERO: Self;
    /// Decode from exactly `SIZE` bytes
    fn decode(bytes: &[u8]) -> Self;
    /// Encode into exactly `SIZE` bytes
    fn encode(self, bytes: &mut [u8]);
}

macro_rules! scalar {
    ($($ty:ty),*) => {
        $(
            impl Scalar for $ty {
                const SIZE: usize = core::mem::size_of::<$ty>();
                const ZERO: Self = 0;
                fn decode(bytes: &[u8]) -> Self {
                    let mut raw = [0; core::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }
                fn encode(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

scalar!(u8, u16, u32, i8, i16, i32);

impl Scalar for bool {
    const SIZE: usize = 1;
    const ZERO: Self = false;
    fn decode(bytes: &[u8]) -> Self {
        bytes.iter().any(|&b| b != 0)
    }
    fn encode(self, bytes: &mut [u8]) {
        bytes.fill(0);
        if let Some(first) = bytes.first_mut() {
            *first = self as u8;
        }
    }
}

/// The state of one remote procedure call
///
/// The transport creates a transaction for every command it receives. A
/// verb handler reads its arguments with [`parse()`](Self::parse) and
/// friends, and writes its response with [`respond()`](Self::respond) and
/// friends. Cursors only move forward, and never leave their buffers;
/// operations that would overrun a buffer record a [`Status`] bit instead.
///
/// Handlers must check [`is_okay()`](Self::is_okay) before trusting parsed
/// values. The registry fails any handler that claims success on a
/// transaction that isn't okay.
pub struct CommandTransaction<'a> {
    pub class_number: u32,
    pub verb: u32,
    data_in: &'a [u8],
    in_position: usize,
    data_out: &'a mut [u8],
    out_position: usize,
    status: Status,
    registry: Option<RegistryView<'a>>,
}

impl<'a> CommandTransaction<'a> {
    /// Create a transaction over the command's arguments, and a response buffer
    pub fn new(class_number: u32, verb: u32, data_in: &'a [u8], data_out: &'a mut [u8]) -> Self {
        CommandTransaction {
            class_number,
            verb,
            data_in,
            in_position: 0,
            data_out,
            out_position: 0,
            status: Status::empty(),
            registry: None,
        }
    }

    pub(crate) fn attach_registry(&mut self, registry: RegistryView<'a>) {
        self.registry = Some(registry);
    }

    /// The registry that dispatched this transaction, if any
    pub fn registry(&self) -> Option<RegistryView<'a>> {
        self.registry
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// `true` while no bounds error happened
    pub fn is_okay(&self) -> bool {
        self.status.is_empty()
    }

    /// Argument bytes not yet parsed
    pub fn remaining(&self) -> usize {
        self.data_in.len() - self.in_position
    }

    /// Parse the next argument
    ///
    /// If the arguments are exhausted, the cursor stays put, the transaction
    /// records [`Status::UNDERRUN`], and the result is zero.
    pub fn parse<T: Scalar>(&mut self) -> T {
        if self.remaining() < T::SIZE {
            self.status |= Status::UNDERRUN;
            return T::ZERO;
        }
        let start = self.in_position;
        self.in_position += T::SIZE;
        T::decode(&self.data_in[start..self.in_position])
    }

    /// Consume and return every argument byte not yet parsed
    pub fn read_remaining(&mut self) -> &'a [u8] {
        self.read_buffer(usize::MAX)
    }

    /// Consume and return up to `max_length` argument bytes
    pub fn read_buffer(&mut self, max_length: usize) -> &'a [u8] {
        let data_in: &'a [u8] = self.data_in;
        let start = self.in_position;
        self.in_position += max_length.min(self.remaining());
        &data_in[start..self.in_position]
    }

    /// Response bytes written so far
    pub fn data_out_length(&self) -> usize {
        self.out_position
    }

    /// The response written so far
    pub fn response(&self) -> &[u8] {
        &self.data_out[..self.out_position]
    }

    /// Claim `length` bytes of the response, to fill in place
    ///
    /// Returns `None`, and records [`Status::OVERRUN`], if they don't fit.
    pub fn reserve_space(&mut self, length: usize) -> Option<&mut [u8]> {
        if self.data_out.len() - self.out_position < length {
            self.status |= Status::OVERRUN;
            return None;
        }
        let start = self.out_position;
        self.out_position += length;
        Some(&mut self.data_out[start..self.out_position])
    }

    /// Append a value to the response
    pub fn respond<T: Scalar>(&mut self, value: T) {
        if let Some(space) = self.reserve_space(T::SIZE) {
            value.encode(space);
        }
    }

    /// Append bytes to the response; all of them, or none
    pub fn respond_raw(&mut self, bytes: &[u8]) {
        if let Some(space) = self.reserve_space(bytes.len()) {
            space.copy_from_slice(bytes);
        }
    }

    /// Append a NUL-terminated string to the response
    ///
    /// Copies as much as fits, terminator included, and records
    /// [`Status::OVERRUN`] when the string was cut short.
    pub fn respond_str(&mut self, text: &str) {
        let space = self.data_out.len() - self.out_position;
        if space == 0 {
            self.status |= Status::OVERRUN;
            return;
        }
        let length = text.len().min(space - 1);
        if let Some(out) = self.reserve_space(length + 1) {
            out[..length].copy_from_slice(&text.as_bytes()[..length]);
            out[length] = 0;
        }
        if length < text.len() {
            self.status |= Status::OVERRUN;
        }
    }
}

#[cfg(test)]
mod test {
    use super::{CommandTransaction, Status};

    #[test]
    fn parse_little_endian() {
        let args = [0x2A, 0, 0, 0, 0x34, 0x12, 0xFF, 1];
        let mut out = [0u8; 0];
        let mut trans = CommandTransaction::new(0, 0, &args, &mut out);
        assert_eq!(trans.parse::<u32>(), 42);
        assert_eq!(trans.parse::<u16>(), 0x1234);
        assert_eq!(trans.parse::<i8>(), -1);
        assert!(trans.parse::<bool>());
        assert!(trans.is_okay());
        assert_eq!(trans.remaining(), 0);
    }

    #[test]
    fn underrun_keeps_cursor() {
        let args = [1, 2, 3];
        let mut out = [0u8; 0];
        let mut trans = CommandTransaction::new(0, 0, &args, &mut out);
        assert_eq!(trans.parse::<u32>(), 0);
        assert_eq!(trans.status(), Status::UNDERRUN);
        assert_eq!(trans.remaining(), 3);

        // A smaller value still fits, but the error is sticky.
        assert_eq!(trans.parse::<u16>(), 0x0201);
        assert!(!trans.is_okay());
        assert_eq!(trans.remaining(), 1);
    }

    #[test]
    fn consumed_never_exceeds_input() {
        let args = [0xAB; 7];
        let mut out = [0u8; 0];
        let mut trans = CommandTransaction::new(0, 0, &args, &mut out);
        let mut consumed = 0;
        for step in 0..10 {
            let before = trans.remaining();
            match step % 3 {
                0 => {
                    let _ = trans.parse::<u32>();
                }
                1 => {
                    let _ = trans.parse::<u16>();
                }
                _ => {
                    let _ = trans.parse::<u8>();
                }
            }
            consumed += before - trans.remaining();
            assert!(consumed <= args.len());
        }
        assert_eq!(trans.status(), Status::UNDERRUN);
    }

    #[test]
    fn zero_input_parse() {
        let mut out = [0u8; 0];
        let mut trans = CommandTransaction::new(0, 0, &[], &mut out);
        assert_eq!(trans.parse::<u32>(), 0);
        assert!(!trans.is_okay());
    }

    #[test]
    fn read_buffer_truncates() {
        let args = [1, 2, 3, 4, 5];
        let mut out = [0u8; 0];
        let mut trans = CommandTransaction::new(0, 0, &args, &mut out);
        assert_eq!(trans.parse::<u8>(), 1);
        assert_eq!(trans.read_buffer(2), &[2, 3]);
        assert_eq!(trans.read_buffer(100), &[4, 5]);
        assert_eq!(trans.read_remaining(), &[] as &[u8]);
        assert!(trans.is_okay());
    }

    #[test]
    fn respond_until_full() {
        let mut out = [0; 6];
        let mut trans = CommandTransaction::new(0, 0, &[], &mut out);
        trans.respond(0x1234_5678u32);
        trans.respond(0xBEEFu16);
        assert!(trans.is_okay());
        trans.respond(7u8);
        assert_eq!(trans.status(), Status::OVERRUN);
        assert_eq!(trans.data_out_length(), 6);
        assert_eq!(trans.response(), &[0x78, 0x56, 0x34, 0x12, 0xEF, 0xBE]);
    }

    #[test]
    fn overrun_leaves_length() {
        let mut out = [0; 3];
        let mut trans = CommandTransaction::new(0, 0, &[], &mut out);
        trans.respond(1u8);
        trans.respond(2u32);
        assert_eq!(trans.data_out_length(), 1);
        trans.respond_raw(&[9, 9, 9]);
        assert_eq!(trans.data_out_length(), 1);
        trans.respond(-2i16);
        assert_eq!(trans.response(), &[1, 0xFE, 0xFF]);
        assert_eq!(trans.status(), Status::OVERRUN);
    }

    #[test]
    fn reserve_in_place() {
        let mut out = [0; 4];
        let mut trans = CommandTransaction::new(0, 0, &[], &mut out);
        trans.reserve_space(3).unwrap().copy_from_slice(b"abc");
        assert!(trans.reserve_space(2).is_none());
        assert_eq!(trans.response(), b"abc");
    }

    #[test]
    fn string_fits() {
        let mut out = [0xFF; 8];
        let mut trans = CommandTransaction::new(0, 0, &[], &mut out);
        trans.respond_str("core");
        assert!(trans.is_okay());
        assert_eq!(trans.response(), b"core\0");
    }

    #[test]
    fn string_truncates() {
        let mut out = [0xFF; 4];
        let mut trans = CommandTransaction::new(0, 0, &[], &mut out);
        trans.respond_str("greatfet");
        assert_eq!(trans.response(), b"gre\0");
        assert_eq!(trans.status(), Status::OVERRUN);
    }
}
