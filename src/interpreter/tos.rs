//! Top-of-stack representation states.

use std::fmt;

use crate::codegen::masm::{Precision, Width};

/// How the value produced by the previous bytecode is held between
/// handlers. Integer-like and reference values live in the `Tos`
/// register, float and double values in `F0`; `Vtos` means the value (if
/// any) has been pushed to the expression stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum TosState {
    Btos = 0,
    Ztos,
    Ctos,
    Stos,
    Itos,
    Ltos,
    Ftos,
    Dtos,
    Atos,
    Vtos,
}

pub const NUMBER_OF_STATES: usize = 10;

impl TosState {
    pub const ALL: [TosState; NUMBER_OF_STATES] = [
        TosState::Btos,
        TosState::Ztos,
        TosState::Ctos,
        TosState::Stos,
        TosState::Itos,
        TosState::Ltos,
        TosState::Ftos,
        TosState::Dtos,
        TosState::Atos,
        TosState::Vtos,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: u32) -> Option<TosState> {
        Self::ALL.get(i as usize).copied()
    }

    /// Holds its value in the integer TOS register.
    pub fn in_int_register(self) -> bool {
        matches!(
            self,
            TosState::Btos
                | TosState::Ztos
                | TosState::Ctos
                | TosState::Stos
                | TosState::Itos
                | TosState::Ltos
                | TosState::Atos
        )
    }

    pub fn in_float_register(self) -> bool {
        matches!(self, TosState::Ftos | TosState::Dtos)
    }

    /// States sharing the `int` calling convention.
    pub fn is_int_like(self) -> bool {
        matches!(
            self,
            TosState::Btos | TosState::Ztos | TosState::Ctos | TosState::Stos | TosState::Itos
        )
    }

    /// Expression stack slots the value occupies once pushed.
    pub fn slots(self) -> usize {
        match self {
            TosState::Vtos => 0,
            TosState::Ltos | TosState::Dtos => 2,
            _ => 1,
        }
    }

    pub fn precision(self) -> Option<Precision> {
        match self {
            TosState::Ftos => Some(Precision::Single),
            TosState::Dtos => Some(Precision::Double),
            _ => None,
        }
    }

    /// Memory width of a field or array element of this state.
    pub fn width(self) -> Width {
        match self {
            TosState::Btos | TosState::Ztos => Width::W8,
            TosState::Ctos | TosState::Stos => Width::W16,
            TosState::Itos | TosState::Ftos => Width::W32,
            _ => Width::W64,
        }
    }

    /// State for a field descriptor or return type character.
    pub fn from_descriptor(c: u8) -> Option<TosState> {
        Some(match c {
            b'B' => TosState::Btos,
            b'Z' => TosState::Ztos,
            b'C' => TosState::Ctos,
            b'S' => TosState::Stos,
            b'I' => TosState::Itos,
            b'J' => TosState::Ltos,
            b'F' => TosState::Ftos,
            b'D' => TosState::Dtos,
            b'L' | b'[' => TosState::Atos,
            b'V' => TosState::Vtos,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            TosState::Btos => "btos",
            TosState::Ztos => "ztos",
            TosState::Ctos => "ctos",
            TosState::Stos => "stos",
            TosState::Itos => "itos",
            TosState::Ltos => "ltos",
            TosState::Ftos => "ftos",
            TosState::Dtos => "dtos",
            TosState::Atos => "atos",
            TosState::Vtos => "vtos",
        }
    }
}

impl fmt::Display for TosState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_states() {
        assert_eq!(TosState::from_descriptor(b'J'), Some(TosState::Ltos));
        assert_eq!(TosState::from_descriptor(b'['), Some(TosState::Atos));
        assert_eq!(TosState::from_descriptor(b'V'), Some(TosState::Vtos));
        assert_eq!(TosState::from_descriptor(b'X'), None);
    }

    #[test]
    fn test_register_classes_partition_states() {
        for state in TosState::ALL {
            let classes = [
                state.in_int_register(),
                state.in_float_register(),
                state == TosState::Vtos,
            ];
            assert_eq!(classes.iter().filter(|c| **c).count(), 1, "{}", state);
            assert_eq!(TosState::from_index(state as u32), Some(state));
        }
    }
}
