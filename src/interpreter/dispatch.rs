//! Dispatch tables.
//!
//! Generated code dispatches through the *active* table: a cell holding a
//! pointer to one of two immutable snapshots, `normal` or `safepoint`.
//! Switching tables is a single atomic pointer store; a thread may use
//! the previous table for at most one more dispatch.

use std::sync::atomic::{AtomicPtr, Ordering};

use super::bytecodes::NUMBER_OF_CODES;
use super::tos::{NUMBER_OF_STATES, TosState};

/// One address per TOS state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct EntryPoint {
    entry: [usize; NUMBER_OF_STATES],
}

impl EntryPoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// An entry point using the same address for every state.
    pub fn uniform(addr: usize) -> Self {
        Self {
            entry: [addr; NUMBER_OF_STATES],
        }
    }

    pub fn entry(&self, state: TosState) -> usize {
        self.entry[state.index()]
    }

    pub fn set_entry(&mut self, state: TosState, addr: usize) {
        self.entry[state.index()] = addr;
    }

    pub fn as_ptr(&self) -> *const usize {
        self.entry.as_ptr()
    }
}

/// `table[state][opcode]`, laid out so that generated code can index it
/// as `base + state * STATE_STRIDE + opcode * 8`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct DispatchTable {
    table: [[usize; NUMBER_OF_CODES]; NUMBER_OF_STATES],
}

/// Byte distance between two state rows.
pub const STATE_STRIDE: i32 = (NUMBER_OF_CODES * 8) as i32;

impl DispatchTable {
    fn boxed() -> Box<Self> {
        Box::new(Self {
            table: [[0; NUMBER_OF_CODES]; NUMBER_OF_STATES],
        })
    }

    pub fn entry(&self, code: u8) -> EntryPoint {
        let mut ep = EntryPoint::new();
        for state in TosState::ALL {
            ep.set_entry(state, self.table[state.index()][code as usize]);
        }
        ep
    }

    pub fn set_entry(&mut self, code: u8, ep: &EntryPoint) {
        for state in TosState::ALL {
            self.table[state.index()][code as usize] = ep.entry(state);
        }
    }

    pub fn get(&self, state: TosState, code: u8) -> usize {
        self.table[state.index()][code as usize]
    }

    pub fn base(&self) -> usize {
        self.table.as_ptr() as usize
    }

    /// Address of the row for `state`.
    pub fn table_for(&self, state: TosState) -> usize {
        self.base() + state.index() * NUMBER_OF_CODES * 8
    }
}

/// Which snapshot the active cell points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveTable {
    Normal,
    Safepoint,
}

pub struct DispatchTables {
    normal: Box<DispatchTable>,
    safepoint: Box<DispatchTable>,
    /// Entries for `wide`-prefixed opcodes, indexed by the second byte.
    wide: Box<[usize; NUMBER_OF_CODES]>,
    active: AtomicPtr<DispatchTable>,
}

impl DispatchTables {
    pub fn new() -> Box<Self> {
        let mut normal = DispatchTable::boxed();
        let active = AtomicPtr::new(&mut *normal as *mut DispatchTable);
        Box::new(Self {
            normal,
            safepoint: DispatchTable::boxed(),
            wide: Box::new([0; NUMBER_OF_CODES]),
            active,
        })
    }

    pub fn normal(&self) -> &DispatchTable {
        &self.normal
    }

    pub fn safepoint(&self) -> &DispatchTable {
        &self.safepoint
    }

    pub(crate) fn normal_mut(&mut self) -> &mut DispatchTable {
        &mut self.normal
    }

    pub(crate) fn safepoint_mut(&mut self) -> &mut DispatchTable {
        &mut self.safepoint
    }

    pub fn wide_entry(&self, code: u8) -> usize {
        self.wide[code as usize]
    }

    pub(crate) fn set_wide_entry(&mut self, code: u8, addr: usize) {
        self.wide[code as usize] = addr;
    }

    pub fn wide_base(&self) -> usize {
        self.wide.as_ptr() as usize
    }

    /// Address of the cell generated code loads the active table from.
    pub fn active_cell(&self) -> usize {
        &self.active as *const AtomicPtr<DispatchTable> as usize
    }

    pub fn active(&self) -> ActiveTable {
        let p = self.active.load(Ordering::Acquire);
        if std::ptr::eq(p, &*self.safepoint) {
            ActiveTable::Safepoint
        } else {
            ActiveTable::Normal
        }
    }

    pub fn active_table(&self) -> &DispatchTable {
        match self.active() {
            ActiveTable::Normal => &self.normal,
            ActiveTable::Safepoint => &self.safepoint,
        }
    }

    /// Route every dispatch through the safepoint entries.
    pub fn notice_safepoints(&self) {
        let p = &*self.safepoint as *const DispatchTable as *mut DispatchTable;
        if self.active.swap(p, Ordering::AcqRel) != p {
            log::debug!("dispatch: safepoint table active");
        }
    }

    pub fn ignore_safepoints(&self) {
        let p = &*self.normal as *const DispatchTable as *mut DispatchTable;
        if self.active.swap(p, Ordering::AcqRel) != p {
            log::debug!("dispatch: normal table active");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_point_equality_is_pointwise() {
        let mut a = EntryPoint::uniform(0x1000);
        let b = EntryPoint::uniform(0x1000);
        assert_eq!(a, b);
        a.set_entry(TosState::Ftos, 0x2000);
        assert_ne!(a, b);
        assert_eq!(a.entry(TosState::Ftos), 0x2000);
    }

    #[test]
    fn test_table_layout_matches_stride() {
        let mut tables = DispatchTables::new();
        let mut ep = EntryPoint::new();
        ep.set_entry(TosState::Itos, 0xabc);
        tables.normal_mut().set_entry(7, &ep);
        let t = tables.normal();
        let addr = t.base() + TosState::Itos.index() * STATE_STRIDE as usize + 7 * 8;
        // SAFETY: the address lies inside the boxed table.
        let v = unsafe { *(addr as *const usize) };
        assert_eq!(v, 0xabc);
        assert_eq!(t.table_for(TosState::Itos) + 7 * 8, addr);
    }

    #[test]
    fn test_switching_active_table() {
        let tables = DispatchTables::new();
        assert_eq!(tables.active(), ActiveTable::Normal);
        tables.notice_safepoints();
        assert_eq!(tables.active(), ActiveTable::Safepoint);
        // SAFETY: the cell is an AtomicPtr owned by `tables`.
        let cell = unsafe { &*(tables.active_cell() as *const AtomicPtr<DispatchTable>) };
        assert_eq!(cell.load(Ordering::Relaxed) as usize, tables.safepoint().base());
        tables.ignore_safepoints();
        assert_eq!(tables.active(), ActiveTable::Normal);
    }
}
