//! The CSR file: storage, legality, aliasing, and the privileged entry points the trap/execution
//! logic needs.
//!
//! Grounded on the reference simulator's `Csr<URV>`/`CsRegs<URV>` pair: a `Csr` is a
//! mask-and-reset-value description of one register, `CsRegs` is the array of them plus the
//! read/write/poke API. [`CsrRegister`] and [`CsrFile`] play the same two roles. The indirection
//! the reference simulator gets from raw pointers into a shared backing array, this crate gets
//! from [`Rc<Cell<U>>`]: a register's storage cell is shared by every register that aliases it
//! (`sstatus` shares `mstatus`'s cell; `vsstatus` shares its own distinct cell; two harts' shared
//! registers, if configured as such, share the same `Rc`).

pub mod fields;
pub mod specifier;

pub use specifier::CsrSpecifier;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use log::{trace, warn};

use crate::error::{AccessError, WriteError};
use crate::width::Xlen;
use crate::{PrivilegeLevel, RawPrivilegeLevel, VirtualizationMode};
use fields::FieldDescriptor;

/// Where a register's value actually lives.
#[derive(Debug, Clone, Copy)]
enum StorageRef {
    /// This register's own cell; its reset value is authoritative for the cell.
    Owned(usize),
    /// Shares another register's cell (a shadow view with its own mask/name, e.g. `sstatus` over
    /// `mstatus`). The index is into [`CsrFile::cells`], same as `Owned`.
    Aliased(usize),
}

/// Behavior beyond "mask the incoming value and store it" that a write to this CSR triggers.
///
/// The reference simulator wires this up with per-register pre/post-write callback lists
/// (`std::function` chains attached at configuration time); with a fixed, small set of
/// cross-register effects in this CSR space, a closed enum dispatched in [`CsrFile::write`] says
/// the same thing without the `Rc<RefCell<dyn FnMut>>` bookkeeping a callback list would need to
/// let one callback reach its sibling registers.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum SideEffect {
    None,
    /// Legalizes `MPP`/`SPP` to only the implemented privilege levels and recomputes `SD` as the
    /// OR of `FS`/`VS`/`XS` each reading "dirty".
    MstatusLegalize,
    /// `fflags`/`frm` are sub-fields of `fcsr`; a write to any of the three keeps the other two
    /// consistent.
    FcsrCompose,
    /// `vxsat`/`vxrm` are sub-fields of `vcsr`, same idea as [`Self::FcsrCompose`].
    VcsrCompose,
    /// `mip`/`hip`/`hvip`/`vsip` (and the `mie`/`hie`/`vsie`, `mideleg`/`hideleg` pairs) share a
    /// subset of bits across the hypervisor's interrupt-aliasing rules; a write to one propagates
    /// the shared subset into the others.
    HypervisorAliasPropagate,
}

/// Which half of a tied 64-bit counter a register reads, for the RV32 split views
/// (`mcycle`/`mcycleh`). RV64 only ever uses `Full`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum CounterHalf {
    Full,
    Low,
    High,
}

#[derive(Debug, Clone, Copy)]
struct TiedCounter {
    /// Index into [`CsrFile::counters`] (`0`=cycle, `1`=time, `2`=instret, `3..=31`=hpmcounter3..31).
    index: usize,
    half: CounterHalf,
}

struct CsrRegister<U: Xlen> {
    specifier: CsrSpecifier,
    name: &'static str,
    storage: StorageRef,
    reset_value: U,
    write_mask: U,
    poke_mask: U,
    read_mask: U,
    implemented: bool,
    /// True if the privileged architecture mandates this register be present, independent of
    /// whether this particular configuration implements it.
    mandatory: bool,
    debug_only: bool,
    hypervisor_only: bool,
    maps_to_virtual: Option<CsrSpecifier>,
    fields: &'static [FieldDescriptor],
    side_effect: SideEffect,
    tied_counter: Option<TiedCounter>,
    /// Value held before the first write since the last [`CsrFile::clear_last_written`]; `None`
    /// until that first write happens, at which point it is set once and left alone.
    prev_value: Option<U>,
}

/// One CSR's description, supplied to [`CsrFile::define`]. Everything not set explicitly takes
/// the all-permissive default (read/write-able by everyone at the CSR number's own minimum
/// privilege, no aliasing, no side effect).
pub struct CsrRegisterSpec<U: Xlen> {
    pub specifier: CsrSpecifier,
    pub name: &'static str,
    pub reset_value: U,
    pub write_mask: U,
    pub poke_mask: U,
    pub read_mask: U,
    pub fields: &'static [FieldDescriptor],
    /// Whether the privileged architecture mandates this register's presence, as opposed to
    /// `implemented` which only says whether *this* `CsrFile` carries it.
    pub mandatory: bool,
}

impl<U: Xlen> CsrRegisterSpec<U> {
    pub fn new(specifier: CsrSpecifier, name: &'static str) -> Self {
        Self {
            specifier,
            name,
            reset_value: U::ZERO,
            write_mask: U::ALL_ONES,
            poke_mask: U::ALL_ONES,
            read_mask: U::ALL_ONES,
            fields: &[],
            mandatory: false,
        }
    }

    /// Marks this register as architecturally mandatory (e.g. `mstatus`, `mtvec`, `mepc`):
    /// present on every conformant implementation, not merely an optional extension CSR.
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn reset(mut self, value: U) -> Self {
        self.reset_value = value;
        self
    }

    pub fn masks(mut self, write: U, poke: U, read: U) -> Self {
        self.write_mask = write;
        self.poke_mask = poke;
        self.read_mask = read;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.write_mask = U::ZERO;
        self.poke_mask = U::ZERO;
        self
    }

    pub fn fields(mut self, fields: &'static [FieldDescriptor]) -> Self {
        self.fields = fields;
        self
    }
}

/// The full CSR register file for one hart, parameterized on its configured register width.
///
/// Construct with [`CsrFile::new`], populate with [`CsrFile::define`] / [`CsrFile::alias`] /
/// [`CsrFile::define_range`], then drive with [`CsrFile::read`]/[`CsrFile::write`]/[`CsrFile::poke`].
pub struct CsrFile<U: Xlen> {
    registers: Vec<CsrRegister<U>>,
    cells: Vec<Rc<Cell<U>>>,
    by_specifier: HashMap<CsrSpecifier, usize>,
    /// Backing store for the tied performance counters, always full 64-bit width regardless of
    /// `U`. Shared via `Rc` so a hart's mcycle/minstret survive a `CsrFile` rebuild (e.g. after
    /// a WARL reconfiguration) and so `counters_handle` can be handed to an external ticker.
    counters: Rc<RefCell<[u64; 32]>>,
    /// Indices (into `registers`) written since the last [`CsrFile::clear_last_written`], in
    /// write order. Mirrors the reference simulator's "last written" bookkeeping used to build
    /// post-instruction trace records.
    last_written: Vec<usize>,
}

impl<U: Xlen> CsrFile<U> {
    pub fn new() -> Self {
        Self {
            registers: Vec::new(),
            cells: Vec::new(),
            by_specifier: HashMap::new(),
            counters: Rc::new(RefCell::new([0u64; 32])),
            last_written: Vec::new(),
        }
    }

    /// Registers a new CSR owning its own storage cell.
    pub fn define(&mut self, spec: CsrRegisterSpec<U>) -> &mut Self {
        let cell_ix = self.cells.len();
        self.cells.push(Rc::new(Cell::new(spec.reset_value)));
        self.push_register(CsrRegister {
            specifier: spec.specifier,
            name: spec.name,
            storage: StorageRef::Owned(cell_ix),
            reset_value: spec.reset_value,
            write_mask: spec.write_mask,
            poke_mask: spec.poke_mask,
            read_mask: spec.read_mask,
            implemented: true,
            mandatory: spec.mandatory,
            debug_only: specifier::is_debug_only(spec.specifier),
            hypervisor_only: specifier::is_hypervisor_only(spec.specifier),
            maps_to_virtual: specifier::virtual_alias_of(spec.specifier),
            fields: spec.fields,
            side_effect: SideEffect::None,
            tied_counter: None,
            prev_value: None,
        });
        self
    }

    /// Registers a CSR that shares an already-defined CSR's storage cell, with its own
    /// name/masks/fields (e.g. `sstatus` aliasing `mstatus`).
    pub fn alias(
        &mut self,
        target: CsrSpecifier,
        spec: CsrRegisterSpec<U>,
    ) -> &mut Self {
        let target_ix = *self
            .by_specifier
            .get(&target)
            .unwrap_or_else(|| panic!("alias target {target:#05x} not yet defined"));
        let cell_ix = match self.registers[target_ix].storage {
            StorageRef::Owned(ix) | StorageRef::Aliased(ix) => ix,
        };
        self.push_register(CsrRegister {
            specifier: spec.specifier,
            name: spec.name,
            storage: StorageRef::Aliased(cell_ix),
            reset_value: spec.reset_value,
            write_mask: spec.write_mask,
            poke_mask: spec.poke_mask,
            read_mask: spec.read_mask,
            implemented: true,
            mandatory: spec.mandatory,
            debug_only: specifier::is_debug_only(spec.specifier),
            hypervisor_only: specifier::is_hypervisor_only(spec.specifier),
            maps_to_virtual: specifier::virtual_alias_of(spec.specifier),
            fields: spec.fields,
            side_effect: SideEffect::None,
            tied_counter: None,
            prev_value: None,
        });
        self
    }

    /// Registers `count` consecutive CSRs (`base`, `base+1`, ...) sharing one configuration,
    /// each owning its own cell. Used for `pmpcfgN`/`pmpaddrN`/`mhpmcounterN`/`mhpmeventN`.
    pub fn define_range(
        &mut self,
        base: CsrSpecifier,
        count: u16,
        name_of: impl Fn(u16) -> &'static str,
        reset_value: U,
        write_mask: U,
    ) {
        for i in 0..count {
            self.define(
                CsrRegisterSpec::new(base + i, name_of(i))
                    .reset(reset_value)
                    .masks(write_mask, U::ALL_ONES, U::ALL_ONES),
            );
        }
    }

    /// Marks the last-defined register as side-effecting. Internal builder helper used while
    /// constructing the standard register set in [`crate::csr`]'s configuration helpers.
    fn with_side_effect(&mut self, side_effect: SideEffect) -> &mut Self {
        let ix = self.registers.len() - 1;
        self.registers[ix].side_effect = side_effect;
        self
    }

    fn with_tied_counter(&mut self, index: usize, half: CounterHalf) -> &mut Self {
        let ix = self.registers.len() - 1;
        self.registers[ix].tied_counter = Some(TiedCounter { index, half });
        self
    }

    fn push_register(&mut self, register: CsrRegister<U>) {
        let ix = self.registers.len();
        self.by_specifier.insert(register.specifier, ix);
        self.registers.push(register);
    }

    fn index_of(&self, specifier: CsrSpecifier) -> Result<usize, AccessError> {
        self.by_specifier
            .get(&specifier)
            .copied()
            .filter(|&ix| self.registers[ix].implemented)
            .ok_or(AccessError::NotImplemented(specifier))
    }

    fn check_access(
        &self,
        ix: usize,
        priv_level: PrivilegeLevel,
        virt: VirtualizationMode,
        debug_mode: bool,
    ) -> Result<(), AccessError> {
        let reg = &self.registers[ix];
        let required = specifier::required_privilege_level(reg.specifier);
        if RawPrivilegeLevel::from(priv_level) < required {
            return Err(AccessError::Privileged {
                specifier: reg.specifier,
                required,
                actual: priv_level.into(),
            });
        }
        if reg.debug_only && !debug_mode {
            return Err(AccessError::DebugOnly(reg.specifier));
        }
        if reg.hypervisor_only && virt.is_virtual() {
            return Err(AccessError::Virtualized(reg.specifier));
        }
        Ok(())
    }

    /// Reads a CSR's current value, applying the configured read-mask and redirecting through
    /// `maps_to_virtual` while `V=1`.
    pub fn read(
        &self,
        specifier: CsrSpecifier,
        priv_level: PrivilegeLevel,
        virt: VirtualizationMode,
        debug_mode: bool,
    ) -> Result<U, AccessError> {
        let ix = self.index_of(specifier)?;
        self.check_access(ix, priv_level, virt, debug_mode)?;
        if virt.is_virtual() {
            if let Some(target) = self.registers[ix].maps_to_virtual {
                return self.read(target, priv_level, virt, debug_mode);
            }
        }
        Ok(self.read_raw(ix))
    }

    /// Reads a CSR's value bypassing every legality check, for trace/debug tooling.
    pub fn peek(&self, specifier: CsrSpecifier) -> Option<U> {
        let ix = self.by_specifier.get(&specifier).copied()?;
        Some(self.read_raw(ix))
    }

    fn read_raw(&self, ix: usize) -> U {
        let reg = &self.registers[ix];
        let raw = if let Some(tied) = reg.tied_counter {
            self.read_tied_counter(tied)
        } else {
            match reg.side_effect {
                SideEffect::FcsrCompose if reg.specifier == specifier::FCSR => {
                    self.compose_fcsr()
                }
                SideEffect::VcsrCompose if reg.specifier == specifier::VCSR => {
                    self.compose_vcsr()
                }
                _ => self.cell_value(ix),
            }
        };
        raw & reg.read_mask
    }

    fn cell_value(&self, ix: usize) -> U {
        let cell_ix = match self.registers[ix].storage {
            StorageRef::Owned(c) | StorageRef::Aliased(c) => c,
        };
        self.cells[cell_ix].get()
    }

    fn set_cell_value(&self, ix: usize, value: U) {
        let cell_ix = match self.registers[ix].storage {
            StorageRef::Owned(c) | StorageRef::Aliased(c) => c,
        };
        self.cells[cell_ix].set(value);
    }

    fn read_tied_counter(&self, tied: TiedCounter) -> U {
        let raw = self.counters.borrow()[tied.index];
        match tied.half {
            CounterHalf::Full => U::from_u64(raw),
            CounterHalf::Low => U::from_u64(raw & 0xFFFF_FFFF),
            CounterHalf::High => U::from_u64(raw >> 32),
        }
    }

    fn write_tied_counter(&self, tied: TiedCounter, write_mask: U, value: U) {
        let mut counters = self.counters.borrow_mut();
        let old = counters[tied.index];
        let new = match tied.half {
            CounterHalf::Full => {
                let mask = U::to_u64(write_mask);
                (old & !mask) | (U::to_u64(value) & mask)
            }
            CounterHalf::Low => {
                let mask = U::to_u64(write_mask) & 0xFFFF_FFFF;
                let masked_in = U::to_u64(value) & mask;
                let high = old & 0xFFFF_FFFF_0000_0000;
                let low = (old & !mask & 0xFFFF_FFFF) | masked_in;
                high | low
            }
            CounterHalf::High => {
                let mask = U::to_u64(write_mask) & 0xFFFF_FFFF;
                let masked_in = U::to_u64(value) & mask;
                let low = old & 0x0000_0000_FFFF_FFFF;
                let high = ((old >> 32) & !mask & 0xFFFF_FFFF | masked_in) << 32;
                low | high
            }
        };
        counters[tied.index] = new;
    }

    fn compose_fcsr(&self) -> U {
        let fflags_ix = self.by_specifier[&specifier::FFLAGS];
        let frm_ix = self.by_specifier[&specifier::FRM];
        let fflags = self.cell_value(fflags_ix);
        let frm = self.cell_value(frm_ix);
        fflags | (frm << 5)
    }

    fn compose_vcsr(&self) -> U {
        let vxsat_ix = self.by_specifier[&specifier::VXSAT];
        let vxrm_ix = self.by_specifier[&specifier::VXRM];
        let vxsat = self.cell_value(vxsat_ix);
        let vxrm = self.cell_value(vxrm_ix);
        vxsat | (vxrm << 1)
    }

    /// Writes a CSR through the full legality path: privilege, debug-mode, hypervisor gating,
    /// read-only rejection, virtualization redirection, masked store, side effects, and
    /// last-written bookkeeping.
    pub fn write(
        &mut self,
        specifier: CsrSpecifier,
        priv_level: PrivilegeLevel,
        virt: VirtualizationMode,
        debug_mode: bool,
        value: U,
    ) -> Result<(), WriteError> {
        let ix = self.index_of(specifier).map_err(WriteError::Access)?;
        self.check_access(ix, priv_level, virt, debug_mode)
            .map_err(WriteError::Access)?;
        if specifier::is_read_only(specifier) {
            return Err(WriteError::ReadOnly(specifier));
        }
        if virt.is_virtual() {
            if let Some(target) = self.registers[ix].maps_to_virtual {
                return self.write(target, priv_level, virt, debug_mode, value);
            }
        }
        self.write_raw(ix, value, true);
        Ok(())
    }

    /// Writes a CSR by number, skipping the privilege/debug/hypervisor/virtualization gates but
    /// still honoring the write-mask and side effects. Used by trap entry/exit and other
    /// hart-internal state transitions that write CSRs on the instruction's behalf rather than in
    /// response to a CSR instruction.
    pub fn write_ignoring_legality(&mut self, specifier: CsrSpecifier, value: U) -> Result<(), AccessError> {
        let ix = self.index_of(specifier)?;
        self.write_raw(ix, value, true);
        Ok(())
    }

    /// Writes a CSR bypassing legality *and* the write-mask, using the (typically wider) poke
    /// mask instead. Models RTL-visibility pokes: external interrupt pin toggles, a debugger
    /// forcing a register, or the MCM checker cross-checking a value the RTL reports.
    pub fn poke(&mut self, specifier: CsrSpecifier, value: U) -> Result<(), AccessError> {
        let ix = self.index_of(specifier)?;
        let poke_mask = self.registers[ix].poke_mask;
        if let Some(tied) = self.registers[ix].tied_counter {
            self.write_tied_counter(tied, poke_mask, value);
            return Ok(());
        }
        let old = self.cell_value(ix);
        let new = (value & poke_mask) | (old & !poke_mask);
        self.set_cell_value(ix, new);
        self.apply_side_effects(ix, old, new);
        Ok(())
    }

    /// Records `specifier` as written by the current instruction without itself performing a
    /// write, for state that was mutated directly (e.g. a tied counter incremented by the
    /// execution engine's tick rather than through [`CsrFile::write`]).
    pub fn mark_written_by_instruction(&mut self, specifier: CsrSpecifier) -> Result<(), AccessError> {
        let ix = self.index_of(specifier)?;
        self.last_written.push(ix);
        Ok(())
    }

    fn write_raw(&mut self, ix: usize, value: U, record: bool) {
        let reg = &self.registers[ix];
        if let Some(tied) = reg.tied_counter {
            let write_mask = reg.write_mask;
            let old = self.read_tied_counter(tied);
            if self.registers[ix].prev_value.is_none() {
                self.registers[ix].prev_value = Some(old);
            }
            self.write_tied_counter(tied, write_mask, value);
            if record {
                self.last_written.push(ix);
            }
            return;
        }
        let write_mask = reg.write_mask;
        let old = self.cell_value(ix);
        if self.registers[ix].prev_value.is_none() {
            self.registers[ix].prev_value = Some(old);
        }
        let new = (value & write_mask) | (old & !write_mask);
        self.set_cell_value(ix, new);
        self.apply_side_effects(ix, old, new);
        if record {
            self.last_written.push(ix);
        }
        trace!(
            csr = self.registers[ix].name,
            specifier:% = format!("{:#05x}", self.registers[ix].specifier),
            old:% = format!("{old:#x}"),
            new:% = format!("{new:#x}");
            "csr write"
        );
    }

    fn apply_side_effects(&mut self, ix: usize, old: U, new: U) {
        match self.registers[ix].side_effect {
            SideEffect::None => {}
            SideEffect::MstatusLegalize => self.legalize_mstatus(ix),
            SideEffect::FcsrCompose => self.decompose_fcsr(ix, new),
            SideEffect::VcsrCompose => self.decompose_vcsr(ix, new),
            SideEffect::HypervisorAliasPropagate => self.propagate_hypervisor_alias(ix, old, new),
        }
    }

    /// Legalizes `MPP` to an implemented privilege level (forcing reserved level `2` down to
    /// `User`) and recomputes `SD` as `FS==dirty | VS==dirty | XS==dirty`.
    fn legalize_mstatus(&mut self, ix: usize) {
        let value = self.cell_value(ix);
        let mpp_field = fields::MSTATUS_FIELDS
            .iter()
            .find(|f| f.name == "MPP")
            .expect("MSTATUS_FIELDS always defines MPP");
        let mpp = mpp_field.extract(U::to_u64(value));
        let legalized_mpp = if mpp == RawPrivilegeLevel::Reserved as u64 {
            warn!(mpp; "mstatus write set MPP to the reserved privilege level, forcing to User");
            RawPrivilegeLevel::User as u64
        } else {
            mpp
        };
        let cleared = U::to_u64(value) & !(0b11 << mpp_field.lsb);
        let with_mpp = cleared | (legalized_mpp << mpp_field.lsb);

        let fs = extract_field(with_mpp, "FS");
        let vs = extract_field(with_mpp, "VS");
        let xs = extract_field(with_mpp, "XS");
        let dirty = fs == 0b11 || vs == 0b11 || xs == 0b11;
        let sd_bit = U::BITS - 1;
        let with_sd = if dirty {
            with_mpp | (1u64 << sd_bit)
        } else {
            with_mpp & !(1u64 << sd_bit)
        };
        self.set_cell_value(ix, U::from_u64(with_sd));
    }

    fn decompose_fcsr(&mut self, ix: usize, new: U) {
        if self.registers[ix].specifier != specifier::FCSR {
            return;
        }
        let value = U::to_u64(new);
        let fflags_ix = self.by_specifier[&specifier::FFLAGS];
        let frm_ix = self.by_specifier[&specifier::FRM];
        self.set_cell_value(fflags_ix, U::from_u64(value & 0x1F));
        self.set_cell_value(frm_ix, U::from_u64((value >> 5) & 0x7));
    }

    fn decompose_vcsr(&mut self, ix: usize, new: U) {
        if self.registers[ix].specifier != specifier::VCSR {
            return;
        }
        let value = U::to_u64(new);
        let vxsat_ix = self.by_specifier[&specifier::VXSAT];
        let vxrm_ix = self.by_specifier[&specifier::VXRM];
        self.set_cell_value(vxsat_ix, U::from_u64(value & 0x1));
        self.set_cell_value(vxrm_ix, U::from_u64((value >> 1) & 0x3));
    }

    /// Propagates the shared subset of `mip`/`hip`/`hvip`/`vsip` (or the analogous `mie`/`hie`/
    /// `vsie`, `mideleg`/`hideleg` pairs) into sibling registers that alias the same interrupt
    /// bits but are configured as distinct storage (not `StorageRef::Aliased`, since each of the
    /// four views also carries bits the others don't: `vsip` for instance is read/write for bit 2
    /// (`VSSIP`) but read-only-zero elsewhere).
    ///
    /// Grounded on the hypervisor extension's interrupt-aliasing rules; this crate implements
    /// only the bit subset named there (`VSSIP`/`VSTIP`/`VSEIP`, bit positions 2/6/10) since the
    /// full AIA `hvictl`/IMSIC interaction is out of scope.
    fn propagate_hypervisor_alias(&mut self, ix: usize, _old: U, new: U) {
        const SHARED_MASK: u64 = (1 << 2) | (1 << 6) | (1 << 10);
        let shared_bits = U::to_u64(new) & SHARED_MASK;
        let siblings: &[CsrSpecifier] = match self.registers[ix].specifier {
            specifier::MIP | specifier::HIP | specifier::HVIP | specifier::VSIP => {
                &[specifier::MIP, specifier::HIP, specifier::HVIP, specifier::VSIP]
            }
            specifier::MIE | specifier::HIE | specifier::VSIE => {
                &[specifier::MIE, specifier::HIE, specifier::VSIE]
            }
            specifier::MIDELEG | specifier::HIDELEG => &[specifier::MIDELEG, specifier::HIDELEG],
            _ => return,
        };
        for &sibling in siblings {
            let Some(&sib_ix) = self.by_specifier.get(&sibling) else {
                continue;
            };
            if sib_ix == ix {
                continue;
            }
            let sib_value = U::to_u64(self.cell_value(sib_ix));
            let updated = (sib_value & !SHARED_MASK) | shared_bits;
            self.set_cell_value(sib_ix, U::from_u64(updated));
        }
    }

    /// Resets every owned storage cell to its configured reset value and clears the last-written
    /// set. Aliased registers have no independent reset value; resetting their target cell resets
    /// their view too.
    pub fn reset(&mut self) {
        for ix in 0..self.registers.len() {
            if let StorageRef::Owned(cell_ix) = self.registers[ix].storage {
                self.cells[cell_ix].set(self.registers[ix].reset_value);
            }
            self.registers[ix].prev_value = None;
        }
        self.counters.borrow_mut().fill(0);
        self.last_written.clear();
    }

    /// CSR numbers written since the last [`CsrFile::clear_last_written`], in write order.
    pub fn last_written(&self) -> impl Iterator<Item = CsrSpecifier> + '_ {
        self.last_written.iter().map(|&ix| self.registers[ix].specifier)
    }

    /// Clears the last-written set and, per register, the guard that pins
    /// [`CsrFile::prev_value`] to the value held before the first write since the last clear.
    /// The Hart's retire loop calls this once per retired instruction, after the MCM/trap logic
    /// has had a chance to read each register's pre-instruction value.
    pub fn clear_last_written(&mut self) {
        for &ix in &self.last_written {
            self.registers[ix].prev_value = None;
        }
        self.last_written.clear();
    }

    /// The value CSR `specifier` held before the first write since the last
    /// [`CsrFile::clear_last_written`], or its current value if no write has happened since then.
    /// Lets the MCM checker and trap-entry logic recover a CSR's pre-instruction value even after
    /// it has been written more than once in the same instruction (e.g. a CSR write followed by
    /// a side effect that touches the same register again).
    pub fn prev_value(&self, specifier: CsrSpecifier) -> Option<U> {
        let ix = self.by_specifier.get(&specifier).copied()?;
        Some(self.registers[ix].prev_value.unwrap_or_else(|| self.read_raw(ix)))
    }

    /// The configured field layout for a CSR, if it has one (used for trace field-diffing).
    pub fn fields_of(&self, specifier: CsrSpecifier) -> Option<&'static [FieldDescriptor]> {
        let ix = self.by_specifier.get(&specifier).copied()?;
        Some(self.registers[ix].fields)
    }

    /// Whether the privileged architecture mandates `specifier`'s presence, distinct from
    /// whether this particular file implements it (`None` if not even defined here).
    pub fn is_mandatory(&self, specifier: CsrSpecifier) -> Option<bool> {
        let ix = self.by_specifier.get(&specifier).copied()?;
        Some(self.registers[ix].mandatory)
    }

    /// A cloneable handle onto the tied performance-counter array, for an external ticker (the
    /// Hart's retire loop) to increment `cycle`/`instret`/`mhpmcounterN` without going through the
    /// CSR write path on every retired instruction.
    pub fn counters_handle(&self) -> Rc<RefCell<[u64; 32]>> {
        Rc::clone(&self.counters)
    }

    /// Builds a second hart's register file sharing this file's cells for every CSR name present
    /// in `shared`, and independent cells for everything else. Used for CSRs the privileged
    /// architecture defines as a single instance visible to every hart (implementations vary;
    /// this crate leaves the choice to the caller rather than hardcoding one).
    pub fn new_sharing(&self, shared: &[CsrSpecifier]) -> Self
    where
        U: 'static,
    {
        let mut file = Self::new();
        for reg in &self.registers {
            let spec = CsrRegisterSpec {
                specifier: reg.specifier,
                name: reg.name,
                reset_value: reg.reset_value,
                write_mask: reg.write_mask,
                poke_mask: reg.poke_mask,
                read_mask: reg.read_mask,
                fields: reg.fields,
                mandatory: reg.mandatory,
            };
            if shared.contains(&reg.specifier) {
                if let StorageRef::Owned(cell_ix) = reg.storage {
                    let shared_cell = Rc::clone(&self.cells[cell_ix]);
                    let new_cell_ix = file.cells.len();
                    file.cells.push(shared_cell);
                    file.push_register(CsrRegister {
                        storage: StorageRef::Owned(new_cell_ix),
                        ..clone_register(reg, &spec)
                    });
                    continue;
                }
            }
            file.define(spec);
            let new_ix = file.registers.len() - 1;
            file.registers[new_ix].side_effect = reg.side_effect;
            file.registers[new_ix].tied_counter = reg.tied_counter;
        }
        file
    }
}

impl<U: Xlen> Default for CsrFile<U> {
    fn default() -> Self {
        Self::new()
    }
}

fn extract_field(value: u64, name: &str) -> u64 {
    fields::MSTATUS_FIELDS
        .iter()
        .find(|f| f.name == name)
        .map(|f| f.extract(value))
        .unwrap_or(0)
}

fn clone_register<U: Xlen>(reg: &CsrRegister<U>, spec: &CsrRegisterSpec<U>) -> CsrRegister<U> {
    CsrRegister {
        specifier: spec.specifier,
        name: spec.name,
        storage: reg.storage,
        reset_value: spec.reset_value,
        write_mask: spec.write_mask,
        poke_mask: spec.poke_mask,
        read_mask: spec.read_mask,
        implemented: reg.implemented,
        mandatory: spec.mandatory,
        debug_only: reg.debug_only,
        hypervisor_only: reg.hypervisor_only,
        maps_to_virtual: reg.maps_to_virtual,
        fields: reg.fields,
        side_effect: reg.side_effect,
        tied_counter: reg.tied_counter,
        prev_value: None,
    }
}

/// Populates `file` with the CSR set this crate models, wired up with the privileged
/// architecture's aliasing and side effects. Exposed as a free function (rather than a
/// `CsrFile` constructor) so tests can build a minimal file with only the registers they
/// exercise.
pub fn define_standard_registers<U: Xlen>(file: &mut CsrFile<U>) {
    use specifier::*;

    file.define(CsrRegisterSpec::new(MSTATUS, "mstatus").fields(fields::MSTATUS_FIELDS).mandatory());
    file.with_side_effect(SideEffect::MstatusLegalize);
    file.alias(
        MSTATUS,
        CsrRegisterSpec::new(SSTATUS, "sstatus").masks(
            U::from_u64(0x0000_0000_800D_E762),
            U::from_u64(0x0000_0000_800D_E762),
            U::from_u64(0x0000_0000_800D_E762),
        ),
    );
    if U::BITS == 64 {
        file.define(CsrRegisterSpec::new(MSTATUSH, "mstatush").read_only());
    }
    file.define(CsrRegisterSpec::new(MISA, "misa").mandatory());
    file.define(CsrRegisterSpec::new(MEDELEG, "medeleg"));
    file.define(CsrRegisterSpec::new(MIDELEG, "mideleg"));
    file.with_side_effect(SideEffect::HypervisorAliasPropagate);
    file.define(CsrRegisterSpec::new(MIE, "mie").mandatory());
    file.with_side_effect(SideEffect::HypervisorAliasPropagate);
    file.alias(MIE, CsrRegisterSpec::new(SIE, "sie").masks(U::from_u64(0x222), U::from_u64(0x222), U::from_u64(0x222)));
    file.define(CsrRegisterSpec::new(MTVEC, "mtvec").mandatory());
    file.alias(MTVEC, CsrRegisterSpec::new(STVEC, "stvec"));
    file.define(CsrRegisterSpec::new(MCOUNTEREN, "mcounteren"));
    file.alias(MCOUNTEREN, CsrRegisterSpec::new(SCOUNTEREN, "scounteren"));
    file.define(CsrRegisterSpec::new(MENVCFG, "menvcfg"));
    file.alias(MENVCFG, CsrRegisterSpec::new(SENVCFG, "senvcfg"));
    if U::BITS == 64 {
        file.define(CsrRegisterSpec::new(MENVCFGH, "menvcfgh"));
    }
    file.define(CsrRegisterSpec::new(MSECCFG, "mseccfg"));
    if U::BITS == 64 {
        file.define(CsrRegisterSpec::new(MSECCFGH, "mseccfgh"));
    }

    file.define(CsrRegisterSpec::new(MSCRATCH, "mscratch").mandatory());
    file.alias(MSCRATCH, CsrRegisterSpec::new(SSCRATCH, "sscratch"));
    file.define(CsrRegisterSpec::new(MEPC, "mepc").mandatory());
    file.alias(MEPC, CsrRegisterSpec::new(SEPC, "sepc"));
    file.define(CsrRegisterSpec::new(MCAUSE, "mcause").mandatory());
    file.alias(MCAUSE, CsrRegisterSpec::new(SCAUSE, "scause"));
    file.define(CsrRegisterSpec::new(MTVAL, "mtval").mandatory());
    file.alias(MTVAL, CsrRegisterSpec::new(STVAL, "stval"));
    file.define(CsrRegisterSpec::new(MIP, "mip").mandatory());
    file.with_side_effect(SideEffect::HypervisorAliasPropagate);
    file.alias(MIP, CsrRegisterSpec::new(SIP, "sip").masks(U::from_u64(0x222), U::from_u64(0x222), U::from_u64(0x222)));
    file.define(CsrRegisterSpec::new(MTINST, "mtinst"));
    file.define(CsrRegisterSpec::new(MTVAL2, "mtval2"));

    file.define(CsrRegisterSpec::new(SATP, "satp"));
    file.define(CsrRegisterSpec::new(SCONTEXT, "scontext"));

    file.define(CsrRegisterSpec::new(HSTATUS, "hstatus"));
    file.define(CsrRegisterSpec::new(HEDELEG, "hedeleg"));
    file.define(CsrRegisterSpec::new(HIDELEG, "hideleg"));
    file.with_side_effect(SideEffect::HypervisorAliasPropagate);
    file.define(CsrRegisterSpec::new(HIE, "hie"));
    file.with_side_effect(SideEffect::HypervisorAliasPropagate);
    file.define(CsrRegisterSpec::new(HTIMEDELTA, "htimedelta"));
    if U::BITS == 32 {
        file.define(CsrRegisterSpec::new(HTIMEDELTAH, "htimedeltah"));
    }
    file.define(CsrRegisterSpec::new(HCOUNTEREN, "hcounteren"));
    file.define(CsrRegisterSpec::new(HGEIE, "hgeie"));
    file.define(CsrRegisterSpec::new(HTVAL, "htval"));
    file.define(CsrRegisterSpec::new(HIP, "hip"));
    file.with_side_effect(SideEffect::HypervisorAliasPropagate);
    file.define(CsrRegisterSpec::new(HVIP, "hvip"));
    file.with_side_effect(SideEffect::HypervisorAliasPropagate);
    file.define(CsrRegisterSpec::new(HTINST, "htinst"));
    file.define(CsrRegisterSpec::new(HGATP, "hgatp"));
    file.define(CsrRegisterSpec::new(HENVCFG, "henvcfg"));
    if U::BITS == 64 {
        file.define(CsrRegisterSpec::new(HENVCFGH, "henvcfgh"));
    }
    file.define(CsrRegisterSpec::new(HCONTEXT, "hcontext"));
    file.define(CsrRegisterSpec::new(HGEIP, "hgeip").read_only());

    file.define(CsrRegisterSpec::new(VSSTATUS, "vsstatus").fields(fields::MSTATUS_FIELDS));
    file.define(CsrRegisterSpec::new(VSIE, "vsie"));
    file.with_side_effect(SideEffect::HypervisorAliasPropagate);
    file.define(CsrRegisterSpec::new(VSTVEC, "vstvec"));
    file.define(CsrRegisterSpec::new(VSSCRATCH, "vsscratch"));
    file.define(CsrRegisterSpec::new(VSEPC, "vsepc"));
    file.define(CsrRegisterSpec::new(VSCAUSE, "vscause"));
    file.define(CsrRegisterSpec::new(VSTVAL, "vstval"));
    file.define(CsrRegisterSpec::new(VSIP, "vsip"));
    file.with_side_effect(SideEffect::HypervisorAliasPropagate);
    file.define(CsrRegisterSpec::new(VSATP, "vsatp"));

    file.define(CsrRegisterSpec::new(MVENDORID, "mvendorid").read_only().mandatory());
    file.define(CsrRegisterSpec::new(MARCHID, "marchid").read_only().mandatory());
    file.define(CsrRegisterSpec::new(MIMPID, "mimpid").read_only().mandatory());
    file.define(CsrRegisterSpec::new(MHARTID, "mhartid").read_only().mandatory());
    file.define(CsrRegisterSpec::new(MCONFIGPTR, "mconfigptr").read_only().mandatory());

    file.define_range(PMPCFG0, 16, |i| pmp_cfg_name(i), U::ZERO, U::ALL_ONES);
    file.define_range(PMPADDR0, 64, |i| pmp_addr_name(i), U::ZERO, U::ALL_ONES);

    file.define(CsrRegisterSpec::new(MCOUNTINHIBIT, "mcountinhibit"));
    file.define_range(MHPMEVENT3, 29, |i| mhpmevent_name(i), U::ZERO, U::ALL_ONES);

    file.define(CsrRegisterSpec::new(MCYCLE, "mcycle").mandatory());
    file.with_tied_counter(0, CounterHalf::Full);
    file.define(CsrRegisterSpec::new(MINSTRET, "minstret").mandatory());
    file.with_tied_counter(2, CounterHalf::Full);
    for n in 3..=31u8 {
        file.define(CsrRegisterSpec::new(mhpmcounter(n), mhpmcounter_name(n)));
        file.with_tied_counter(n as usize, CounterHalf::Full);
    }
    if U::BITS == 32 {
        file.define(CsrRegisterSpec::new(MCYCLEH, "mcycleh"));
        file.with_tied_counter(0, CounterHalf::High);
        file.define(CsrRegisterSpec::new(MINSTRETH, "minstreth"));
        file.with_tied_counter(2, CounterHalf::High);
        for n in 3..=31u8 {
            file.define(CsrRegisterSpec::new(mhpmcounter_h(n), mhpmcounter_h_name(n)));
            file.with_tied_counter(n as usize, CounterHalf::High);
        }
    }

    file.define(CsrRegisterSpec::new(CYCLE, "cycle").read_only().mandatory());
    file.with_tied_counter(0, CounterHalf::Full);
    file.define(CsrRegisterSpec::new(TIME, "time").read_only().mandatory());
    file.with_tied_counter(1, CounterHalf::Full);
    file.define(CsrRegisterSpec::new(INSTRET, "instret").read_only().mandatory());
    file.with_tied_counter(2, CounterHalf::Full);
    for n in 3..=31u8 {
        file.define(CsrRegisterSpec::new(hpmcounter(n), hpmcounter_name(n)).read_only());
        file.with_tied_counter(n as usize, CounterHalf::Full);
    }

    file.define(CsrRegisterSpec::new(FFLAGS, "fflags").masks(U::from_u64(0x1F), U::from_u64(0x1F), U::from_u64(0x1F)));
    file.define(CsrRegisterSpec::new(FRM, "frm").masks(U::from_u64(0x7), U::from_u64(0x7), U::from_u64(0x7)));
    file.define(
        CsrRegisterSpec::new(FCSR, "fcsr")
            .masks(U::from_u64(0xFF), U::from_u64(0xFF), U::from_u64(0xFF))
            .fields(fields::FCSR_FIELDS),
    );
    file.with_side_effect(SideEffect::FcsrCompose);

    file.define(CsrRegisterSpec::new(VSTART, "vstart"));
    file.define(CsrRegisterSpec::new(VXSAT, "vxsat").masks(U::from_u64(1), U::from_u64(1), U::from_u64(1)));
    file.define(CsrRegisterSpec::new(VXRM, "vxrm").masks(U::from_u64(0x3), U::from_u64(0x3), U::from_u64(0x3)));
    file.define(
        CsrRegisterSpec::new(VCSR, "vcsr")
            .masks(U::from_u64(0x7), U::from_u64(0x7), U::from_u64(0x7))
            .fields(fields::VCSR_FIELDS),
    );
    file.with_side_effect(SideEffect::VcsrCompose);
    file.define(CsrRegisterSpec::new(VL, "vl").read_only());
    file.define(CsrRegisterSpec::new(VTYPE, "vtype").read_only());
    file.define(CsrRegisterSpec::new(VLENB, "vlenb").read_only());

    file.define(CsrRegisterSpec::new(TSELECT, "tselect"));
    file.define(CsrRegisterSpec::new(TDATA1, "tdata1"));
    file.define(CsrRegisterSpec::new(TDATA2, "tdata2"));
    file.define(CsrRegisterSpec::new(TDATA3, "tdata3"));
    file.define(CsrRegisterSpec::new(TINFO, "tinfo").read_only());
    file.define(CsrRegisterSpec::new(TCONTROL, "tcontrol"));
    file.define(CsrRegisterSpec::new(MCONTEXT, "mcontext"));

    file.define(CsrRegisterSpec::new(DCSR, "dcsr"));
    file.define(CsrRegisterSpec::new(DPC, "dpc"));
    file.define(CsrRegisterSpec::new(DSCRATCH0, "dscratch0"));
    file.define(CsrRegisterSpec::new(DSCRATCH1, "dscratch1"));
}

fn pmp_cfg_name(i: u16) -> &'static str {
    const NAMES: [&str; 16] = [
        "pmpcfg0", "pmpcfg1", "pmpcfg2", "pmpcfg3", "pmpcfg4", "pmpcfg5", "pmpcfg6", "pmpcfg7",
        "pmpcfg8", "pmpcfg9", "pmpcfg10", "pmpcfg11", "pmpcfg12", "pmpcfg13", "pmpcfg14", "pmpcfg15",
    ];
    NAMES[i as usize]
}

fn pmp_addr_name(i: u16) -> &'static str {
    macro_rules! n64 {
        ($($i:literal),*) => { [$(concat!("pmpaddr", $i)),*] };
    }
    const NAMES: [&str; 64] = n64!(
        0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24,
        25, 26, 27, 28, 29, 30, 31, 32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46, 47,
        48, 49, 50, 51, 52, 53, 54, 55, 56, 57, 58, 59, 60, 61, 62, 63
    );
    NAMES[i as usize]
}

fn mhpmevent_name(i: u16) -> &'static str {
    static_str_table_3_31(i, "mhpmevent")
}

fn mhpmcounter_name(n: u8) -> &'static str {
    static_str_table_3_31(n as u16 - 3, "mhpmcounter")
}

fn mhpmcounter_h_name(n: u8) -> &'static str {
    static_str_table_3_31(n as u16 - 3, "mhpmcounterh")
}

fn hpmcounter_name(n: u8) -> &'static str {
    static_str_table_3_31(n as u16 - 3, "hpmcounter")
}

/// Leaks a formatted name for CSR index `3..=31` once, the first time it's requested, and
/// returns the same `'static` string on every later call. `mhpmcounterN`/`mhpmeventN` names are
/// only ever formatted a few dozen times total (once per defined register, at startup), so the
/// one-time leak is simpler than threading an arena through the configuration helpers.
fn static_str_table_3_31(offset: u16, prefix: &str) -> &'static str {
    Box::leak(format!("{prefix}{}", offset + 3).into_boxed_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file32() -> CsrFile<u32> {
        let mut file = CsrFile::new();
        define_standard_registers(&mut file);
        file
    }

    fn file64() -> CsrFile<u64> {
        let mut file = CsrFile::new();
        define_standard_registers(&mut file);
        file
    }

    #[test]
    fn reset_then_read_mstatus_is_zero() {
        let mut file = file64();
        file.reset();
        let v = file.read(specifier::MSTATUS, PrivilegeLevel::Machine, VirtualizationMode::OFF, false);
        assert_eq!(v.unwrap(), 0);
    }

    #[test]
    fn user_mode_cannot_write_mstatus() {
        let mut file = file64();
        file.reset();
        let err = file
            .write(specifier::MSTATUS, PrivilegeLevel::User, VirtualizationMode::OFF, false, 0xFF)
            .unwrap_err();
        assert!(matches!(err, WriteError::Access(AccessError::Privileged { .. })));
    }

    #[test]
    fn mpp_reserved_level_is_legalized_to_user() {
        let mut file = file64();
        file.reset();
        // MPP (bits 12:11) = 0b10, the reserved level.
        let reserved_mpp = 0b10u64 << 11;
        file.write(
            specifier::MSTATUS,
            PrivilegeLevel::Machine,
            VirtualizationMode::OFF,
            false,
            reserved_mpp,
        )
        .unwrap();
        let after = file
            .read(specifier::MSTATUS, PrivilegeLevel::Machine, VirtualizationMode::OFF, false)
            .unwrap();
        let mpp_field = fields::MSTATUS_FIELDS.iter().find(|f| f.name == "MPP").unwrap();
        assert_eq!(mpp_field.extract(after), RawPrivilegeLevel::User as u64);
    }

    #[test]
    fn sstatus_reads_reflect_mstatus_writes() {
        let mut file = file64();
        file.reset();
        file.write(specifier::MSTATUS, PrivilegeLevel::Machine, VirtualizationMode::OFF, false, 1 << 1)
            .unwrap(); // SIE
        let sstatus = file
            .read(specifier::SSTATUS, PrivilegeLevel::Supervisor, VirtualizationMode::OFF, false)
            .unwrap();
        assert_eq!(sstatus & (1 << 1), 1 << 1);
    }

    #[test]
    fn cycle_is_rejected_as_read_only() {
        let mut file = file64();
        let err = file
            .write(specifier::CYCLE, PrivilegeLevel::Machine, VirtualizationMode::OFF, false, 1)
            .unwrap_err();
        assert!(matches!(err, WriteError::ReadOnly(_)));
    }

    #[test]
    fn mcycle_write_is_visible_through_cycle() {
        let mut file = file64();
        file.write(specifier::MCYCLE, PrivilegeLevel::Machine, VirtualizationMode::OFF, false, 1234)
            .unwrap();
        let cycle = file
            .read(specifier::CYCLE, PrivilegeLevel::User, VirtualizationMode::OFF, false)
            .unwrap();
        assert_eq!(cycle, 1234);
    }

    #[test]
    fn fcsr_write_decomposes_into_fflags_and_frm() {
        let mut file = file64();
        // frm = 0b101, fflags = 0b00011.
        let value = (0b101 << 5) | 0b00011;
        file.write(specifier::FCSR, PrivilegeLevel::User, VirtualizationMode::OFF, false, value)
            .unwrap();
        assert_eq!(
            file.read(specifier::FRM, PrivilegeLevel::User, VirtualizationMode::OFF, false)
                .unwrap(),
            0b101
        );
        assert_eq!(
            file.read(specifier::FFLAGS, PrivilegeLevel::User, VirtualizationMode::OFF, false)
                .unwrap(),
            0b00011
        );
    }

    #[test]
    fn frm_write_is_visible_through_fcsr() {
        let mut file = file64();
        file.write(specifier::FRM, PrivilegeLevel::User, VirtualizationMode::OFF, false, 0b11)
            .unwrap();
        let fcsr = file
            .read(specifier::FCSR, PrivilegeLevel::User, VirtualizationMode::OFF, false)
            .unwrap();
        assert_eq!((fcsr >> 5) & 0x7, 0b11);
    }

    #[test]
    fn hypervisor_csr_rejected_while_virtualized() {
        let mut file = file64();
        let err = file
            .write(specifier::HSTATUS, PrivilegeLevel::Machine, VirtualizationMode::ON, false, 0)
            .unwrap_err();
        assert!(matches!(err, WriteError::Access(AccessError::Virtualized(_))));
    }

    #[test]
    fn sstatus_write_while_virtualized_redirects_to_vsstatus() {
        let mut file = file64();
        file.write(specifier::SSTATUS, PrivilegeLevel::Supervisor, VirtualizationMode::ON, false, 1 << 1)
            .unwrap();
        let vsstatus = file
            .read(specifier::VSSTATUS, PrivilegeLevel::Supervisor, VirtualizationMode::OFF, false)
            .unwrap();
        assert_eq!(vsstatus & (1 << 1), 1 << 1);
        // mstatus itself is untouched: the write landed on vsstatus's own cell.
        let mstatus = file
            .read(specifier::MSTATUS, PrivilegeLevel::Machine, VirtualizationMode::OFF, false)
            .unwrap();
        assert_eq!(mstatus & (1 << 1), 0);
    }

    #[test]
    fn last_written_tracks_write_order() {
        let mut file = file64();
        file.write(specifier::MEPC, PrivilegeLevel::Machine, VirtualizationMode::OFF, false, 0x1000)
            .unwrap();
        file.write(specifier::MCAUSE, PrivilegeLevel::Machine, VirtualizationMode::OFF, false, 2)
            .unwrap();
        let written: Vec<_> = file.last_written().collect();
        assert_eq!(written, vec![specifier::MEPC, specifier::MCAUSE]);
        file.clear_last_written();
        assert_eq!(file.last_written().count(), 0);
    }

    #[test]
    fn prev_value_survives_a_second_write_until_cleared() {
        let mut file = file64();
        file.write(specifier::MEPC, PrivilegeLevel::Machine, VirtualizationMode::OFF, false, 0x1000)
            .unwrap();
        // A second write in the same instruction must not move prev_value off the pre-instruction
        // value.
        file.write(specifier::MEPC, PrivilegeLevel::Machine, VirtualizationMode::OFF, false, 0x2000)
            .unwrap();
        assert_eq!(file.prev_value(specifier::MEPC).unwrap(), 0);
        let current = file
            .read(specifier::MEPC, PrivilegeLevel::Machine, VirtualizationMode::OFF, false)
            .unwrap();
        assert_eq!(current, 0x2000);

        file.clear_last_written();
        assert_eq!(file.prev_value(specifier::MEPC).unwrap(), 0x2000);
    }

    #[test]
    fn mandatory_registers_are_flagged() {
        let file = file64();
        assert_eq!(file.is_mandatory(specifier::MSTATUS), Some(true));
        assert_eq!(file.is_mandatory(specifier::MEDELEG), Some(false));
        assert_eq!(file.is_mandatory(0x555), None);
    }

    #[test]
    fn poke_bypasses_privilege_check() {
        let mut file = file64();
        // mip is machine-only; poke still succeeds (used to model external interrupt pins).
        file.poke(specifier::MIP, 1 << 1).unwrap();
        let v = file
            .read(specifier::MIP, PrivilegeLevel::Machine, VirtualizationMode::OFF, false)
            .unwrap();
        assert_eq!(v & (1 << 1), 1 << 1);
    }

    #[test]
    fn poke_mip_propagates_shared_bits_to_vsip() {
        let mut file = file64();
        file.poke(specifier::MIP, 1 << 2).unwrap(); // VSSIP
        let vsip = file.peek(specifier::VSIP).unwrap();
        assert_eq!(vsip & (1 << 2), 1 << 2);
    }

    #[test]
    fn rv32_defines_high_halves_rv64_does_not() {
        let f32 = file32();
        let f64_ = file64();
        assert!(f32.peek(specifier::MCYCLEH).is_some());
        assert!(f64_.peek(specifier::MCYCLEH).is_none());
    }

    #[test]
    fn unimplemented_specifier_is_rejected() {
        let file = file64();
        let err = file
            .read(0x555, PrivilegeLevel::Machine, VirtualizationMode::OFF, false)
            .unwrap_err();
        assert!(matches!(err, AccessError::NotImplemented(_)));
    }
}
