//! The debug-trigger subsystem: `tselect`/`tdata1..3`/`tinfo`/`tcontrol` and the match/chain
//! engine that evaluates them against retiring instructions and load/store operations.
//!
//! Grounded on the reference simulator's `Trigger<URV>`/`Triggers<URV>` pair. `Trigger` owns one
//! slot's three data words plus its chain-membership bookkeeping; `Triggers` owns the slot array
//! and the cross-slot chain/dmode policy.

pub mod types;

use log::{trace, warn};

use crate::error::TriggerWriteError;
use crate::width::Xlen;
use crate::{PrivilegeLevel, VirtualizationMode};
use types::{Etrigger, Icount, Itrigger, Match, Mcontrol, Mcontrol6, Tinfo, TriggerAction, TriggerType};

/// Configuration fixed at construction time for this subsystem.
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    /// Bitmask of [`TriggerType`] encodings this hart's trigger slots can be configured as,
    /// reported through `tinfo`.
    pub supported_types: u16,
    /// Whether a write that would create a trigger chain whose members disagree on `dmode` is
    /// rejected outright (`true`) or silently defanged by clearing the new member's chain bit
    /// (`false`). The debug-trigger architecture doesn't mandate one over the other; this crate
    /// defaults to rejecting, since a silently-defanged chain is a worse debugging experience
    /// than a write error pointing at the offending write.
    pub reject_cross_dmode_chain: bool,
    /// Whether triggers are permitted to fire while running in machine mode.
    pub enable_machine_mode: bool,
    /// Whether `tcontrol.mte`/`tcontrol.mpte` gate firing while in machine mode (Smdbltrp-style
    /// nesting control); when `false`, triggers are unconditionally live in machine mode
    /// whenever `enable_machine_mode` allows it.
    pub tcontrol_enabled: bool,
    /// Bitmask of [`TriggerAction`] encodings a write may legally select; action `0`
    /// (`RaiseBreak`) is always supported regardless of this mask.
    pub supported_actions: u16,
    /// Whether a write requesting an unsupported action is defanged by clearing it to 0
    /// (`true`) or by preserving the trigger's previous action (`false`).
    pub clear_unsupported_action: bool,
    /// Mask of the `tdata1` bits visible on read while the slot's type is `Disabled`; all other
    /// bits read as zero. `None` (the default) uses the top 5 bits (type nibble + dmode) of
    /// whatever width the trigger engine is configured for.
    pub disabled_read_mask: Option<u64>,
    /// Upper bound (in bits) on the don't-care suffix an `mcontrol` NAPOT match (`maskmax`) may
    /// use; `mcontrol.mask_max` is clamped to this on every `tdata1` write. `mcontrol6` carries
    /// no `maskMax` field and is unaffected.
    pub maskmax: u8,
    /// Per-slot `tdata1` write mask: `(value & mask) | (old & !mask)` on every `write_data1`.
    /// A slot past the end of this vector uses [`DEFAULT_DATA1_WRITE_MASK`].
    pub data1_write_mask: Vec<u64>,
    /// Per-slot `tdata2` write mask. Defaults to [`DEFAULT_DATA2_WRITE_MASK`] (all bits live).
    pub data2_write_mask: Vec<u64>,
    /// Per-slot `tdata3` write mask. Defaults to [`DEFAULT_DATA3_WRITE_MASK`] (zero: `tdata3` is
    /// a placeholder extension field this crate does not interpret).
    pub data3_write_mask: Vec<u64>,
    /// Per-slot `tdata1` poke mask, applied the same way as `data1_write_mask` but by
    /// [`Triggers::poke_data1`], which bypasses the legality/legalization gate `write_data1`
    /// applies.
    pub data1_poke_mask: Vec<u64>,
    /// Per-slot `tdata2` poke mask.
    pub data2_poke_mask: Vec<u64>,
    /// Per-slot `tdata3` poke mask.
    pub data3_poke_mask: Vec<u64>,
    /// Per-slot `tdata1` reset value, used by [`Triggers::reset`] in place of an unconditional
    /// all-zero word.
    pub data1_reset: Vec<u64>,
    /// Per-slot `tdata2` reset value.
    pub data2_reset: Vec<u64>,
    /// Per-slot `tdata3` reset value.
    pub data3_reset: Vec<u64>,
}

/// Default `tdata1`/`tdata2` write and poke mask: every bit is software-settable.
pub const DEFAULT_DATA1_WRITE_MASK: u64 = u64::MAX;
pub const DEFAULT_DATA2_WRITE_MASK: u64 = u64::MAX;
/// `tdata3` is an unimplemented placeholder extension field in this crate, matching
/// `data3WriteMask_`'s `0` default in the reference simulator.
pub const DEFAULT_DATA3_WRITE_MASK: u64 = 0;
pub const DEFAULT_DATA1_POKE_MASK: u64 = u64::MAX;
pub const DEFAULT_DATA2_POKE_MASK: u64 = u64::MAX;
pub const DEFAULT_DATA3_POKE_MASK: u64 = 0;
pub const DEFAULT_RESET_VALUE: u64 = 0;
/// `mcontrol.mask_max` is a 6-bit field; this default leaves it unrestricted.
pub const DEFAULT_MASKMAX: u8 = 63;

/// The don't-care suffix mask for a NAPOT (`Masked`/`NotMasked`) match: the number of trailing
/// one-bits in `tdata2` (at least 1, since the LSB is always treated as don't-care), bounded by
/// `maskmax` (`mcontrol.mask_max`, or [`TriggerConfig::maskmax`] for `mcontrol6`, which has no
/// `maskMax` field of its own).
pub fn napot_mask(tdata2: u64, maskmax: u8) -> u64 {
    let trailing_ones = (tdata2 | 1).trailing_ones().min(maskmax as u32);
    if trailing_ones >= 64 {
        u64::MAX
    } else {
        (1u64 << trailing_ones) - 1
    }
}

fn supported_actions_mask() -> u16 {
    (1 << TriggerAction::RaiseBreak.to_bits())
        | (1 << TriggerAction::EnterDebug.to_bits())
        | (1 << TriggerAction::StartTrace.to_bits())
        | (1 << TriggerAction::StopTrace.to_bits())
        | (1 << TriggerAction::EmitTrace.to_bits())
        | (1 << TriggerAction::External0.to_bits())
        | (1 << TriggerAction::External1.to_bits())
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            supported_types: supported_types_mask(),
            reject_cross_dmode_chain: true,
            enable_machine_mode: true,
            tcontrol_enabled: false,
            supported_actions: supported_actions_mask(),
            clear_unsupported_action: true,
            disabled_read_mask: None,
            maskmax: DEFAULT_MASKMAX,
            data1_write_mask: Vec::new(),
            data2_write_mask: Vec::new(),
            data3_write_mask: Vec::new(),
            data1_poke_mask: Vec::new(),
            data2_poke_mask: Vec::new(),
            data3_poke_mask: Vec::new(),
            data1_reset: Vec::new(),
            data2_reset: Vec::new(),
            data3_reset: Vec::new(),
        }
    }
}

impl TriggerConfig {
    fn mask_for(masks: &[u64], ix: usize, default: u64) -> u64 {
        masks.get(ix).copied().unwrap_or(default)
    }

    fn data1_write_mask(&self, ix: usize) -> u64 {
        Self::mask_for(&self.data1_write_mask, ix, DEFAULT_DATA1_WRITE_MASK)
    }

    fn data2_write_mask(&self, ix: usize) -> u64 {
        Self::mask_for(&self.data2_write_mask, ix, DEFAULT_DATA2_WRITE_MASK)
    }

    fn data3_write_mask(&self, ix: usize) -> u64 {
        Self::mask_for(&self.data3_write_mask, ix, DEFAULT_DATA3_WRITE_MASK)
    }

    fn data1_poke_mask(&self, ix: usize) -> u64 {
        Self::mask_for(&self.data1_poke_mask, ix, DEFAULT_DATA1_POKE_MASK)
    }

    fn data2_poke_mask(&self, ix: usize) -> u64 {
        Self::mask_for(&self.data2_poke_mask, ix, DEFAULT_DATA2_POKE_MASK)
    }

    fn data3_poke_mask(&self, ix: usize) -> u64 {
        Self::mask_for(&self.data3_poke_mask, ix, DEFAULT_DATA3_POKE_MASK)
    }

    fn data1_reset(&self, ix: usize) -> u64 {
        Self::mask_for(&self.data1_reset, ix, DEFAULT_RESET_VALUE)
    }

    fn data2_reset(&self, ix: usize) -> u64 {
        Self::mask_for(&self.data2_reset, ix, DEFAULT_RESET_VALUE)
    }

    fn data3_reset(&self, ix: usize) -> u64 {
        Self::mask_for(&self.data3_reset, ix, DEFAULT_RESET_VALUE)
    }
}

fn supported_types_mask() -> u16 {
    (1 << TriggerType::Mcontrol.to_bits())
        | (1 << TriggerType::Icount.to_bits())
        | (1 << TriggerType::Itrigger.to_bits())
        | (1 << TriggerType::Etrigger.to_bits())
        | (1 << TriggerType::Mcontrol6.to_bits())
}

struct Trigger<U: Xlen> {
    tdata1: U,
    tdata2: U,
    tdata3: U,
    tripped: bool,
    local_hit: bool,
}

impl<U: Xlen> Trigger<U> {
    fn new() -> Self {
        Self {
            tdata1: U::ZERO,
            tdata2: U::ZERO,
            tdata3: U::ZERO,
            tripped: false,
            local_hit: false,
        }
    }

    fn reset_to(data1: u64, data2: u64, data3: u64) -> Self {
        Self {
            tdata1: U::from_u64(data1),
            tdata2: U::from_u64(data2),
            tdata3: U::from_u64(data3),
            tripped: false,
            local_hit: false,
        }
    }

    fn ty(&self, width_bits: u32) -> TriggerType {
        TriggerType::from_bits(types::type_bits(U::to_u64(self.tdata1), width_bits))
    }

    fn dmode(&self, width_bits: u32) -> bool {
        types::dmode_bit(U::to_u64(self.tdata1), width_bits)
    }

    fn chain_bit(&self, width_bits: u32) -> bool {
        match self.ty(width_bits) {
            TriggerType::Mcontrol => Mcontrol::unpack(U::to_u64(self.tdata1), width_bits).chain,
            TriggerType::Mcontrol6 => Mcontrol6::unpack(U::to_u64(self.tdata1), width_bits).chain,
            _ => false,
        }
    }
}

/// The array of trigger slots for one hart.
pub struct Triggers<U: Xlen> {
    triggers: Vec<Trigger<U>>,
    config: TriggerConfig,
    width_bits: u32,
    tcontrol: U,
    last_written: Vec<usize>,
    _phantom: std::marker::PhantomData<U>,
}

impl<U: Xlen> Triggers<U> {
    pub fn new(count: usize, config: TriggerConfig) -> Self {
        let triggers = (0..count)
            .map(|ix| {
                Trigger::reset_to(
                    config.data1_reset(ix),
                    config.data2_reset(ix),
                    config.data3_reset(ix),
                )
            })
            .collect();
        Self {
            triggers,
            config,
            width_bits: U::BITS,
            tcontrol: U::ZERO,
            last_written: Vec::new(),
            _phantom: std::marker::PhantomData,
        }
    }

    pub fn size(&self) -> usize {
        self.triggers.len()
    }

    /// Resets every slot to its configured reset value (all-zero unless
    /// [`TriggerConfig::data1_reset`]/`data2_reset`/`data3_reset` override it for that slot).
    pub fn reset(&mut self) {
        for ix in 0..self.triggers.len() {
            self.triggers[ix] = Trigger::reset_to(
                self.config.data1_reset(ix),
                self.config.data2_reset(ix),
                self.config.data3_reset(ix),
            );
        }
        self.tcontrol = U::ZERO;
        self.last_written.clear();
    }

    fn check_index(&self, ix: usize) -> Result<(), TriggerWriteError> {
        if ix >= self.triggers.len() {
            Err(TriggerWriteError::OutOfRange(ix))
        } else {
            Ok(())
        }
    }

    /// Reads `tdata1`. While the slot's type is `Disabled`, only the bits named by
    /// [`TriggerConfig::disabled_read_mask`] (the type nibble and dmode bit, by default) are
    /// visible; the rest reads as zero.
    pub fn read_data1(&self, ix: usize) -> Result<U, TriggerWriteError> {
        self.check_index(ix)?;
        let trigger = &self.triggers[ix];
        if trigger.ty(self.width_bits) == TriggerType::Disabled {
            let mask = self
                .config
                .disabled_read_mask
                .unwrap_or_else(|| ((1u64 << 5) - 1) << (self.width_bits - 5));
            return Ok(U::from_u64(U::to_u64(trigger.tdata1) & mask));
        }
        Ok(trigger.tdata1)
    }

    pub fn read_data2(&self, ix: usize) -> Result<U, TriggerWriteError> {
        self.check_index(ix)?;
        Ok(self.triggers[ix].tdata2)
    }

    pub fn read_data3(&self, ix: usize) -> Result<U, TriggerWriteError> {
        self.check_index(ix)?;
        Ok(self.triggers[ix].tdata3)
    }

    pub fn read_info(&self, ix: usize) -> Result<U, TriggerWriteError> {
        self.check_index(ix)?;
        let tinfo = Tinfo {
            supported_types: self.config.supported_types,
            version: 1,
        };
        Ok(U::from_u64(tinfo.pack()))
    }

    pub fn read_control(&self) -> U {
        self.tcontrol
    }

    pub fn write_control(&mut self, value: U) {
        self.tcontrol = value;
    }

    /// Legalizes an incoming `tdata1` write: unsupported types are clamped back to the trigger's
    /// previous type (a WARL field, per the debug-trigger spec), and a chain bit that would
    /// create a dmode-mixed chain is either rejected or defanged per
    /// [`TriggerConfig::reject_cross_dmode_chain`].
    pub fn write_data1(
        &mut self,
        ix: usize,
        debug_mode: bool,
        value: U,
    ) -> Result<(), TriggerWriteError> {
        self.check_index(ix)?;
        if self.triggers[ix].dmode(self.width_bits) && !debug_mode {
            return Err(TriggerWriteError::NotInDebugMode(ix));
        }
        let mask = self.config.data1_write_mask(ix);
        let old = U::to_u64(self.triggers[ix].tdata1);
        let value = U::from_u64((U::to_u64(value) & mask) | (old & !mask));
        let requested_type = TriggerType::from_bits(types::type_bits(U::to_u64(value), self.width_bits));
        let mut legalized = value;
        if let TriggerType::Unsupported(bits) = requested_type {
            warn!(requested = bits; "tdata1 write requested an unsupported trigger type, ignoring");
            let mut raw = U::to_u64(value);
            types::set_type_bits(&mut raw, self.width_bits, self.triggers[ix].ty(self.width_bits).to_bits());
            legalized = U::from_u64(raw);
        }
        legalized = self.legalize_action_and_maskmax(ix, legalized);
        let previous = self.triggers[ix].tdata1;
        self.triggers[ix].tdata1 = legalized;

        if self.would_create_cross_dmode_chain(ix) {
            if self.config.reject_cross_dmode_chain {
                self.triggers[ix].tdata1 = previous;
                return Err(TriggerWriteError::CrossDmodeChain(ix));
            }
            warn!(trigger = ix; "write would create a dmode-mixed chain, clearing its chain bit");
            self.clear_chain_bit(ix);
        }

        self.last_written.push(ix);
        trace!(trigger = ix, value:% = format!("{:#x}", U::to_u64(legalized)); "tdata1 write");
        Ok(())
    }

    /// Legalizes `tdata1`'s action field (action 1/`EnterDebug` requires `dmode=1`; an action
    /// outside [`TriggerConfig::supported_actions`] is cleared or rolled back per
    /// [`TriggerConfig::clear_unsupported_action`]) and, for `mcontrol`, clamps `mask_max` to
    /// [`TriggerConfig::maskmax`].
    fn legalize_action_and_maskmax(&self, ix: usize, value: U) -> U {
        let width_bits = self.width_bits;
        let raw = U::to_u64(value);
        let dmode = types::dmode_bit(raw, width_bits);
        let ty = TriggerType::from_bits(types::type_bits(raw, width_bits));
        let previous_raw = U::to_u64(self.triggers[ix].tdata1);

        let legalize_action = |action: TriggerAction, previous: TriggerAction| -> TriggerAction {
            if !dmode && action == TriggerAction::EnterDebug {
                return TriggerAction::RaiseBreak;
            }
            if self.config.supported_actions & (1 << action.to_bits()) == 0 {
                warn!(requested = action.to_bits(); "tdata1 write requested an unsupported action");
                return if self.config.clear_unsupported_action { TriggerAction::RaiseBreak } else { previous };
            }
            action
        };

        let forced = match ty {
            TriggerType::Mcontrol => {
                let mut mc = Mcontrol::unpack(raw, width_bits);
                let prev = Mcontrol::unpack(previous_raw, width_bits);
                mc.action = legalize_action(mc.action, prev.action);
                mc.mask_max = mc.mask_max.min(self.config.maskmax);
                mc.pack(width_bits)
            }
            TriggerType::Mcontrol6 => {
                let mut mc = Mcontrol6::unpack(raw, width_bits);
                let prev = Mcontrol6::unpack(previous_raw, width_bits);
                mc.action = legalize_action(mc.action, prev.action);
                mc.pack(width_bits)
            }
            TriggerType::Icount => {
                let mut ic = Icount::unpack(raw, width_bits);
                let prev = Icount::unpack(previous_raw, width_bits);
                ic.action = legalize_action(ic.action, prev.action);
                ic.pack(width_bits)
            }
            TriggerType::Etrigger => {
                let mut et = Etrigger::unpack(raw, width_bits);
                let prev = Etrigger::unpack(previous_raw, width_bits);
                et.action = legalize_action(et.action, prev.action);
                et.pack(width_bits)
            }
            TriggerType::Itrigger => {
                let mut it = Itrigger::unpack(raw, width_bits);
                let prev = Itrigger::unpack(previous_raw, width_bits);
                it.action = legalize_action(it.action, prev.action);
                it.pack(width_bits)
            }
            _ => raw,
        };
        U::from_u64(forced)
    }

    fn clear_chain_bit(&mut self, ix: usize) {
        let width = self.width_bits;
        let ty = self.triggers[ix].ty(width);
        let mut raw = U::to_u64(self.triggers[ix].tdata1);
        match ty {
            TriggerType::Mcontrol => {
                let mut mc = Mcontrol::unpack(raw, width);
                mc.chain = false;
                raw = mc.pack(width);
            }
            TriggerType::Mcontrol6 => {
                let mut mc = Mcontrol6::unpack(raw, width);
                mc.chain = false;
                raw = mc.pack(width);
            }
            _ => {}
        }
        self.triggers[ix].tdata1 = U::from_u64(raw);
    }

    /// Returns `true` if, with `ix`'s current `tdata1`, the chain `ix` belongs to now contains
    /// members with differing `dmode` bits.
    fn would_create_cross_dmode_chain(&self, ix: usize) -> bool {
        let (begin, end) = self.chain_bounds(ix);
        if end - begin <= 1 {
            return false;
        }
        let first_dmode = self.triggers[begin].dmode(self.width_bits);
        (begin..end).any(|i| self.triggers[i].dmode(self.width_bits) != first_dmode)
    }

    /// A chain is a maximal run of triggers each (except the last) with its `chain` bit set;
    /// `[begin, end)` always contains `ix`.
    fn chain_bounds(&self, ix: usize) -> (usize, usize) {
        let mut begin = ix;
        while begin > 0 && self.triggers[begin - 1].chain_bit(self.width_bits) {
            begin -= 1;
        }
        let mut end = ix;
        while end < self.triggers.len() && self.triggers[end].chain_bit(self.width_bits) {
            end += 1;
        }
        // `end` currently points at the last member with chain_bit set; the chain includes one
        // more trigger (the member that ends it).
        let end = (end + 1).min(self.triggers.len());
        (begin, end)
    }

    pub fn write_data2(&mut self, ix: usize, debug_mode: bool, value: U) -> Result<(), TriggerWriteError> {
        self.check_index(ix)?;
        if self.triggers[ix].dmode(self.width_bits) && !debug_mode {
            return Err(TriggerWriteError::NotInDebugMode(ix));
        }
        let mask = self.config.data2_write_mask(ix);
        let old = U::to_u64(self.triggers[ix].tdata2);
        let new = U::from_u64((U::to_u64(value) & mask) | (old & !mask));
        self.triggers[ix].tdata2 = new;
        self.last_written.push(ix);
        Ok(())
    }

    pub fn write_data3(&mut self, ix: usize, debug_mode: bool, value: U) -> Result<(), TriggerWriteError> {
        self.check_index(ix)?;
        if self.triggers[ix].dmode(self.width_bits) && !debug_mode {
            return Err(TriggerWriteError::NotInDebugMode(ix));
        }
        let mask = self.config.data3_write_mask(ix);
        let old = U::to_u64(self.triggers[ix].tdata3);
        let new = U::from_u64((U::to_u64(value) & mask) | (old & !mask));
        self.triggers[ix].tdata3 = new;
        self.last_written.push(ix);
        Ok(())
    }

    pub fn poke_data1(&mut self, ix: usize, value: U) -> Result<(), TriggerWriteError> {
        self.check_index(ix)?;
        let mask = self.config.data1_poke_mask(ix);
        let old = U::to_u64(self.triggers[ix].tdata1);
        self.triggers[ix].tdata1 = U::from_u64((U::to_u64(value) & mask) | (old & !mask));
        Ok(())
    }

    pub fn poke_data2(&mut self, ix: usize, value: U) -> Result<(), TriggerWriteError> {
        self.check_index(ix)?;
        let mask = self.config.data2_poke_mask(ix);
        let old = U::to_u64(self.triggers[ix].tdata2);
        self.triggers[ix].tdata2 = U::from_u64((U::to_u64(value) & mask) | (old & !mask));
        Ok(())
    }

    pub fn poke_data3(&mut self, ix: usize, value: U) -> Result<(), TriggerWriteError> {
        self.check_index(ix)?;
        let mask = self.config.data3_poke_mask(ix);
        let old = U::to_u64(self.triggers[ix].tdata3);
        self.triggers[ix].tdata3 = U::from_u64((U::to_u64(value) & mask) | (old & !mask));
        Ok(())
    }

    pub fn last_written(&self) -> impl Iterator<Item = usize> + '_ {
        self.last_written.iter().copied()
    }

    pub fn clear_last_written(&mut self) {
        self.last_written.clear();
    }

    pub fn get_hit(&self, ix: usize) -> bool {
        self.triggers.get(ix).map(|t| t.tripped).unwrap_or(false)
    }

    pub fn has_active_trigger(&self) -> bool {
        self.triggers
            .iter()
            .any(|t| !t.ty(self.width_bits).is_disabled())
    }

    /// Whether a trigger with the given privilege enables is live. Used by trigger types
    /// (`mcontrol`, type 2) that predate the hypervisor extension and have no virtualized-mode
    /// enable bits at all: such a trigger simply never fires while `V=1`.
    fn mode_enabled(&self, priv_level: PrivilegeLevel, virt: VirtualizationMode, user: bool, supervisor: bool, machine: bool) -> bool {
        self.mode_enabled_full(priv_level, virt, user, supervisor, machine, false, false)
    }

    /// Same as [`Self::mode_enabled`], but for trigger types that do carry virtualized-mode
    /// enable bits (`mcontrol6`, `icount`, `etrigger`, `itrigger`): while `V=1`, `virt_user`/
    /// `virt_supervisor` gate firing instead of `user`/`supervisor` (machine mode cannot itself be
    /// virtualized).
    fn mode_enabled_full(
        &self,
        priv_level: PrivilegeLevel,
        virt: VirtualizationMode,
        user: bool,
        supervisor: bool,
        machine: bool,
        virt_user: bool,
        virt_supervisor: bool,
    ) -> bool {
        if virt.is_virtual() {
            return match priv_level {
                PrivilegeLevel::User => virt_user,
                PrivilegeLevel::Supervisor => virt_supervisor,
                PrivilegeLevel::Machine => false,
            };
        }
        match priv_level {
            PrivilegeLevel::User => user,
            PrivilegeLevel::Supervisor => supervisor,
            PrivilegeLevel::Machine => machine && self.config.enable_machine_mode,
        }
    }

    fn do_match(item: u64, tdata2: u64, code: Match, maskmax: u8) -> bool {
        let base = match code {
            Match::Equal | Match::NotEqual => item == tdata2,
            Match::Masked | Match::NotMasked => (item & !napot_mask(tdata2, maskmax)) == (tdata2 & !napot_mask(tdata2, maskmax)),
            Match::Ge => item >= tdata2,
            Match::Lt => item < tdata2,
            Match::MaskHighEqualLow | Match::MaskLowEqualHigh | Match::NotMaskHighEqualLow | Match::NotMaskLowEqualHigh => {
                warn!("half-word straddling match codes are not implemented, trigger will not fire");
                false
            }
            Match::Unsupported(_) => false,
        };
        if code.is_negated() {
            !base
        } else {
            base
        }
    }

    /// Evaluates every `mcontrol`/`mcontrol6` load/store-address trigger against a memory
    /// access, firing (and recording chain hits) any whose chain fully matches. Returns the
    /// triggers that tripped, so the caller can decide the resulting action (break vs. enter
    /// debug vs. trace).
    pub fn ld_st_addr_trigger_hit(
        &mut self,
        addr: U,
        is_load: bool,
        priv_level: PrivilegeLevel,
        virt: VirtualizationMode,
    ) -> Vec<usize> {
        self.evaluate_addr_data_triggers(addr, is_load, false, priv_level, virt)
    }

    /// Same as [`Self::ld_st_addr_trigger_hit`] but for the data value of a load/store, matched
    /// against triggers configured with `select=data`.
    pub fn ld_st_data_trigger_hit(
        &mut self,
        data: U,
        is_load: bool,
        priv_level: PrivilegeLevel,
        virt: VirtualizationMode,
    ) -> Vec<usize> {
        self.evaluate_addr_data_triggers(data, is_load, true, priv_level, virt)
    }

    pub fn inst_addr_trigger_hit(&mut self, pc: U, priv_level: PrivilegeLevel, virt: VirtualizationMode) -> Vec<usize> {
        self.evaluate_execute_triggers(pc, false, priv_level, virt)
    }

    pub fn inst_opcode_trigger_hit(&mut self, opcode: U, priv_level: PrivilegeLevel, virt: VirtualizationMode) -> Vec<usize> {
        self.evaluate_execute_triggers(opcode, true, priv_level, virt)
    }

    fn evaluate_addr_data_triggers(
        &mut self,
        compare: U,
        is_load: bool,
        want_data_select: bool,
        priv_level: PrivilegeLevel,
        virt: VirtualizationMode,
    ) -> Vec<usize> {
        for ix in 0..self.triggers.len() {
            let width = self.width_bits;
            let matched = match self.triggers[ix].ty(width) {
                TriggerType::Mcontrol => {
                    let mc = Mcontrol::unpack(U::to_u64(self.triggers[ix].tdata1), width);
                    let relevant = if is_load { mc.load } else { mc.store };
                    relevant
                        && mc.select_data == want_data_select
                        && self.mode_enabled(priv_level, virt, mc.user, mc.supervisor, mc.machine)
                        && Self::do_match(U::to_u64(compare), U::to_u64(self.triggers[ix].tdata2), mc.match_code, mc.mask_max)
                }
                TriggerType::Mcontrol6 => {
                    let mc = Mcontrol6::unpack(U::to_u64(self.triggers[ix].tdata1), width);
                    let relevant = if is_load { mc.load } else { mc.store };
                    relevant
                        && mc.select_data == want_data_select
                        && self.mode_enabled_full(priv_level, virt, mc.user, mc.supervisor, mc.machine, mc.virt_user, mc.virt_supervisor)
                        && Self::do_match(U::to_u64(compare), U::to_u64(self.triggers[ix].tdata2), mc.match_code, self.config.maskmax)
                }
                _ => false,
            };
            self.triggers[ix].local_hit = matched;
        }
        self.collect_chain_hits()
    }

    fn evaluate_execute_triggers(
        &mut self,
        compare: U,
        want_opcode_select: bool,
        priv_level: PrivilegeLevel,
        virt: VirtualizationMode,
    ) -> Vec<usize> {
        for ix in 0..self.triggers.len() {
            let width = self.width_bits;
            let matched = match self.triggers[ix].ty(width) {
                TriggerType::Mcontrol => {
                    let mc = Mcontrol::unpack(U::to_u64(self.triggers[ix].tdata1), width);
                    mc.execute
                        && mc.select_data == want_opcode_select
                        && self.mode_enabled(priv_level, virt, mc.user, mc.supervisor, mc.machine)
                        && Self::do_match(U::to_u64(compare), U::to_u64(self.triggers[ix].tdata2), mc.match_code, mc.mask_max)
                }
                TriggerType::Mcontrol6 => {
                    let mc = Mcontrol6::unpack(U::to_u64(self.triggers[ix].tdata1), width);
                    mc.execute
                        && mc.select_data == want_opcode_select
                        && self.mode_enabled_full(priv_level, virt, mc.user, mc.supervisor, mc.machine, mc.virt_user, mc.virt_supervisor)
                        && Self::do_match(U::to_u64(compare), U::to_u64(self.triggers[ix].tdata2), mc.match_code, self.config.maskmax)
                }
                _ => false,
            };
            self.triggers[ix].local_hit = matched;
        }
        self.collect_chain_hits()
    }

    /// Counts down every live `icount` trigger by one (called once per retired instruction,
    /// before [`Self::clear_last_written`] runs for that instruction). A trigger written by the
    /// very instruction currently retiring is skipped entirely, mirroring `isModified()` in
    /// `evaluateIcount`: writing an icount trigger's data words can never self-trip it. Reaching
    /// a count of zero sets the trigger's `pending` bit but does not fire it; firing is reported
    /// on the next retirement by [`Self::icount_trigger_fired`].
    pub fn evaluate_icount(&mut self, priv_level: PrivilegeLevel, virt: VirtualizationMode) {
        for ix in 0..self.triggers.len() {
            let width = self.width_bits;
            if self.triggers[ix].ty(width) != TriggerType::Icount {
                continue;
            }
            if self.last_written.contains(&ix) {
                continue;
            }
            let mut ic = Icount::unpack(U::to_u64(self.triggers[ix].tdata1), width);
            if !self.mode_enabled(priv_level, virt, ic.user, ic.supervisor, ic.machine) {
                continue;
            }
            if ic.count == 0 {
                continue;
            }
            ic.count -= 1;
            if ic.count == 0 {
                ic.pending = true;
            }
            self.triggers[ix].tdata1 = U::from_u64(ic.pack(width));
        }
    }

    /// Checks every icount trigger's `pending` bit, set by a prior call to
    /// [`Self::evaluate_icount`], and reports it as fired on this retirement if the privilege
    /// filter still matches. Clears `pending` on every matching trigger regardless of outcome,
    /// mirroring `icountTriggerFired`.
    pub fn icount_trigger_fired(&mut self, priv_level: PrivilegeLevel, virt: VirtualizationMode) -> Vec<usize> {
        let mut fired = Vec::new();
        for ix in 0..self.triggers.len() {
            let width = self.width_bits;
            if self.triggers[ix].ty(width) != TriggerType::Icount {
                continue;
            }
            let mut ic = Icount::unpack(U::to_u64(self.triggers[ix].tdata1), width);
            if !self.mode_enabled(priv_level, virt, ic.user, ic.supervisor, ic.machine) {
                continue;
            }
            if ic.pending {
                ic.hit = true;
                self.triggers[ix].tripped = true;
                self.triggers[ix].local_hit = true;
                fired.push(ix);
            }
            ic.pending = false;
            self.triggers[ix].tdata1 = U::from_u64(ic.pack(width));
        }
        fired
    }

    /// Checks every `etrigger` against a just-raised exception cause (`1<<cause` bitmask test
    /// against `tdata2`).
    pub fn exception_trigger_hit(&mut self, cause: u32, priv_level: PrivilegeLevel, virt: VirtualizationMode) -> Vec<usize> {
        let mut fired = Vec::new();
        for ix in 0..self.triggers.len() {
            let width = self.width_bits;
            if self.triggers[ix].ty(width) != TriggerType::Etrigger {
                continue;
            }
            let et = Etrigger::unpack(U::to_u64(self.triggers[ix].tdata1), width);
            if !self.mode_enabled(priv_level, virt, et.user, et.supervisor, et.machine) {
                continue;
            }
            let mask = U::to_u64(self.triggers[ix].tdata2);
            if mask & (1u64 << cause) != 0 {
                self.triggers[ix].tripped = true;
                fired.push(ix);
            }
        }
        fired
    }

    /// Checks every `itrigger` against a just-taken interrupt cause.
    pub fn interrupt_trigger_hit(&mut self, cause: u32, is_nmi: bool, priv_level: PrivilegeLevel, virt: VirtualizationMode) -> Vec<usize> {
        let mut fired = Vec::new();
        for ix in 0..self.triggers.len() {
            let width = self.width_bits;
            if self.triggers[ix].ty(width) != TriggerType::Itrigger {
                continue;
            }
            let it = Itrigger::unpack(U::to_u64(self.triggers[ix].tdata1), width);
            if is_nmi && !it.nmi {
                continue;
            }
            if !self.mode_enabled(priv_level, virt, it.user, it.supervisor, it.machine) {
                continue;
            }
            let mask = U::to_u64(self.triggers[ix].tdata2);
            if mask & (1u64 << cause) != 0 {
                self.triggers[ix].tripped = true;
                fired.push(ix);
            }
        }
        fired
    }

    /// After a round of `local_hit` evaluation, resolves which triggers actually fire: a chained
    /// trigger only fires once every member of its `[begin, end)` chain has `local_hit` set.
    fn collect_chain_hits(&mut self) -> Vec<usize> {
        let mut fired = Vec::new();
        let mut ix = 0;
        while ix < self.triggers.len() {
            let (begin, end) = self.chain_bounds(ix);
            let all_hit = (begin..end).all(|i| self.triggers[i].local_hit);
            if all_hit && end > begin {
                for i in begin..end {
                    self.triggers[i].tripped = true;
                    fired.push(i);
                }
            }
            ix = end.max(ix + 1);
        }
        fired
    }

    pub fn action_of(&self, ix: usize) -> Option<TriggerAction> {
        let width = self.width_bits;
        let trigger = self.triggers.get(ix)?;
        Some(match trigger.ty(width) {
            TriggerType::Mcontrol => Mcontrol::unpack(U::to_u64(trigger.tdata1), width).action,
            TriggerType::Mcontrol6 => Mcontrol6::unpack(U::to_u64(trigger.tdata1), width).action,
            TriggerType::Icount => Icount::unpack(U::to_u64(trigger.tdata1), width).action,
            TriggerType::Etrigger => Etrigger::unpack(U::to_u64(trigger.tdata1), width).action,
            TriggerType::Itrigger => Itrigger::unpack(U::to_u64(trigger.tdata1), width).action,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enable_mcontrol(store: bool, load: bool, execute: bool, action: TriggerAction, dmode: bool) -> u64 {
        Mcontrol {
            store,
            load,
            execute,
            machine: true,
            action,
            dmode,
            ..Default::default()
        }
        .pack(64)
    }

    #[test]
    fn single_store_address_trigger_fires_on_equal_match() {
        let mut triggers: Triggers<u64> = Triggers::new(4, TriggerConfig::default());
        triggers.write_data1(0, true, enable_mcontrol(true, false, false, TriggerAction::EnterDebug, true)).unwrap();
        triggers.write_data2(0, true, 0x2000).unwrap();

        let hits = triggers.ld_st_addr_trigger_hit(0x2000, false, PrivilegeLevel::Machine, VirtualizationMode::OFF);
        assert_eq!(hits, vec![0]);
        assert_eq!(triggers.action_of(0), Some(TriggerAction::EnterDebug));
    }

    #[test]
    fn non_matching_address_does_not_fire() {
        let mut triggers: Triggers<u64> = Triggers::new(4, TriggerConfig::default());
        triggers.write_data1(0, true, enable_mcontrol(true, false, false, TriggerAction::EnterDebug, true)).unwrap();
        triggers.write_data2(0, true, 0x2000).unwrap();

        let hits = triggers.ld_st_addr_trigger_hit(0x3000, false, PrivilegeLevel::Machine, VirtualizationMode::OFF);
        assert!(hits.is_empty());
    }

    #[test]
    fn two_member_chain_requires_both_to_match() {
        let mut triggers: Triggers<u64> = Triggers::new(4, TriggerConfig::default());
        let mut first = Mcontrol {
            store: true,
            machine: true,
            chain: true,
            action: TriggerAction::EnterDebug,
            dmode: true,
            ..Default::default()
        };
        first.match_code = Match::Equal;
        triggers.write_data1(0, true, first.pack(64)).unwrap();
        triggers.write_data2(0, true, 0x1000).unwrap();

        let second = Mcontrol {
            store: true,
            machine: true,
            action: TriggerAction::EnterDebug,
            dmode: true,
            ..Default::default()
        };
        triggers.write_data1(1, true, second.pack(64)).unwrap();
        triggers.write_data2(1, true, 0x2000).unwrap();

        // Only the first member's address seen so far: no fire yet.
        let hits = triggers.ld_st_addr_trigger_hit(0x1000, false, PrivilegeLevel::Machine, VirtualizationMode::OFF);
        assert!(hits.is_empty());

        // A single access can't match both addresses; chains fire when every member's local_hit
        // was set within the same evaluation round (both tdata2 values would need to be probed by
        // the caller, e.g. for two successive bytes of an unaligned access). Simulate that here.
        triggers.write_data2(1, true, 0x1000).unwrap();
        let hits = triggers.ld_st_addr_trigger_hit(0x1000, false, PrivilegeLevel::Machine, VirtualizationMode::OFF);
        assert_eq!(hits, vec![0, 1]);
    }

    #[test]
    fn cross_dmode_chain_is_rejected_by_default() {
        let mut triggers: Triggers<u64> = Triggers::new(4, TriggerConfig::default());
        let first = Mcontrol { store: true, chain: true, dmode: true, ..Default::default() };
        triggers.write_data1(0, true, first.pack(64)).unwrap();

        let second = Mcontrol { store: true, dmode: false, ..Default::default() };
        let err = triggers.write_data1(1, true, second.pack(64)).unwrap_err();
        assert!(matches!(err, TriggerWriteError::CrossDmodeChain(1)));
    }

    #[test]
    fn cross_dmode_chain_is_defanged_when_configured_not_to_reject() {
        let config = TriggerConfig { reject_cross_dmode_chain: false, ..TriggerConfig::default() };
        let mut triggers: Triggers<u64> = Triggers::new(4, config);
        let first = Mcontrol { store: true, chain: true, dmode: true, ..Default::default() };
        triggers.write_data1(0, true, first.pack(64)).unwrap();

        let second = Mcontrol { store: true, dmode: false, ..Default::default() };
        triggers.write_data1(1, true, second.pack(64)).unwrap();

        // First trigger's chain bit was cleared rather than the write being rejected.
        let mc = Mcontrol::unpack(triggers.read_data1(0).unwrap(), 64);
        assert!(!mc.chain);
    }

    #[test]
    fn write_outside_debug_mode_to_dmode_trigger_is_rejected() {
        let mut triggers: Triggers<u64> = Triggers::new(4, TriggerConfig::default());
        let dmoded = Mcontrol { store: true, dmode: true, ..Default::default() }.pack(64);
        triggers.write_data1(0, true, dmoded).unwrap();

        let err = triggers.write_data1(0, false, 0).unwrap_err();
        assert!(matches!(err, TriggerWriteError::NotInDebugMode(0)));
    }

    // Per retirement, the caller checks the previous retirement's pending hit before decrementing
    // for the current one: `icount_trigger_fired` then `evaluate_icount`, in that order.

    #[test]
    fn icount_fires_on_the_retirement_after_configured_count_retires() {
        let mut triggers: Triggers<u64> = Triggers::new(4, TriggerConfig::default());
        let ic = Icount { machine: true, count: 3, action: TriggerAction::EnterDebug, ..Default::default() };
        triggers.write_data1(0, true, ic.pack(64)).unwrap();
        // The write itself counts as "written by the current instruction": evaluate_icount for
        // that same retirement must not decrement it.
        triggers.clear_last_written();

        // Three retirements bring the countdown to zero; none of these observe a fire, since
        // reaching zero only sets `pending` for the *next* retirement to see.
        for _ in 0..3 {
            assert!(triggers.icount_trigger_fired(PrivilegeLevel::Machine, VirtualizationMode::OFF).is_empty());
            triggers.evaluate_icount(PrivilegeLevel::Machine, VirtualizationMode::OFF);
        }

        // The 4th retirement observes `pending` set by the 3rd and fires.
        let fired = triggers.icount_trigger_fired(PrivilegeLevel::Machine, VirtualizationMode::OFF);
        assert_eq!(fired, vec![0]);
    }

    #[test]
    fn icount_does_not_decrement_on_the_instruction_that_wrote_it() {
        let mut triggers: Triggers<u64> = Triggers::new(4, TriggerConfig::default());
        let ic = Icount { machine: true, count: 1, action: TriggerAction::EnterDebug, ..Default::default() };
        triggers.write_data1(0, true, ic.pack(64)).unwrap();

        // Same retirement as the write: must be skipped, not decremented to 0.
        assert!(triggers.icount_trigger_fired(PrivilegeLevel::Machine, VirtualizationMode::OFF).is_empty());
        triggers.evaluate_icount(PrivilegeLevel::Machine, VirtualizationMode::OFF);
        triggers.clear_last_written();

        // Next retirement: no longer "just written", so the countdown actually decrements to 0.
        assert!(triggers.icount_trigger_fired(PrivilegeLevel::Machine, VirtualizationMode::OFF).is_empty());
        triggers.evaluate_icount(PrivilegeLevel::Machine, VirtualizationMode::OFF);

        // The retirement after that observes the pending bit set above and fires.
        let fired = triggers.icount_trigger_fired(PrivilegeLevel::Machine, VirtualizationMode::OFF);
        assert_eq!(fired, vec![0]);
    }

    #[test]
    fn action_enter_debug_is_forced_to_raise_break_without_dmode() {
        let mut triggers: Triggers<u64> = Triggers::new(4, TriggerConfig::default());
        let mc = Mcontrol { store: true, machine: true, action: TriggerAction::EnterDebug, dmode: false, ..Default::default() };
        triggers.write_data1(0, true, mc.pack(64)).unwrap();
        assert_eq!(triggers.action_of(0), Some(TriggerAction::RaiseBreak));
    }

    #[test]
    fn action_enter_debug_is_kept_with_dmode_set() {
        let mut triggers: Triggers<u64> = Triggers::new(4, TriggerConfig::default());
        let mc = Mcontrol { store: true, machine: true, action: TriggerAction::EnterDebug, dmode: true, ..Default::default() };
        triggers.write_data1(0, true, mc.pack(64)).unwrap();
        assert_eq!(triggers.action_of(0), Some(TriggerAction::EnterDebug));
    }

    #[test]
    fn write_mask_blocks_protected_tdata1_bits() {
        // Only bit 0 ("load") is software-settable; everything else is pinned to its reset value.
        let config = TriggerConfig { data1_write_mask: vec![0b1], ..TriggerConfig::default() };
        let mut triggers: Triggers<u64> = Triggers::new(2, config);
        let mc = Mcontrol { load: true, store: true, machine: true, ..Default::default() };
        triggers.write_data1(0, true, mc.pack(64)).unwrap();
        let back = Mcontrol::unpack(triggers.read_data1(0).unwrap(), 64);
        assert!(back.load);
        assert!(!back.store);
    }

    #[test]
    fn tdata3_write_is_a_no_op_under_the_default_placeholder_mask() {
        let mut triggers: Triggers<u64> = Triggers::new(2, TriggerConfig::default());
        triggers.write_data3(0, true, 0xDEAD_BEEF).unwrap();
        assert_eq!(triggers.read_data3(0).unwrap(), 0);
    }

    #[test]
    fn reset_restores_configured_reset_values_not_zero() {
        let config = TriggerConfig { data2_reset: vec![0x55], ..TriggerConfig::default() };
        let mut triggers: Triggers<u64> = Triggers::new(1, config);
        assert_eq!(triggers.read_data2(0).unwrap(), 0x55);

        triggers.write_data2(0, true, 0x99).unwrap();
        assert_eq!(triggers.read_data2(0).unwrap(), 0x99);

        triggers.reset();
        assert_eq!(triggers.read_data2(0).unwrap(), 0x55);
    }

    #[test]
    fn unsupported_type_write_is_ignored() {
        let mut triggers: Triggers<u64> = Triggers::new(4, TriggerConfig::default());
        // Type 9 ("Reserved1") is not in the default supported mask.
        let mut raw = 0u64;
        types::set_type_bits(&mut raw, 64, 9);
        triggers.write_data1(0, true, raw).unwrap();
        assert_eq!(triggers.read_data1(0).unwrap(), 0);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let triggers: Triggers<u64> = Triggers::new(2, TriggerConfig::default());
        assert!(matches!(triggers.read_data1(5), Err(TriggerWriteError::OutOfRange(5))));
    }

    #[test]
    fn disabled_trigger_reads_back_only_type_and_dmode_bits() {
        let mut triggers: Triggers<u64> = Triggers::new(2, TriggerConfig::default());
        let mut raw = 0u64;
        types::set_type_bits(&mut raw, 64, TriggerType::Disabled.to_bits());
        types::set_dmode_bit(&mut raw, 64, true);
        raw |= 1; // a non-type/dmode bit that must not read back
        triggers.poke_data1(0, raw).unwrap();

        let read_back = triggers.read_data1(0).unwrap();
        assert_eq!(types::type_bits(read_back, 64), TriggerType::Disabled.to_bits());
        assert!(types::dmode_bit(read_back, 64));
        assert_eq!(read_back & 1, 0);
    }

    #[test]
    fn unsupported_action_is_cleared_to_raise_break() {
        // Action 2 ("StartTrace") is disallowed; writes requesting it are forced to RaiseBreak.
        let config = TriggerConfig {
            supported_actions: 1 << TriggerAction::RaiseBreak.to_bits(),
            ..TriggerConfig::default()
        };
        let mut triggers: Triggers<u64> = Triggers::new(2, config);
        let mc = Mcontrol { store: true, machine: true, action: TriggerAction::StartTrace, ..Default::default() };
        triggers.write_data1(0, true, mc.pack(64)).unwrap();
        assert_eq!(triggers.action_of(0), Some(TriggerAction::RaiseBreak));
    }

    #[test]
    fn unsupported_action_is_rolled_back_when_configured_not_to_clear() {
        let config = TriggerConfig {
            supported_actions: 1 << TriggerAction::RaiseBreak.to_bits(),
            clear_unsupported_action: false,
            ..TriggerConfig::default()
        };
        let mut triggers: Triggers<u64> = Triggers::new(2, config);
        let first = Mcontrol { store: true, machine: true, action: TriggerAction::RaiseBreak, ..Default::default() };
        triggers.write_data1(0, true, first.pack(64)).unwrap();

        let second = Mcontrol { store: true, machine: true, action: TriggerAction::StartTrace, ..Default::default() };
        triggers.write_data1(0, true, second.pack(64)).unwrap();
        assert_eq!(triggers.action_of(0), Some(TriggerAction::RaiseBreak));
    }

    #[test]
    fn maskmax_clamps_mcontrol_mask_max_field() {
        let config = TriggerConfig { maskmax: 4, ..TriggerConfig::default() };
        let mut triggers: Triggers<u64> = Triggers::new(2, config);
        let mc = Mcontrol { store: true, machine: true, mask_max: 12, ..Default::default() };
        triggers.write_data1(0, true, mc.pack(64)).unwrap();
        let back = Mcontrol::unpack(triggers.read_data1(0).unwrap(), 64);
        assert_eq!(back.mask_max, 4);
    }

    #[test]
    fn napot_mask_is_bounded_by_maskmax() {
        // tdata2 offers 8 trailing one-bits of don't-care, but maskmax permits only 3.
        assert_eq!(napot_mask(0xFF, 3), 0b111);
        assert_eq!(napot_mask(0xFF, 63), 0xFF);
    }
}
