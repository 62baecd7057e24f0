//! Trigger register bit layouts: `tdata1`'s type-dependent component view, `tdata2`/`tdata3`'s
//! type-dependent interpretation, and `tinfo`.
//!
//! `tdata1` always places the 4-bit trigger type in its top nibble and (except for `Legacy`
//! triggers, unsupported here) a `dmode` bit just below it; the rest of the word is laid out
//! differently per type. This crate works on the word as a plain `u64` (already widened from
//! whatever `Xlen` the hart is configured for) and computes type-dependent bit positions from
//! the configured width, rather than defining one packed struct per `(type, width)` pair as the
//! reference simulator's C bitfields do.

use bitvec::prelude::*;

/// `tdata1`'s type field (top 4 bits of the word).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum TriggerType {
    None,
    Legacy,
    Mcontrol,
    Icount,
    Itrigger,
    Etrigger,
    Mcontrol6,
    Tmext,
    Disabled,
    /// A type value this crate does not implement match/chain semantics for (the `Reserved*`/
    /// `Custom*` range, `8..=14`).
    Unsupported(u8),
}

impl TriggerType {
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::None,
            1 => Self::Legacy,
            2 => Self::Mcontrol,
            3 => Self::Icount,
            4 => Self::Itrigger,
            5 => Self::Etrigger,
            6 => Self::Mcontrol6,
            7 => Self::Tmext,
            15 => Self::Disabled,
            other => Self::Unsupported(other),
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Legacy => 1,
            Self::Mcontrol => 2,
            Self::Icount => 3,
            Self::Itrigger => 4,
            Self::Etrigger => 5,
            Self::Mcontrol6 => 6,
            Self::Tmext => 7,
            Self::Disabled => 15,
            Self::Unsupported(bits) => bits,
        }
    }

    /// Whether this type names an address/data comparator (`mcontrol`/`mcontrol6`), which use
    /// `tdata2` as a compare value rather than an event count.
    pub fn is_addr_data(self) -> bool {
        matches!(self, Self::Mcontrol | Self::Mcontrol6)
    }

    pub fn is_disabled(self) -> bool {
        matches!(self, Self::None | Self::Disabled)
    }
}

/// `tdata1`'s action field. The field's bit position within the word depends on the type
/// (`mcontrol`/`mcontrol6` use a 4-bit field at `[15:12]`; `icount`/`etrigger`/`itrigger` use a
/// 6-bit field at `[5:0]`), so this enum only models the decoded value.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum TriggerAction {
    RaiseBreak,
    EnterDebug,
    StartTrace,
    StopTrace,
    EmitTrace,
    External0,
    External1,
    /// Any other encoded value (including the reserved `5` and anything `>=8`).
    Unsupported(u8),
}

impl TriggerAction {
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::RaiseBreak,
            1 => Self::EnterDebug,
            2 => Self::StartTrace,
            3 => Self::StopTrace,
            4 => Self::EmitTrace,
            6 => Self::External0,
            7 => Self::External1,
            other => Self::Unsupported(other),
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            Self::RaiseBreak => 0,
            Self::EnterDebug => 1,
            Self::StartTrace => 2,
            Self::StopTrace => 3,
            Self::EmitTrace => 4,
            Self::External0 => 6,
            Self::External1 => 7,
            Self::Unsupported(bits) => bits,
        }
    }
}

/// `mcontrol`/`mcontrol6`'s 4-bit match-control field.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Match {
    Equal,
    Masked,
    Ge,
    Lt,
    MaskHighEqualLow,
    MaskLowEqualHigh,
    NotEqual,
    NotMasked,
    NotMaskHighEqualLow,
    NotMaskLowEqualHigh,
    /// The reserved encodings `6`, `7`, `10`, `11`, `14`, `15`.
    Unsupported(u8),
}

impl Match {
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::Equal,
            1 => Self::Masked,
            2 => Self::Ge,
            3 => Self::Lt,
            4 => Self::MaskHighEqualLow,
            5 => Self::MaskLowEqualHigh,
            8 => Self::NotEqual,
            9 => Self::NotMasked,
            12 => Self::NotMaskHighEqualLow,
            13 => Self::NotMaskLowEqualHigh,
            other => Self::Unsupported(other),
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            Self::Equal => 0,
            Self::Masked => 1,
            Self::Ge => 2,
            Self::Lt => 3,
            Self::MaskHighEqualLow => 4,
            Self::MaskLowEqualHigh => 5,
            Self::NotEqual => 8,
            Self::NotMasked => 9,
            Self::NotMaskHighEqualLow => 12,
            Self::NotMaskLowEqualHigh => 13,
            Self::Unsupported(bits) => bits,
        }
    }

    /// The "not" forms invert the underlying comparator's result.
    pub fn is_negated(self) -> bool {
        self.to_bits() & 0b1000 != 0
    }
}

fn bit(value: u64, ix: u32) -> bool {
    value.view_bits::<Lsb0>()[ix as usize]
}

fn field(value: u64, lsb: u32, width: u32) -> u64 {
    value.view_bits::<Lsb0>()[lsb as usize..(lsb + width) as usize].load::<u64>()
}

fn set_field(value: &mut u64, lsb: u32, width: u32, new: u64) {
    let bits = value.view_bits_mut::<Lsb0>();
    bits[lsb as usize..(lsb + width) as usize].store(new);
}

/// Every trigger type places its type nibble at the top of the word and (except `Legacy`) its
/// `dmode` bit directly below it.
pub fn type_bits(value: u64, width_bits: u32) -> u8 {
    field(value, width_bits - 4, 4) as u8
}

pub fn set_type_bits(value: &mut u64, width_bits: u32, ty: u8) {
    set_field(value, width_bits - 4, 4, ty as u64);
}

pub fn dmode_bit(value: u64, width_bits: u32) -> bool {
    bit(value, width_bits - 5)
}

pub fn set_dmode_bit(value: &mut u64, width_bits: u32, dmode: bool) {
    set_field(value, width_bits - 5, 1, dmode as u64);
}

/// `mcontrol`'s decoded fields (type 2). `size` is the 2-bit `sizelo` field on RV32 widened with
/// `sizehi` on RV64, per the reference layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mcontrol {
    pub load: bool,
    pub store: bool,
    pub execute: bool,
    pub user: bool,
    pub supervisor: bool,
    pub machine: bool,
    pub match_code: Match,
    pub chain: bool,
    pub action: TriggerAction,
    pub size: u8,
    pub timing_after: bool,
    pub select_data: bool,
    pub hit: bool,
    pub mask_max: u8,
    pub dmode: bool,
}

impl Default for Match {
    fn default() -> Self {
        Self::Equal
    }
}

impl Default for TriggerAction {
    fn default() -> Self {
        Self::RaiseBreak
    }
}

impl Mcontrol {
    pub fn unpack(value: u64, width_bits: u32) -> Self {
        let sizelo = field(value, 16, 2);
        let sizehi = if width_bits == 64 { field(value, 21, 2) } else { 0 };
        Self {
            load: bit(value, 0),
            store: bit(value, 1),
            execute: bit(value, 2),
            user: bit(value, 3),
            supervisor: bit(value, 4),
            machine: bit(value, 6),
            match_code: Match::from_bits(field(value, 7, 4) as u8),
            chain: bit(value, 11),
            action: TriggerAction::from_bits(field(value, 12, 4) as u8),
            size: ((sizehi << 2) | sizelo) as u8,
            timing_after: bit(value, 18),
            select_data: bit(value, 19),
            hit: bit(value, 20),
            mask_max: field(value, width_bits - 5 - 6, 6) as u8,
            dmode: dmode_bit(value, width_bits),
        }
    }

    pub fn pack(&self, width_bits: u32) -> u64 {
        let mut value = 0u64;
        set_field(&mut value, 0, 1, self.load as u64);
        set_field(&mut value, 1, 1, self.store as u64);
        set_field(&mut value, 2, 1, self.execute as u64);
        set_field(&mut value, 3, 1, self.user as u64);
        set_field(&mut value, 4, 1, self.supervisor as u64);
        set_field(&mut value, 6, 1, self.machine as u64);
        set_field(&mut value, 7, 4, self.match_code.to_bits() as u64);
        set_field(&mut value, 11, 1, self.chain as u64);
        set_field(&mut value, 12, 4, self.action.to_bits() as u64);
        set_field(&mut value, 16, 2, (self.size & 0b11) as u64);
        if width_bits == 64 {
            set_field(&mut value, 21, 2, ((self.size >> 2) & 0b11) as u64);
        }
        set_field(&mut value, 18, 1, self.timing_after as u64);
        set_field(&mut value, 19, 1, self.select_data as u64);
        set_field(&mut value, 20, 1, self.hit as u64);
        set_field(&mut value, width_bits - 5 - 6, 6, self.mask_max as u64);
        set_dmode_bit(&mut value, width_bits, self.dmode);
        set_type_bits(&mut value, width_bits, TriggerType::Mcontrol.to_bits());
        value
    }
}

/// `mcontrol6`'s decoded fields (type 6): adds virtualized-mode enables (`vu`/`vs`) and a second
/// hit bit, drops `mcontrol`'s NAPOT `maskMax` field (superseded by the "tdata2 all-ones" NAPOT
/// convention, see [`crate::trigger::napot_mask`]).
#[derive(Debug, Clone, Copy, Default)]
pub struct Mcontrol6 {
    pub load: bool,
    pub store: bool,
    pub execute: bool,
    pub user: bool,
    pub supervisor: bool,
    pub machine: bool,
    pub match_code: Match,
    pub chain: bool,
    pub action: TriggerAction,
    pub size: u8,
    pub select_data: bool,
    pub hit0: bool,
    pub virt_user: bool,
    pub virt_supervisor: bool,
    pub hit1: bool,
    pub dmode: bool,
}

impl Mcontrol6 {
    pub fn unpack(value: u64, width_bits: u32) -> Self {
        Self {
            load: bit(value, 0),
            store: bit(value, 1),
            execute: bit(value, 2),
            user: bit(value, 3),
            supervisor: bit(value, 4),
            machine: bit(value, 6),
            match_code: Match::from_bits(field(value, 7, 4) as u8),
            chain: bit(value, 11),
            action: TriggerAction::from_bits(field(value, 12, 4) as u8),
            size: field(value, 16, 3) as u8,
            select_data: bit(value, 21),
            hit0: bit(value, 22),
            virt_user: bit(value, 23),
            virt_supervisor: bit(value, 24),
            hit1: bit(value, 25),
            dmode: dmode_bit(value, width_bits),
        }
    }

    pub fn pack(&self, width_bits: u32) -> u64 {
        let mut value = 0u64;
        set_field(&mut value, 0, 1, self.load as u64);
        set_field(&mut value, 1, 1, self.store as u64);
        set_field(&mut value, 2, 1, self.execute as u64);
        set_field(&mut value, 3, 1, self.user as u64);
        set_field(&mut value, 4, 1, self.supervisor as u64);
        set_field(&mut value, 6, 1, self.machine as u64);
        set_field(&mut value, 7, 4, self.match_code.to_bits() as u64);
        set_field(&mut value, 11, 1, self.chain as u64);
        set_field(&mut value, 12, 4, self.action.to_bits() as u64);
        set_field(&mut value, 16, 3, self.size as u64);
        set_field(&mut value, 21, 1, self.select_data as u64);
        set_field(&mut value, 22, 1, self.hit0 as u64);
        set_field(&mut value, 23, 1, self.virt_user as u64);
        set_field(&mut value, 24, 1, self.virt_supervisor as u64);
        set_field(&mut value, 25, 1, self.hit1 as u64);
        set_dmode_bit(&mut value, width_bits, self.dmode);
        set_type_bits(&mut value, width_bits, TriggerType::Mcontrol6.to_bits());
        value
    }
}

/// `icount`'s decoded fields (type 3): counts down `count` retired instructions.
#[derive(Debug, Clone, Copy, Default)]
pub struct Icount {
    pub action: TriggerAction,
    pub user: bool,
    pub supervisor: bool,
    pub pending: bool,
    pub machine: bool,
    pub count: u16,
    pub hit: bool,
    pub virt_user: bool,
    pub virt_supervisor: bool,
    pub dmode: bool,
}

impl Icount {
    pub fn unpack(value: u64, width_bits: u32) -> Self {
        Self {
            action: TriggerAction::from_bits(field(value, 0, 6) as u8),
            user: bit(value, 6),
            supervisor: bit(value, 7),
            pending: bit(value, 8),
            machine: bit(value, 9),
            count: field(value, 10, 14) as u16,
            hit: bit(value, 24),
            virt_user: bit(value, 25),
            virt_supervisor: bit(value, 26),
            dmode: dmode_bit(value, width_bits),
        }
    }

    pub fn pack(&self, width_bits: u32) -> u64 {
        let mut value = 0u64;
        set_field(&mut value, 0, 6, self.action.to_bits() as u64);
        set_field(&mut value, 6, 1, self.user as u64);
        set_field(&mut value, 7, 1, self.supervisor as u64);
        set_field(&mut value, 8, 1, self.pending as u64);
        set_field(&mut value, 9, 1, self.machine as u64);
        set_field(&mut value, 10, 14, self.count as u64);
        set_field(&mut value, 24, 1, self.hit as u64);
        set_field(&mut value, 25, 1, self.virt_user as u64);
        set_field(&mut value, 26, 1, self.virt_supervisor as u64);
        set_dmode_bit(&mut value, width_bits, self.dmode);
        set_type_bits(&mut value, width_bits, TriggerType::Icount.to_bits());
        value
    }
}

/// `etrigger`'s decoded fields (type 5): fires on a matching exception cause in `tdata2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Etrigger {
    pub action: TriggerAction,
    pub user: bool,
    pub supervisor: bool,
    pub machine: bool,
    pub virt_user: bool,
    pub virt_supervisor: bool,
    pub hit: bool,
    pub dmode: bool,
}

impl Etrigger {
    pub fn unpack(value: u64, width_bits: u32) -> Self {
        Self {
            action: TriggerAction::from_bits(field(value, 0, 6) as u8),
            user: bit(value, 6),
            supervisor: bit(value, 7),
            machine: bit(value, 9),
            virt_user: bit(value, 11),
            virt_supervisor: bit(value, 12),
            hit: bit(value, width_bits - 6),
            dmode: dmode_bit(value, width_bits),
        }
    }

    pub fn pack(&self, width_bits: u32) -> u64 {
        let mut value = 0u64;
        set_field(&mut value, 0, 6, self.action.to_bits() as u64);
        set_field(&mut value, 6, 1, self.user as u64);
        set_field(&mut value, 7, 1, self.supervisor as u64);
        set_field(&mut value, 9, 1, self.machine as u64);
        set_field(&mut value, 11, 1, self.virt_user as u64);
        set_field(&mut value, 12, 1, self.virt_supervisor as u64);
        set_field(&mut value, width_bits - 6, 1, self.hit as u64);
        set_dmode_bit(&mut value, width_bits, self.dmode);
        set_type_bits(&mut value, width_bits, TriggerType::Etrigger.to_bits());
        value
    }
}

/// `itrigger`'s decoded fields (type 4): fires on a matching pending interrupt, optionally NMI.
#[derive(Debug, Clone, Copy, Default)]
pub struct Itrigger {
    pub action: TriggerAction,
    pub user: bool,
    pub supervisor: bool,
    pub machine: bool,
    pub nmi: bool,
    pub virt_user: bool,
    pub virt_supervisor: bool,
    pub hit: bool,
    pub dmode: bool,
}

impl Itrigger {
    pub fn unpack(value: u64, width_bits: u32) -> Self {
        Self {
            action: TriggerAction::from_bits(field(value, 0, 6) as u8),
            user: bit(value, 6),
            supervisor: bit(value, 7),
            machine: bit(value, 9),
            nmi: bit(value, 10),
            virt_user: bit(value, 11),
            virt_supervisor: bit(value, 12),
            hit: bit(value, width_bits - 6),
            dmode: dmode_bit(value, width_bits),
        }
    }

    pub fn pack(&self, width_bits: u32) -> u64 {
        let mut value = 0u64;
        set_field(&mut value, 0, 6, self.action.to_bits() as u64);
        set_field(&mut value, 6, 1, self.user as u64);
        set_field(&mut value, 7, 1, self.supervisor as u64);
        set_field(&mut value, 9, 1, self.machine as u64);
        set_field(&mut value, 10, 1, self.nmi as u64);
        set_field(&mut value, 11, 1, self.virt_user as u64);
        set_field(&mut value, 12, 1, self.virt_supervisor as u64);
        set_field(&mut value, width_bits - 6, 1, self.hit as u64);
        set_dmode_bit(&mut value, width_bits, self.dmode);
        set_type_bits(&mut value, width_bits, TriggerType::Itrigger.to_bits());
        value
    }
}

/// `tinfo`'s decoded fields: which types this trigger slot can be configured as, and a version
/// nibble for `tdata3`'s `sselect`-style future extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tinfo {
    pub supported_types: u16,
    pub version: u8,
}

impl Tinfo {
    pub fn unpack(value: u64) -> Self {
        Self {
            supported_types: field(value, 0, 16) as u16,
            version: field(value, 24, 8) as u8,
        }
    }

    pub fn pack(&self) -> u64 {
        let mut value = 0u64;
        set_field(&mut value, 0, 16, self.supported_types as u64);
        set_field(&mut value, 24, 8, self.version as u64);
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_and_dmode_position_depend_on_width() {
        let value = (TriggerType::Mcontrol6.to_bits() as u64) << 28 | 1 << 27;
        assert_eq!(type_bits(value, 32), TriggerType::Mcontrol6.to_bits());
        assert!(dmode_bit(value, 32));

        let value64 = (TriggerType::Mcontrol6.to_bits() as u64) << 60 | 1 << 59;
        assert_eq!(type_bits(value64, 64), TriggerType::Mcontrol6.to_bits());
        assert!(dmode_bit(value64, 64));
    }

    #[test]
    fn mcontrol_roundtrips_through_pack_unpack() {
        let mc = Mcontrol {
            load: true,
            execute: true,
            match_code: Match::Masked,
            action: TriggerAction::EnterDebug,
            mask_max: 12,
            dmode: true,
            ..Default::default()
        };
        let packed = mc.pack(64);
        let back = Mcontrol::unpack(packed, 64);
        assert!(back.load);
        assert!(back.execute);
        assert_eq!(back.match_code, Match::Masked);
        assert_eq!(back.action, TriggerAction::EnterDebug);
        assert_eq!(back.mask_max, 12);
        assert!(back.dmode);
        assert_eq!(type_bits(packed, 64), TriggerType::Mcontrol.to_bits());
    }

    #[test]
    fn icount_roundtrips_through_pack_unpack() {
        let ic = Icount {
            machine: true,
            count: 100,
            action: TriggerAction::RaiseBreak,
            ..Default::default()
        };
        let packed = ic.pack(32);
        let back = Icount::unpack(packed, 32);
        assert!(back.machine);
        assert_eq!(back.count, 100);
    }

    #[test]
    fn match_not_forms_are_negated() {
        assert!(Match::NotEqual.is_negated());
        assert!(!Match::Equal.is_negated());
    }

    #[test]
    fn tinfo_roundtrips() {
        let ti = Tinfo { supported_types: 0b0000_0000_0110_0110, version: 1 };
        let packed = ti.pack();
        let back = Tinfo::unpack(packed);
        assert_eq!(back.supported_types, ti.supported_types);
        assert_eq!(back.version, 1);
    }
}
