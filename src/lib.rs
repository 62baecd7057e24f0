#[macro_use]
extern crate static_assertions;

use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

pub mod csr;
pub mod error;
pub mod mcm;
pub mod trigger;
pub mod width;

pub use width::Xlen;

/// List of all possible privilege levels for RISC-V.
///
/// Same as [`PrivilegeLevel`] except that it allows specifying the reserved privilege level `2`.
/// This can be useful in case a minimum required privilege level is specified as a 2-bit value,
/// since that value itself may be a reserved privilege level (as is the case for several CSR
/// numbers, whose bits 9:8 encode the minimum required privilege level).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RawPrivilegeLevel {
    User = 0,
    Supervisor = 1,
    /// Privilege level `0b10` is reserved in the base ISA. When using the hypervisor extension,
    /// this becomes the Hypervisor privilege level.
    Reserved = 2,
    Machine = 3,
}

impl RawPrivilegeLevel {
    /// Convert a 2-bit value into a [`RawPrivilegeLevel`].
    /// Panics if the value doesn't fit in 2 bits (`0..=3`).
    pub fn from_u2(value_u2: u8) -> Self {
        match value_u2 {
            0 => Self::User,
            1 => Self::Supervisor,
            2 => Self::Reserved,
            3 => Self::Machine,
            _ => panic!("out of range u2 used"),
        }
    }

    pub fn is_reserved(self) -> bool {
        matches!(self, Self::Reserved)
    }
}

impl fmt::Display for RawPrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            RawPrivilegeLevel::User => "U",
            RawPrivilegeLevel::Supervisor => "S",
            RawPrivilegeLevel::Reserved => "2",
            RawPrivilegeLevel::Machine => "M",
        })
    }
}

/// List of defined privilege levels for RISC-V.
///
/// A privilege level is always referenced by two bits, so only `0`, `1`, `2`, and `3` are valid
/// privilege levels. However, only levels `0`, `1`, and `3` are defined; level `2` is considered
/// *reserved* for now.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PrivilegeLevel {
    /// User/application (abbreviated `U`) is the lower privilege level.
    User = 0,
    /// Supervisor (abbreviated `S`) is an intermediate privilege level,
    /// that allows protection from OS.
    Supervisor = 1,
    // Level 2 is reserved
    /// Machine (abbreviated `M`) is the highest privilege level.
    Machine = 3,
}

impl PartialEq<PrivilegeLevel> for RawPrivilegeLevel {
    fn eq(&self, other: &PrivilegeLevel) -> bool {
        *self as usize == *other as usize
    }
}

impl PartialEq<RawPrivilegeLevel> for PrivilegeLevel {
    fn eq(&self, other: &RawPrivilegeLevel) -> bool {
        *self as usize == *other as usize
    }
}

impl PartialOrd<PrivilegeLevel> for RawPrivilegeLevel {
    fn partial_cmp(&self, other: &PrivilegeLevel) -> Option<Ordering> {
        (*self as usize).partial_cmp(&(*other as usize))
    }
}

impl PartialOrd<RawPrivilegeLevel> for PrivilegeLevel {
    fn partial_cmp(&self, other: &RawPrivilegeLevel) -> Option<Ordering> {
        (*self as usize).partial_cmp(&(*other as usize))
    }
}

impl fmt::Display for PrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            PrivilegeLevel::User => "U",
            PrivilegeLevel::Supervisor => "S",
            PrivilegeLevel::Machine => "M",
        })
    }
}

impl From<PrivilegeLevel> for RawPrivilegeLevel {
    fn from(value: PrivilegeLevel) -> Self {
        match value {
            PrivilegeLevel::User => Self::User,
            PrivilegeLevel::Supervisor => Self::Supervisor,
            PrivilegeLevel::Machine => Self::Machine,
        }
    }
}

impl TryFrom<RawPrivilegeLevel> for PrivilegeLevel {
    type Error = ReservedPrivilegeLevelError;
    fn try_from(value: RawPrivilegeLevel) -> Result<Self, Self::Error> {
        match value {
            RawPrivilegeLevel::User => Ok(Self::User),
            RawPrivilegeLevel::Supervisor => Ok(Self::Supervisor),
            RawPrivilegeLevel::Reserved => Err(ReservedPrivilegeLevelError(value)),
            RawPrivilegeLevel::Machine => Ok(Self::Machine),
        }
    }
}

#[derive(Error, Debug)]
#[error("privilege level {0} is reserved")]
pub struct ReservedPrivilegeLevelError(RawPrivilegeLevel);

/// Whether a hart is currently executing in virtualized mode (the hypervisor extension's `V`
/// bit). Carried alongside [`PrivilegeLevel`] almost everywhere in the CSR and trigger
/// subsystems, since most legality and aliasing rules are conditioned on the pair.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct VirtualizationMode(bool);

impl VirtualizationMode {
    pub const OFF: Self = Self(false);
    pub const ON: Self = Self(true);

    pub fn new(virt: bool) -> Self {
        Self(virt)
    }

    pub fn is_virtual(self) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privilege_level_ordering() {
        assert!(PrivilegeLevel::User < PrivilegeLevel::Supervisor);
        assert!(PrivilegeLevel::Supervisor < PrivilegeLevel::Machine);
    }

    #[test]
    fn raw_privilege_reserved_rejected() {
        let raw = RawPrivilegeLevel::Reserved;
        assert!(PrivilegeLevel::try_from(raw).is_err());
    }

    #[test]
    fn raw_privilege_roundtrip() {
        for level in [
            PrivilegeLevel::User,
            PrivilegeLevel::Supervisor,
            PrivilegeLevel::Machine,
        ] {
            let raw = RawPrivilegeLevel::from(level);
            assert_eq!(PrivilegeLevel::try_from(raw).unwrap(), level);
        }
    }
}
