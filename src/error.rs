//! Crate-wide error types.
//!
//! CSR and trigger illegality are hard failures returned to the caller (no state changes):
//! modeled as ordinary `Result` errors via [`thiserror`]. MCM protocol errors and PPO
//! violations are different in kind — per the reference simulator's design, a violation must
//! be *recorded*, not propagated as a `Result`, since the run continues so later mismatches
//! can also be surfaced. Those live in [`crate::mcm`] as [`McmViolation`](crate::mcm::McmViolation).

use thiserror::Error;

use crate::csr::CsrSpecifier;
use crate::RawPrivilegeLevel;

/// Failure reading or writing a CSR.
#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum AccessError {
    /// The specifier does not name an implemented CSR.
    #[error("CSR {0:#05x} is not implemented")]
    NotImplemented(CsrSpecifier),
    /// The access does not meet the CSR's minimum required privilege level.
    #[error(
        "CSR {specifier:#05x} requires privilege {required}, access was from {actual}"
    )]
    Privileged {
        specifier: CsrSpecifier,
        required: RawPrivilegeLevel,
        actual: RawPrivilegeLevel,
    },
    /// The CSR is debug-only and the hart is not in debug mode.
    #[error("CSR {0:#05x} is accessible only in debug mode")]
    DebugOnly(CsrSpecifier),
    /// The CSR is a hypervisor extension register and the hart is currently virtualized (`V=1`).
    #[error("CSR {0:#05x} is not accessible while virtualized")]
    Virtualized(CsrSpecifier),
}

/// Failure writing to a CSR. A superset of the read failures, since every write is preceded by
/// the same legality check as a read.
#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum WriteError {
    #[error(transparent)]
    Access(#[from] AccessError),
    /// Attempted write to a CSR whose number marks it read-only (CSR-number bits 11:10 both
    /// set).
    #[error("CSR {0:#05x} is read-only")]
    ReadOnly(CsrSpecifier),
}

/// Failure writing a trigger's `tdataN`/`tinfo`/`tcontrol` register.
#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum TriggerWriteError {
    /// The trigger index does not name a configured trigger.
    #[error("trigger index {0} is out of range")]
    OutOfRange(usize),
    /// The target component is debug-mode-only and the write did not originate in debug mode.
    #[error("trigger {0} tdata is writable only in debug mode")]
    NotInDebugMode(usize),
    /// The write would create a trigger chain that crosses a debug-mode-only boundary, and the
    /// engine is configured to reject (rather than silently defang) such writes.
    #[error("trigger {0} write would create a chain crossing a dmode boundary")]
    CrossDmodeChain(usize),
}
