//! Field descriptors for readable per-field diffs of a CSR's value.
//!
//! The reference simulator's trace output wants to print `MSTATUS.MPP 0->3` without the trace
//! writer knowing mstatus's bit layout; a CSR annotates itself with an ordered list of named
//! bit-fields and the file extracts them generically.

use bitvec::prelude::*;

/// A single named bit-field within a CSR's value: `[lsb, lsb+width)`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub lsb: u32,
    pub width: u32,
}

impl FieldDescriptor {
    pub const fn new(name: &'static str, lsb: u32, width: u32) -> Self {
        Self { name, lsb, width }
    }

    /// Extracts this field's value out of a full register value.
    pub fn extract(&self, value: u64) -> u64 {
        let bits = value.view_bits::<Lsb0>();
        let slice = &bits[self.lsb as usize..(self.lsb + self.width) as usize];
        slice.load::<u64>()
    }
}

/// One field's value before and after a write, for trace diffing.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FieldDiff {
    pub name: &'static str,
    pub before: u64,
    pub after: u64,
}

/// Computes the set of fields whose value changed between `before` and `after`, in descriptor
/// order. Fields whose value didn't change are omitted, matching the reference trace's
/// "only print what moved" behavior.
pub fn diff_fields(fields: &[FieldDescriptor], before: u64, after: u64) -> Vec<FieldDiff> {
    fields
        .iter()
        .filter_map(|field| {
            let b = field.extract(before);
            let a = field.extract(after);
            (a != b).then_some(FieldDiff {
                name: field.name,
                before: b,
                after: a,
            })
        })
        .collect()
}

/// Field layout for `mstatus` (RV64; the RV32 layout drops the upper `xlen`/`sbe`/`mbe` fields
/// which live in `mstatush` instead, but the low 32 bits are identical).
pub const MSTATUS_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("SIE", 1, 1),
    FieldDescriptor::new("MIE", 3, 1),
    FieldDescriptor::new("SPIE", 5, 1),
    FieldDescriptor::new("UBE", 6, 1),
    FieldDescriptor::new("MPIE", 7, 1),
    FieldDescriptor::new("SPP", 8, 1),
    FieldDescriptor::new("VS", 9, 2),
    FieldDescriptor::new("MPP", 11, 2),
    FieldDescriptor::new("FS", 13, 2),
    FieldDescriptor::new("XS", 15, 2),
    FieldDescriptor::new("MPRV", 17, 1),
    FieldDescriptor::new("SUM", 18, 1),
    FieldDescriptor::new("MXR", 19, 1),
    FieldDescriptor::new("TVM", 20, 1),
    FieldDescriptor::new("TW", 21, 1),
    FieldDescriptor::new("TSR", 22, 1),
    FieldDescriptor::new("UXL", 32, 2),
    FieldDescriptor::new("SXL", 34, 2),
    FieldDescriptor::new("SBE", 36, 1),
    FieldDescriptor::new("MBE", 37, 1),
    FieldDescriptor::new("SD", 63, 1),
];

/// Field layout for `fcsr` (`frm` + `fflags`).
pub const FCSR_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("NX", 0, 1),
    FieldDescriptor::new("UF", 1, 1),
    FieldDescriptor::new("OF", 2, 1),
    FieldDescriptor::new("DZ", 3, 1),
    FieldDescriptor::new("NV", 4, 1),
    FieldDescriptor::new("FRM", 5, 3),
];

/// Field layout for `vcsr` (`vxsat` + `vxrm`).
pub const VCSR_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("VXSAT", 0, 1),
    FieldDescriptor::new("VXRM", 1, 2),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_mpp_from_mstatus() {
        let mpp_field = MSTATUS_FIELDS.iter().find(|f| f.name == "MPP").unwrap();
        // MPP = 0b11 (Machine), at bits 12:11.
        let value = 0b11 << 11;
        assert_eq!(mpp_field.extract(value), 0b11);
    }

    #[test]
    fn diff_fields_reports_only_changes() {
        let before = 0u64;
        let after = 0b11 << 11; // MPP set to 3.
        let diffs = diff_fields(MSTATUS_FIELDS, before, after);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].name, "MPP");
        assert_eq!(diffs[0].before, 0);
        assert_eq!(diffs[0].after, 0b11);
    }

    #[test]
    fn diff_fields_empty_when_unchanged() {
        assert!(diff_fields(MSTATUS_FIELDS, 42, 42).is_empty());
    }
}
