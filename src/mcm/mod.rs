//! The memory-consistency-model checker: ingests a timestamped RTL memory-event stream and
//! certifies it against the architectural in-order model.
//!
//! Grounded on the reference simulator's `Mcm<URV>` class. Unlike the CSR file and trigger
//! engine, [`Mcm`] is not generic over [`crate::Xlen`]: addresses, data, and time are uniformly
//! `u64` regardless of a hart's configured register width, since the checker's own state never
//! needs to be narrowed to a hart's XLEN.

pub mod forward;
pub mod instr;
pub mod ppo;

use std::collections::HashMap;

use log::{error, trace, warn};

use instr::{HartMcmState, MemoryOp};
pub use instr::{DecodedInstr, ElementStatus, FenceSet, RegIx, VectorElem, VectorLdSt};
pub use ppo::PpoRule;

/// Construction-time parameters.
#[derive(Debug, Clone)]
pub struct McmConfig {
    pub hart_count: usize,
    /// Merge-buffer (cache) line size in bytes. `0` means "no merge buffer": every
    /// `mergeBufferInsert` behaves as an immediate `bypassOp` and `mergeBufferWrite` is never
    /// called.
    pub merge_buffer_line_size: usize,
    /// Check the entire drained line against `rtl_line`, rather than only the bytes a covered
    /// store instruction actually writes.
    pub check_whole_line: bool,
    /// Which PPO rules are enabled. Empty means "all enabled except [`PpoRule::Io`]", the
    /// simulator's usual default.
    pub enabled_ppo_rules: Vec<PpoRule>,
    pub is_tso: bool,
    /// Whether `fence`'s predecessor/successor sets are enlarged to cover I/O accesses (the
    /// `menvcfg.FIOM`/`senvcfg.FIOM` bit), consulted by PPO rule R4.
    pub fiom: bool,
    /// Page size in bytes, used only to split a page-straddling scalar access's logical byte
    /// offsets across its two physical addresses.
    pub page_size: u64,
}

impl Default for McmConfig {
    fn default() -> Self {
        Self {
            hart_count: 1,
            merge_buffer_line_size: 64,
            check_whole_line: false,
            enabled_ppo_rules: Vec::new(),
            is_tso: false,
            fiom: false,
            page_size: 4096,
        }
    }
}

impl McmConfig {
    fn rule_enabled(&self, rule: PpoRule) -> bool {
        if self.enabled_ppo_rules.is_empty() {
            rule != PpoRule::Io
        } else {
            self.enabled_ppo_rules.contains(&rule)
        }
    }
}

/// Severity of a recorded [`McmViolation`]. A run accumulates violations and keeps going
/// regardless; only the aggregate run status the embedder derives from the log
/// distinguishes "failed" from "clean".
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Severity {
    Fatal,
    Warning,
}

/// The non-PPO failure kinds an ingestion-protocol violation can take.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ProtocolErrorKind {
    NonMonotonicTime,
    InsertForNonPendingStore,
    WriteWithoutInsert,
    LineBoundsViolation,
    MergeBufferLineMismatch,
    LoadDataMismatch,
    StoreDataMismatch,
    IncompleteAtEndOfRun,
    MissingReadOp,
}

impl std::fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NonMonotonicTime => "non-monotonic event time",
            Self::InsertForNonPendingStore => "merge-buffer insert for an instruction with no pending store",
            Self::WriteWithoutInsert => "merge-buffer drain covers a byte with no matching insert",
            Self::LineBoundsViolation => "write op straddles a merge-buffer line boundary",
            Self::MergeBufferLineMismatch => "drained line mismatches the model image",
            Self::LoadDataMismatch => "RTL-returned load data mismatches the model value",
            Self::StoreDataMismatch => "bypassed store write mismatches the architectural store value",
            Self::IncompleteAtEndOfRun => "store instruction incomplete at end of run",
            Self::MissingReadOp => "load byte has no matching read op",
        };
        f.write_str(s)
    }
}

/// A recorded MCM failure: either a protocol error or a PPO-rule violation.
/// Reported, never propagated as a `Result` — see the note on [`crate::error`].
#[derive(Debug, Clone)]
pub enum McmViolation {
    Protocol {
        hart: usize,
        tag: u64,
        time: u64,
        pa: u64,
        kind: ProtocolErrorKind,
    },
    Ppo {
        rule: PpoRule,
        severity: Severity,
        hart: usize,
        tag1: u64,
        tag2: u64,
        time1: u64,
        time2: u64,
        pa: u64,
    },
}

impl McmViolation {
    pub fn severity(&self) -> Severity {
        match self {
            Self::Protocol { .. } => Severity::Fatal,
            Self::Ppo { severity, .. } => *severity,
        }
    }
}

/// The memory-consistency-model checker for all harts of one simulation run.
pub struct Mcm {
    config: McmConfig,
    harts: Vec<HartMcmState>,
    ops: Vec<MemoryOp>,
    time: u64,
    violations: Vec<McmViolation>,
    skip_read_check: std::collections::HashSet<u64>,
    /// Committed memory image: bytes made globally visible by a successful merge-buffer drain
    /// or a bypass write. Read by the forwarding oracle when no in-flight forwarder covers a
    /// byte. Absent entries read as `0`, matching a freshly reset simulation.
    memory: HashMap<u64, u8>,
}

impl Mcm {
    pub fn new(config: McmConfig) -> Self {
        let hart_count = config.hart_count;
        Self {
            config,
            harts: (0..hart_count).map(|_| HartMcmState::default()).collect(),
            ops: Vec::new(),
            time: 0,
            violations: Vec::new(),
            skip_read_check: std::collections::HashSet::new(),
            memory: HashMap::new(),
        }
    }

    pub fn merge_buffer_line_size(&self) -> usize {
        self.config.merge_buffer_line_size
    }

    pub fn enable_tso(&mut self, flag: bool) {
        self.config.is_tso = flag;
    }

    pub fn skip_read_check(&mut self, addr: u64) {
        self.skip_read_check.insert(addr);
    }

    pub fn set_check_whole_mb_line(&mut self, flag: bool) {
        self.config.check_whole_line = flag;
    }

    /// Drains and returns every violation recorded since the last drain.
    pub fn drain_violations(&mut self) -> Vec<McmViolation> {
        std::mem::take(&mut self.violations)
    }

    pub fn violations(&self) -> &[McmViolation] {
        &self.violations
    }

    fn record(&mut self, violation: McmViolation) {
        match &violation {
            McmViolation::Protocol { hart, tag, time, pa, kind } => {
                error!(hart = hart, tag = tag, time = time, pa:% = format!("{pa:#x}"); "{kind}");
            }
            McmViolation::Ppo { rule, hart, tag1, tag2, time1, time2, pa, severity } => {
                let level = if *severity == Severity::Warning { log::Level::Warn } else { log::Level::Error };
                log::log!(level, hart = hart, tag1 = tag1, tag2 = tag2, time1 = time1, time2 = time2, pa:% = format!("{pa:#x}"); "PPO {rule:?} failed");
            }
        }
        self.violations.push(violation);
    }

    fn protocol_error(&mut self, hart: usize, tag: u64, time: u64, pa: u64, kind: ProtocolErrorKind) {
        self.record(McmViolation::Protocol { hart, tag, time, pa, kind });
    }

    /// Validates and, where necessary, repairs a newly-arrived event's timestamp. Read events that arrive out of order relative to the
    /// last observed time are tolerated and later re-sorted by [`Self::insert_op_sorted`]; any
    /// other non-monotonic arrival is a protocol error but does not block ingestion.
    fn update_time(&mut self, hart: usize, tag: u64, time: u64, pa: u64, is_read: bool) -> bool {
        if time < self.time {
            if is_read {
                return false; // caller repairs via insert_op_sorted instead of appending.
            }
            self.protocol_error(hart, tag, time, pa, ProtocolErrorKind::NonMonotonicTime);
            return true;
        }
        self.time = time;
        true
    }

    /// Appends `op` to the global ops vector, or — if its time is behind the last observed
    /// time and it is a read — inserts it into sorted position and shifts every subsequent
    /// `mem_op_ixs`/`pending_writes` reference accordingly.
    fn push_op(&mut self, op: MemoryOp) -> usize {
        if op.is_read && op.time < self.ops.last().map(|o| o.time).unwrap_or(0) {
            let ix = self.ops.partition_point(|existing| existing.time <= op.time);
            self.ops.insert(ix, op);
            for hart in &mut self.harts {
                for instr in &mut hart.instrs {
                    for slot in &mut instr.mem_op_ixs {
                        if *slot >= ix {
                            *slot += 1;
                        }
                    }
                }
                for slot in &mut hart.pending_writes {
                    if *slot >= ix {
                        *slot += 1;
                    }
                }
            }
            trace!(insert_ix = ix; "repaired out-of-order read event into sorted position");
            ix
        } else {
            self.ops.push(op);
            self.ops.len() - 1
        }
    }

    /// A read operation issued for a load or AMO.
    pub fn read_op(
        &mut self,
        hart: usize,
        time: u64,
        tag: u64,
        pa: u64,
        size: u8,
        rtl_data: u64,
        elem_ix: Option<u32>,
        field: Option<u32>,
        cache: bool,
        is_io: bool,
    ) -> bool {
        self.update_time(hart, tag, time, pa, true);
        let op = MemoryOp {
            time,
            hart_ix: hart,
            tag,
            pa,
            size,
            data: rtl_data,
            rtl_data,
            is_read: true,
            bypass: false,
            canceled: false,
            elem_ix,
            field,
            is_io,
            cache,
            forward_time: vec![None; size as usize],
        };
        let op_ix = self.push_op(op);
        let instr_ix = self.harts[hart].find_or_add(tag, hart);
        self.harts[hart].instrs[instr_ix].add_mem_op(op_ix);
        true
    }

    /// A write that bypasses the merge buffer entirely: AMO result, SC success, or a CMO drain
    ///. Commits directly to the model's memory image.
    pub fn bypass_op(
        &mut self,
        hart: usize,
        time: u64,
        tag: u64,
        pa: u64,
        size: u8,
        rtl_data: u64,
        elem_ix: Option<u32>,
        field: Option<u32>,
        cache: bool,
        is_io: bool,
    ) -> bool {
        self.update_time(hart, tag, time, pa, false);
        for i in 0..size as u64 {
            let byte = (rtl_data >> (8 * i)) as u8;
            self.memory.insert(pa + i, byte);
        }
        let op = MemoryOp {
            time,
            hart_ix: hart,
            tag,
            pa,
            size,
            data: rtl_data,
            rtl_data,
            is_read: false,
            bypass: true,
            canceled: false,
            elem_ix,
            field,
            is_io,
            cache,
            forward_time: Vec::new(),
        };
        let op_ix = self.push_op(op);
        let instr_ix = self.harts[hart].find_or_add(tag, hart);
        let instr = &mut self.harts[hart].instrs[instr_ix];
        instr.add_mem_op(op_ix);
        if size == 0 {
            instr.cbo_bypass_count += 1;
        } else {
            for i in 0..size as u64 {
                instr.covered_bytes.insert(pa + i);
            }
        }
        self.recompute_store_complete(hart, instr_ix);
        true
    }

    /// Inserts a store into the merge buffer. When the merge buffer is
    /// disabled (`merge_buffer_line_size == 0`) this behaves as an immediate [`Self::bypass_op`]
    /// instead. Inserting against a tag whose instruction was already canceled has no pending
    /// store to insert into and is reported as [`ProtocolErrorKind::InsertForNonPendingStore`].
    pub fn merge_buffer_insert(
        &mut self,
        hart: usize,
        time: u64,
        tag: u64,
        pa: u64,
        size: u8,
        rtl_data: u64,
        elem_ix: Option<u32>,
        field: Option<u32>,
    ) -> bool {
        if self.config.merge_buffer_line_size == 0 {
            return self.bypass_op(hart, time, tag, pa, size, rtl_data, elem_ix, field, false, false);
        }
        let instr_ix = self.harts[hart].find_or_add(tag, hart);
        if self.harts[hart].instrs[instr_ix].canceled {
            self.protocol_error(hart, tag, time, pa, ProtocolErrorKind::InsertForNonPendingStore);
            return false;
        }
        self.update_time(hart, tag, time, pa, false);
        let op = MemoryOp {
            time,
            hart_ix: hart,
            tag,
            pa,
            size,
            data: rtl_data,
            rtl_data,
            is_read: false,
            bypass: false,
            canceled: false,
            elem_ix,
            field,
            is_io: false,
            cache: true,
            forward_time: Vec::new(),
        };
        let op_ix = self.push_op(op);
        self.harts[hart].instrs[instr_ix].add_mem_op(op_ix);
        self.harts[hart].pending_writes.push(op_ix);
        self.harts[hart].undrained.insert(tag);
        true
    }

    /// Cancels every memory op belonging to `tag`. Per the
    /// embedding contract, cancels must arrive in reverse program order so a producer is never
    /// cancelled before its dependents; the register-producer map is deliberately not rewound
    /// here.
    pub fn cancel_instruction(&mut self, hart: usize, tag: u64) {
        let Some(ix) = self.harts[hart].find_ix(tag) else {
            return;
        };
        if self.harts[hart].instrs[ix].canceled {
            warn!(hart = hart, tag = tag; "instruction already canceled");
        }
        self.harts[hart].instrs[ix].cancel();
        let op_ixs = self.harts[hart].instrs[ix].mem_op_ixs.clone();
        for op_ix in op_ixs {
            self.ops[op_ix].cancel();
        }
        self.harts[hart].pending_writes.retain(|&op_ix| self.ops[op_ix].tag != tag);
        self.harts[hart].undrained.remove(&tag);
    }

    pub fn set_current_instruction(&mut self, hart: usize, tag: u64) -> bool {
        if self.harts[hart].find_ix(tag).is_none() {
            return false;
        }
        self.harts[hart].current_tag = Some(tag);
        true
    }

    /// The current-load-value oracle: resolves the architectural value a
    /// retiring load should see by reconciling forwarding against the committed memory image.
    pub fn get_current_load_value(&mut self, hart: usize, addr: u64, size: u8) -> Option<u64> {
        let tag = self.harts[hart].current_tag?;
        Some(self.resolve_load_value(hart, tag, addr, size))
    }

    /// Called once after the last event of a run: every store still in a hart's undrained set
    /// never reached the merge buffer's final drain, reported as
    /// [`ProtocolErrorKind::IncompleteAtEndOfRun`].
    pub fn end_of_run_checks(&mut self) {
        for hart in 0..self.harts.len() {
            let undrained: Vec<u64> = self.harts[hart].undrained.iter().copied().collect();
            for tag in undrained {
                let pa = self.harts[hart].find_ix(tag).map(|ix| self.harts[hart].instrs[ix].pa).unwrap_or(0);
                self.protocol_error(hart, tag, self.time, pa, ProtocolErrorKind::IncompleteAtEndOfRun);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::instr::{DecodedInstr, RegIx};
    use super::*;

    fn single_hart() -> Mcm {
        Mcm::new(McmConfig { hart_count: 1, ..McmConfig::default() })
    }

    /// A later load sees an undrained store's value by forwarding.
    #[test]
    fn store_forwards_to_later_load_before_drain() {
        let mut mcm = single_hart();
        // sw x1,0(x2): data=0xDEAD_BEEF pa=0x1000, retires at time 10, undrained.
        mcm.merge_buffer_insert(0, 5, 5, 0x1000, 4, 0xDEAD_BEEF, None, None);
        let mut decoded = DecodedInstr {
            is_store: true,
            pa: 0x1000,
            size: 4,
            data: 0xDEAD_BEEF,
            ..Default::default()
        };
        decoded.data_regs.push(RegIx::int(1));
        mcm.retire(0, 10, 5, decoded);

        // lw x3,0(x2) read-op at time 12.
        mcm.read_op(0, 12, 6, 0x1000, 4, 0xDEAD_BEEF, None, None, false, false);
        mcm.set_current_instruction(0, 6);
        let value = mcm.get_current_load_value(0, 0x1000, 4).unwrap();
        assert_eq!(value, 0xDEAD_BEEF);

        // Drain at time 20 with the forwarded value actually committed: no error.
        let line = {
            let mut l = vec![0u8; 64];
            l[0..4].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
            l
        };
        let mask = {
            let mut m = vec![false; 64];
            m[0..4].fill(true);
            m
        };
        mcm.merge_buffer_write(0, 20, 0x1000, &line, &mask);
        assert!(mcm.violations().is_empty());
    }

    /// Draining a program-order-earlier store after a later one that overlaps it violates R1.
    #[test]
    fn ppo_r1_violation_on_out_of_order_drain() {
        let mut mcm = single_hart();
        mcm.merge_buffer_insert(0, 1, 5, 0x2000, 4, 0x1111_1111, None, None);
        mcm.retire(0, 2, 5, DecodedInstr { is_store: true, pa: 0x2000, size: 4, data: 0x1111_1111, ..Default::default() });
        mcm.merge_buffer_insert(0, 3, 6, 0x2000, 4, 0x2222_2222, None, None);
        mcm.retire(0, 4, 6, DecodedInstr { is_store: true, pa: 0x2000, size: 4, data: 0x2222_2222, ..Default::default() });

        let mut line = vec![0u8; 64];
        let mut mask = vec![false; 64];
        // Drain tag 6 first, at time 30.
        line[0..4].copy_from_slice(&0x2222_2222u32.to_le_bytes());
        mask[0..4].fill(true);
        mcm.merge_buffer_write(0, 30, 0x2000, &line, &mask);

        // Then drain tag 5 at time 40: later in time but earlier in program order -> R1 fails.
        line[0..4].copy_from_slice(&0x1111_1111u32.to_le_bytes());
        mcm.merge_buffer_write(0, 40, 0x2000, &line, &mask);

        let found = mcm.violations().iter().any(|v| matches!(
            v,
            McmViolation::Ppo { rule: PpoRule::R1, tag1: 5, tag2: 6, time1: 40, time2: 30, pa: 0x2000, .. }
        ));
        assert!(found, "expected PPO R1 violation, got {:?}", mcm.violations());
    }

    #[test]
    fn canceled_instruction_cancels_its_ops() {
        let mut mcm = single_hart();
        mcm.read_op(0, 1, 9, 0x3000, 4, 0xAAAA_AAAA, None, None, false, false);
        mcm.cancel_instruction(0, 9);
        let ix = mcm.harts[0].find_ix(9).unwrap();
        assert!(mcm.harts[0].instrs[ix].canceled);
        let op_ix = mcm.harts[0].instrs[ix].mem_op_ixs[0];
        assert!(mcm.ops[op_ix].is_canceled());
    }

    /// Inserting into the merge buffer for a tag whose instruction was already canceled has no
    /// pending store to insert into.
    #[test]
    fn merge_buffer_insert_for_canceled_instruction_is_a_protocol_error() {
        let mut mcm = single_hart();
        mcm.merge_buffer_insert(0, 1, 7, 0x4000, 4, 0xBEEF_BEEF, None, None);
        mcm.cancel_instruction(0, 7);
        mcm.merge_buffer_insert(0, 2, 7, 0x4000, 4, 0xBEEF_BEEF, None, None);

        let found = mcm.violations().iter().any(|v| matches!(
            v,
            McmViolation::Protocol { tag: 7, kind: ProtocolErrorKind::InsertForNonPendingStore, .. }
        ));
        assert!(found, "expected InsertForNonPendingStore, got {:?}", mcm.violations());
    }

    /// A merge-buffer drain that writes a byte the model never saw inserted is a
    /// write-without-insert, distinct from an ordinary data mismatch against a real insert.
    #[test]
    fn drain_byte_with_no_matching_insert_is_write_without_insert() {
        let mut mcm = single_hart();
        let mut line = vec![0u8; 64];
        let mut mask = vec![false; 64];
        line[0] = 0xAB;
        mask[0] = true;
        mcm.merge_buffer_write(0, 10, 0x5000, &line, &mask);

        let found = mcm.violations().iter().any(|v| matches!(
            v,
            McmViolation::Protocol { kind: ProtocolErrorKind::WriteWithoutInsert, .. }
        ));
        assert!(found, "expected WriteWithoutInsert, got {:?}", mcm.violations());
    }

    #[test]
    fn undrained_store_at_end_of_run_is_reported() {
        let mut mcm = single_hart();
        mcm.merge_buffer_insert(0, 1, 11, 0x6000, 4, 0xCAFE_CAFE, None, None);
        mcm.retire(0, 2, 11, DecodedInstr { is_store: true, pa: 0x6000, size: 4, data: 0xCAFE_CAFE, ..Default::default() });

        mcm.end_of_run_checks();

        let found = mcm.violations().iter().any(|v| matches!(
            v,
            McmViolation::Protocol { tag: 11, kind: ProtocolErrorKind::IncompleteAtEndOfRun, .. }
        ));
        assert!(found, "expected IncompleteAtEndOfRun, got {:?}", mcm.violations());
    }
}
