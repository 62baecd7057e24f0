//! Store-forwarding, the current-load-value oracle, merge-buffer drain, and retire-time
//! bookkeeping.
//!
//! Grounded on `Mcm.cpp`'s `forwardToRead`/`forwardTo`, `collectCoveredWrites`, and the
//! `retire` method's byte-level load/store checks.

use log::trace;

use super::instr::{self, ElementStatus, McmInstr};
use super::{Mcm, McmViolation, ProtocolErrorKind};

impl Mcm {
    /// The current-load-value oracle's core: resolves every byte of
    /// `[addr, addr+size)` by searching, in reverse program order, the same-hart stores
    /// preceding `tag` for the most recent one covering that byte, falling back to the
    /// committed memory image when none is found.
    pub(super) fn resolve_load_value(&mut self, hart: usize, tag: u64, addr: u64, size: u8) -> u64 {
        let mut bytes = Vec::with_capacity(size as usize);
        for i in 0..size as u64 {
            bytes.push(self.forward_byte(hart, tag, addr + i));
        }

        let read_op_ixs: Vec<usize> = self.harts[hart]
            .find_ix(tag)
            .map(|ix| self.harts[hart].instrs[ix].mem_op_ixs.clone())
            .unwrap_or_default();
        for (i, &(_, forward_time)) in bytes.iter().enumerate() {
            let byte_addr = addr + i as u64;
            for &op_ix in &read_op_ixs {
                let op = &mut self.ops[op_ix];
                if op.is_read && byte_addr >= op.pa && byte_addr < op.pa + op.size as u64 {
                    let b = (byte_addr - op.pa) as usize;
                    if b < op.forward_time.len() {
                        op.forward_time[b] = forward_time;
                    }
                }
            }
        }

        let mut value = 0u64;
        for (i, &(byte, _)) in bytes.iter().enumerate() {
            value |= (byte as u64) << (8 * i as u32);
        }
        value
    }

    /// Finds the newest same-hart, program-order-preceding, retired, non-canceled store that
    /// covers `byte_addr`, returning its byte value and the time to attribute to the forward
    /// (used to tighten PPO proofs). Falls back to the committed memory image (time `None`) when
    /// no forwarder covers the byte.
    fn forward_byte(&self, hart: usize, before_tag: u64, byte_addr: u64) -> (u8, Option<u64>) {
        let mut best: Option<&McmInstr> = None;
        for candidate in &self.harts[hart].instrs {
            if candidate.tag >= before_tag || candidate.canceled || !candidate.retired || !candidate.is_store {
                continue;
            }
            let covers = if candidate.decoded.vector.is_some() {
                candidate
                    .vector_refs
                    .iter()
                    .any(|e| matches!(e.status, ElementStatus::Active) && (0..e.size as u64).any(|i| e.pa + i == byte_addr))
            } else {
                instr::instr_offset_for_addr(candidate.pa, candidate.pa2, candidate.size, self.config.page_size, byte_addr).is_some()
            };
            if !covers {
                continue;
            }
            if best.map(|b| b.tag < candidate.tag).unwrap_or(true) {
                best = Some(candidate);
            }
        }

        if let Some(store) = best {
            let byte = self.store_byte(store, byte_addr);
            let time = self.latest_op_time_of(store);
            (byte, Some(time))
        } else {
            (self.memory.get(&byte_addr).copied().unwrap_or(0), None)
        }
    }

    /// Like [`Self::forward_byte`] but returns the forwarding store's tag rather than its value,
    /// for PPO rules that need to reason about *which* instruction produced a byte (R2, R3).
    pub(super) fn find_forwarder_tag(&self, hart: usize, before_tag: u64, byte_addr: u64) -> Option<u64> {
        let mut best: Option<&McmInstr> = None;
        for candidate in &self.harts[hart].instrs {
            if candidate.tag >= before_tag || candidate.canceled || !candidate.retired || !candidate.is_store {
                continue;
            }
            let covers = if candidate.decoded.vector.is_some() {
                candidate
                    .vector_refs
                    .iter()
                    .any(|e| matches!(e.status, ElementStatus::Active) && (0..e.size as u64).any(|i| e.pa + i == byte_addr))
            } else {
                instr::instr_offset_for_addr(candidate.pa, candidate.pa2, candidate.size, self.config.page_size, byte_addr).is_some()
            };
            if !covers {
                continue;
            }
            if best.map(|b| b.tag < candidate.tag).unwrap_or(true) {
                best = Some(candidate);
            }
        }
        best.map(|b| b.tag)
    }

    fn store_byte(&self, store: &McmInstr, byte_addr: u64) -> u8 {
        if store.decoded.vector.is_some() {
            store
                .vector_refs
                .iter()
                .find(|e| (0..e.size as u64).any(|i| e.pa + i == byte_addr))
                .map(|e| {
                    let off = (byte_addr - e.pa) as u32;
                    ((e.data >> (8 * off)) & 0xff) as u8
                })
                .unwrap_or(0)
        } else {
            match instr::instr_offset_for_addr(store.pa, store.pa2, store.size, self.config.page_size, byte_addr) {
                Some(off) => ((store.data >> (8 * off as u32)) & 0xff) as u8,
                None => 0,
            }
        }
    }

    fn model_byte(&self, hart: usize, instr_ix: usize, addr: u64) -> Option<u8> {
        let instr = &self.harts[hart].instrs[instr_ix];
        if instr.decoded.vector.is_some() {
            instr
                .vector_refs
                .iter()
                .find(|e| (0..e.size as u64).any(|i| e.pa + i == addr))
                .map(|e| {
                    let off = (addr - e.pa) as u32;
                    ((e.data >> (8 * off)) & 0xff) as u8
                })
        } else {
            let off = instr::instr_offset_for_addr(instr.pa, instr.pa2, instr.size, self.config.page_size, addr)?;
            Some(((instr.data >> (8 * off as u32)) & 0xff) as u8)
        }
    }

    fn load_bytes(&self, hart: usize, instr_ix: usize) -> Vec<u64> {
        let instr = &self.harts[hart].instrs[instr_ix];
        if let Some(vec) = &instr.decoded.vector {
            vec.elems
                .iter()
                .filter(|e| matches!(e.status, ElementStatus::Active))
                .flat_map(|e| (0..e.size as u64).map(move |i| e.pa + i))
                .collect()
        } else {
            (0..instr.size as u64)
                .map(|i| instr::instr_byte_addr(instr.pa, instr.pa2, self.config.page_size, i as usize))
                .collect()
        }
    }

    pub(super) fn latest_op_time(&self, hart: usize, instr_ix: usize) -> u64 {
        self.harts[hart].instrs[instr_ix]
            .mem_op_ixs
            .iter()
            .map(|&ix| self.ops[ix].time)
            .max()
            .unwrap_or(self.time)
    }

    fn latest_op_time_of(&self, instr: &McmInstr) -> u64 {
        instr.mem_op_ixs.iter().map(|&ix| self.ops[ix].time).max().unwrap_or(self.time)
    }

    /// `earliestOpTime` of `Mcm.hpp`: the earliest time among an instruction's recorded memory
    /// ops, used by R10/R13's "earliest write-op time" comparisons.
    pub(super) fn earliest_op_time(&self, hart: usize, instr_ix: usize) -> Option<u64> {
        self.harts[hart].instrs[instr_ix].mem_op_ixs.iter().map(|&ix| self.ops[ix].time).min()
    }

    /// `isBeforeInMemoryTime` of `Mcm.hpp`: both instructions must be `complete`; a same-time
    /// tie between two stores breaks by program-order tag.
    pub(super) fn is_before_in_memory_time(&self, hart: usize, a_ix: usize, b_ix: usize) -> bool {
        let (a_complete, a_is_store, a_tag) = {
            let a = &self.harts[hart].instrs[a_ix];
            (a.complete, a.is_store, a.tag)
        };
        let (b_complete, b_is_store, b_tag) = {
            let b = &self.harts[hart].instrs[b_ix];
            (b.complete, b.is_store, b.tag)
        };
        if !a_complete || !b_complete {
            return false;
        }
        let a_time = self.latest_op_time(hart, a_ix);
        let b_time = self.earliest_op_time(hart, b_ix).unwrap_or_else(|| self.latest_op_time(hart, b_ix));
        if a_is_store && b_is_store && a_time == b_time {
            return a_tag < b_tag;
        }
        a_time < b_time
    }

    /// An instruction is retired with the Hart's decoded facts.
    pub fn retire(&mut self, hart: usize, time: u64, tag: u64, decoded: super::instr::DecodedInstr) -> bool {
        self.update_time(hart, tag, time, decoded.pa, false);
        let instr_ix = self.harts[hart].find_or_add(tag, hart);
        if self.harts[hart].instrs[instr_ix].retired {
            log::warn!(hart = hart, tag = tag; "instruction retired twice");
            return false;
        }

        {
            let instr = &mut self.harts[hart].instrs[instr_ix];
            instr.retired = true;
            instr.is_load = decoded.is_load;
            instr.is_store = decoded.is_store || decoded.is_amo;
            instr.pa = decoded.pa;
            instr.pa2 = decoded.pa2;
            instr.size = decoded.size;
            instr.data = decoded.data;
            if let Some(vec) = &decoded.vector {
                instr.vector_refs = vec.elems.clone();
            }
            instr.decoded = decoded;
        }

        if self.harts[hart].instrs[instr_ix].canceled {
            // Cancellation round-trip: a no-op on state other than the cancel mark.
            return true;
        }

        if self.harts[hart].instrs[instr_ix].is_load {
            self.retire_load(hart, instr_ix);
        }
        if self.harts[hart].instrs[instr_ix].is_store {
            self.retire_store(hart, instr_ix);
        }

        self.resolve_producers(hart, instr_ix);
        if self.harts[hart].instrs[instr_ix].is_memory() {
            self.check_ppo_rules(hart, instr_ix);
        }
        self.update_dependencies(hart, instr_ix);
        true
    }

    fn retire_load(&mut self, hart: usize, instr_ix: usize) {
        let tag = self.harts[hart].instrs[instr_ix].tag;
        if let Some(vec) = self.harts[hart].instrs[instr_ix].decoded.vector.clone() {
            for elem in &vec.elems {
                if !matches!(elem.status, ElementStatus::Active) {
                    continue;
                }
                let value = self.resolve_load_value(hart, tag, elem.pa, elem.size);
                if let Some(target) = self.harts[hart].instrs[instr_ix]
                    .vector_refs
                    .iter_mut()
                    .find(|e| e.elem_ix == elem.elem_ix && e.field == elem.field)
                {
                    target.data = value;
                }
            }
        } else {
            let pa = self.harts[hart].instrs[instr_ix].pa;
            let size = self.harts[hart].instrs[instr_ix].size;
            let value = self.resolve_load_value(hart, tag, pa, size);
            self.harts[hart].instrs[instr_ix].data = value;
        }
        self.check_load_complete(hart, instr_ix);
    }

    /// Confirms every byte of a retiring load has a matching read op, compares the resolved
    /// model value against the RTL-returned value, and marks the instruction complete once
    /// every byte's read op has arrived, independent of whether the compare passed — a mismatch
    /// is reported but does not block completion.
    fn check_load_complete(&mut self, hart: usize, instr_ix: usize) {
        let tag = self.harts[hart].instrs[instr_ix].tag;
        let addrs = self.load_bytes(hart, instr_ix);
        let read_ops = self.harts[hart].instrs[instr_ix].mem_op_ixs.clone();

        let mut all_present = true;
        for addr in addrs {
            let matched = read_ops.iter().copied().find(|&op_ix| {
                let op = &self.ops[op_ix];
                op.is_read && !op.is_canceled() && addr >= op.pa && addr < op.pa + op.size as u64
            });
            let Some(op_ix) = matched else {
                all_present = false;
                self.protocol_error(hart, tag, self.time, addr, ProtocolErrorKind::MissingReadOp);
                continue;
            };
            let (op_time, rtl_byte) = {
                let op = &self.ops[op_ix];
                let off = (addr - op.pa) as u32;
                (op.time, ((op.rtl_data >> (8 * off)) & 0xff) as u8)
            };
            let model_byte = self.model_byte(hart, instr_ix, addr).unwrap_or(0);
            if !self.skip_read_check.contains(&addr) && rtl_byte != model_byte {
                self.protocol_error(hart, tag, op_time, addr, ProtocolErrorKind::LoadDataMismatch);
            }
        }
        if all_present {
            self.harts[hart].instrs[instr_ix].complete = true;
        }
    }

    fn retire_store(&mut self, hart: usize, instr_ix: usize) {
        let tag = self.harts[hart].instrs[instr_ix].tag;
        let bypass_op_ixs: Vec<usize> = self.harts[hart].instrs[instr_ix]
            .mem_op_ixs
            .iter()
            .copied()
            .filter(|&ix| self.ops[ix].bypass)
            .collect();
        for op_ix in bypass_op_ixs {
            let (pa, size, op_time, rtl_data) = {
                let op = &self.ops[op_ix];
                (op.pa, op.size, op.time, op.rtl_data)
            };
            for i in 0..size as u64 {
                let addr = pa + i;
                let Some(model) = self.model_byte(hart, instr_ix, addr) else { continue };
                let rtl_byte = ((rtl_data >> (8 * i as u32)) & 0xff) as u8;
                if model != rtl_byte {
                    self.protocol_error(hart, tag, op_time, addr, ProtocolErrorKind::StoreDataMismatch);
                }
            }
        }
        self.recompute_store_complete(hart, instr_ix);
    }

    /// Completeness by kind: scalar store/AMO needs every declared byte covered; `cbo.zero`
    /// needs a full line; `cbo.clean/flush/inval` needs exactly one zero-size bypass event; a
    /// vector store needs every active-element byte covered.
    pub(super) fn recompute_store_complete(&mut self, hart: usize, instr_ix: usize) {
        let complete = {
            let instr = &self.harts[hart].instrs[instr_ix];
            if !instr.is_store {
                return;
            }
            if instr.decoded.is_cbo_clean_flush_inval {
                instr.cbo_bypass_count >= 1
            } else if instr.decoded.is_cbo_zero {
                instr.covered_bytes.len() >= self.config.merge_buffer_line_size.max(1)
            } else if let Some(vec) = &instr.decoded.vector {
                vec.elems
                    .iter()
                    .filter(|e| matches!(e.status, ElementStatus::Active))
                    .all(|e| (0..e.size as u64).all(|i| instr.covered_bytes.contains(&(e.pa + i))))
            } else {
                instr.covered_bytes.len() >= instr.size as usize
            }
        };
        let was_complete = self.harts[hart].instrs[instr_ix].complete;
        let instr = &mut self.harts[hart].instrs[instr_ix];
        instr.complete = complete;
        let tag = instr.tag;
        if complete {
            self.harts[hart].undrained.remove(&tag);
        }
        // R1 (write-write/write-read coherence) depends on an instruction's final drain time,
        // which may only be known well after retire; re-derive it each time completeness newly
        // becomes true rather than once at retire.
        if complete && !was_complete && self.config.rule_enabled(super::PpoRule::R1) {
            self.check_ppo_r1(hart, instr_ix);
        }
    }

    /// Splits producer bookkeeping by PPO rule: R9 consults the address register plus, for an
    /// indexed vector ld/st, each index-vector register; R10 consults the data register(s) only
    ///.
    fn resolve_producers(&mut self, hart: usize, instr_ix: usize) {
        let decoded = self.harts[hart].instrs[instr_ix].decoded.clone();
        let mut addr_producers = Vec::new();
        if let Some(r) = decoded.addr_reg {
            if let Some(p) = self.harts[hart].reg_producer.get(&r).copied() {
                addr_producers.push(p);
            }
        }
        for r in &decoded.index_regs {
            if let Some(p) = self.harts[hart].reg_producer.get(r).copied() {
                addr_producers.push(p);
            }
        }
        let mut data_producers = Vec::new();
        for r in &decoded.data_regs {
            if let Some(p) = self.harts[hart].reg_producer.get(r).copied() {
                data_producers.push(p);
            }
        }
        let branch_producer = if decoded.branch_dependent { self.harts[hart].last_branch } else { None };

        let instr = &mut self.harts[hart].instrs[instr_ix];
        instr.addr_producers = addr_producers;
        instr.data_producers = data_producers;
        instr.branch_producer = branch_producer;
    }

    /// The destination-register entry now points at this instruction's tag and its effective
    /// time: for a load, the latest time among its memory ops; otherwise, retire time
    ///.
    fn update_dependencies(&mut self, hart: usize, instr_ix: usize) {
        let tag = self.harts[hart].instrs[instr_ix].tag;
        let is_load = self.harts[hart].instrs[instr_ix].is_load;
        let effective_time = if is_load { self.latest_op_time(hart, instr_ix) } else { self.time };
        let dest_regs = self.harts[hart].instrs[instr_ix].decoded.dest_regs.clone();
        for r in dest_regs {
            self.harts[hart].reg_producer.insert(r, (tag, effective_time));
        }
        if self.harts[hart].instrs[instr_ix].decoded.is_branch {
            self.harts[hart].last_branch = Some((tag, effective_time));
        }
        trace!(hart = hart, tag = tag, time = effective_time; "updated register-producer map at retire");
    }

    /// A merge-buffer drain: collects every pending write of
    /// `hart` that falls wholly within the draining line, composes the final line image from
    /// committed memory plus those writes in program order, and compares it byte-for-byte
    /// (under `mask`) against `rtl_line`.
    pub fn merge_buffer_write(&mut self, hart: usize, time: u64, pa: u64, rtl_line: &[u8], mask: &[bool]) -> bool {
        let line_size = self.config.merge_buffer_line_size;
        if line_size == 0 || pa % line_size as u64 != 0 {
            self.protocol_error(hart, 0, time, pa, ProtocolErrorKind::LineBoundsViolation);
            return false;
        }
        if rtl_line.len() < line_size || mask.len() < line_size {
            self.protocol_error(hart, 0, time, pa, ProtocolErrorKind::MergeBufferLineMismatch);
            return false;
        }
        self.update_time(hart, 0, time, pa, false);

        let line_end = pa + line_size as u64;
        let mut covered = Vec::new();
        let mut remaining = Vec::new();
        for op_ix in self.harts[hart].pending_writes.clone() {
            let op = &self.ops[op_ix];
            if op.is_canceled() {
                continue;
            }
            let fully_inside = op.pa >= pa && op.end() <= line_end;
            let overlaps = op.pa < line_end && pa < op.end();
            if fully_inside {
                covered.push(op_ix);
            } else if overlaps {
                let (tag, op_pa) = (op.tag, op.pa);
                self.protocol_error(hart, tag, time, op_pa, ProtocolErrorKind::LineBoundsViolation);
                remaining.push(op_ix);
            } else {
                remaining.push(op_ix);
            }
        }
        self.harts[hart].pending_writes = remaining;
        covered.sort_by_key(|&ix| self.ops[ix].tag);

        let mut line_image = vec![0u8; line_size];
        let mut insert_tag: Vec<Option<u64>> = vec![None; line_size];
        for (b, slot) in line_image.iter_mut().enumerate() {
            *slot = self.memory.get(&(pa + b as u64)).copied().unwrap_or(0);
        }
        for &op_ix in &covered {
            let op = &self.ops[op_ix];
            for i in 0..op.size as u64 {
                let off = (op.pa + i - pa) as usize;
                if off < line_image.len() {
                    line_image[off] = (op.data >> (8 * i)) as u8;
                    insert_tag[off] = Some(op.tag);
                }
            }
        }

        // A byte the drain says is written (`mask[b]`) but the model has no insert covering
        // is a write-without-insert; any other byte mismatch is a data mismatch between the
        // insert and the drain.
        let mut mismatch = false;
        for b in 0..line_size {
            let must_check = self.config.check_whole_line || mask[b];
            if must_check && line_image[b] != rtl_line[b] {
                mismatch = true;
                let kind = if mask[b] && insert_tag[b].is_none() {
                    ProtocolErrorKind::WriteWithoutInsert
                } else {
                    ProtocolErrorKind::MergeBufferLineMismatch
                };
                self.protocol_error(hart, insert_tag[b].unwrap_or(0), time, pa + b as u64, kind);
                break;
            }
        }

        // The RTL write is now reality regardless of the compare's outcome.
        for b in 0..line_size {
            if mask[b] {
                self.memory.insert(pa + b as u64, rtl_line[b]);
            }
        }

        let mut touched_tags = Vec::new();
        for &op_ix in &covered {
            let tag = self.ops[op_ix].tag;
            if !touched_tags.contains(&tag) {
                touched_tags.push(tag);
            }
        }
        for &op_ix in &covered {
            let (tag, op_pa, op_size) = {
                let op = &self.ops[op_ix];
                (op.tag, op.pa, op.size)
            };
            if let Some(ix) = self.harts[hart].find_ix(tag) {
                for i in 0..op_size as u64 {
                    self.harts[hart].instrs[ix].covered_bytes.insert(op_pa + i);
                }
            }
        }
        for tag in touched_tags {
            if let Some(ix) = self.harts[hart].find_ix(tag) {
                self.recompute_store_complete(hart, ix);
            }
        }

        !mismatch
    }
}
