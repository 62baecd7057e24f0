//! Shared record types for the MCM checker: memory operations, per-instruction bookkeeping, and
//! the per-hart state threaded through event ingestion.
//!
//! Grounded on `Mcm.hpp`'s `MemoryOp`/`McmInstr` structs, generalized with element-granular
//! vector ld/st bookkeeping the reference simulator spreads across `DecodedInst`/`Mcm.cpp`
//! rather than the header.

use std::collections::{HashMap, HashSet};

/// Unified register-producer index: integer registers at `+0`, floating-point at `+32`, CSRs at
/// `+64`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct RegIx(u16);

impl RegIx {
    const FP_OFFSET: u16 = 32;
    const CSR_OFFSET: u16 = 64;

    pub fn int(n: u16) -> Self {
        Self(n)
    }

    pub fn fp(n: u16) -> Self {
        Self(Self::FP_OFFSET + n)
    }

    pub fn csr(n: u16) -> Self {
        Self(Self::CSR_OFFSET + n)
    }
}

/// Whether a vector instruction's destination-register element is actively written this
/// instruction, left untouched because tail/mask-agnostic policy preserves the old value, or
/// entirely inactive.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ElementStatus {
    Active,
    Preserve,
    Skip,
}

/// One element of a vector load/store's per-element reference table.
#[derive(Debug, Clone)]
pub struct VectorElem {
    pub elem_ix: u32,
    pub field: u32,
    pub pa: u64,
    pub size: u8,
    pub data: u64,
    pub data_reg: RegIx,
    pub index_reg: Option<RegIx>,
    pub status: ElementStatus,
}

/// `fence pred,succ` operand sets, plus the two device-I/O bits FIOM may
/// fold into `pred`/`succ` on top of the plain read/write bits.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct FenceSet {
    pub read: bool,
    pub write: bool,
    pub device_input: bool,
    pub device_output: bool,
}

impl FenceSet {
    /// Whether this set would observe a given memory op, once FIOM has folded I/O into
    /// read/write as appropriate (R4's "possibly enlarged by FIOM to include I/O").
    pub fn matches(&self, is_read: bool, is_io: bool, fiom: bool) -> bool {
        let observes = if is_read { self.read } else { self.write };
        let observes_io = fiom
            && if is_read {
                self.device_input
            } else {
                self.device_output
            };
        (observes && !is_io) || (is_io && (observes || observes_io))
    }
}

/// Vector-specific decode facts for a vector load/store.
#[derive(Debug, Clone, Default)]
pub struct VectorLdSt {
    pub is_indexed: bool,
    pub is_strided: bool,
    pub stride: i64,
    pub elem_count: u32,
    pub field_count: u32,
    pub elems: Vec<VectorElem>,
}

/// The Hart-supplied decode facts for one memory instruction: everything
/// [`crate::mcm::Mcm::retire`] needs and nothing of the actual execution semantics, which stay
/// out of this checker's scope entirely.
#[derive(Debug, Clone, Default)]
pub struct DecodedInstr {
    pub is_load: bool,
    pub is_store: bool,
    pub is_amo: bool,
    pub is_lr: bool,
    pub is_sc: bool,
    pub is_cbo_zero: bool,
    pub is_cbo_clean_flush_inval: bool,
    pub is_fence: bool,
    pub fence_predecessor: FenceSet,
    pub fence_successor: FenceSet,
    pub is_acquire_rl: bool,
    pub is_release_rl: bool,
    pub is_rcsc: bool,
    pub is_branch: bool,
    pub is_io: bool,
    /// Data physical address (scalar ld/st/AMO/CMO); ignored for vector ld/st, whose per-element
    /// addresses live in `vector.elems`.
    pub pa: u64,
    /// Second page, when the access straddles a page boundary.
    pub pa2: Option<u64>,
    pub size: u8,
    /// Architectural value: the store/AMO source value, or (for a load) the value the Hart's
    /// execution determined the load produced — compared against the RTL-returned data at
    /// retire once forwarding is resolved.
    pub data: u64,
    pub addr_reg: Option<RegIx>,
    /// Source register(s) supplying a store/AMO's data, or the index-register group of an
    /// indexed vector ld/st (R9/R10's "index-vector producer" and "data register(s)").
    pub data_regs: Vec<RegIx>,
    pub dest_regs: Vec<RegIx>,
    pub index_regs: Vec<RegIx>,
    /// R11: this instruction is control-dependent on the hart's last branch/vl/vm producer.
    pub branch_dependent: bool,
    pub vector: Option<VectorLdSt>,
}

impl DecodedInstr {
    pub fn is_memory(&self) -> bool {
        self.is_load || self.is_store
    }
}

/// A single timestamped memory event as delivered by the RTL monitor.
#[derive(Debug, Clone)]
pub struct MemoryOp {
    pub time: u64,
    pub hart_ix: usize,
    pub tag: u64,
    pub pa: u64,
    pub size: u8,
    pub data: u64,
    pub rtl_data: u64,
    pub is_read: bool,
    pub bypass: bool,
    pub canceled: bool,
    pub elem_ix: Option<u32>,
    pub field: Option<u32>,
    pub is_io: bool,
    pub cache: bool,
    /// Per-byte forwarding source timestamp (`Some(store_time)` when `getCurrentLoadValue`
    /// resolved that byte from an in-flight forwarder rather than committed memory); indexed
    /// `0..size`. Kept to tighten later PPO ordering proofs.
    pub forward_time: Vec<Option<u64>>,
}

impl MemoryOp {
    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    pub fn cancel(&mut self) {
        self.canceled = true;
    }

    pub fn end(&self) -> u64 {
        self.pa + self.size as u64
    }

    pub fn overlaps_range(&self, pa: u64, size: u8) -> bool {
        ranges_overlap(self.pa, self.size, pa, size)
    }
}

/// Byte-range overlap test shared by [`MemoryOp`] and [`McmInstr`]; a zero-size range is treated
/// as overlapping only an exact address match (mirrors `Mcm.hpp`'s `McmInstr::overlaps`, which
/// logs but does not reject a zero-size comparison — CMO-drain events legitimately carry
/// `size == 0`).
pub fn ranges_overlap(a_pa: u64, a_size: u8, b_pa: u64, b_size: u8) -> bool {
    if a_size == 0 || b_size == 0 {
        return a_pa == b_pa;
    }
    a_pa < b_pa + b_size as u64 && b_pa < a_pa + a_size as u64
}

/// Maps a logical byte offset of a (possibly page-straddling) scalar access to its physical
/// address, given the access's first page `pa`, optional second page `pa2`, and the
/// configured page size.
pub fn instr_byte_addr(pa: u64, pa2: Option<u64>, page_size: u64, offset: usize) -> u64 {
    match pa2 {
        Some(pa2) => {
            let split = (page_size - pa % page_size) as usize;
            if offset < split {
                pa + offset as u64
            } else {
                pa2 + (offset - split) as u64
            }
        }
        None => pa + offset as u64,
    }
}

/// Inverse of [`instr_byte_addr`]: which logical byte offset (if any) of a `size`-byte scalar
/// access at `(pa, pa2)` corresponds to physical address `addr`.
pub fn instr_offset_for_addr(pa: u64, pa2: Option<u64>, size: u8, page_size: u64, addr: u64) -> Option<usize> {
    (0..size as usize).find(|&o| instr_byte_addr(pa, pa2, page_size, o) == addr)
}

/// One in-flight or retired instruction's memory-consistency bookkeeping.
#[derive(Debug, Clone)]
pub struct McmInstr {
    pub tag: u64,
    pub hart_ix: usize,
    pub retired: bool,
    pub canceled: bool,
    pub complete: bool,
    pub is_load: bool,
    pub is_store: bool,
    pub pa: u64,
    /// Second physical page, when the access straddles a page boundary.
    pub pa2: Option<u64>,
    pub size: u8,
    /// Architectural reference value: the Hart-supplied store value(s) for a store/AMO, or the
    /// resolved (post-forwarding) load value for a load.
    pub data: u64,
    /// `(tag, time)` of the address register's producer, plus one entry per index-vector
    /// producer for an indexed vector ld/st (R9's "each index-vector producer").
    pub addr_producers: Vec<(u64, u64)>,
    /// `(tag, time)` per data register, in register order (R10's "producer of its data
    /// register(s)").
    pub data_producers: Vec<(u64, u64)>,
    pub branch_producer: Option<(u64, u64)>,
    pub decoded: DecodedInstr,
    pub mem_op_ixs: Vec<usize>,
    pub vector_refs: Vec<VectorElem>,
    /// Physical addresses made globally visible so far, via a bypass op or a merge-buffer
    /// drain that covered them.
    pub covered_bytes: HashSet<u64>,
    /// Number of zero-size bypass events seen.
    pub cbo_bypass_count: u32,
}

impl McmInstr {
    pub fn new(tag: u64, hart_ix: usize) -> Self {
        Self {
            tag,
            hart_ix,
            retired: false,
            canceled: false,
            complete: false,
            is_load: false,
            is_store: false,
            pa: 0,
            pa2: None,
            size: 0,
            data: 0,
            addr_producers: Vec::new(),
            data_producers: Vec::new(),
            branch_producer: None,
            decoded: DecodedInstr::default(),
            mem_op_ixs: Vec::new(),
            vector_refs: Vec::new(),
            covered_bytes: HashSet::new(),
            cbo_bypass_count: 0,
        }
    }

    pub fn is_memory(&self) -> bool {
        self.is_load || self.is_store
    }

    pub fn cancel(&mut self) {
        self.canceled = true;
    }

    pub fn add_mem_op(&mut self, ix: usize) {
        debug_assert!(
            !self.mem_op_ixs.contains(&ix),
            "McmInstr::add_mem_op: op {ix} already added to tag {}",
            self.tag
        );
        self.mem_op_ixs.push(ix);
    }

    pub fn overlaps(&self, pa: u64, size: u8) -> bool {
        ranges_overlap(self.pa, self.size, pa, size)
    }

    pub fn overlaps_instr(&self, other: &McmInstr) -> bool {
        ranges_overlap(self.pa, self.size, other.pa, other.size)
    }
}

/// A retired `fence`'s ordering point, kept so a later instruction matching its successor set
/// can be checked against the predecessor-matching ops observed up to the fence.
#[derive(Debug, Clone, Copy)]
pub struct FenceRecord {
    pub tag: u64,
    pub pred_time: u64,
    pub successor: FenceSet,
    pub fiom: bool,
}

/// Per-hart mutable state the checker threads across event ingestion.
#[derive(Debug, Default)]
pub struct HartMcmState {
    pub instrs: Vec<McmInstr>,
    pub tag_to_ix: HashMap<u64, usize>,
    /// Indices into the global ops vector for writes inserted into, but not yet drained from,
    /// the merge buffer (or immediately-bypassed writes when there is no merge buffer).
    pub pending_writes: Vec<usize>,
    /// Tags of store/AMO/CMO/vector-store instructions with at least one byte not yet covered
    /// by a drain.
    pub undrained: HashSet<u64>,
    pub reg_producer: HashMap<RegIx, (u64, u64)>,
    pub last_branch: Option<(u64, u64)>,
    pub last_vl_producer: Option<(u64, u64)>,
    pub last_sinval_time: Option<u64>,
    pub current_tag: Option<u64>,
    /// Most recently retired `fence` in this hart (R4).
    pub last_fence: Option<FenceRecord>,
    /// `(tag, time)` of the most recently retired acquire-annotated access (R5).
    pub last_acquire: Option<(u64, u64)>,
    /// `(tag, time)` of the most recently retired release-annotated access (R6).
    pub last_release: Option<(u64, u64)>,
    /// `(tag, time)` of the most recently retired `rcsc`-annotated access (R7).
    pub last_rcsc: Option<(u64, u64)>,
    /// `(tag, time)` of the LR half of an in-progress lr/sc pair, cleared once its SC retires
    /// (R8).
    pub last_lr: Option<(u64, u64)>,
}

impl HartMcmState {
    pub fn find_ix(&self, tag: u64) -> Option<usize> {
        self.tag_to_ix.get(&tag).copied()
    }

    pub fn find_or_add(&mut self, tag: u64, hart_ix: usize) -> usize {
        if let Some(&ix) = self.tag_to_ix.get(&tag) {
            return ix;
        }
        let ix = self.instrs.len();
        self.instrs.push(McmInstr::new(tag, hart_ix));
        self.tag_to_ix.insert(tag, ix);
        ix
    }
}
