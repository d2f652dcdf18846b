//! Translation of the abstract source stream into SSA CFG form.
//!
//! Variables are put into SSA form on the fly: each source register
//! component tracks its current value plus the history of values assigned
//! to it per block, so cross-block reads can resolve through phi functions
//! placed via dominance. Phis for loop-carried variables are inserted
//! speculatively at the loop header on first use/def inside the loop and
//! their back-edge operand is patched at loop end; phis that turn out
//! trivial are deleted again.

mod emit;
#[cfg(test)]
mod test;

use crate::cfg::{BlockId, EdgeKind};
use crate::error::CompileError;
use crate::instruction::{CondCode, DType, InstId, Opcode, RoundMode};
use crate::program::Program;
use crate::source::{ShaderKind, SourceInst, SourceOp, SourceShader};
use crate::value::{Imm, Ref, RegFile, ValueId};
use std::collections::HashMap;

pub const MAX_TEMPS: usize = 64;
pub const MAX_ADDRS: usize = 4;
pub const MAX_PREDS: usize = 4;
pub const MAX_OUTPS: usize = 32;
pub const MAX_INPUTS: usize = 32;
pub const MAX_IMMDS: usize = 128;
pub const MAX_COND_NESTING: usize = 8;
pub const MAX_LOOP_NESTING: usize = 4;

/// One source register component being tracked for SSA construction.
#[derive(Default, Clone)]
struct TrackedReg {
    current: Option<ValueId>,
    /// All values assigned, at most one per block (later defs replace).
    vals: Vec<ValueId>,
    /// One bit per loop level: read at that level.
    loop_use: u16,
    /// One bit per loop level: written at that level.
    loop_def: u16,
}

/// Which tracked table a register lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(super) enum RegClass {
    Temp,
    Addr,
    Pred,
    Outp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(super) struct RegKey {
    class: RegClass,
    index: usize,
    comp: usize,
}

impl RegKey {
    pub(super) fn new(class: RegClass, index: usize, comp: usize) -> RegKey {
        RegKey { class, index, comp }
    }
}

pub struct Builder<'a> {
    pub(super) p: Program,
    src: &'a SourceShader,
    /// Current insertion block.
    pub(super) cur: BlockId,

    temps: Vec<TrackedReg>,
    addrs: Vec<TrackedReg>,
    preds: Vec<TrackedReg>,
    outps: Vec<TrackedReg>,

    cond_bb: Vec<BlockId>,
    join_bb: Vec<Option<BlockId>>,
    loop_bb: Vec<BlockId>,
    brkt_bb: Vec<BlockId>,
    loop_lvl: usize,
    /// Edge kind for the fall-through out of the current block; becomes
    /// `Fake` after a BRK/CONT already terminated it.
    out_kind: EdgeKind,

    /// Loop-header phis awaiting their back-edge operand, keyed to the
    /// register they stand for.
    pending_loop_phis: HashMap<InstId, RegKey>,

    pub(super) zero: ValueId,
    /// 1/w for perspective interpolation (fragment only).
    pub(super) frag_w_rcp: Option<ValueId>,
    saved_inputs: [[Option<ValueId>; 4]; MAX_INPUTS],
    immd_cache: Vec<(u32, ValueId)>,

    pub(super) outputs_written: [u8; MAX_OUTPS],
    pub(super) hpos_index: Option<usize>,
    /// All temporaries go through local memory when any temp access is
    /// indirect; SSA tracking cannot follow computed indices.
    pub(super) require_stores: bool,
}

pub fn build(src: &SourceShader) -> Result<Program, CompileError> {
    Builder::new(src)?.run()
}

impl<'a> Builder<'a> {
    fn new(src: &'a SourceShader) -> Result<Builder<'a>, CompileError> {
        let mut p = Program::new(src.kind);
        let cur = p.entry();
        let zero = p.new_value(RegFile::Gpr, 4)?;
        p[zero].reg = Some(63);

        let require_stores = src.insns.iter().any(|i| {
            i.srcs
                .iter()
                .any(|s| s.file == crate::source::SrcFile::Temp && s.indirect.is_some())
                || i.dst.is_some_and(|d| {
                    d.file == crate::source::DstFile::Temp && d.indirect.is_some()
                })
        });

        Ok(Builder {
            p,
            src,
            cur,
            temps: vec![TrackedReg::default(); MAX_TEMPS * 4],
            addrs: vec![TrackedReg::default(); MAX_ADDRS * 4],
            preds: vec![TrackedReg::default(); MAX_PREDS * 4],
            outps: vec![TrackedReg::default(); MAX_OUTPS * 4],
            cond_bb: Vec::new(),
            join_bb: Vec::new(),
            loop_bb: Vec::new(),
            brkt_bb: Vec::new(),
            loop_lvl: 0,
            out_kind: EdgeKind::Forward,
            pending_loop_phis: HashMap::new(),
            zero,
            frag_w_rcp: None,
            saved_inputs: [[None; 4]; MAX_INPUTS],
            immd_cache: Vec::new(),
            outputs_written: [0; MAX_OUTPS],
            hpos_index: None,
            require_stores,
        })
    }

    fn run(mut self) -> Result<Program, CompileError> {
        if self.src.kind == ShaderKind::Fragment {
            self.load_frag_w()?;
        }
        if self.require_stores {
            let max_temp = self.max_temp_index();
            self.p.local_mem_size = (max_temp as u32 + 1) * 16;
        }
        for i in 0..self.src.insns.len() {
            let inst = self.src.insns[i].clone();
            self.instruction(&inst)?;
        }
        Ok(self.p)
    }

    fn max_temp_index(&self) -> usize {
        let mut max = 0;
        for i in &self.src.insns {
            for s in &i.srcs {
                if s.file == crate::source::SrcFile::Temp {
                    max = max.max(s.index as usize);
                }
            }
            if let Some(d) = i.dst {
                if d.file == crate::source::DstFile::Temp {
                    max = max.max(d.index as usize);
                }
            }
        }
        max
    }

    // ------------------------------------------------------------------
    // Register tracking
    // ------------------------------------------------------------------

    fn tracked(&mut self, key: RegKey) -> Result<&mut TrackedReg, CompileError> {
        let (table, limit, what) = match key.class {
            RegClass::Temp => (&mut self.temps, MAX_TEMPS, "temporaries"),
            RegClass::Addr => (&mut self.addrs, MAX_ADDRS, "address registers"),
            RegClass::Pred => (&mut self.preds, MAX_PREDS, "predicate registers"),
            RegClass::Outp => (&mut self.outps, MAX_OUTPS, "outputs"),
        };
        if key.index >= limit {
            return Err(CompileError::OutOfResources { what, limit });
        }
        Ok(&mut table[key.index * 4 + key.comp])
    }

    fn reg_file(&self, key: RegKey) -> RegFile {
        match key.class {
            RegClass::Pred => RegFile::Pred,
            _ => RegFile::Gpr,
        }
    }

    /// Record `val` as the register's definition in its defining block,
    /// replacing an earlier same-block definition.
    fn reg_add_val(&mut self, key: RegKey, val: ValueId) -> Result<(), CompileError> {
        let bb = self.def_block(val);
        let top = self.tracked(key)?.vals.last().copied();
        let replace = match top {
            Some(t) => self.def_block(t) == bb,
            None => false,
        };
        let reg = self.tracked(key)?;
        if replace {
            *reg.vals.last_mut().unwrap() = val;
        } else {
            reg.vals.push(val);
        }
        Ok(())
    }

    fn reg_del_val(&mut self, key: RegKey, val: ValueId) -> Result<(), CompileError> {
        let reg = self.tracked(key)?;
        if let Some(pos) = reg.vals.iter().rposition(|&v| v == val) {
            reg.vals.swap_remove(pos);
        }
        if reg.current == Some(val) {
            reg.current = reg.vals.last().copied();
        }
        Ok(())
    }

    fn def_block(&self, val: ValueId) -> Option<BlockId> {
        self.p[val].def.and_then(|i| self.p[i].bb)
    }

    /// Store a new value for a register. If this is the first touch of the
    /// register at the current loop level, a loop-header phi is inserted in
    /// foresight so back-edge uses stay legal.
    pub(super) fn store_reg(&mut self, key: RegKey, val: ValueId) -> Result<(), CompileError> {
        let m = 1u16 << self.loop_lvl;
        let reg = self.tracked(key)?;
        let untouched = (reg.loop_def | reg.loop_use) & m == 0;
        if self.loop_lvl > 0 && untouched {
            self.loop_phi(key, Some(val))?;
        }
        let reg = self.tracked(key)?;
        reg.current = Some(val);
        reg.loop_def |= m;
        self.reg_add_val(key, val)?;
        Ok(())
    }

    /// Read a register, resolving through phis where control flow merges.
    /// `None` means the register was never written (uninitialized read).
    pub(super) fn fetch_reg(&mut self, key: RegKey) -> Result<Option<ValueId>, CompileError> {
        let m = 1u16 << self.loop_lvl;
        let reg = self.tracked(key)?;
        let untouched = (reg.loop_use | reg.loop_def) & m == 0;
        reg.loop_use |= m;
        if self.loop_lvl > 0 && untouched {
            return Ok(Some(self.loop_phi(key, None)?));
        }
        self.phi(self.cur, key)
    }

    // ------------------------------------------------------------------
    // Phi synthesis
    // ------------------------------------------------------------------

    fn find_by_bb(&mut self, key: RegKey, b: BlockId) -> Result<Option<ValueId>, CompileError> {
        let reg = self.tracked(key)?;
        let current = reg.current;
        let vals = reg.vals.clone();
        if let Some(c) = current {
            if self.def_block(c) == Some(b) {
                return Ok(Some(c));
            }
        }
        for v in vals {
            if self.def_block(v) == Some(b) {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }

    /// Collect the definitions reaching `b`: the in-block definition, or
    /// recursively the first ones in each predecessor. Back and fake edges
    /// are walls.
    fn fetch_by_bb(
        &mut self,
        key: RegKey,
        vals: &mut Vec<ValueId>,
        b: BlockId,
    ) -> Result<(), CompileError> {
        if vals.len() >= 16 {
            return Err(CompileError::Internal("phi operand collection overflow"));
        }
        if let Some(v) = self.find_by_bb(key, b)? {
            if !vals.contains(&v) {
                vals.push(v);
            }
            return Ok(());
        }
        for i in 0..self.p[b].ins.len() {
            let (pred, kind) = self.p[b].ins[i];
            if kind == EdgeKind::Back || kind == EdgeKind::Fake {
                continue;
            }
            self.fetch_by_bb(key, vals, pred)?;
        }
        Ok(())
    }

    /// The first successor block that the given block does not dominate:
    /// the place where a phi merging its definition belongs.
    fn dom_frontier(&mut self, bb: BlockId) -> Result<BlockId, CompileError> {
        let order = self.p.pass_order(bb);
        for b in order {
            if b != bb && !self.p.dominated_by(b, bb) {
                return Ok(b);
            }
        }
        Err(CompileError::Internal("no dominance frontier block"))
    }

    pub(super) fn undef(&mut self, file: RegFile) -> Result<ValueId, CompileError> {
        let i = self.push_inst(Opcode::Undef)?;
        let d = self.p.new_value(file, 4)?;
        self.p.add_def(i, d);
        Ok(d)
    }

    fn undef_in(&mut self, bb: BlockId, file: RegFile) -> Result<ValueId, CompileError> {
        let save = self.cur;
        self.cur = bb;
        let v = self.undef(file);
        self.cur = save;
        v
    }

    /// Resolve the value of `key` as seen from block `b`, inserting phi
    /// functions where paths with different definitions merge.
    fn phi(&mut self, b: BlockId, key: RegKey) -> Result<Option<ValueId>, CompileError> {
        let mut vals: Vec<ValueId> = Vec::new();
        loop {
            vals.clear();
            self.fetch_by_bb(key, &mut vals, b)?;

            if vals.is_empty() {
                return Ok(None);
            }

            if vals.len() == 1 {
                let d = self.def_block(vals[0]).expect("tracked values are defined");
                if self.p.dominated_by(b, d) {
                    break;
                }
                // A path into `b` misses this definition. Walk up to the
                // branch point the definition does not reach and park an
                // undef there, so the next collection sees both paths.
                let mut in_b = b;
                loop {
                    let ins: Vec<_> = self.p[in_b].ins.iter().copied().collect();
                    if ins.is_empty() {
                        break;
                    }
                    if ins.len() == 1 {
                        in_b = ins[0].0;
                        continue;
                    }
                    let d0 = self.def_block(vals[0]).unwrap();
                    if !self.p.reachable_by(d0, ins[0].0, Some(b)) {
                        in_b = ins[0].0;
                    } else if ins.len() > 1 && !self.p.reachable_by(d0, ins[1].0, Some(b)) {
                        in_b = ins[1].0;
                    } else {
                        in_b = ins[0].0;
                    }
                }
                let file = self.p[vals[0]].file;
                let u = self.undef_in(in_b, file)?;
                self.reg_add_val(key, u)?;
                continue;
            }

            let mut restart = false;
            for i in 0..vals.len() {
                let d = self.def_block(vals[i]).expect("tracked values are defined");
                if self.p.dominated_by(b, d) {
                    continue;
                }
                // If the def dominates one of b's predecessors, b is the
                // merge point; otherwise the phi belongs at the def's
                // dominance frontier first.
                let dominates_pred = (0..self.p[b].ins.len())
                    .any(|j| self.p.dominated_by(self.p[b].ins[j].0, d));
                if !dominates_pred {
                    let f = self.dom_frontier(d)?;
                    let v = self
                        .phi(f, key)?
                        .ok_or(CompileError::Internal("lost phi operand"))?;
                    self.reg_add_val(key, v)?;
                    restart = true;
                    break;
                }
            }
            if !restart {
                break;
            }
        }

        if vals.len() == 1 {
            return Ok(Some(vals[0]));
        }

        let phi = self.p.new_inst(Opcode::Phi)?;
        self.p.append_phi(b, phi);
        let (file, size) = (self.p[vals[0]].file, self.p[vals[0]].size);
        let d = self.p.new_value(file, size)?;
        self.p.add_def(phi, d);
        for (i, &v) in vals.iter().enumerate() {
            self.p.set_src(phi, i, Some(Ref::new(v)));
        }
        Ok(Some(d))
    }

    /// Insert a phi at the current loop's header (and, recursively, in any
    /// enclosing loop header that has none for this register yet).
    ///
    /// `def` is the in-loop redefinition, or `None` to use the phi's own
    /// result as a placeholder patched at loop end.
    fn loop_phi(&mut self, key: RegKey, def: Option<ValueId>) -> Result<ValueId, CompileError> {
        let save = self.cur;
        let mut val = None;

        if self.loop_lvl > 1 {
            self.loop_lvl -= 1;
            let m = 1u16 << self.loop_lvl;
            let reg = self.tracked(key)?;
            if (reg.loop_def | reg.loop_use) & m == 0 {
                val = Some(self.loop_phi(key, None)?);
            }
            self.loop_lvl += 1;
        }

        if val.is_none() {
            val = self.phi(self.cur, key)?;
        }
        let header = self.loop_bb[self.loop_lvl - 1];
        let val = match val {
            Some(v) => v,
            None => {
                let pre = self.p[header].ins[0].0;
                let file = self.reg_file(key);
                self.undef_in(pre, file)?
            }
        };

        let phi = self.p.new_inst(Opcode::Phi)?;
        self.p.append_phi(header, phi);
        let d = self.p.new_value_like(val)?;
        self.p.add_def(phi, d);
        let def = def.unwrap_or(d);

        self.reg_add_val(key, d)?;
        self.pending_loop_phis.insert(phi, key);

        self.p.set_src(phi, 0, Some(Ref::new(val)));
        self.p.set_src(phi, 1, Some(Ref::new(def)));

        self.cur = save;
        Ok(d)
    }

    /// Patch the back-edge operands of the loop-header phis, then delete
    /// the ones that turned out trivial.
    fn loop_end(&mut self, header: BlockId) -> Result<(), CompileError> {
        let save = self.cur;
        for phi in self.p.block_phis(header) {
            let Some(key) = self.pending_loop_phis.remove(&phi) else {
                continue;
            };

            for n in 0..self.p[header].ins.len() {
                let (pred, kind) = self.p[header].ins[n];
                if kind != EdgeKind::Back {
                    continue;
                }
                self.cur = pred;
                let val = self
                    .fetch_reg(key)?
                    .ok_or(CompileError::Internal("loop phi operand vanished"))?;

                let already = self.p[phi].src_iter().any(|(_, r)| r.value == val);
                if already {
                    continue;
                }
                // Replace the placeholder operand (the phi's own result),
                // or append behind the existing operands.
                let d0 = self.p[phi].defs[0];
                let mut s = 1;
                while let Some(r) = self.p[phi].src(s) {
                    if r.value == d0 {
                        break;
                    }
                    s += 1;
                }
                self.p.set_src(phi, s, Some(Ref::new(val)));
            }
            self.cur = save;

            let d0 = self.p[phi].defs[0];
            let s0 = self.p[phi].src(0).map(|r| r.value);
            let s1 = self.p[phi].src(1).map(|r| r.value);
            let survivor = if s0 == Some(d0) || s0 == s1 {
                1
            } else if s1 == Some(d0) {
                0
            } else {
                continue;
            };

            let keep = self.p[phi].src(survivor).map(|r| r.value).unwrap();
            self.reg_del_val(key, d0)?;
            self.p.replace_value(d0, keep);
            self.p.delete_inst(phi);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Instruction helpers
    // ------------------------------------------------------------------

    /// Create an instruction and append it to the current block.
    pub(super) fn push_inst(&mut self, op: Opcode) -> Result<InstId, CompileError> {
        let i = self.p.new_inst(op)?;
        self.p.append(self.cur, i);
        Ok(i)
    }

    pub(super) fn insn_1(&mut self, op: Opcode, src0: ValueId) -> Result<ValueId, CompileError> {
        let i = self.push_inst(op)?;
        self.p.set_src(i, 0, Some(Ref::new(src0)));
        let size = self.p[src0].size;
        let d = self.p.new_value(RegFile::Gpr, size)?;
        self.p.add_def(i, d);
        Ok(d)
    }

    pub(super) fn insn_2(
        &mut self,
        op: Opcode,
        src0: ValueId,
        src1: ValueId,
    ) -> Result<ValueId, CompileError> {
        let i = self.push_inst(op)?;
        self.p.set_src(i, 0, Some(Ref::new(src0)));
        self.p.set_src(i, 1, Some(Ref::new(src1)));
        let size = self.p[src0].size;
        let d = self.p.new_value(RegFile::Gpr, size)?;
        self.p.add_def(i, d);
        Ok(d)
    }

    pub(super) fn insn_3(
        &mut self,
        op: Opcode,
        src0: ValueId,
        src1: ValueId,
        src2: ValueId,
    ) -> Result<ValueId, CompileError> {
        let i = self.push_inst(op)?;
        self.p.set_src(i, 0, Some(Ref::new(src0)));
        self.p.set_src(i, 1, Some(Ref::new(src1)));
        self.p.set_src(i, 2, Some(Ref::new(src2)));
        let size = self.p[src0].size;
        let d = self.p.new_value(RegFile::Gpr, size)?;
        self.p.add_def(i, d);
        Ok(d)
    }

    pub(super) fn src_predicate(&mut self, i: InstId, slot: usize, pred: ValueId, cc: CondCode) {
        self.p[i].predicate = Some(slot);
        self.p[i].cc = cc;
        self.p.set_src(i, slot, Some(Ref::new(pred)));
    }

    pub(super) fn src_pointer(&mut self, i: InstId, slot: usize, ptr: ValueId) {
        self.p[i].indirect = Some(slot);
        self.p.set_src(i, slot, Some(Ref::new(ptr)));
    }

    /// A comparison producing a predicate.
    pub(super) fn setp(
        &mut self,
        dtype: DType,
        cc: CondCode,
        src0: ValueId,
        src1: ValueId,
    ) -> Result<ValueId, CompileError> {
        let d = self.insn_2(Opcode::Set(dtype), src0, src1)?;
        self.p[d].file = RegFile::Pred;
        self.p[d].size = 1;
        let i = self.p[d].def.unwrap();
        self.p[i].set_cond = cc;
        Ok(d)
    }

    pub(super) fn cvt(
        &mut self,
        dst: DType,
        src_t: DType,
        round: Option<RoundMode>,
        src: ValueId,
    ) -> Result<ValueId, CompileError> {
        let d = self.insn_1(Opcode::Cvt, src)?;
        let i = self.p[d].def.unwrap();
        self.p[i].ext = crate::instruction::OpExt::Cvt(crate::instruction::CvtInfo {
            dst,
            src: src_t,
            round,
        });
        Ok(d)
    }

    /// Duplicate an instruction with fresh result values.
    pub(super) fn clone_inst(&mut self, src: InstId) -> Result<ValueId, CompileError> {
        let op = self.p[src].opcode;
        let dup = self.push_inst(op)?;
        self.p[dup].ext = self.p[src].ext;
        self.p[dup].cc = self.p[src].cc;
        self.p[dup].set_cond = self.p[src].set_cond;
        self.p[dup].saturate = self.p[src].saturate;
        self.p[dup].lanes = self.p[src].lanes;
        self.p[dup].quadop = self.p[src].quadop;
        self.p[dup].predicate = self.p[src].predicate;
        self.p[dup].indirect = self.p[src].indirect;
        let defs: Vec<ValueId> = self.p[src].defs.iter().copied().collect();
        for d in defs {
            let nd = self.p.new_value_like(d)?;
            self.p.add_def(dup, nd);
        }
        let srcs: Vec<(usize, Ref)> = self.p[src].src_iter().map(|(s, r)| (s, *r)).collect();
        for (s, r) in srcs {
            self.p.set_src(dup, s, Some(r));
        }
        Ok(self.p[dup].defs[0])
    }

    // ------------------------------------------------------------------
    // Immediates
    // ------------------------------------------------------------------

    pub(super) fn imm_u32(&mut self, u: u32) -> Result<ValueId, CompileError> {
        if let Some(&(_, v)) = self.immd_cache.iter().find(|&&(bits, _)| bits == u) {
            return Ok(v);
        }
        if self.immd_cache.len() >= MAX_IMMDS {
            return Err(CompileError::OutOfResources {
                what: "immediates",
                limit: MAX_IMMDS,
            });
        }
        let v = self.p.new_imm(Imm::u32(u))?;
        self.immd_cache.push((u, v));
        Ok(v)
    }

    pub(super) fn imm_f32(&mut self, f: f32) -> Result<ValueId, CompileError> {
        self.imm_u32(f.to_bits())
    }

    /// An immediate loaded into a register; zero uses the hardwired zero.
    pub(super) fn load_imm_u32(&mut self, u: u32) -> Result<ValueId, CompileError> {
        if u == 0 {
            return Ok(self.zero);
        }
        let imm = self.imm_u32(u)?;
        self.insn_1(Opcode::Mov, imm)
    }

    // ------------------------------------------------------------------
    // Control flow
    // ------------------------------------------------------------------

    fn block_is_terminated(&self, b: BlockId) -> bool {
        matches!(self.p[b].exit, Some(e) if self.p[e].terminator)
    }

    fn flow(
        &mut self,
        op: Opcode,
        pred: Option<(ValueId, CondCode)>,
        target: Option<BlockId>,
        reconverge: bool,
    ) -> Result<InstId, CompileError> {
        if reconverge {
            let j = self.push_inst(Opcode::Joinat)?;
            self.p[j].fixed = true;
        }
        let i = self.push_inst(op)?;
        self.p[i].target = target;
        self.p[i].terminator = true;
        if let Some((pred, cc)) = pred {
            self.src_predicate(i, 0, pred, cc);
        }
        Ok(i)
    }

    fn new_block(&mut self, b: BlockId) {
        self.cur = b;
        self.saved_inputs = [[None; 4]; MAX_INPUTS];
        self.out_kind = EdgeKind::Forward;
    }

    fn op_if(&mut self, inst: &SourceInst) -> Result<(), CompileError> {
        if self.cond_bb.len() >= MAX_COND_NESTING {
            return Err(CompileError::OutOfResources {
                what: "conditional nesting levels",
                limit: MAX_COND_NESTING,
            });
        }
        let b = self.p.new_block()?;
        let pred = self.fetch_src(inst, 0, 0)?;

        self.p.attach_edge(self.cur, b, EdgeKind::Forward);
        self.join_bb.push(Some(self.cur));
        self.cond_bb.push(self.cur);

        // Reuse a comparison result directly as the predicate when the
        // condition value comes straight out of a Set.
        let pred = match self.p[pred].def {
            Some(di) if matches!(self.p[di].opcode, Opcode::Set(_)) => {
                let c = self.clone_inst(di)?;
                self.p[c].size = 1;
                self.p[c].file = RegFile::Pred;
                c
            }
            _ => self.setp(DType::U32, CondCode::Ne, pred, self.zero)?,
        };

        let outermost = self.cond_bb.len() == 1;
        self.flow(Opcode::Bra, Some((pred, CondCode::Eq)), None, outermost)?;

        self.new_block(b);
        Ok(())
    }

    fn op_else(&mut self) -> Result<(), CompileError> {
        let b = self.p.new_block()?;
        let lvl = self.cond_bb.len() - 1;
        let if_bb = self.join_bb[lvl].expect("ELSE without IF");
        self.p.attach_edge(if_bb, b, EdgeKind::Forward);

        // Point the IF's conditional branch at the else arm.
        let bra = self.p[self.cond_bb[lvl]].exit.expect("IF block terminated");
        self.p[bra].target = Some(b);
        self.cond_bb[lvl] = self.cur;

        let i = self.push_inst(Opcode::Bra)?;
        self.p[i].terminator = true;

        self.new_block(b);
        Ok(())
    }

    fn op_endif(&mut self) -> Result<(), CompileError> {
        let b = self.p.new_block()?;

        if !self.block_is_terminated(self.cur) {
            self.flow(Opcode::Bra, None, Some(b), false)?;
        }

        let cond = self.cond_bb.pop().expect("ENDIF without IF");
        let join = self.join_bb.pop().expect("ENDIF without IF");
        self.p.attach_edge(self.cur, b, self.out_kind);
        self.p.attach_edge(cond, b, EdgeKind::Forward);

        let bra = self.p[cond].exit.expect("conditional arm terminated");
        if self.p[bra].target.is_none() {
            self.p[bra].target = Some(b);
        }

        self.new_block(b);

        if self.cond_bb.is_empty() {
            if let Some(join) = join {
                // Patch the JOINAT to the merge block and mark it.
                let exit = self.p[join].exit.expect("IF block terminated");
                if let Some(joinat) = self.p[exit].prev {
                    if self.p[joinat].opcode == Opcode::Joinat {
                        self.p[joinat].target = Some(b);
                    }
                }
                let j = self.push_inst(Opcode::Join)?;
                self.p[j].is_join = true;
            }
        }
        Ok(())
    }

    fn op_bgnloop(&mut self) -> Result<(), CompileError> {
        if self.loop_lvl >= MAX_LOOP_NESTING {
            return Err(CompileError::OutOfResources {
                what: "loop nesting levels",
                limit: MAX_LOOP_NESTING,
            });
        }
        let header = self.p.new_block()?;
        let exit = self.p.new_block()?;

        self.loop_bb.push(header);
        self.brkt_bb.push(exit);

        self.p.attach_edge(self.cur, header, EdgeKind::LoopEnter);

        self.loop_lvl += 1;
        self.new_block(header);

        if self.loop_lvl as u32 == self.p.loop_nesting_bound {
            self.p.loop_nesting_bound += 1;
        }

        let mask = !(1u16 << self.loop_lvl);
        for r in self
            .temps
            .iter_mut()
            .chain(self.addrs.iter_mut())
            .chain(self.preds.iter_mut())
        {
            r.loop_def &= mask;
            r.loop_use &= mask;
        }
        Ok(())
    }

    fn op_brk(&mut self) -> Result<(), CompileError> {
        let exit = self.brkt_bb[self.loop_lvl - 1];
        self.flow(Opcode::Bra, None, Some(exit), false)?;
        if self.out_kind == EdgeKind::Forward {
            self.p
                .attach_edge_ex(self.cur, exit, EdgeKind::Fake, EdgeKind::LoopLeave);
        }
        self.out_kind = EdgeKind::Fake;
        Ok(())
    }

    fn op_cont(&mut self) -> Result<(), CompileError> {
        let header = self.loop_bb[self.loop_lvl - 1];
        self.flow(Opcode::Bra, None, Some(header), false)?;
        self.p.attach_edge(self.cur, header, EdgeKind::Back);

        // A continue makes the pending reconvergence point unusable.
        if let Some(lvl) = self.cond_bb.len().checked_sub(1) {
            if let Some(join) = self.join_bb[lvl].take() {
                let exit = self.p[join].exit.expect("IF block terminated");
                if let Some(joinat) = self.p[exit].prev {
                    if self.p[joinat].opcode == Opcode::Joinat {
                        self.p.delete_inst(joinat);
                    }
                }
            }
        }
        self.out_kind = EdgeKind::Fake;
        Ok(())
    }

    fn op_endloop(&mut self) -> Result<(), CompileError> {
        let header = self.loop_bb[self.loop_lvl - 1];

        if self.out_kind != EdgeKind::Fake {
            self.flow(Opcode::Bra, None, Some(header), false)?;
            self.p.attach_edge(self.cur, header, EdgeKind::Back);
        }

        self.loop_end(header)?;

        let exit = self.brkt_bb[self.loop_lvl - 1];
        self.loop_bb.pop();
        self.brkt_bb.pop();
        self.loop_lvl -= 1;
        self.new_block(exit);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn instruction(&mut self, inst: &SourceInst) -> Result<(), CompileError> {
        match inst.op {
            SourceOp::If => self.op_if(inst),
            SourceOp::Else => self.op_else(),
            SourceOp::Endif => self.op_endif(),
            SourceOp::BgnLoop => self.op_bgnloop(),
            SourceOp::EndLoop => self.op_endloop(),
            SourceOp::Brk => self.op_brk(),
            SourceOp::Cont => self.op_cont(),
            SourceOp::Ret => {
                let i = self.push_inst(Opcode::Ret)?;
                self.p[i].fixed = true;
                Ok(())
            }
            SourceOp::End => self.op_end(),
            _ => self.alu_instruction(inst),
        }
    }
}
