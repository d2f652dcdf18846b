use crate::cfg::{BasicBlock, BlockId};
use crate::error::CompileError;
use crate::instruction::{InstId, Instruction, Opcode};
use crate::source::ShaderKind;
use crate::value::{Imm, Ref, RegFile, UseLink, Value, ValueId};
use generational_arena::Arena;
use vec1::Vec1;

/// Arena capacity limits. Exceeding one is a resource-exhaustion error, a
/// different failure class than running out of registers.
pub const MAX_VALUES: usize = 4096;
pub const MAX_INSNS: usize = 4096;
pub const MAX_BLOCKS: usize = 512;

/// Highest register id used per allocatable file, for the result header.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxReg {
    pub gpr: i32,
    pub pred: i32,
    pub cond: i32,
}

impl MaxReg {
    pub fn note(&mut self, file: RegFile, reg: u32) {
        let slot = match file {
            RegFile::Gpr => &mut self.gpr,
            RegFile::Pred => &mut self.pred,
            RegFile::Cond => &mut self.cond,
            _ => return,
        };
        *slot = (*slot).max(reg as i32);
    }
}

/// The per-compile context: owns every value, instruction and block of one
/// shader program. All identities handed out are arena indices and stay
/// valid for the lifetime of the `Program`.
#[derive(Debug, Clone)]
pub struct Program {
    values: Arena<Value>,
    insns: Arena<Instruction>,
    blocks: Arena<BasicBlock>,
    /// Root blocks, main first, one more per subroutine.
    pub roots: Vec1<BlockId>,
    pub kind: ShaderKind,
    pub(crate) pass_seq: u32,
    pub max_reg: MaxReg,
    /// Deepest loop nesting seen by the builder; bounds the live-set
    /// fixpoint iteration.
    pub loop_nesting_bound: u32,
    /// Bytes of per-thread local memory (indirect temporary window).
    pub local_mem_size: u32,
}

impl Program {
    pub fn new(kind: ShaderKind) -> Program {
        let mut blocks = Arena::new();
        let entry = BlockId(blocks.insert(BasicBlock::default()));
        Program {
            values: Arena::new(),
            insns: Arena::new(),
            blocks,
            roots: Vec1::new(entry),
            kind,
            pass_seq: 0,
            max_reg: MaxReg::default(),
            loop_nesting_bound: 1,
            local_mem_size: 0,
        }
    }

    pub fn entry(&self) -> BlockId {
        *self.roots.first()
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    pub fn num_insns(&self) -> usize {
        self.insns.len()
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    pub fn new_block(&mut self) -> Result<BlockId, CompileError> {
        if self.blocks.len() >= MAX_BLOCKS {
            return Err(CompileError::OutOfResources {
                what: "basic blocks",
                limit: MAX_BLOCKS,
            });
        }
        Ok(BlockId(self.blocks.insert(BasicBlock::default())))
    }

    pub fn new_value(&mut self, file: RegFile, size: u8) -> Result<ValueId, CompileError> {
        if self.values.len() >= MAX_VALUES {
            return Err(CompileError::OutOfResources {
                what: "values",
                limit: MAX_VALUES,
            });
        }
        let id = ValueId(self.values.insert(Value {
            file,
            size,
            reg: None,
            address: 0,
            imm: None,
            def: None,
            // Patched right below; the arena index is unknown before insert.
            join: ValueId(generational_arena::Index::from_raw_parts(usize::MAX, u64::MAX)),
            refc: 0,
            uses: Vec::new(),
            livei: Default::default(),
        }));
        self.values[id.0].join = id;
        Ok(id)
    }

    /// A fresh value in the same file and of the same size as `like`.
    pub fn new_value_like(&mut self, like: ValueId) -> Result<ValueId, CompileError> {
        let (file, size) = (self[like].file, self[like].size);
        self.new_value(file, size)
    }

    pub fn new_imm(&mut self, imm: Imm) -> Result<ValueId, CompileError> {
        let id = self.new_value(RegFile::Imm, 4)?;
        self[id].imm = Some(imm);
        Ok(id)
    }

    pub fn new_inst(&mut self, opcode: Opcode) -> Result<InstId, CompileError> {
        if self.insns.len() >= MAX_INSNS {
            return Err(CompileError::OutOfResources {
                what: "instructions",
                limit: MAX_INSNS,
            });
        }
        Ok(InstId(self.insns.insert(Instruction::new(opcode))))
    }

    // ------------------------------------------------------------------
    // Def/use maintenance
    // ------------------------------------------------------------------

    /// Rebind source `slot` of `inst`. Refcount and use-list of the old and
    /// new values are updated together; they can never go out of sync.
    pub fn set_src(&mut self, inst: InstId, slot: usize, r: Option<Ref>) {
        if let Some(old) = self.insns[inst.0].srcs[slot] {
            let v = &mut self.values[old.value.0];
            debug_assert!(v.refc > 0);
            v.refc -= 1;
            if let Some(pos) = v
                .uses
                .iter()
                .position(|u| u.inst == inst && u.slot == slot)
            {
                v.uses.remove(pos);
            }
        }
        self.insns[inst.0].srcs[slot] = r;
        if let Some(r) = r {
            let v = &mut self.values[r.value.0];
            v.refc += 1;
            v.uses.push(UseLink { inst, slot });
        }
    }

    /// Add a destination to `inst`, making `inst` the value's definition.
    pub fn add_def(&mut self, inst: InstId, value: ValueId) {
        self.insns[inst.0].defs.push(value);
        self.values[value.0].def = Some(inst);
    }

    /// Total refcount over all destinations.
    pub fn inst_refcount(&self, inst: InstId) -> u32 {
        self[inst].defs.iter().map(|&d| self[d].refc).sum()
    }

    /// Redirect every use of `old` to `new`, keeping each use's modifier.
    pub fn replace_value(&mut self, old: ValueId, new: ValueId) {
        if old == new {
            return;
        }
        let uses = self[old].uses.clone();
        for u in uses {
            let modifier = self[u.inst].srcs[u.slot]
                .map(|r| r.modifier)
                .unwrap_or_default();
            self.set_src(u.inst, u.slot, Some(Ref::with_mod(new, modifier)));
        }
    }

    // ------------------------------------------------------------------
    // Instruction list splicing
    // ------------------------------------------------------------------

    /// Recompute a block's phi/entry/exit markers from its list head.
    fn refresh_markers(&mut self, bb: BlockId, head: Option<InstId>) {
        let mut phi = None;
        let mut entry = None;
        let mut exit = None;
        let mut cur = head;
        while let Some(i) = cur {
            if self[i].opcode == Opcode::Phi {
                if phi.is_none() {
                    phi = Some(i);
                }
            } else if entry.is_none() {
                entry = Some(i);
            }
            exit = Some(i);
            cur = self[i].next;
        }
        let b = &mut self.blocks[bb.0];
        b.phi = phi;
        b.entry = entry;
        b.exit = exit;
    }

    /// Append `inst` at the end of `bb`.
    pub fn append(&mut self, bb: BlockId, inst: InstId) {
        self.insns[inst.0].bb = Some(bb);
        let old_exit = self[bb].exit;
        self.insns[inst.0].prev = old_exit;
        self.insns[inst.0].next = None;
        if let Some(exit) = old_exit {
            self.insns[exit.0].next = Some(inst);
        }
        let head = self[bb].first().unwrap_or(inst);
        self.refresh_markers(bb, Some(head));
    }

    /// Append a phi to `bb`'s phi prefix (before the body).
    pub fn append_phi(&mut self, bb: BlockId, inst: InstId) {
        debug_assert_eq!(self[inst].opcode, Opcode::Phi);
        // Splice in front of the first non-phi, or at the very end.
        match self[bb].entry {
            Some(entry) => self.insert_before(entry, inst),
            None => self.append(bb, inst),
        }
    }

    /// Insert `inst` immediately before `anchor` (same block).
    pub fn insert_before(&mut self, anchor: InstId, inst: InstId) {
        let bb = self[anchor].bb.expect("anchor must be in a block");
        let prev = self[anchor].prev;
        self.insns[inst.0].bb = Some(bb);
        self.insns[inst.0].next = Some(anchor);
        self.insns[inst.0].prev = prev;
        self.insns[anchor.0].prev = Some(inst);
        if let Some(p) = prev {
            self.insns[p.0].next = Some(inst);
        }
        let head = if prev.is_none() {
            inst
        } else {
            self[bb].first().expect("non-empty block")
        };
        self.refresh_markers(bb, Some(head));
    }

    /// Insert `inst` immediately after `anchor` (same block).
    pub fn insert_after(&mut self, anchor: InstId, inst: InstId) {
        let bb = self[anchor].bb.expect("anchor must be in a block");
        let next = self[anchor].next;
        self.insns[inst.0].bb = Some(bb);
        self.insns[inst.0].prev = Some(anchor);
        self.insns[inst.0].next = next;
        self.insns[anchor.0].next = Some(inst);
        if let Some(n) = next {
            self.insns[n.0].prev = Some(inst);
        }
        let head = self[bb].first().expect("non-empty block");
        self.refresh_markers(bb, Some(head));
    }

    /// Unlink `inst` from its block without touching its operands.
    pub fn unlink(&mut self, inst: InstId) {
        let Some(bb) = self[inst].bb else { return };
        let (prev, next) = (self[inst].prev, self[inst].next);
        if let Some(p) = prev {
            self.insns[p.0].next = next;
        }
        if let Some(n) = next {
            self.insns[n.0].prev = prev;
        }
        let i = &mut self.insns[inst.0];
        i.bb = None;
        i.prev = None;
        i.next = None;
        let head = match prev {
            Some(p) => {
                let mut h = p;
                while let Some(pp) = self[h].prev {
                    h = pp;
                }
                Some(h)
            }
            None => next,
        };
        self.refresh_markers(bb, head);
    }

    /// Unlink `inst`, release all its sources, detach its defs and free it.
    pub fn delete_inst(&mut self, inst: InstId) {
        self.unlink(inst);
        for slot in 0..crate::instruction::MAX_SRCS {
            if self[inst].srcs[slot].is_some() {
                self.set_src(inst, slot, None);
            }
        }
        let defs: Vec<ValueId> = self[inst].defs.iter().copied().collect();
        for d in defs {
            if self[d].def == Some(inst) {
                self.values[d.0].def = None;
            }
        }
        self.insns.remove(inst.0);
    }

    // ------------------------------------------------------------------
    // Iteration
    // ------------------------------------------------------------------

    /// Instructions of `bb` in list order (phi prefix first).
    pub fn block_insns(&self, bb: BlockId) -> Vec<InstId> {
        let mut out = Vec::new();
        let mut cur = self[bb].first();
        while let Some(i) = cur {
            out.push(i);
            cur = self[i].next;
        }
        out
    }

    /// The phi prefix of `bb`.
    pub fn block_phis(&self, bb: BlockId) -> Vec<InstId> {
        let mut out = Vec::new();
        let mut cur = self[bb].phi;
        while let Some(i) = cur {
            if self[i].opcode != Opcode::Phi {
                break;
            }
            out.push(i);
            cur = self[i].next;
        }
        out
    }

    pub fn block_ids(&self) -> Vec<(BlockId, ())> {
        self.blocks.iter().map(|(i, _)| (BlockId(i), ())).collect()
    }

    pub fn value_ids(&self) -> Vec<ValueId> {
        self.values.iter().map(|(i, _)| ValueId(i)).collect()
    }

    pub fn inst_ids(&self) -> Vec<InstId> {
        self.insns.iter().map(|(i, _)| InstId(i)).collect()
    }

    pub fn contains_inst(&self, inst: InstId) -> bool {
        self.insns.contains(inst.0)
    }

    /// The coalescing representative of `v` (identity before allocation).
    pub fn join_of(&self, v: ValueId) -> ValueId {
        self[v].join
    }
}

impl std::ops::Index<ValueId> for Program {
    type Output = Value;
    fn index(&self, id: ValueId) -> &Value {
        &self.values[id.0]
    }
}

impl std::ops::IndexMut<ValueId> for Program {
    fn index_mut(&mut self, id: ValueId) -> &mut Value {
        &mut self.values[id.0]
    }
}

impl std::ops::Index<InstId> for Program {
    type Output = Instruction;
    fn index(&self, id: InstId) -> &Instruction {
        &self.insns[id.0]
    }
}

impl std::ops::IndexMut<InstId> for Program {
    fn index_mut(&mut self, id: InstId) -> &mut Instruction {
        &mut self.insns[id.0]
    }
}

impl std::ops::Index<BlockId> for Program {
    type Output = BasicBlock;
    fn index(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0]
    }
}

impl std::ops::IndexMut<BlockId> for Program {
    fn index_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.0]
    }
}

impl ValueId {
    /// Raw arena slot, for printing.
    pub fn index(self) -> usize {
        self.0.into_raw_parts().0
    }
}

impl InstId {
    pub fn index(self) -> usize {
        self.0.into_raw_parts().0
    }
}

impl BlockId {
    pub fn index(self) -> usize {
        self.0.into_raw_parts().0
    }
}
