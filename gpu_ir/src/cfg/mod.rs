//! Basic blocks and the control-flow graph.
//!
//! Blocks carry at most two outgoing and eight incoming typed edges. Loop
//! structure is encoded in the edge kinds rather than in a separate loop
//! tree: a loop header is entered through a `LoopEnter` edge and closed by a
//! `Back` edge, breaks leave through `LoopLeave` in-edges whose out-side is
//! `Fake` (the out-side must not look like real control flow to liveness,
//! the in-side must be visible to reachability).

#[cfg(test)]
mod test;

use crate::instruction::InstId;
use crate::program::Program;
use arrayvec::ArrayVec;

/// Stable identity of a [`BasicBlock`] inside one `Program`'s arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) generational_arena::Index);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    Forward,
    /// Loop back edge; never descended by passes.
    Back,
    /// Edge from a loop pre-header into the loop header.
    LoopEnter,
    /// Edge out of a loop body to the loop exit block.
    LoopLeave,
    /// Control never actually flows here; keeps the graph connected for
    /// ordering purposes (e.g. the out-side of a BRK).
    Fake,
}

pub const MAX_OUT_EDGES: usize = 2;
pub const MAX_IN_EDGES: usize = 8;

#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    /// First phi instruction, head of the phi prefix.
    pub phi: Option<InstId>,
    /// First non-phi instruction.
    pub entry: Option<InstId>,
    /// Last instruction.
    pub exit: Option<InstId>,
    pub out: ArrayVec<(BlockId, EdgeKind), MAX_OUT_EDGES>,
    pub ins: ArrayVec<(BlockId, EdgeKind), MAX_IN_EDGES>,
    /// Generation marker; a block is visited when this equals the walk's
    /// sequence number.
    pub pass_seq: u32,
    /// Scratch counter for ordering walks and the flattener.
    pub scratch: u32,
    /// Byte offset of the first emitted instruction.
    pub emit_pos: u32,
    /// Emitted size in bytes.
    pub emit_size: u32,
}

impl BasicBlock {
    pub fn num_in(&self) -> usize {
        self.ins.len()
    }

    /// First instruction in list order (phis come first).
    pub fn first(&self) -> Option<InstId> {
        self.phi.or(self.entry)
    }
}

impl Program {
    /// Connect `from -> to`, recording `kind` on both sides.
    pub fn attach_edge(&mut self, from: BlockId, to: BlockId, kind: EdgeKind) {
        self.attach_edge_ex(from, to, kind, kind);
    }

    /// Connect `from -> to` with distinct out/in kinds. Used for break
    /// edges, which are `Fake` on the out-side and `LoopLeave` on the
    /// in-side.
    pub fn attach_edge_ex(
        &mut self,
        from: BlockId,
        to: BlockId,
        out_kind: EdgeKind,
        in_kind: EdgeKind,
    ) {
        self[from].out.push((to, out_kind));
        self[to].ins.push((from, in_kind));
    }

    /// Fresh generation number for one graph walk.
    pub fn new_pass_seq(&mut self) -> u32 {
        self.pass_seq += 1;
        self.pass_seq
    }

    /// Reachable blocks in preorder, descending out-edges but never back
    /// edges (those always lead to an already-visited header).
    pub fn pass_order(&mut self, root: BlockId) -> Vec<BlockId> {
        let seq = self.new_pass_seq();
        let mut order = Vec::new();
        let mut stack = vec![root];
        self[root].pass_seq = seq;
        while let Some(b) = stack.pop() {
            order.push(b);
            for i in (0..self[b].out.len()).rev() {
                let (succ, kind) = self[b].out[i];
                if kind == EdgeKind::Back || self[succ].pass_seq == seq {
                    continue;
                }
                self[succ].pass_seq = seq;
                stack.push(succ);
            }
        }
        order
    }

    /// Emission order: a block is ready once all its forward/fake
    /// predecessors were visited; loop headers are entered eagerly and loop
    /// exits are deferred until the main stack drains, so a loop body is
    /// laid out contiguously before its exit.
    pub fn emission_order(&mut self, root: BlockId) -> Vec<BlockId> {
        for (id, _) in self.block_ids() {
            self[id].scratch = 0;
        }
        let mut order = Vec::new();
        let mut stack = vec![root];
        let mut deferred: Vec<BlockId> = Vec::new();
        while let Some(b) = stack.pop() {
            self[b].scratch = 0;
            for i in (0..self[b].out.len()).rev() {
                let (succ, kind) = self[b].out[i];
                match kind {
                    EdgeKind::Back => {}
                    EdgeKind::Forward | EdgeKind::Fake => {
                        self[succ].scratch += 1;
                        if self[succ].scratch as usize == self[succ].num_in() {
                            stack.push(succ);
                        }
                    }
                    EdgeKind::LoopEnter => stack.push(succ),
                    EdgeKind::LoopLeave => {
                        if self[succ].scratch == 0 {
                            self[succ].scratch = 1;
                            deferred.push(succ);
                        }
                    }
                }
            }
            order.push(b);
            if stack.is_empty() {
                while let Some(d) = deferred.pop() {
                    stack.push(d);
                }
            }
        }
        order
    }

    /// Whether every acyclic path from the entry to `b` passes through `d`.
    /// Back in-edges are ignored, which makes the recursion well-founded.
    pub fn dominated_by(&self, b: BlockId, d: BlockId) -> bool {
        if b == d {
            return true;
        }
        if self[b].ins.is_empty() {
            return false;
        }
        self[b]
            .ins
            .iter()
            .filter(|(_, kind)| *kind != EdgeKind::Back)
            .all(|&(pred, _)| self.dominated_by(pred, d))
    }

    /// Whether `target` can be reached from `from` without passing through
    /// `term` and without taking back edges.
    pub fn reachable_by(&mut self, target: BlockId, from: BlockId, term: Option<BlockId>) -> bool {
        let seq = self.new_pass_seq();
        let mut stack = vec![from];
        self[from].pass_seq = seq;
        while let Some(b) = stack.pop() {
            if b == target {
                return true;
            }
            if Some(b) == term {
                continue;
            }
            for i in 0..self[b].out.len() {
                let (succ, kind) = self[b].out[i];
                if kind == EdgeKind::Back || self[succ].pass_seq == seq {
                    continue;
                }
                self[succ].pass_seq = seq;
                stack.push(succ);
            }
        }
        false
    }
}
