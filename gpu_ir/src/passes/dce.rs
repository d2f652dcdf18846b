//! Dead code elimination. Runs to a fixpoint from the driver since deleting
//! one instruction can strand the operands of another.

use crate::cfg::BlockId;
use crate::program::Program;

pub fn run(p: &mut Program, root: BlockId) -> usize {
    let mut removed = 0;
    for b in p.pass_order(root) {
        for i in p.block_insns(b) {
            if !p.contains_inst(i) {
                continue;
            }
            if p[i].must_keep() || p[i].target.is_some() {
                continue;
            }
            if p.inst_refcount(i) == 0 {
                p.delete_inst(i);
                removed += 1;
            }
        }
    }
    removed
}
