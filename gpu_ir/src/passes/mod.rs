//! The machine-independent optimization passes.
//!
//! Pass order is load-bearing: CSE first so later passes can compare values
//! by identity, constant folding before modifier lowering (folding sees the
//! original Neg/Abs instructions), modifier lowering before load folding
//! (folding must not have to reason about modifiers on memory operands), and
//! the load combiner only after dead code is gone so it does not vectorize
//! loads whose results are unused.

mod cse;
mod dce;
mod fold;
mod fold_loads;
mod lower_mods;
mod mem_opt;
mod tex_fixups;


use crate::error::CompileError;
use crate::program::Program;

/// Optimizer knobs. Everything defaults to on; the switches exist for
/// debugging miscompiles.
#[derive(Debug, Clone, Copy)]
pub struct OptimizeConfig {
    /// Vectorize adjacent constant-bank and attribute loads.
    pub combine_loads: bool,
}

impl Default for OptimizeConfig {
    fn default() -> OptimizeConfig {
        OptimizeConfig {
            combine_loads: true,
        }
    }
}

pub fn optimize(p: &mut Program, cfg: &OptimizeConfig) -> Result<(), CompileError> {
    for root in p.roots.clone() {
        cse::run(p, root);
        fold::run(p, root)?;
        lower_mods::run(p, root);
        fold_loads::run(p, root);

        while dce::run(p, root) > 0 {}

        if cfg.combine_loads {
            // Two rounds: the first can open up adjacency for the second.
            mem_opt::run(p, root)?;
            mem_opt::run(p, root)?;
        }

        tex_fixups::tex_mask(p);
        tex_fixups::run(p, root)?;
    }
    Ok(())
}
