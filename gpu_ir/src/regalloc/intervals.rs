//! Liveness analysis and live-interval construction.
//!
//! Live sets are per-block sets of values live immediately before the block.
//! The backward data-flow is iterated once per loop-nesting level: a loop
//! body's live-in set can grow each time the header's set from the previous
//! iteration flows around the back edge.

use crate::cfg::{BlockId, EdgeKind};
use crate::instruction::{InstId, Opcode};
use crate::program::Program;
use crate::value::ValueId;
use std::collections::{HashMap, HashSet};

pub(super) type LiveSets = HashMap<BlockId, HashSet<ValueId>>;

pub(super) fn build_live_sets(p: &mut Program, root: BlockId) -> LiveSets {
    let mut live = LiveSets::new();
    for _ in 0..p.loop_nesting_bound.max(1) {
        let seq = p.new_pass_seq();
        visit_live(p, &mut live, seq, root);
    }
    live
}

fn visit_live(p: &mut Program, live: &mut LiveSets, seq: u32, b: BlockId) {
    if p[b].pass_seq >= seq {
        return;
    }
    p[b].pass_seq = seq;

    let outs: Vec<BlockId> = p[b]
        .out
        .iter()
        .map(|&(s, _)| s)
        .filter(|&s| s != b)
        .collect();
    for &s in &outs {
        visit_live(p, live, seq, s);
    }

    let mut set: HashSet<ValueId> = HashSet::new();
    for &s in &outs {
        if let Some(ls) = live.get(&s) {
            set.extend(ls.iter().copied());
        }
    }

    let body: Vec<InstId> = p
        .block_insns(b)
        .into_iter()
        .filter(|&i| p[i].opcode != Opcode::Phi)
        .collect();
    for &i in body.iter().rev() {
        for &d in p[i].defs.iter() {
            set.remove(&d);
        }
        for (_, r) in p[i].src_iter() {
            // Values without a defining instruction (immediates, memory
            // operands) never occupy a register.
            if p[r.value].def.is_some() {
                set.insert(r.value);
            }
        }
    }
    for ph in p.block_phis(b) {
        if let Some(&d) = p[ph].defs.first() {
            set.remove(&d);
        }
    }

    live.insert(b, set);
}

/// Add `[def, end)` to `v`'s interval, clamped to `b`'s serial range. A def
/// from another block contributes from the top of this block. Phi results
/// start living at the first non-phi instruction.
fn add_range(p: &mut Program, v: ValueId, b: BlockId, end: i32) {
    let Some(def) = p[v].def else { return };
    let entry_serial = match p[b].entry.or_else(|| p[b].first()) {
        Some(e) => p[e].serial,
        None => return,
    };
    let exit_serial = p[b].exit.map(|e| p[e].serial).unwrap_or(entry_serial);

    let mut bgn = p[def].serial;
    if bgn < entry_serial || bgn > exit_serial {
        bgn = entry_serial;
    }
    debug_assert!(bgn <= end);
    if bgn >= end {
        return;
    }
    p[v].livei.add(bgn, end);
}

pub(super) fn build_intervals(p: &mut Program, live: &LiveSets, root: BlockId) {
    let seq = p.new_pass_seq();
    visit_intervals(p, live, seq, root);
}

fn visit_intervals(p: &mut Program, live: &LiveSets, seq: u32, b: BlockId) {
    p[b].pass_seq = seq;

    // Live-out is the union of successor live-ins; fake edges carry no
    // actual control flow and contribute nothing.
    let outs: Vec<(BlockId, EdgeKind)> = p[b].out.iter().copied().collect();
    let mut set: HashSet<ValueId> = HashSet::new();
    for &(s, k) in &outs {
        if k == EdgeKind::Fake {
            continue;
        }
        if let Some(ls) = live.get(&s) {
            set.extend(ls.iter().copied());
        }
    }

    // Successor phis: their results are not live here, and of their operands
    // only the one whose definition actually flows through this block is.
    for &(s, _) in &outs {
        for ph in p.block_phis(s) {
            set.remove(&p[ph].defs[0]);
            let srcs: Vec<ValueId> = p[ph].src_iter().map(|(_, r)| r.value).collect();
            for v in srcs {
                let Some(db) = p[v].def.and_then(|d| p[d].bb) else { continue };
                if p.reachable_by(b, db, Some(s)) {
                    set.insert(v);
                } else {
                    set.remove(&v);
                }
            }
        }
    }

    // Remaining live-outs survive the whole block.
    if let Some(exit) = p[b].exit {
        let end = p[exit].serial + 1;
        let vals: Vec<ValueId> = set.iter().copied().collect();
        for v in vals {
            add_range(p, v, b, end);
        }
    }

    let body: Vec<InstId> = p
        .block_insns(b)
        .into_iter()
        .filter(|&i| p[i].opcode != Opcode::Phi)
        .collect();
    for &i in body.iter().rev() {
        let serial = p[i].serial;
        let defs: Vec<ValueId> = p[i].defs.iter().copied().collect();
        for d in defs {
            set.remove(&d);
        }
        let srcs: Vec<ValueId> = p[i].src_iter().map(|(_, r)| r.value).collect();
        for v in srcs {
            if !set.contains(&v) {
                if p[v].def.is_some() {
                    set.insert(v);
                }
                add_range(p, v, b, serial);
            }
        }
    }

    for &(s, _) in &outs {
        if p[s].pass_seq < seq {
            visit_intervals(p, live, seq, s);
        }
    }
}
