use super::{allocate, coalesce, linear_scan};
use crate::builder::build;
use crate::instruction::{InstId, Opcode};
use crate::passes::{optimize, OptimizeConfig};
use crate::program::Program;
use crate::source::*;
use crate::value::{Ref, RegFile, ValueId};

/// An instruction with one GPR def and a hand-set live interval.
fn def_with_interval(p: &mut Program, serial: i32, bgn: i32, end: i32) -> (InstId, ValueId) {
    let e = p.entry();
    let i = p.new_inst(Opcode::Mov).unwrap();
    let d = p.new_value(RegFile::Gpr, 4).unwrap();
    p.add_def(i, d);
    p[i].serial = serial;
    p[d].livei.add(bgn, end);
    p.append(e, i);
    (i, d)
}

#[test]
fn disjoint_intervals_share_a_register() {
    let mut p = Program::new(ShaderKind::Vertex);
    let (i0, v0) = def_with_interval(&mut p, 0, 0, 2);
    let (i1, v1) = def_with_interval(&mut p, 2, 2, 4);
    linear_scan::linear_scan(&mut p, &[i0, i1]).unwrap();
    assert_eq!(p[v0].reg, Some(0));
    assert_eq!(p[v1].reg, Some(0));
}

#[test]
fn overlapping_intervals_get_distinct_registers() {
    let mut p = Program::new(ShaderKind::Vertex);
    let (i0, v0) = def_with_interval(&mut p, 0, 0, 4);
    let (i1, v1) = def_with_interval(&mut p, 1, 1, 3);
    linear_scan::linear_scan(&mut p, &[i0, i1]).unwrap();
    assert_eq!(p[v0].reg, Some(0));
    assert_eq!(p[v1].reg, Some(1));
    assert_eq!(p.max_reg.gpr, 1);
}

#[test]
fn pinned_register_is_avoided_by_earlier_values() {
    let mut p = Program::new(ShaderKind::Vertex);
    let (i0, v0) = def_with_interval(&mut p, 0, 0, 4);
    let (i1, v1) = def_with_interval(&mut p, 2, 2, 4);
    p[v1].reg = Some(0);
    linear_scan::linear_scan(&mut p, &[i0, i1]).unwrap();
    // The unassigned value sees the pinned overlap ahead of it.
    assert_eq!(p[v0].reg, Some(1));
    assert_eq!(p[v1].reg, Some(0));
}

#[test]
fn copy_coalescing_merges_mov_chains() {
    let mut p = Program::new(ShaderKind::Vertex);
    let (_, v0) = def_with_interval(&mut p, 0, 0, 1);
    let (mv, v1) = def_with_interval(&mut p, 1, 1, 2);
    p.set_src(mv, 0, Some(Ref::new(v0)));
    coalesce::join_values(&mut p, &[mv], coalesce::JOIN_MOV).unwrap();
    assert_eq!(coalesce::rep(&mut p, v0), coalesce::rep(&mut p, v1));
    let r = coalesce::rep(&mut p, v1);
    assert_eq!(p[r].livei.bgn(), Some(0));
    assert_eq!(p[r].livei.end(), Some(2));
}

#[test]
fn coalescing_refuses_overlapping_copies() {
    let mut p = Program::new(ShaderKind::Vertex);
    let (_, v0) = def_with_interval(&mut p, 0, 0, 3);
    let (mv, v1) = def_with_interval(&mut p, 1, 1, 2);
    p.set_src(mv, 0, Some(Ref::new(v0)));
    coalesce::join_values(&mut p, &[mv], coalesce::JOIN_MOV).unwrap();
    assert_ne!(coalesce::rep(&mut p, v0), coalesce::rep(&mut p, v1));
}

#[test]
fn bind_components_land_in_consecutive_registers() {
    let mut p = Program::new(ShaderKind::Vertex);
    let e = p.entry();
    let mut srcs = Vec::new();
    for c in 0..4 {
        let (_, v) = def_with_interval(&mut p, c, c, 4);
        srcs.push(v);
    }
    let bind = p.new_inst(Opcode::Bind).unwrap();
    for (c, &s) in srcs.iter().enumerate() {
        let d = p.new_value(RegFile::Gpr, 4).unwrap();
        p.add_def(bind, d);
        p[d].livei.add(4, 6 + c as i32);
        p.set_src(bind, c, Some(Ref::new(s)));
    }
    p[bind].serial = 4;
    p.append(e, bind);

    let order: Vec<InstId> = p
        .inst_ids()
        .into_iter()
        .collect();
    coalesce::join_values(&mut p, &order, coalesce::JOIN_BIND).unwrap();
    linear_scan::allocate_constrained(&mut p, &[bind]).unwrap();

    let regs: Vec<u32> = (0..4)
        .map(|c| {
            let d = p[bind].defs[c];
            let r = coalesce::rep(&mut p, d);
            p[r].reg.unwrap()
        })
        .collect();
    assert_eq!(regs, vec![regs[0], regs[0] + 1, regs[0] + 2, regs[0] + 3]);
    assert_eq!(regs[0] % 4, 0);
}

fn fs_if_else() -> SourceShader {
    let mut sh = SourceShader::new(ShaderKind::Fragment);
    sh.decls.push(Decl::new(DeclClass::Input, 0, 0));
    sh.decls
        .push(Decl::new(DeclClass::Output, 0, 0).semantic(Semantic::Color(0)));
    sh.decls.push(Decl::new(DeclClass::Temp, 0, 0));
    sh.immediates.push(ImmVec::splat_f32(1.0));
    sh.immediates.push(ImmVec::splat_f32(2.0));
    sh.insns
        .push(SourceInst::new(SourceOp::If).src(SrcOperand::input(0).scalar(Comp::X)));
    sh.insns.push(
        SourceInst::new(SourceOp::Mov)
            .dst(DstOperand::temp(0).mask(1))
            .src(SrcOperand::imm(0)),
    );
    sh.insns.push(SourceInst::new(SourceOp::Else));
    sh.insns.push(
        SourceInst::new(SourceOp::Mov)
            .dst(DstOperand::temp(0).mask(1))
            .src(SrcOperand::imm(1)),
    );
    sh.insns.push(SourceInst::new(SourceOp::Endif));
    sh.insns.push(
        SourceInst::new(SourceOp::Mov)
            .dst(DstOperand::output(0).mask(1))
            .src(SrcOperand::temp(0).scalar(Comp::X)),
    );
    sh.insns.push(SourceInst::new(SourceOp::End));
    sh
}

#[test]
fn every_live_value_ends_up_in_a_register() {
    let mut p = build(&fs_if_else()).unwrap();
    optimize(&mut p, &OptimizeConfig::default()).unwrap();
    allocate(&mut p).unwrap();
    for v in p.value_ids() {
        if !p[v].livei.is_empty() {
            assert!(p[v].reg.is_some(), "unassigned live value {}", v.index());
        }
    }
}

#[test]
fn shared_registers_imply_disjoint_intervals() {
    let mut p = build(&fs_if_else()).unwrap();
    optimize(&mut p, &OptimizeConfig::default()).unwrap();
    allocate(&mut p).unwrap();
    let live: Vec<ValueId> = p
        .value_ids()
        .into_iter()
        .filter(|&v| !p[v].livei.is_empty() && p[v].reg.is_some())
        .collect();
    for (n, &a) in live.iter().enumerate() {
        for &b in &live[n + 1..] {
            if p[a].file == p[b].file && p[a].reg == p[b].reg {
                assert!(
                    !p[a].livei.overlaps(&p[b].livei),
                    "register clash between {} and {}",
                    a.index(),
                    b.index()
                );
            }
        }
    }
}

#[test]
fn phi_operands_are_isolated_through_copies() {
    let mut p = build(&fs_if_else()).unwrap();
    allocate(&mut p).unwrap();
    for (b, _) in p.block_ids() {
        for phi in p.block_phis(b) {
            for (_, r) in p[phi].operand_iter() {
                let def = p[r.value].def.expect("phi operand has a def");
                assert_eq!(p[def].opcode, Opcode::Mov);
            }
        }
    }
}
