use super::build;
use crate::cfg::EdgeKind;
use crate::error::CompileError;
use crate::instruction::Opcode;
use crate::source::*;

fn vs_passthrough() -> SourceShader {
    let mut sh = SourceShader::new(ShaderKind::Vertex);
    sh.decls.push(Decl::new(DeclClass::Input, 0, 0));
    sh.decls
        .push(Decl::new(DeclClass::Output, 0, 0).semantic(Semantic::Position));
    sh.insns.push(
        SourceInst::new(SourceOp::Mov)
            .dst(DstOperand::output(0))
            .src(SrcOperand::input(0)),
    );
    sh.insns.push(SourceInst::new(SourceOp::End));
    sh
}

#[test]
fn vertex_passthrough_exports_position() {
    let p = build(&vs_passthrough()).unwrap();
    let mut exports = 0;
    let mut exits = 0;
    for i in p.inst_ids() {
        match p[i].opcode {
            Opcode::Export => exports += 1,
            Opcode::Exit => exits += 1,
            _ => {}
        }
    }
    assert!(exports >= 1);
    assert_eq!(exits, 1);
    // A full position write groups all four components into one export.
    let export = p
        .inst_ids()
        .into_iter()
        .find(|&i| p[i].opcode == Opcode::Export)
        .unwrap();
    let loc = p[export].src(0).unwrap().value;
    assert_eq!(p[loc].size, 16);
}

fn fs_if_else() -> SourceShader {
    let mut sh = SourceShader::new(ShaderKind::Fragment);
    sh.decls.push(Decl::new(DeclClass::Input, 0, 0));
    sh.decls
        .push(Decl::new(DeclClass::Output, 0, 0).semantic(Semantic::Color(0)));
    sh.decls.push(Decl::new(DeclClass::Temp, 0, 0));
    sh.immediates.push(ImmVec::splat_f32(1.0));
    sh.immediates.push(ImmVec::splat_f32(2.0));
    sh.insns.push(
        SourceInst::new(SourceOp::If).src(SrcOperand::input(0).scalar(Comp::X)),
    );
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
fn diverging_writes_meet_in_a_phi() {
    let p = build(&fs_if_else()).unwrap();
    let mut phis = Vec::new();
    for (b, _) in p.block_ids() {
        phis.extend(p.block_phis(b));
    }
    assert_eq!(phis.len(), 1);
    assert_eq!(p[phis[0]].num_srcs(), 2);

    // The merge block has two forward in-edges.
    let merge = p[phis[0]].bb.unwrap();
    assert_eq!(p[merge].num_in(), 2);
    assert!(p[merge]
        .ins
        .iter()
        .all(|&(_, k)| k == EdgeKind::Forward));
}

#[test]
fn conditional_branch_reconverges() {
    let p = build(&fs_if_else()).unwrap();
    let joinats = p
        .inst_ids()
        .into_iter()
        .filter(|&i| p[i].opcode == Opcode::Joinat)
        .count();
    let joins = p
        .inst_ids()
        .into_iter()
        .filter(|&i| p[i].opcode == Opcode::Join)
        .count();
    assert_eq!(joinats, 1);
    assert_eq!(joins, 1);
}

fn vs_loop() -> SourceShader {
    let mut sh = SourceShader::new(ShaderKind::Vertex);
    sh.decls
        .push(Decl::new(DeclClass::Output, 0, 0).semantic(Semantic::Position));
    sh.decls.push(Decl::new(DeclClass::Temp, 0, 0));
    sh.immediates.push(ImmVec::splat_f32(0.0));
    sh.immediates.push(ImmVec::splat_f32(1.0));
    sh.insns.push(
        SourceInst::new(SourceOp::Mov)
            .dst(DstOperand::temp(0))
            .src(SrcOperand::imm(0)),
    );
    sh.insns.push(SourceInst::new(SourceOp::BgnLoop));
    sh.insns.push(
        SourceInst::new(SourceOp::Add)
            .dst(DstOperand::temp(0))
            .src(SrcOperand::temp(0))
            .src(SrcOperand::imm(1)),
    );
    sh.insns
        .push(SourceInst::new(SourceOp::If).src(SrcOperand::temp(0).scalar(Comp::X)));
    sh.insns.push(SourceInst::new(SourceOp::Brk));
    sh.insns.push(SourceInst::new(SourceOp::Endif));
    sh.insns.push(SourceInst::new(SourceOp::EndLoop));
    sh.insns.push(
        SourceInst::new(SourceOp::Mov)
            .dst(DstOperand::output(0))
            .src(SrcOperand::temp(0)),
    );
    sh.insns.push(SourceInst::new(SourceOp::End));
    sh
}

#[test]
fn loop_carried_variable_gets_header_phi() {
    let p = build(&vs_loop()).unwrap();
    let header = p
        .block_ids()
        .into_iter()
        .map(|(b, _)| b)
        .find(|&b| p[b].ins.iter().any(|&(_, k)| k == EdgeKind::Back))
        .expect("loop header with back edge");
    let phis = p.block_phis(header);
    assert!(!phis.is_empty());
    for phi in phis {
        assert_eq!(p[phi].num_srcs(), 2);
    }
}

#[test]
fn break_edge_is_fake_on_the_out_side() {
    let p = build(&vs_loop()).unwrap();
    let exit = p
        .block_ids()
        .into_iter()
        .map(|(b, _)| b)
        .find(|&b| p[b].ins.iter().any(|&(_, k)| k == EdgeKind::LoopLeave))
        .expect("loop exit block");
    // The break edge is visible to reachability (in-side) without looking
    // like fall-through control flow on the breaking block.
    assert!(p[exit]
        .ins
        .iter()
        .any(|&(_, k)| k == EdgeKind::LoopLeave));
}

#[test]
fn use_counts_match_use_lists() {
    for sh in [vs_passthrough(), fs_if_else(), vs_loop()] {
        let p = build(&sh).unwrap();
        for v in p.value_ids() {
            assert_eq!(p[v].refc as usize, p[v].uses.len());
            for u in &p[v].uses {
                let r = p[u.inst].src(u.slot).expect("use link points at a source");
                assert_eq!(r.value, v);
            }
        }
    }
}

#[test]
fn immediates_are_deduplicated() {
    let mut sh = vs_passthrough();
    sh.immediates.push(ImmVec::splat_f32(3.5));
    sh.insns.insert(
        0,
        SourceInst::new(SourceOp::Mov)
            .dst(DstOperand::temp(0))
            .src(SrcOperand::imm(0)),
    );
    sh.insns.insert(
        1,
        SourceInst::new(SourceOp::Add)
            .dst(DstOperand::temp(1))
            .src(SrcOperand::temp(0))
            .src(SrcOperand::imm(0)),
    );
    let p = build(&sh).unwrap();
    let imm_count = p
        .value_ids()
        .into_iter()
        .filter(|&v| p[v].imm.map(|i| i.as_f32()) == Some(3.5))
        .count();
    assert_eq!(imm_count, 1);
}

#[test]
fn fragment_results_past_the_register_file_are_rejected() {
    // Color results are pinned to consecutive registers; the sixteenth
    // color's .w component would land on the hardwired zero register.
    let mut sh = SourceShader::new(ShaderKind::Fragment);
    sh.decls
        .push(Decl::new(DeclClass::Output, 0, 15).semantic(Semantic::Color(0)));
    sh.immediates.push(ImmVec::splat_f32(1.0));
    sh.insns.push(
        SourceInst::new(SourceOp::Mov)
            .dst(DstOperand::output(15))
            .src(SrcOperand::imm(0)),
    );
    sh.insns.push(SourceInst::new(SourceOp::End));

    assert!(matches!(
        build(&sh),
        Err(CompileError::OutOfResources { .. })
    ));
}

#[test]
fn local_memory_fallback_for_indirect_temps() {
    let mut sh = vs_passthrough();
    sh.decls.push(Decl::new(DeclClass::Temp, 0, 3));
    sh.decls.push(Decl::new(DeclClass::Address, 0, 0));
    sh.insns.insert(
        0,
        SourceInst::new(SourceOp::Mov)
            .dst(DstOperand::temp(2))
            .src(SrcOperand::temp(1).indirect(0)),
    );
    let p = build(&sh).unwrap();
    assert!(p.local_mem_size > 0);
    assert!(p
        .inst_ids()
        .into_iter()
        .any(|i| p[i].opcode == Opcode::Ld));
    assert!(p
        .inst_ids()
        .into_iter()
        .any(|i| p[i].opcode == Opcode::St));
}
