//! Whole-pipeline scenarios: source stream in, compiled program out, with
//! assertions on the surviving IR and the register assignment.

use gpu_ir::cfg::EdgeKind;
use gpu_ir::{
    builder, compile, regalloc, Comp, CompileError, CompileOpts, CompiledProgram, CondCode, Decl,
    DeclClass, DstOperand, ImmVec, OpExt, Opcode, Program, Ref, RegFile, Semantic, ShaderKind,
    SourceInst, SourceOp, SourceShader, SrcOperand, TexInfo, TexTarget,
};
use pretty_assertions::assert_eq;

fn compiled(sh: &SourceShader) -> CompiledProgram {
    compile(sh, &CompileOpts::default()).unwrap()
}

fn opcodes(p: &Program) -> Vec<Opcode> {
    p.inst_ids().into_iter().map(|i| p[i].opcode).collect()
}

fn count(p: &Program, pred: impl Fn(Opcode) -> bool) -> usize {
    opcodes(p).into_iter().filter(|&o| pred(o)).count()
}

#[test]
fn constant_load_folds_into_its_consumer() {
    let mut sh = SourceShader::new(ShaderKind::Vertex);
    sh.decls
        .push(Decl::new(DeclClass::Output, 0, 0).semantic(Semantic::Position));
    sh.decls.push(Decl::new(DeclClass::Temp, 0, 1));
    sh.immediates.push(ImmVec::splat_f32(1.0));
    sh.insns.push(
        SourceInst::new(SourceOp::Mov)
            .dst(DstOperand::temp(0).mask(1))
            .src(SrcOperand::cbuf(0, 0).scalar(Comp::X)),
    );
    sh.insns.push(
        SourceInst::new(SourceOp::Add)
            .dst(DstOperand::temp(1).mask(1))
            .src(SrcOperand::temp(0).scalar(Comp::X))
            .src(SrcOperand::imm(0)),
    );
    sh.insns.push(
        SourceInst::new(SourceOp::Mov)
            .dst(DstOperand::output(0).mask(1))
            .src(SrcOperand::temp(1).scalar(Comp::X)),
    );
    sh.insns.push(SourceInst::new(SourceOp::End));

    let out = compiled(&sh);
    let p = &out.program;

    // The load was folded into the add, the copies through the temporaries
    // are gone.
    assert_eq!(count(p, |o| o == Opcode::Ld), 0);
    assert_eq!(count(p, |o| matches!(o, Opcode::Add(_))), 1);
    let add = p
        .inst_ids()
        .into_iter()
        .find(|&i| matches!(p[i].opcode, Opcode::Add(_)))
        .unwrap();
    assert!(p[add]
        .src_iter()
        .any(|(_, r)| matches!(p[r.value].file, RegFile::MemC(0))));
    for i in p.inst_ids() {
        if p[i].opcode == Opcode::Mov {
            let src = p[i].src(0).expect("mov with a source");
            assert!(
                p[src.value].is_imm(),
                "only immediate loads may survive, found a stray copy"
            );
        }
    }
}

#[test]
fn multiply_by_zero_becomes_the_zero_constant() {
    let mut sh = SourceShader::new(ShaderKind::Fragment);
    sh.decls.push(Decl::new(DeclClass::Input, 0, 0));
    sh.decls
        .push(Decl::new(DeclClass::Output, 0, 0).semantic(Semantic::Color(0)));
    sh.decls.push(Decl::new(DeclClass::Temp, 0, 0));
    sh.immediates.push(ImmVec::splat_f32(0.0));
    sh.insns.push(
        SourceInst::new(SourceOp::Mul)
            .dst(DstOperand::temp(0).mask(1))
            .src(SrcOperand::input(0).scalar(Comp::X))
            .src(SrcOperand::imm(0)),
    );
    sh.insns.push(
        SourceInst::new(SourceOp::Mov)
            .dst(DstOperand::output(0).mask(1))
            .src(SrcOperand::temp(0).scalar(Comp::X)),
    );
    sh.insns.push(SourceInst::new(SourceOp::End));

    let out = compiled(&sh);
    let p = &out.program;

    assert_eq!(count(p, |o| matches!(o, Opcode::Mul(_))), 0);
    // The input is no longer read, so its interpolation died with the
    // multiply.
    assert_eq!(count(p, |o| o == Opcode::Linterp || o == Opcode::Pinterp), 0);
    assert!(p.inst_ids().into_iter().any(|i| {
        p[i].opcode == Opcode::Mov
            && p[i]
                .src(0)
                .is_some_and(|r| p[r.value].is_imm() && p[r.value].imm.unwrap().as_f32() == 0.0)
    }));
}

#[test]
fn chained_constant_arithmetic_folds_to_one_immediate() {
    let mut sh = SourceShader::new(ShaderKind::Vertex);
    sh.decls
        .push(Decl::new(DeclClass::Output, 0, 0).semantic(Semantic::Position));
    sh.immediates.push(ImmVec::splat_f32(2.0));
    sh.immediates.push(ImmVec::splat_f32(3.0));
    sh.insns.push(
        SourceInst::new(SourceOp::Add)
            .dst(DstOperand::output(0).mask(1))
            .src(SrcOperand::imm(0))
            .src(SrcOperand::imm(1)),
    );
    sh.insns.push(SourceInst::new(SourceOp::End));

    let out = compiled(&sh);
    let p = &out.program;

    assert_eq!(count(p, |o| matches!(o, Opcode::Add(_))), 0);
    assert!(p
        .value_ids()
        .into_iter()
        .any(|v| p[v].imm.is_some_and(|imm| imm.as_f32() == 5.0)));
}

#[test]
fn short_if_else_flattens_to_predicated_straight_line() {
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

    let out = compiled(&sh);
    let p = &out.program;

    // No control flow survives; both arms run predicated on complementary
    // conditions over the same predicate register.
    assert_eq!(count(p, |o| o == Opcode::Bra), 0);
    assert_eq!(count(p, |o| o == Opcode::Joinat), 0);
    assert_eq!(count(p, |o| o == Opcode::Join), 0);

    let predicated: Vec<_> = p
        .inst_ids()
        .into_iter()
        .filter(|&i| p[i].is_predicated())
        .collect();
    assert!(predicated.len() >= 2, "both arms should be predicated");
    let ccs: Vec<CondCode> = predicated.iter().map(|&i| p[i].cc).collect();
    assert!(ccs.contains(&CondCode::Eq) && ccs.contains(&CondCode::Ne));
    let pregs: Vec<_> = predicated
        .iter()
        .map(|&i| {
            let s = p[i].predicate.unwrap();
            p[p[i].src(s).unwrap().value].reg
        })
        .collect();
    assert!(pregs.iter().all(|&r| r.is_some() && r == pregs[0]));
}

#[test]
fn loop_carried_temp_gets_a_single_header_phi() {
    let mut sh = SourceShader::new(ShaderKind::Vertex);
    sh.decls
        .push(Decl::new(DeclClass::Output, 0, 0).semantic(Semantic::Position));
    sh.decls.push(Decl::new(DeclClass::Temp, 0, 0));
    sh.immediates.push(ImmVec::splat_f32(0.0));
    sh.immediates.push(ImmVec::splat_f32(1.0));
    sh.insns.push(
        SourceInst::new(SourceOp::Mov)
            .dst(DstOperand::temp(0).mask(1))
            .src(SrcOperand::imm(0)),
    );
    sh.insns.push(SourceInst::new(SourceOp::BgnLoop));
    sh.insns.push(
        SourceInst::new(SourceOp::Add)
            .dst(DstOperand::temp(0).mask(1))
            .src(SrcOperand::temp(0).scalar(Comp::X))
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
            .src(SrcOperand::imm(0)),
    );
    sh.insns.push(SourceInst::new(SourceOp::End));

    // The temporary is carried around the back edge but never read after
    // the loop, so SSA construction needs exactly one phi.
    let p = builder::build(&sh).unwrap();
    let phis: Vec<_> = p
        .inst_ids()
        .into_iter()
        .filter(|&i| p[i].opcode == Opcode::Phi)
        .collect();
    assert_eq!(phis.len(), 1);
    let ph = phis[0];
    assert_eq!(p[ph].src_iter().count(), 2);
    let header = p[ph].bb.unwrap();
    assert!(p[header].ins.iter().any(|&(_, k)| k == EdgeKind::Back));
}

#[test]
fn adjacent_constant_loads_combine_into_one() {
    let mut sh = SourceShader::new(ShaderKind::Vertex);
    sh.decls
        .push(Decl::new(DeclClass::Output, 0, 0).semantic(Semantic::Position));
    sh.insns.push(
        SourceInst::new(SourceOp::Mov)
            .dst(DstOperand::output(0).mask(1))
            .src(SrcOperand::cbuf(0, 0).scalar(Comp::X)),
    );
    sh.insns.push(
        SourceInst::new(SourceOp::Mov)
            .dst(DstOperand::output(0).mask(2))
            .src(SrcOperand::cbuf(0, 0).scalar(Comp::Y)),
    );
    sh.insns.push(SourceInst::new(SourceOp::End));

    let out = compiled(&sh);
    let p = &out.program;

    let loads: Vec<_> = p
        .inst_ids()
        .into_iter()
        .filter(|&i| p[i].opcode == Opcode::Ld)
        .collect();
    assert_eq!(loads.len(), 1);
    let ld = loads[0];
    assert_eq!(p[ld].defs.len(), 2);
    let mem = p[ld].src(0).unwrap().value;
    assert_eq!(p[mem].file, RegFile::MemC(0));
    assert_eq!(p[mem].address, 0);
    assert_eq!(p[mem].size, 8);
    // The paired results sit in an aligned register run.
    let r0 = p[p[ld].defs[0]].reg.unwrap();
    let r1 = p[p[ld].defs[1]].reg.unwrap();
    assert_eq!(r1, r0 + 1);
    assert_eq!(r0 % 2, 0);
}

/// One pinned scalar per aligned quad, except the quad at `free_base`.
/// Everything stays live across the texture fetch.
fn constrained_tex_program(free_base: Option<u32>) -> Program {
    let mut p = Program::new(ShaderKind::Fragment);
    let e = p.entry();

    let mut live = Vec::new();
    for q in 0..16u32 {
        if free_base == Some(q * 4) {
            continue;
        }
        let i = p.new_inst(Opcode::Mov).unwrap();
        let v = p.new_value(RegFile::Gpr, 4).unwrap();
        p[v].reg = Some(q * 4);
        p.add_def(i, v);
        p.append(e, i);
        live.push(v);
    }

    let mut coords = Vec::new();
    for _ in 0..2 {
        let i = p.new_inst(Opcode::Mov).unwrap();
        let v = p.new_value(RegFile::Gpr, 4).unwrap();
        p.add_def(i, v);
        p.append(e, i);
        coords.push(v);
    }

    let tex = p.new_inst(Opcode::Tex).unwrap();
    p[tex].ext = OpExt::Tex(TexInfo {
        unit: 0,
        target: TexTarget::Tex2D,
        mask: 0xf,
    });
    for (s, &c) in coords.iter().enumerate() {
        p.set_src(tex, s, Some(Ref::new(c)));
    }
    for _ in 0..4 {
        let d = p.new_value(RegFile::Gpr, 4).unwrap();
        p.add_def(tex, d);
    }
    p.append(e, tex);

    let texdefs: Vec<_> = p[tex].defs.iter().copied().collect();
    live.extend(texdefs);
    let mut addr = 0;
    for chunk in live.chunks(4) {
        let loc = p.new_value(RegFile::MemV, 4 * chunk.len() as u8).unwrap();
        p[loc].address = addr;
        addr += 4 * chunk.len() as u32;
        let i = p.new_inst(Opcode::Export).unwrap();
        p[i].fixed = true;
        p.set_src(i, 0, Some(Ref::new(loc)));
        for (s, &v) in chunk.iter().enumerate() {
            p.set_src(i, s + 1, Some(Ref::new(v)));
        }
        p.append(e, i);
    }

    let x = p.new_inst(Opcode::Exit).unwrap();
    p[x].terminator = true;
    p.append(e, x);
    p
}

#[test]
fn wide_texture_result_takes_the_one_free_aligned_run() {
    let mut p = constrained_tex_program(Some(8));
    regalloc::allocate(&mut p).unwrap();

    let tex = p
        .inst_ids()
        .into_iter()
        .find(|&i| p[i].opcode == Opcode::Tex)
        .unwrap();
    let regs: Vec<u32> = p[tex].defs.iter().map(|&d| p[d].reg.unwrap()).collect();
    assert_eq!(regs, vec![8, 9, 10, 11]);
}

#[test]
fn wide_texture_result_fails_when_no_aligned_run_is_free() {
    let mut p = constrained_tex_program(None);
    assert!(matches!(
        regalloc::allocate(&mut p),
        Err(CompileError::RegisterAllocation {
            file: RegFile::Gpr
        })
    ));
}
