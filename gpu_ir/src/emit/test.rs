use super::encode::TRAP_OP;
use super::{encode, pre_emission, EncodedProgram, RelocKind, Relocation, INSN_BYTES};
use crate::builder::build;
use crate::cfg::EdgeKind;
use crate::instruction::Opcode;
use crate::passes::{optimize, OptimizeConfig};
use crate::program::Program;
use crate::regalloc::allocate;
use crate::source::*;
use crate::value::{Ref, RegFile};

fn compiled(sh: &SourceShader) -> (Program, EncodedProgram) {
    let mut p = build(sh).unwrap();
    optimize(&mut p, &OptimizeConfig::default()).unwrap();
    allocate(&mut p).unwrap();
    let enc = encode(&mut p, sh).unwrap();
    (p, enc)
}

fn op_at(words: &[u32], pair: usize) -> u32 {
    words[pair * 2] & 0xff
}

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
fn every_instruction_packs_into_one_word_pair() {
    let (p, enc) = compiled(&vs_passthrough());
    assert_eq!(enc.words.len() % 2, 0);
    let pairs = enc.words.len() / 2;
    // Everything still in the arena was encoded, plus the trap sentinel.
    assert_eq!(pairs, p.inst_ids().len() + 1);
    assert_eq!(enc.words[enc.words.len() - 2], TRAP_OP);
    assert_eq!(enc.words[enc.words.len() - 1], 0);
}

#[test]
fn branch_to_the_next_block_is_elided() {
    let mut p = Program::new(ShaderKind::Vertex);
    let b0 = p.entry();
    let b1 = p.new_block().unwrap();
    p.attach_edge(b0, b1, EdgeKind::Forward);

    let mv = p.new_inst(Opcode::Mov).unwrap();
    p[mv].fixed = true;
    p.append(b0, mv);
    let br = p.new_inst(Opcode::Bra).unwrap();
    p[br].target = Some(b1);
    p[br].terminator = true;
    p.append(b0, br);
    let exit = p.new_inst(Opcode::Exit).unwrap();
    p[exit].terminator = true;
    p.append(b1, exit);

    let order = pre_emission(&mut p).unwrap();
    assert_eq!(order, vec![b0, b1]);
    assert!(!p.contains_inst(br));
    assert_eq!(p[b0].emit_size, INSN_BYTES);
    assert_eq!(p[b1].emit_pos, INSN_BYTES);
}

#[test]
fn identity_copies_are_stripped() {
    let mut p = Program::new(ShaderKind::Vertex);
    let b = p.entry();
    let a = p.new_value(RegFile::Gpr, 4).unwrap();
    p[a].reg = Some(2);
    let mv = p.new_inst(Opcode::Mov).unwrap();
    let d = p.new_value(RegFile::Gpr, 4).unwrap();
    p[d].reg = Some(2);
    p.add_def(mv, d);
    p.set_src(mv, 0, Some(Ref::new(a)));
    p.append(b, mv);
    let exit = p.new_inst(Opcode::Exit).unwrap();
    p[exit].terminator = true;
    p.append(b, exit);

    pre_emission(&mut p).unwrap();
    assert!(!p.contains_inst(mv));
    assert_eq!(p[b].emit_size, INSN_BYTES);
}

#[test]
fn flattening_removes_branches_from_a_diamond() {
    let (p, enc) = compiled(&fs_if_else());

    for i in p.inst_ids() {
        assert!(
            !matches!(
                p[i].opcode,
                Opcode::Bra | Opcode::Joinat | Opcode::Join | Opcode::Export
            ),
            "{} survived flattening",
            p[i].opcode
        );
        assert!(!p[i].opcode.is_pseudo());
    }
    for pair in 0..enc.words.len() / 2 {
        assert_ne!(op_at(&enc.words, pair), 40, "branch word emitted");
    }

    // Both arms run predicated, one on the branch condition and one on its
    // complement.
    let ccs: Vec<_> = p
        .inst_ids()
        .into_iter()
        .filter(|&i| p[i].is_predicated())
        .map(|i| p[i].cc)
        .collect();
    assert!(!ccs.is_empty());
    assert!(ccs.iter().any(|&c| ccs.contains(&c.invert())));
}

#[test]
fn loop_back_edge_branch_encodes_a_negative_delta() {
    let (_, enc) = compiled(&vs_loop());
    let mut deltas = Vec::new();
    for pair in 0..enc.words.len() / 2 {
        if op_at(&enc.words, pair) == 40 {
            deltas.push(enc.words[pair * 2 + 1] as i32);
        }
    }
    assert!(!deltas.is_empty(), "loop lost its branches");
    for d in &deltas {
        assert_eq!(d % INSN_BYTES as i32, 0);
    }
    assert!(deltas.iter().any(|&d| d < 0), "no backward branch: {deltas:?}");
}

#[test]
fn constant_loads_get_data_relocations() {
    let mut p = Program::new(ShaderKind::Vertex);
    let b = p.entry();

    let ld = p.new_inst(Opcode::Ld).unwrap();
    let mem = p.new_value(RegFile::MemC(0), 4).unwrap();
    p[mem].address = 0x10;
    let d = p.new_value(RegFile::Gpr, 4).unwrap();
    p.add_def(ld, d);
    p.set_src(ld, 0, Some(Ref::new(mem)));
    p.append(b, ld);

    let mv = p.new_inst(Opcode::Mov).unwrap();
    let d2 = p.new_value(RegFile::Gpr, 4).unwrap();
    p.add_def(mv, d2);
    p.set_src(mv, 0, Some(Ref::new(d)));
    p[mv].fixed = true;
    p.append(b, mv);

    let exit = p.new_inst(Opcode::Exit).unwrap();
    p[exit].terminator = true;
    p.append(b, exit);

    allocate(&mut p).unwrap();
    let enc = encode(&mut p, &SourceShader::new(ShaderKind::Vertex)).unwrap();

    assert_eq!(enc.relocs.len(), 1);
    let r = enc.relocs[0];
    assert_eq!(r.kind, RelocKind::Data);
    assert_eq!(r.addend, 0x10);
    assert_eq!(r.mask, 0xffff_0000);
    assert_eq!(r.shift, 16);
    // The relocation points at the load's second word.
    assert_eq!(r.offset % INSN_BYTES, 4);
}

#[test]
fn relocations_patch_the_addressed_word() {
    let r = Relocation {
        offset: 4,
        kind: RelocKind::Data,
        addend: 0x10,
        mask: 0xffff_0000,
        shift: 16,
    };
    let mut words = vec![0u32, 0x0000_1234];
    r.apply(&mut words, 0, 0x100);
    assert_eq!(words[1], 0x0110_1234);
}

#[test]
fn header_reports_io_masks_and_early_z() {
    let (_, enc) = compiled(&fs_if_else());
    assert_eq!(enc.header[0] & 1, 1);
    assert_eq!(enc.header[1] & 1, 1);
    assert_ne!(enc.header[5] & super::header::FLAG_EARLY_Z, 0);
    assert_eq!(enc.header[5] & super::header::FLAG_WRITES_DEPTH, 0);
    assert!(enc.header[8] >= 1);
    assert!(enc.max_gpr >= 0);
}

#[test]
fn header_reports_local_memory_use() {
    let mut sh = vs_passthrough();
    sh.decls.push(Decl::new(DeclClass::Temp, 0, 3));
    sh.decls.push(Decl::new(DeclClass::Address, 0, 0));
    sh.insns.insert(
        0,
        SourceInst::new(SourceOp::Mov)
            .dst(DstOperand::temp(2))
            .src(SrcOperand::temp(1).indirect(0)),
    );
    let (p, enc) = compiled(&sh);
    assert!(p.local_mem_size > 0);
    assert_eq!(enc.header[7], p.local_mem_size);
}
