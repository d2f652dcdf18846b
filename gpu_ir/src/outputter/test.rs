use super::{dump, IrOutputConfig};
use crate::builder::build;
use crate::regalloc::allocate;
use crate::source::*;

fn fs_simple() -> SourceShader {
    let mut sh = SourceShader::new(ShaderKind::Fragment);
    sh.decls.push(Decl::new(DeclClass::Input, 0, 0));
    sh.decls
        .push(Decl::new(DeclClass::Output, 0, 0).semantic(Semantic::Color(0)));
    sh.immediates.push(ImmVec::splat_f32(0.5));
    sh.insns.push(
        SourceInst::new(SourceOp::Add)
            .dst(DstOperand::output(0).mask(1))
            .src(SrcOperand::input(0).scalar(Comp::X))
            .src(SrcOperand::imm(0)),
    );
    sh.insns.push(SourceInst::new(SourceOp::End));
    sh
}

#[test]
fn ssa_values_print_as_arena_indices() {
    let p = build(&fs_simple()).unwrap();
    let text = dump(&p, IrOutputConfig::default());
    assert!(text.contains("BB:0"));
    assert!(text.contains("add.f32"));
    assert!(text.contains('%'), "unallocated values should print by index:\n{text}");
    assert!(text.contains("imm(0.5)"));
}

#[test]
fn allocated_values_print_as_registers() {
    let mut p = build(&fs_simple()).unwrap();
    allocate(&mut p).unwrap();
    let text = dump(&p, IrOutputConfig::default());
    assert!(text.contains("$r"), "no register names in:\n{text}");
}

#[test]
fn live_intervals_show_up_on_request() {
    let mut p = build(&fs_simple()).unwrap();
    allocate(&mut p).unwrap();
    let config = IrOutputConfig {
        show_live: true,
        show_serial: true,
    };
    let text = dump(&p, config);
    assert!(text.contains('{'), "no interval markers in:\n{text}");
}

#[test]
fn edges_are_annotated_with_their_kind() {
    let mut sh = fs_simple();
    sh.insns.insert(
        0,
        SourceInst::new(SourceOp::If).src(SrcOperand::input(0).scalar(Comp::X)),
    );
    sh.insns.insert(1, SourceInst::new(SourceOp::Endif));
    let p = build(&sh).unwrap();
    let text = dump(&p, IrOutputConfig::default());
    assert!(text.contains("[Forward]"), "missing edge kinds in:\n{text}");
}
