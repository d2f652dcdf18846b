//! The top-level entry point: source stream in, instruction words out.

use crate::builder;
use crate::emit::{self, Relocation, HEADER_WORDS};
use crate::error::CompileError;
use crate::outputter::{dump, IrOutputConfig};
use crate::passes::{optimize, OptimizeConfig};
use crate::program::Program;
use crate::regalloc;
use crate::source::SourceShader;

/// Pipeline stages after which the IR can be dumped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpPoint {
    /// Right after SSA construction.
    Initial,
    /// After the optimization passes.
    PostOpt,
    /// After register allocation, with live intervals and serials.
    PostRa,
    /// After flattening and pre-emission cleanup.
    PostEmit,
}

/// Per-compile configuration. Build one through [`CompileOpts::builder`].
#[derive(Debug, Clone)]
pub struct CompileOpts {
    opt_level: u8,
    dump: Vec<DumpPoint>,
    optimize: OptimizeConfig,
}

impl CompileOpts {
    pub fn builder() -> CompileOptsBuilder {
        CompileOptsBuilder {
            opt_level: 1,
            dump: Vec::new(),
            optimize: OptimizeConfig::default(),
        }
    }
}

impl Default for CompileOpts {
    fn default() -> CompileOpts {
        CompileOpts::builder()
            .build()
            .expect("default options are valid")
    }
}

#[derive(Debug, Clone)]
pub struct CompileOptsBuilder {
    opt_level: u8,
    dump: Vec<DumpPoint>,
    optimize: OptimizeConfig,
}

impl CompileOptsBuilder {
    /// 0 skips the optimizer entirely; 1 is the default pass suite.
    pub fn opt_level(mut self, level: u8) -> CompileOptsBuilder {
        self.opt_level = level;
        self
    }

    pub fn dump(mut self, point: DumpPoint) -> CompileOptsBuilder {
        if !self.dump.contains(&point) {
            self.dump.push(point);
        }
        self
    }

    pub fn combine_loads(mut self, on: bool) -> CompileOptsBuilder {
        self.optimize.combine_loads = on;
        self
    }

    pub fn build(self) -> Result<CompileOpts, CompileError> {
        if self.opt_level > 1 {
            return Err(CompileError::Unsupported(format!(
                "optimization level {}",
                self.opt_level
            )));
        }
        Ok(CompileOpts {
            opt_level: self.opt_level,
            dump: self.dump,
            optimize: self.optimize,
        })
    }
}

/// Everything the driver-side program object needs to upload and run the
/// shader, plus the final IR for diagnostics.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    pub words: Vec<u32>,
    pub relocs: Vec<Relocation>,
    pub header: [u32; HEADER_WORDS],
    /// Highest general-purpose register id used.
    pub max_gpr: i32,
    /// Per-thread scratch bytes for indirectly addressed temporaries.
    pub local_mem_size: u32,
    pub program: Program,
}

pub fn compile(src: &SourceShader, opts: &CompileOpts) -> Result<CompiledProgram, CompileError> {
    run(src, opts, None)
}

/// Like [`compile`], writing the IR dumps selected in `opts` to `sink`.
pub fn compile_with_dumps(
    src: &SourceShader,
    opts: &CompileOpts,
    sink: &mut dyn std::fmt::Write,
) -> Result<CompiledProgram, CompileError> {
    run(src, opts, Some(sink))
}

fn run(
    src: &SourceShader,
    opts: &CompileOpts,
    mut sink: Option<&mut dyn std::fmt::Write>,
) -> Result<CompiledProgram, CompileError> {
    let mut p = builder::build(src)?;
    dump_at(&p, opts, DumpPoint::Initial, &mut sink);

    if opts.opt_level > 0 {
        optimize(&mut p, &opts.optimize)?;
        dump_at(&p, opts, DumpPoint::PostOpt, &mut sink);
    }

    regalloc::allocate(&mut p)?;
    dump_at(&p, opts, DumpPoint::PostRa, &mut sink);

    let enc = emit::encode(&mut p, src)?;
    dump_at(&p, opts, DumpPoint::PostEmit, &mut sink);

    Ok(CompiledProgram {
        words: enc.words,
        relocs: enc.relocs,
        header: enc.header,
        max_gpr: enc.max_gpr,
        local_mem_size: p.local_mem_size,
        program: p,
    })
}

fn dump_at(
    p: &Program,
    opts: &CompileOpts,
    point: DumpPoint,
    sink: &mut Option<&mut dyn std::fmt::Write>,
) {
    let Some(w) = sink else { return };
    if !opts.dump.contains(&point) {
        return;
    }
    let config = IrOutputConfig {
        show_live: point == DumpPoint::PostRa,
        show_serial: matches!(point, DumpPoint::PostRa | DumpPoint::PostEmit),
    };
    // A failing sink only loses the dump, never the compile.
    let _ = writeln!(w, "=== {point:?} ===");
    let _ = w.write_str(&dump(p, config));
}
