#[cfg(test)]
mod test;

use crate::cfg::BlockId;
use crate::instruction::{InstId, OpExt, Opcode};
use crate::program::Program;
use crate::value::{Modifier, Ref, ValueId};
use std::collections::HashSet;
use std::fmt::Result;

#[derive(Debug, Clone, Default)]
pub struct IrOutputConfig {
    /// If `true`, live intervals are printed next to each definition.
    pub show_live: bool,
    /// If `true`, instruction serial numbers are printed in front of each
    /// instruction (only meaningful after allocation ordered the program).
    pub show_serial: bool,
}

/// Renders a [`Program`] as readable text for dumps and test diagnostics.
///
/// A mutable reference to the writer, an implementor of [`std::fmt::Write`],
/// must be passed to [`new`]; configuration goes through [`with_config`].
/// Values print as `$r2` once a register is assigned and as `%14` (the arena
/// index) before that; memory operands print as `c0[0x10]`, `a[0x80]` and
/// the like.
pub struct IrOutputter<'w, W: std::fmt::Write> {
    writer: &'w mut W,
    config: IrOutputConfig,
}

impl<'w, W: std::fmt::Write> IrOutputter<'w, W> {
    pub fn new(writer: &'w mut W) -> Self {
        Self {
            writer,
            config: Default::default(),
        }
    }

    pub fn with_config(self, config: IrOutputConfig) -> Self {
        Self { config, ..self }
    }

    pub fn write_program(&mut self, p: &Program) -> Result {
        for (n, &root) in p.roots.iter().enumerate() {
            if n > 0 {
                self.writer.write_char('\n')?;
            }
            writeln!(self.writer, "# root {n} ({:?})", p.kind)?;
            self.write_graph(p, root)?;
        }
        Ok(())
    }

    /// Preorder over forward edges; back edges are listed but not followed.
    fn write_graph(&mut self, p: &Program, root: BlockId) -> Result {
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        seen.insert(root);
        while let Some(b) = stack.pop() {
            self.write_block(p, b)?;
            for &(s, _) in p[b].out.iter().rev() {
                if seen.insert(s) {
                    stack.push(s);
                }
            }
        }
        Ok(())
    }

    pub fn write_block(&mut self, p: &Program, b: BlockId) -> Result {
        write!(self.writer, "BB:{}", b.index())?;
        if !p[b].ins.is_empty() {
            self.writer.write_str(" <-")?;
            for &(s, k) in p[b].ins.iter() {
                write!(self.writer, " BB:{}[{:?}]", s.index(), k)?;
            }
        }
        if !p[b].out.is_empty() {
            self.writer.write_str(" ->")?;
            for &(s, k) in p[b].out.iter() {
                write!(self.writer, " BB:{}[{:?}]", s.index(), k)?;
            }
        }
        self.writer.write_char('\n')?;

        for i in p.block_insns(b) {
            self.write_instruction(p, i)?;
        }
        Ok(())
    }

    pub fn write_instruction(&mut self, p: &Program, i: InstId) -> Result {
        let inst = &p[i];
        self.writer.write_str("   ")?;
        if self.config.show_serial && inst.serial >= 0 {
            write!(self.writer, "{:4}: ", inst.serial)?;
        }
        if let Some(s) = inst.predicate {
            if let Some(r) = inst.src(s) {
                self.writer.write_char('[')?;
                self.write_value(p, r.value)?;
                write!(self.writer, " {}] ", inst.cc)?;
            }
        }

        write!(self.writer, "{}", inst.opcode)?;
        if let Opcode::Set(_) | Opcode::Slct(_) = inst.opcode {
            write!(self.writer, ".{}", inst.set_cond)?;
        }
        if inst.saturate {
            self.writer.write_str(".sat")?;
        }
        if let OpExt::Tex(t) = inst.ext {
            write!(self.writer, ".t{}.mask{:x}", t.unit, t.mask)?;
        }

        let mut sep = ' ';
        for &d in inst.defs.iter() {
            self.writer.write_char(sep)?;
            sep = ',';
            self.write_value(p, d)?;
            if self.config.show_live && !p[d].livei.is_empty() {
                self.write_live(p, d)?;
            }
        }
        for (s, r) in inst.src_iter() {
            if Some(s) == inst.predicate {
                continue;
            }
            self.writer.write_char(sep)?;
            sep = ',';
            self.write_ref(p, r)?;
        }
        if let Some(t) = inst.target {
            write!(self.writer, " -> BB:{}", t.index())?;
        }
        if inst.is_join {
            self.writer.write_str(" (join)")?;
        }
        self.writer.write_char('\n')
    }

    fn write_ref(&mut self, p: &Program, r: &Ref) -> Result {
        if r.modifier.has(Modifier::NEG) {
            self.writer.write_char('-')?;
        }
        if r.modifier.has(Modifier::NOT) {
            self.writer.write_char('!')?;
        }
        if r.modifier.has(Modifier::ABS) {
            self.writer.write_char('|')?;
        }
        self.write_value(p, r.value)?;
        if r.modifier.has(Modifier::ABS) {
            self.writer.write_char('|')?;
        }
        Ok(())
    }

    fn write_value(&mut self, p: &Program, v: ValueId) -> Result {
        let val = &p[v];
        if let Some(imm) = val.imm {
            return write!(self.writer, "imm({})", imm.as_f32());
        }
        if val.file.is_memory() {
            return write!(self.writer, "{}[{:#x}]", val.file, val.address);
        }
        match val.reg {
            Some(id) => write!(self.writer, "{}{}", val.file, id),
            None => write!(self.writer, "%{}", v.index()),
        }
    }

    fn write_live(&mut self, p: &Program, v: ValueId) -> Result {
        self.writer.write_char('{')?;
        for (n, r) in p[v].livei.iter().enumerate() {
            if n > 0 {
                self.writer.write_char(' ')?;
            }
            write!(self.writer, "[{},{})", r.bgn, r.end)?;
        }
        self.writer.write_char('}')
    }
}

/// One-call dump used by the compile driver and by tests.
pub fn dump(p: &Program, config: IrOutputConfig) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = IrOutputter::new(&mut out).with_config(config).write_program(p);
    out
}
