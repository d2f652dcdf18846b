//! Operand fetch/store and per-opcode translation.
//!
//! Inputs are loaded through interpolation (fragment) or attribute fetch
//! (vertex), constants through c[] loads, immediates through a dedup cache.
//! Outputs are collected in tracked registers and exported in one batch at
//! program end, so partial writes and rewrites behave like registers.

use super::{Builder, RegClass, RegKey};
use crate::error::CompileError;
use crate::instruction::{
    CondCode, DType, InterpInfo, OpExt, Opcode, RoundMode, TexInfo, TexTarget,
};
use crate::source::{
    DeclClass, DstFile, InterpMode, Semantic, ShaderKind, SignMode, SourceInst, SourceOp, SrcFile,
};
use crate::value::{Ref, RegFile, ValueId};

/// Fragment position/w interpolant address.
pub const FRAG_POS_BASE: u32 = 0x070;
pub const FRAG_W_ADDR: u32 = 0x07c;
/// First generic varying slot.
pub const ATTR_BASE: u32 = 0x080;
/// Front-facing system interpolant.
pub const FACE_ADDR: u32 = 0x3fc;
/// Clip distance output slots.
pub const CLIP_BASE: u32 = 0x2c0;
/// Constant bank holding the user clip planes.
pub const CLIP_CBANK: u8 = 15;

impl<'a> Builder<'a> {
    // ------------------------------------------------------------------
    // IO layout
    // ------------------------------------------------------------------

    fn io_decl(&self, class: DeclClass, index: u32) -> Option<&crate::source::Decl> {
        self.src
            .decls
            .iter()
            .find(|d| d.class == class && d.first <= index && index <= d.last)
    }

    fn input_base(&self, index: u32) -> u32 {
        let semantic = self
            .io_decl(DeclClass::Input, index)
            .and_then(|d| d.semantic);
        match semantic {
            Some(Semantic::Position) => FRAG_POS_BASE,
            _ => ATTR_BASE + index * 16,
        }
    }

    fn output_base(&self, index: u32) -> u32 {
        let semantic = self
            .io_decl(DeclClass::Output, index)
            .and_then(|d| d.semantic);
        match semantic {
            Some(Semantic::Position) => FRAG_POS_BASE,
            _ => ATTR_BASE + index * 16,
        }
    }

    /// Result register of fragment output `index`, component `c`. Color
    /// outputs take four consecutive registers each, in declaration order;
    /// depth goes behind them.
    fn frag_result_reg(&self, index: u32, c: usize) -> u32 {
        let mut colors = 0;
        for d in &self.src.decls {
            if d.class != DeclClass::Output {
                continue;
            }
            if let Some(Semantic::Depth) = d.semantic {
                if d.first <= index && index <= d.last {
                    break;
                }
                continue;
            }
            if d.last < index {
                colors += d.last - d.first + 1;
            } else if d.first <= index {
                colors += index - d.first;
            }
        }
        if self
            .io_decl(DeclClass::Output, index)
            .and_then(|d| d.semantic)
            == Some(Semantic::Depth)
        {
            let all_colors: u32 = self
                .src
                .decls
                .iter()
                .filter(|d| {
                    d.class == DeclClass::Output && d.semantic != Some(Semantic::Depth)
                })
                .map(|d| d.last - d.first + 1)
                .sum();
            all_colors * 4
        } else {
            colors * 4 + c as u32
        }
    }

    fn mem_value(&mut self, file: RegFile, address: u32, size: u8) -> Result<ValueId, CompileError> {
        let v = self.p.new_value(file, size)?;
        self.p[v].address = address;
        Ok(v)
    }

    // ------------------------------------------------------------------
    // Interpolation and attribute fetch
    // ------------------------------------------------------------------

    fn interp(
        &mut self,
        address: u32,
        mode: InterpMode,
        centroid: bool,
    ) -> Result<ValueId, CompileError> {
        let src = self.mem_value(RegFile::MemV, address, 4)?;
        let (op, flat) = match mode {
            InterpMode::Flat => (Opcode::Linterp, true),
            InterpMode::Linear => (Opcode::Linterp, false),
            InterpMode::Perspective => (Opcode::Pinterp, false),
        };
        let d = self.insn_1(op, src)?;
        let i = self.p[d].def.unwrap();
        self.p[i].ext = OpExt::Interp(InterpInfo { centroid, flat });
        if op == Opcode::Pinterp {
            let w = self
                .frag_w_rcp
                .ok_or(CompileError::Internal("missing 1/w interpolant"))?;
            self.p.set_src(i, 1, Some(Ref::new(w)));
        }
        Ok(d)
    }

    /// Interpolate 1/w once at program start; every perspective input
    /// multiplies by it.
    pub(super) fn load_frag_w(&mut self) -> Result<(), CompileError> {
        let w = self.interp(FRAG_W_ADDR, InterpMode::Linear, false)?;
        let rcp = self.insn_1(Opcode::Rcp, w)?;
        self.frag_w_rcp = Some(rcp);
        Ok(())
    }

    /// The front-facing input as +-1.0: interpolate the face bit flat, move
    /// it into the sign position and flip the sign of -1.0 with it.
    fn load_face(&mut self) -> Result<ValueId, CompileError> {
        let face = self.interp(FACE_ADDR, InterpMode::Flat, false)?;
        let sh = self.imm_u32(31)?;
        let bit = self.insn_2(Opcode::Shl, face, sh)?;
        let neg_one = self.imm_f32(-1.0)?;
        self.insn_2(Opcode::Xor, bit, neg_one)
    }

    fn fetch_input(
        &mut self,
        index: u32,
        c: usize,
        ptr: Option<ValueId>,
    ) -> Result<ValueId, CompileError> {
        if ptr.is_none() {
            if let Some(v) = self
                .saved_inputs
                .get(index as usize)
                .and_then(|comps| comps[c])
            {
                return Ok(v);
            }
        }
        let decl = self.io_decl(DeclClass::Input, index);
        let (mode, centroid, semantic) = match decl {
            Some(d) => (d.interp, d.centroid, d.semantic),
            None => (InterpMode::Perspective, false, None),
        };

        let v = match self.src.kind {
            ShaderKind::Fragment => {
                if ptr.is_some() {
                    return Err(CompileError::Unsupported(
                        "indirect fragment input addressing".into(),
                    ));
                }
                if semantic == Some(Semantic::Face) {
                    self.load_face()?
                } else {
                    let mode = if semantic == Some(Semantic::Position) {
                        InterpMode::Linear
                    } else {
                        mode
                    };
                    self.interp(self.input_base(index) + c as u32 * 4, mode, centroid)?
                }
            }
            ShaderKind::Vertex | ShaderKind::Geometry => {
                let src = self.mem_value(RegFile::MemA, index * 16 + c as u32 * 4, 4)?;
                let d = self.insn_1(Opcode::Vfetch, src)?;
                if let Some(ptr) = ptr {
                    let i = self.p[d].def.unwrap();
                    self.src_pointer(i, 1, ptr);
                }
                d
            }
        };
        if ptr.is_none() {
            if let Some(comps) = self.saved_inputs.get_mut(index as usize) {
                comps[c] = Some(v);
            }
        }
        Ok(v)
    }

    // ------------------------------------------------------------------
    // Local-memory fallback for indirectly addressed temporaries
    // ------------------------------------------------------------------

    fn lmem_load(&mut self, address: u32, ptr: Option<ValueId>) -> Result<ValueId, CompileError> {
        let src = self.mem_value(RegFile::MemL, address, 4)?;
        let d = self.insn_1(Opcode::Ld, src)?;
        if let Some(ptr) = ptr {
            let i = self.p[d].def.unwrap();
            self.src_pointer(i, 1, ptr);
        }
        Ok(d)
    }

    fn lmem_store(
        &mut self,
        address: u32,
        ptr: Option<ValueId>,
        val: ValueId,
    ) -> Result<(), CompileError> {
        let dst = self.mem_value(RegFile::MemL, address, 4)?;
        let i = self.push_inst(Opcode::St)?;
        self.p.set_src(i, 0, Some(Ref::new(dst)));
        self.p.set_src(i, 1, Some(Ref::new(val)));
        if let Some(ptr) = ptr {
            self.src_pointer(i, 2, ptr);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Operand fetch/store
    // ------------------------------------------------------------------

    fn fetch_ptr(&mut self, addr_reg: Option<u32>) -> Result<Option<ValueId>, CompileError> {
        match addr_reg {
            None => Ok(None),
            Some(a) => {
                let key = RegKey::new(RegClass::Addr, a as usize, 0);
                match self.fetch_reg(key)? {
                    Some(v) => Ok(Some(v)),
                    None => Ok(Some(self.undef(RegFile::Gpr)?)),
                }
            }
        }
    }

    pub(super) fn fetch_src(
        &mut self,
        inst: &SourceInst,
        src: usize,
        comp: usize,
    ) -> Result<ValueId, CompileError> {
        let s = inst.srcs[src];
        let c = s.swizzle[comp].index();
        let ptr = self.fetch_ptr(s.indirect)?;

        let mut v = match s.file {
            SrcFile::Const(bank) => {
                let loc =
                    self.mem_value(RegFile::MemC(bank), s.index * 16 + c as u32 * 4, 4)?;
                let d = self.insn_1(Opcode::Ld, loc)?;
                if let Some(ptr) = ptr {
                    let i = self.p[d].def.unwrap();
                    self.src_pointer(i, 1, ptr);
                }
                d
            }
            SrcFile::Immediate => {
                let bits = self
                    .src
                    .immediates
                    .get(s.index as usize)
                    .ok_or(CompileError::Internal("immediate index out of range"))?
                    .0[c];
                self.load_imm_u32(bits)?
            }
            SrcFile::Input => self.fetch_input(s.index, c, ptr)?,
            SrcFile::Temp => {
                if self.require_stores {
                    self.lmem_load(s.index * 16 + c as u32 * 4, ptr)?
                } else {
                    let key = RegKey::new(RegClass::Temp, s.index as usize, c);
                    match self.fetch_reg(key)? {
                        Some(v) => v,
                        None => self.undef(RegFile::Gpr)?,
                    }
                }
            }
            SrcFile::Address => {
                let key = RegKey::new(RegClass::Addr, s.index as usize, c);
                match self.fetch_reg(key)? {
                    Some(v) => v,
                    None => self.undef(RegFile::Gpr)?,
                }
            }
            SrcFile::Predicate => {
                let key = RegKey::new(RegClass::Pred, s.index as usize, c);
                match self.fetch_reg(key)? {
                    Some(v) => v,
                    None => self.undef(RegFile::Pred)?,
                }
            }
            SrcFile::Sampler => {
                return Err(CompileError::Internal("sampler used as ALU operand"))
            }
        };

        match s.sign {
            SignMode::Keep => {}
            SignMode::Negate => v = self.insn_1(Opcode::Neg(DType::F32), v)?,
            SignMode::Abs => v = self.insn_1(Opcode::Abs(DType::F32), v)?,
            SignMode::NegAbs => {
                v = self.insn_1(Opcode::Abs(DType::F32), v)?;
                v = self.insn_1(Opcode::Neg(DType::F32), v)?;
            }
        }
        Ok(v)
    }

    /// A value that is the result of an instruction in the current block;
    /// immediates, the zero register and cross-block results get a Mov.
    fn ensure_local_reg(&mut self, v: ValueId) -> Result<ValueId, CompileError> {
        let needs_mov = self.p[v].is_const()
            || self.p[v].is_zero_reg()
            || match self.p[v].def {
                None => true,
                Some(i) => self.p[i].bb != Some(self.cur),
            };
        if needs_mov {
            self.insn_1(Opcode::Mov, v)
        } else {
            Ok(v)
        }
    }

    fn store_dst(
        &mut self,
        inst: &SourceInst,
        comp: usize,
        mut val: ValueId,
    ) -> Result<(), CompileError> {
        let dst = inst.dst.ok_or(CompileError::Internal("store without destination"))?;
        if inst.saturate {
            val = self.insn_1(Opcode::Sat, val)?;
        }
        let ptr = self.fetch_ptr(dst.indirect)?;

        match dst.file {
            DstFile::Output => {
                if let Some(ptr) = ptr {
                    // Indirectly addressed output; export immediately, the
                    // batch at program end only handles static slots.
                    let val = self.ensure_local_reg(val)?;
                    let loc = self.mem_value(
                        RegFile::MemV,
                        self.output_base(dst.index) + comp as u32 * 4,
                        4,
                    )?;
                    let i = self.push_inst(Opcode::Export)?;
                    self.p[i].fixed = true;
                    self.p.set_src(i, 0, Some(Ref::new(loc)));
                    self.p.set_src(i, 1, Some(Ref::new(val)));
                    self.src_pointer(i, 2, ptr);
                    return Ok(());
                }
                let val = self.ensure_local_reg(val)?;
                let key = RegKey::new(RegClass::Outp, dst.index as usize, comp);
                self.store_reg(key, val)?;
                self.outputs_written[dst.index as usize] |= 1 << comp;
                if self
                    .io_decl(DeclClass::Output, dst.index)
                    .and_then(|d| d.semantic)
                    == Some(Semantic::Position)
                {
                    self.hpos_index = Some(dst.index as usize);
                }
            }
            DstFile::Temp => {
                if self.require_stores {
                    self.lmem_store(dst.index * 16 + comp as u32 * 4, ptr, val)?;
                } else {
                    let val = self.ensure_local_reg(val)?;
                    let key = RegKey::new(RegClass::Temp, dst.index as usize, comp);
                    self.store_reg(key, val)?;
                }
            }
            DstFile::Address => {
                let val = self.ensure_local_reg(val)?;
                let key = RegKey::new(RegClass::Addr, dst.index as usize, comp);
                self.store_reg(key, val)?;
            }
            DstFile::Predicate => {
                let val = self.ensure_local_reg(val)?;
                let key = RegKey::new(RegClass::Pred, dst.index as usize, comp);
                self.store_reg(key, val)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Arithmetic helpers
    // ------------------------------------------------------------------

    fn dot(&mut self, inst: &SourceInst, n: usize) -> Result<ValueId, CompileError> {
        let a = self.fetch_src(inst, 0, 0)?;
        let b = self.fetch_src(inst, 1, 0)?;
        let mut acc = self.insn_2(Opcode::Mul(DType::F32), a, b)?;
        for c in 1..n {
            let a = self.fetch_src(inst, 0, c)?;
            let b = self.fetch_src(inst, 1, c)?;
            acc = self.insn_3(Opcode::Mad(DType::F32), a, b, acc)?;
        }
        Ok(acc)
    }

    fn pow(&mut self, x: ValueId, e: ValueId) -> Result<ValueId, CompileError> {
        let l = self.insn_1(Opcode::Lg2, x)?;
        let m = self.insn_2(Opcode::Mul(DType::F32), e, l)?;
        let p = self.insn_1(Opcode::PreEx2, m)?;
        self.insn_1(Opcode::Ex2, p)
    }

    fn set_f32(
        &mut self,
        cc: CondCode,
        a: ValueId,
        b: ValueId,
    ) -> Result<ValueId, CompileError> {
        let d = self.insn_2(Opcode::Set(DType::F32), a, b)?;
        let i = self.p[d].def.unwrap();
        self.p[i].set_cond = cc;
        Ok(d)
    }

    fn quad_delta(
        &mut self,
        src: ValueId,
        qop: u8,
        lane: u8,
    ) -> Result<ValueId, CompileError> {
        let d = self.insn_2(Opcode::Quadop, src, src)?;
        let i = self.p[d].def.unwrap();
        self.p[i].quadop = qop;
        self.p[i].lanes = lane;
        Ok(d)
    }

    // ------------------------------------------------------------------
    // Texturing
    // ------------------------------------------------------------------

    fn bind_group(&mut self, vals: &[ValueId]) -> Result<Vec<ValueId>, CompileError> {
        let i = self.push_inst(Opcode::Bind)?;
        let mut defs = Vec::with_capacity(vals.len());
        for (s, &v) in vals.iter().enumerate() {
            self.p.set_src(i, s, Some(Ref::new(v)));
            let d = self.p.new_value_like(v)?;
            self.p.add_def(i, d);
            defs.push(d);
        }
        Ok(defs)
    }

    fn tex(&mut self, inst: &SourceInst) -> Result<(), CompileError> {
        let (unit, target) = inst
            .tex
            .ok_or(CompileError::Internal("texture op without sampler info"))?;
        let op = match inst.op {
            SourceOp::Txb => Opcode::Txb,
            SourceOp::Txl => Opcode::Txl,
            _ => Opcode::Tex,
        };
        let dim = target.coords();

        let mut coords = Vec::with_capacity(4);
        for c in 0..dim {
            coords.push(self.fetch_src(inst, 0, c)?);
        }

        if matches!(target, TexTarget::Array1D | TexTarget::Array2D) {
            // The layer index travels as an integer.
            let last = coords.len() - 1;
            let layer = self.cvt(DType::U32, DType::F32, Some(RoundMode::Near), coords[last])?;
            coords[last] = layer;
        }

        if target == TexTarget::Cube {
            // Normalize to the major axis so the face projection is exact.
            let mut a = Vec::with_capacity(3);
            for &c in &coords {
                a.push(self.insn_1(Opcode::Abs(DType::F32), c)?);
            }
            let m = self.insn_2(Opcode::Max(DType::F32), a[0], a[1])?;
            let m = self.insn_2(Opcode::Max(DType::F32), m, a[2])?;
            let r = self.insn_1(Opcode::Rcp, m)?;
            for c in coords.iter_mut() {
                *c = self.insn_2(Opcode::Mul(DType::F32), *c, r)?;
            }
        }

        if inst.op == SourceOp::Txp && target != TexTarget::Cube {
            self.project_coords(inst, &mut coords)?;
        }

        let extra = match inst.op {
            SourceOp::Txb | SourceOp::Txl => Some(self.fetch_src(inst, 0, 3)?),
            _ => None,
        };

        let mut srcs = self.bind_group(&coords)?;
        if let Some(extra) = extra {
            srcs.extend(self.bind_group(&[extra])?);
        }

        let i = self.push_inst(op)?;
        for (s, &v) in srcs.iter().enumerate() {
            self.p.set_src(i, s, Some(Ref::new(v)));
        }
        let mut defs = [None; 4];
        for d in defs.iter_mut() {
            let v = self.p.new_value(RegFile::Gpr, 4)?;
            self.p.add_def(i, v);
            *d = Some(v);
        }
        self.p[i].ext = OpExt::Tex(TexInfo {
            unit,
            target,
            mask: 0xf,
        });

        let mask = inst.dst.map(|d| d.write_mask).unwrap_or(0xf);
        for c in 0..4 {
            if mask & (1 << c) != 0 {
                self.store_dst(inst, c, defs[c].unwrap())?;
            }
        }
        Ok(())
    }

    /// Divide projective coordinates by q. Coordinates that come straight
    /// out of a perspective interpolation get a clone with 1/q substituted
    /// for 1/w instead, saving the multiply.
    fn project_coords(
        &mut self,
        inst: &SourceInst,
        coords: &mut [ValueId],
    ) -> Result<(), CompileError> {
        let q = self.fetch_src(inst, 0, 3)?;
        let rq = self.insn_1(Opcode::Rcp, q)?;
        for c in coords.iter_mut() {
            let def = self.p[*c].def;
            let cloneable = match def {
                Some(i) => self.p[i].opcode == Opcode::Pinterp && self.p[i].bb == Some(self.cur),
                None => false,
            };
            if cloneable {
                let dup = self.clone_inst(def.unwrap())?;
                let di = self.p[dup].def.unwrap();
                self.p.set_src(di, 1, Some(Ref::new(rq)));
                *c = dup;
            } else {
                *c = self.insn_2(Opcode::Mul(DType::F32), *c, rq)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Program end: batched exports
    // ------------------------------------------------------------------

    fn fetch_output(&mut self, index: usize, c: usize) -> Result<ValueId, CompileError> {
        let key = RegKey::new(RegClass::Outp, index, c);
        match self.fetch_reg(key)? {
            Some(v) => Ok(v),
            None => self.undef(RegFile::Gpr),
        }
    }

    fn export_fp_outputs(&mut self) -> Result<(), CompileError> {
        for index in 0..super::MAX_OUTPS {
            let mask = self.outputs_written[index];
            if mask == 0 {
                continue;
            }
            for c in 0..4 {
                if mask & (1 << c) == 0 {
                    continue;
                }
                let reg = self.frag_result_reg(index as u32, c);
                if reg > RegFile::Gpr.last_reg() {
                    return Err(CompileError::OutOfResources {
                        what: "fragment result registers",
                        limit: RegFile::Gpr.last_reg() as usize + 1,
                    });
                }
                let v = self.fetch_output(index, c)?;
                let d = self.insn_1(Opcode::Mov, v)?;
                self.p[d].reg = Some(reg);
                self.p.max_reg.note(RegFile::Gpr, reg);
                let i = self.p[d].def.unwrap();
                self.p[i].fixed = true;
            }
        }
        Ok(())
    }

    fn export_group(
        &mut self,
        address: u32,
        vals: &[ValueId],
    ) -> Result<(), CompileError> {
        let (srcs, size) = if vals.len() > 1 {
            (self.bind_group(vals)?, vals.len() as u8 * 4)
        } else {
            (vals.to_vec(), 4)
        };
        let loc = self.mem_value(RegFile::MemV, address, size)?;
        let i = self.push_inst(Opcode::Export)?;
        self.p[i].fixed = true;
        self.p.set_src(i, 0, Some(Ref::new(loc)));
        for (s, &v) in srcs.iter().enumerate() {
            self.p.set_src(i, s + 1, Some(Ref::new(v)));
        }
        Ok(())
    }

    fn export_vp_outputs(&mut self) -> Result<(), CompileError> {
        for index in 0..super::MAX_OUTPS {
            let mask = self.outputs_written[index];
            if mask == 0 {
                continue;
            }
            let base = self.output_base(index as u32);
            let mut vals = [None; 4];
            for c in 0..4 {
                if mask & (1 << c) != 0 {
                    let v = self.fetch_output(index, c)?;
                    vals[c] = Some(self.ensure_local_reg(v)?);
                }
            }
            // Group runs of adjacent written components into one export.
            let mut c = 0;
            while c < 4 {
                if vals[c].is_none() {
                    c += 1;
                    continue;
                }
                let start = c;
                let mut group = Vec::new();
                while c < 4 && vals[c].is_some() {
                    group.push(vals[c].unwrap());
                    c += 1;
                }
                self.export_group(base + start as u32 * 4, &group)?;
            }
        }
        Ok(())
    }

    /// Append user-clip-plane distances: dot the written position against
    /// each enabled plane from the clip constant bank.
    fn append_vp_ucp(&mut self) -> Result<(), CompileError> {
        let Some(hpos) = self.hpos_index else {
            return Ok(());
        };
        let mut pos = [None; 4];
        for (c, p) in pos.iter_mut().enumerate() {
            *p = Some(self.fetch_output(hpos, c)?);
        }
        for plane in 0..8u32 {
            if self.src.clip_plane_mask & (1 << plane) == 0 {
                continue;
            }
            let mut acc = None;
            for c in 0..4u32 {
                let loc =
                    self.mem_value(RegFile::MemC(CLIP_CBANK), plane * 16 + c * 4, 4)?;
                let k = self.insn_1(Opcode::Ld, loc)?;
                let p = pos[c as usize].unwrap();
                acc = Some(match acc {
                    None => self.insn_2(Opcode::Mul(DType::F32), p, k)?,
                    Some(acc) => self.insn_3(Opcode::Mad(DType::F32), p, k, acc)?,
                });
            }
            let d = self.ensure_local_reg(acc.unwrap())?;
            self.export_group(CLIP_BASE + plane * 4, &[d])?;
        }
        Ok(())
    }

    pub(super) fn op_end(&mut self) -> Result<(), CompileError> {
        match self.src.kind {
            ShaderKind::Fragment => self.export_fp_outputs()?,
            ShaderKind::Vertex | ShaderKind::Geometry => {
                self.export_vp_outputs()?;
                if self.src.clip_plane_mask != 0 {
                    self.append_vp_ucp()?;
                }
            }
        }
        let i = self.push_inst(Opcode::Exit)?;
        self.p[i].fixed = true;
        self.p[i].terminator = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // ALU dispatch
    // ------------------------------------------------------------------

    fn kil(&mut self, inst: &SourceInst) -> Result<(), CompileError> {
        if inst.srcs.is_empty() {
            let i = self.push_inst(Opcode::Kil)?;
            self.p[i].fixed = true;
            return Ok(());
        }
        for c in 0..4 {
            let v = self.fetch_src(inst, 0, c)?;
            let p = self.setp(DType::F32, CondCode::Lt, v, self.zero)?;
            let i = self.push_inst(Opcode::Kil)?;
            self.p[i].fixed = true;
            self.src_predicate(i, 0, p, CondCode::Ne);
        }
        Ok(())
    }

    fn round_to(&mut self, inst: &SourceInst, mode: RoundMode) -> Result<(), CompileError> {
        let mask = inst.dst.map(|d| d.write_mask).unwrap_or(0xf);
        for c in 0..4 {
            if mask & (1 << c) == 0 {
                continue;
            }
            let v = self.fetch_src(inst, 0, c)?;
            let d = self.cvt(DType::F32, DType::F32, Some(mode), v)?;
            self.store_dst(inst, c, d)?;
        }
        Ok(())
    }

    fn per_comp_1(&mut self, inst: &SourceInst, op: Opcode) -> Result<(), CompileError> {
        let mask = inst.dst.map(|d| d.write_mask).unwrap_or(0xf);
        for c in 0..4 {
            if mask & (1 << c) == 0 {
                continue;
            }
            let a = self.fetch_src(inst, 0, c)?;
            let d = self.insn_1(op, a)?;
            self.store_dst(inst, c, d)?;
        }
        Ok(())
    }

    fn per_comp_2(&mut self, inst: &SourceInst, op: Opcode) -> Result<(), CompileError> {
        let mask = inst.dst.map(|d| d.write_mask).unwrap_or(0xf);
        for c in 0..4 {
            if mask & (1 << c) == 0 {
                continue;
            }
            let a = self.fetch_src(inst, 0, c)?;
            let b = self.fetch_src(inst, 1, c)?;
            let d = self.insn_2(op, a, b)?;
            self.store_dst(inst, c, d)?;
        }
        Ok(())
    }

    /// A value computed once and written to every masked component.
    fn broadcast(&mut self, inst: &SourceInst, val: ValueId) -> Result<(), CompileError> {
        let mask = inst.dst.map(|d| d.write_mask).unwrap_or(0xf);
        for c in 0..4 {
            if mask & (1 << c) != 0 {
                self.store_dst(inst, c, val)?;
            }
        }
        Ok(())
    }

    fn trig(&mut self, inst: &SourceInst, op: Opcode) -> Result<(), CompileError> {
        let mask = inst.dst.map(|d| d.write_mask).unwrap_or(0xf);
        if mask & 0x7 != 0 {
            let a = self.fetch_src(inst, 0, 0)?;
            let pre = self.insn_1(Opcode::PreSin, a)?;
            let d = self.insn_1(op, pre)?;
            for c in 0..3 {
                if mask & (1 << c) != 0 {
                    self.store_dst(inst, c, d)?;
                }
            }
        }
        if mask & 0x8 != 0 {
            let a = self.fetch_src(inst, 0, 3)?;
            let pre = self.insn_1(Opcode::PreSin, a)?;
            let d = self.insn_1(op, pre)?;
            self.store_dst(inst, 3, d)?;
        }
        Ok(())
    }

    pub(super) fn alu_instruction(&mut self, inst: &SourceInst) -> Result<(), CompileError> {
        let mask = inst.dst.map(|d| d.write_mask).unwrap_or(0xf);
        match inst.op {
            SourceOp::Mov => {
                for c in 0..4 {
                    if mask & (1 << c) == 0 {
                        continue;
                    }
                    let v = self.fetch_src(inst, 0, c)?;
                    self.store_dst(inst, c, v)?;
                }
            }
            SourceOp::Add => self.per_comp_2(inst, Opcode::Add(DType::F32))?,
            SourceOp::Sub => self.per_comp_2(inst, Opcode::Sub(DType::F32))?,
            SourceOp::Mul => self.per_comp_2(inst, Opcode::Mul(DType::F32))?,
            SourceOp::Min => self.per_comp_2(inst, Opcode::Min(DType::F32))?,
            SourceOp::Max => self.per_comp_2(inst, Opcode::Max(DType::F32))?,
            SourceOp::UAdd => self.per_comp_2(inst, Opcode::Add(DType::U32))?,
            SourceOp::UMul => self.per_comp_2(inst, Opcode::Mul(DType::U32))?,
            SourceOp::And => self.per_comp_2(inst, Opcode::And)?,
            SourceOp::Or => self.per_comp_2(inst, Opcode::Or)?,
            SourceOp::Xor => self.per_comp_2(inst, Opcode::Xor)?,
            SourceOp::Shl => self.per_comp_2(inst, Opcode::Shl)?,
            SourceOp::IShr => self.per_comp_2(inst, Opcode::Shr(DType::S32))?,
            SourceOp::UShr => self.per_comp_2(inst, Opcode::Shr(DType::U32))?,
            SourceOp::Not => self.per_comp_1(inst, Opcode::Not)?,
            SourceOp::Abs => self.per_comp_1(inst, Opcode::Abs(DType::F32))?,
            SourceOp::Mad => {
                for c in 0..4 {
                    if mask & (1 << c) == 0 {
                        continue;
                    }
                    let a = self.fetch_src(inst, 0, c)?;
                    let b = self.fetch_src(inst, 1, c)?;
                    let x = self.fetch_src(inst, 2, c)?;
                    let d = self.insn_3(Opcode::Mad(DType::F32), a, b, x)?;
                    self.store_dst(inst, c, d)?;
                }
            }
            SourceOp::Flr => self.round_to(inst, RoundMode::NegInf)?,
            SourceOp::Trunc => self.round_to(inst, RoundMode::Zero)?,
            SourceOp::Ceil => self.round_to(inst, RoundMode::PosInf)?,
            SourceOp::Frc => {
                for c in 0..4 {
                    if mask & (1 << c) == 0 {
                        continue;
                    }
                    let v = self.fetch_src(inst, 0, c)?;
                    let f = self.cvt(DType::F32, DType::F32, Some(RoundMode::NegInf), v)?;
                    let d = self.insn_2(Opcode::Sub(DType::F32), v, f)?;
                    self.store_dst(inst, c, d)?;
                }
            }
            SourceOp::Dp3 => {
                let d = self.dot(inst, 3)?;
                self.broadcast(inst, d)?;
            }
            SourceOp::Dp4 => {
                let d = self.dot(inst, 4)?;
                self.broadcast(inst, d)?;
            }
            SourceOp::Rcp => {
                let a = self.fetch_src(inst, 0, 0)?;
                let d = self.insn_1(Opcode::Rcp, a)?;
                self.broadcast(inst, d)?;
            }
            SourceOp::Rsq => {
                let a = self.fetch_src(inst, 0, 0)?;
                let abs = self.insn_1(Opcode::Abs(DType::F32), a)?;
                let d = self.insn_1(Opcode::Rsq, abs)?;
                self.broadcast(inst, d)?;
            }
            SourceOp::Lg2 => {
                let a = self.fetch_src(inst, 0, 0)?;
                let d = self.insn_1(Opcode::Lg2, a)?;
                self.broadcast(inst, d)?;
            }
            SourceOp::Ex2 => {
                let a = self.fetch_src(inst, 0, 0)?;
                let p = self.insn_1(Opcode::PreEx2, a)?;
                let d = self.insn_1(Opcode::Ex2, p)?;
                self.broadcast(inst, d)?;
            }
            SourceOp::Pow => {
                let x = self.fetch_src(inst, 0, 0)?;
                let e = self.fetch_src(inst, 1, 0)?;
                let d = self.pow(x, e)?;
                self.broadcast(inst, d)?;
            }
            SourceOp::Sin => self.trig(inst, Opcode::Sin)?,
            SourceOp::Cos => self.trig(inst, Opcode::Cos)?,
            SourceOp::Lrp => {
                for c in 0..4 {
                    if mask & (1 << c) == 0 {
                        continue;
                    }
                    let a = self.fetch_src(inst, 0, c)?;
                    let b = self.fetch_src(inst, 1, c)?;
                    let x = self.fetch_src(inst, 2, c)?;
                    let sub = self.insn_2(Opcode::Sub(DType::F32), b, x)?;
                    let d = self.insn_3(Opcode::Mad(DType::F32), sub, a, x)?;
                    self.store_dst(inst, c, d)?;
                }
            }
            SourceOp::Cmp => {
                for c in 0..4 {
                    if mask & (1 << c) == 0 {
                        continue;
                    }
                    let s0 = self.fetch_src(inst, 0, c)?;
                    let s1 = self.fetch_src(inst, 1, c)?;
                    let s2 = self.fetch_src(inst, 2, c)?;
                    let d = self.insn_3(Opcode::Slct(DType::F32), s1, s2, s0)?;
                    let i = self.p[d].def.unwrap();
                    self.p[i].set_cond = CondCode::Lt;
                    self.store_dst(inst, c, d)?;
                }
            }
            SourceOp::Seq
            | SourceOp::Sge
            | SourceOp::Sgt
            | SourceOp::Sle
            | SourceOp::Slt
            | SourceOp::Sne => {
                let cc = match inst.op {
                    SourceOp::Seq => CondCode::Eq,
                    SourceOp::Sge => CondCode::Ge,
                    SourceOp::Sgt => CondCode::Gt,
                    SourceOp::Sle => CondCode::Le,
                    SourceOp::Slt => CondCode::Lt,
                    _ => CondCode::Ne,
                };
                for c in 0..4 {
                    if mask & (1 << c) == 0 {
                        continue;
                    }
                    let a = self.fetch_src(inst, 0, c)?;
                    let b = self.fetch_src(inst, 1, c)?;
                    let d = self.set_f32(cc, a, b)?;
                    self.store_dst(inst, c, d)?;
                }
            }
            SourceOp::Ddx => {
                for c in 0..4 {
                    if mask & (1 << c) == 0 {
                        continue;
                    }
                    let a = self.fetch_src(inst, 0, c)?;
                    let d = self.quad_delta(a, 0x66, 1)?;
                    self.store_dst(inst, c, d)?;
                }
            }
            SourceOp::Ddy => {
                for c in 0..4 {
                    if mask & (1 << c) == 0 {
                        continue;
                    }
                    let a = self.fetch_src(inst, 0, c)?;
                    let d = self.quad_delta(a, 0x5a, 2)?;
                    self.store_dst(inst, c, d)?;
                }
            }
            SourceOp::Tex | SourceOp::Txb | SourceOp::Txl | SourceOp::Txp => self.tex(inst)?,
            SourceOp::Kil => self.kil(inst)?,
            op => {
                return Err(CompileError::Unsupported(format!(
                    "source opcode {op:?}"
                )))
            }
        }
        Ok(())
    }
}
