//! The fixed header block prepended (by the driver) to every program.

use crate::program::Program;
use crate::source::{DeclClass, InterpMode, SourceShader};

pub const HEADER_WORDS: usize = 20;

/// Set when the program writes the depth output itself.
pub const FLAG_WRITES_DEPTH: u32 = 1 << 0;
/// Set when depth can be tested before the program runs.
pub const FLAG_EARLY_Z: u32 = 1 << 1;

/// Word layout:
///   0       enabled input mask
///   1       enabled output mask
///   2..=3   interpolation mode, 2 bits per input (0 unused, 1 flat,
///           2 linear, 3 perspective)
///   4       centroid sampling mask
///   5       flag word
///   6       user clip plane mask
///   7       local memory bytes per thread
///   8       highest general register id used, plus one
///   9..=19  reserved
pub(super) fn build(p: &Program, src: &SourceShader, early_z: bool) -> [u32; HEADER_WORDS] {
    let mut h = [0u32; HEADER_WORDS];

    for d in &src.decls {
        for i in d.first..=d.last {
            let i = i & 31;
            match d.class {
                DeclClass::Input => {
                    h[0] |= 1 << i;
                    let mode = match d.interp {
                        InterpMode::Flat => 1,
                        InterpMode::Linear => 2,
                        InterpMode::Perspective => 3,
                    };
                    h[2 + (i / 16) as usize] |= mode << ((i % 16) * 2);
                    if d.centroid {
                        h[4] |= 1 << i;
                    }
                }
                DeclClass::Output => h[1] |= 1 << i,
                _ => {}
            }
        }
    }

    if src.writes_depth {
        h[5] |= FLAG_WRITES_DEPTH;
    }
    if early_z {
        h[5] |= FLAG_EARLY_Z;
    }
    h[6] = src.clip_plane_mask as u32;
    h[7] = p.local_mem_size;
    h[8] = (p.max_reg.gpr + 1) as u32;
    h
}
