use crate::value::RegFile;

/// Everything that can make a compile fail. There is no partial success: any
/// of these aborts the whole translation and nothing of the program is
/// returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// An opcode, addressing mode or texture target the backend does not
    /// implement. Detected during translation, before any pass runs.
    Unsupported(String),
    /// An arena or bounded stack hit its capacity. The input has to shrink,
    /// retrying with the same shader cannot succeed.
    OutOfResources { what: &'static str, limit: usize },
    /// Linear scan or constrained allocation could not find a free register.
    /// There is no spilling fallback for this target.
    RegisterAllocation { file: RegFile },
    /// A constraint that must hold by construction did not. Indicates a bug
    /// in the compiler rather than in the input.
    Internal(&'static str),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::Unsupported(what) => {
                write!(f, "unsupported input: {what}")
            }
            CompileError::OutOfResources { what, limit } => {
                write!(f, "out of resources: more than {limit} {what}")
            }
            CompileError::RegisterAllocation { file } => {
                write!(f, "cannot allocate a {file} register")
            }
            CompileError::Internal(what) => {
                write!(f, "internal error: {what}")
            }
        }
    }
}

impl std::error::Error for CompileError {}
