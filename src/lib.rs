//! Drive LLVM's JIT through a small lazily resolving compilation stack.
//!
//! A [`JitStack`] owns an execution engine bound to a [`JitTarget`]. Modules
//! are added either eagerly or lazily, and indirect stubs can be created whose
//! call target is compiled and bound on first call. Resolved addresses are
//! called through the typed [`NativeFunction`] bridge.

mod invoke;
mod ir;
mod orc;
mod target;
mod types;

pub use invoke::NativeFunction;
pub use ir::{verify, CallerModule, FactorialModule, ModuleBuilder};
pub use orc::{
    no_external_symbols, CallbackHandle, CompilationMode, JitSession, JitStack, LazyCompileFn,
    ModuleHandle, SymbolScope,
};
pub use target::{
    initialize_once, require_jit, JitTarget, MangledSymbol, Mangler, TargetConfig,
    TargetDescriptor,
};
pub use types::{CallConv, Signature, Value, ValueType};

/// Kind of error that might be encountered while building, compiling,
/// resolving, or invoking JIT code.
#[derive(Clone, Copy, PartialEq, Eq, Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("malformed module")]
    Construction,
    #[error("target initialization failed")]
    TargetInit,
    #[error("no backend for target triple")]
    TripleUnresolvable,
    #[error("jit unsupported on this target")]
    JitUnsupported,
    #[error("failed to create target machine")]
    TargetMachine,
    #[error("orc error")]
    Orc,
    #[error("symbol not found")]
    SymbolNotFound,
    #[error("module handle invalidated")]
    HandleInvalidated,
    #[error("duplicate symbol")]
    DuplicateSymbol,
    #[error("stub already bound")]
    StubAlreadyBound,
    #[error("jit stack disposed")]
    Disposed,
    #[error("null function address")]
    NullAddress,
    #[error("signature mismatch")]
    SignatureMismatch,
    #[error("unsupported signature")]
    UnsupportedSignature,
}

/// Error returned by every fallible operation of this crate. Diagnostics
/// produced by LLVM are copied into `str`.
#[derive(Clone, PartialEq, Eq, Debug, thiserror::Error)]
#[error("{kind}: {str}")]
pub struct Error {
    pub kind: ErrorKind,
    pub str: String,
}

impl Error {
    pub fn new<S: ToString>(kind: ErrorKind, str: S) -> Self {
        Error {
            kind,
            str: str.to_string(),
        }
    }

    /// Returns true for the expected lookup miss of a symbol that is not (yet)
    /// defined, as opposed to a failure inside the toolchain.
    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::SymbolNotFound
    }
}

impl From<inkwell::builder::BuilderError> for Error {
    fn from(error: inkwell::builder::BuilderError) -> Self {
        Error::new(ErrorKind::Construction, error)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
