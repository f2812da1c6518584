//! VM runtime errors. A hand-rolled enum with a manual `Display` impl —
//! core crates stay `thiserror`-free; only the host-facing `via`/`via-cli`
//! crates reach for it, to aggregate across pipeline stages.

use std::fmt;

use crate::value::Value;

/// A runtime error raised during dispatch. `Unhandled` is only ever
/// produced by [`crate::vm::Vm::run`] itself, once unwinding reaches the
/// base frame — every other variant is an in-flight error the dispatch
/// loop's unwind step may still catch at a protected frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeError {
    InvalidOpcode(u16),
    PcOutOfBounds,
    ConstantOutOfBounds(u16),
    RegisterOutOfBounds(u16),
    LocalOutOfBounds(u16),
    NotCallable { type_name: &'static str },
    ArityMismatch { expected: u16, got: usize },
    DivisionByZero,
    ModuloByZero,
    TypeMismatch { expected: &'static str, got: &'static str, op: &'static str },
    IndexOutOfRange { index: i64 },
    CastFailed { value: String, target: &'static str },
    StackOverflow,
    LocalsOverflow,
    /// The `error` intrinsic's in-flight payload: a catchable error
    /// carrying the value's display string. Distinct from
    /// [`Self::Unhandled`], which is only the final, terminal packaging
    /// `run` produces once unwinding finds no protected frame.
    Raised(String),
    /// A user-raised error (the `error` intrinsic) not caught by any
    /// protected frame.
    Unhandled { message: String, traceback: Vec<String> },
}

impl RuntimeError {
    /// The message a protected call (`try`/`PCALL`) packages into its
    /// return register as a string.
    #[must_use]
    pub fn as_value(&self) -> Value {
        Value::string(self.to_string())
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidOpcode(op) => write!(f, "invalid opcode {op}"),
            Self::PcOutOfBounds => write!(f, "program counter out of bounds"),
            Self::ConstantOutOfBounds(idx) => write!(f, "constant pool index {idx} out of bounds"),
            Self::RegisterOutOfBounds(idx) => write!(f, "register {idx} out of bounds"),
            Self::LocalOutOfBounds(slot) => write!(f, "local slot {slot} out of bounds"),
            Self::NotCallable { type_name } => write!(f, "attempt to call a value of type '{type_name}'"),
            Self::ArityMismatch { expected, got } => write!(f, "expected {expected} argument(s), got {got}"),
            Self::DivisionByZero => write!(f, "division by zero"),
            Self::ModuloByZero => write!(f, "modulo by zero"),
            Self::TypeMismatch { expected, got, op } => {
                write!(f, "'{op}' expected a value of type '{expected}', got '{got}'")
            }
            Self::IndexOutOfRange { index } => write!(f, "index {index} out of range"),
            Self::CastFailed { value, target } => write!(f, "cannot cast '{value}' to '{target}'"),
            Self::StackOverflow => write!(f, "stack overflow"),
            Self::LocalsOverflow => write!(f, "too many locals in call frame"),
            Self::Raised(message) => write!(f, "{message}"),
            Self::Unhandled { message, .. } => write!(f, "{message}"),
        }
    }
}
