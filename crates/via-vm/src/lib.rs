//! Value model, closures, call stack, and the dispatch loop for via (§3, §4.5,
//! §9). Where `via-compiler` turns source into an instruction stream,
//! `via-vm` turns that stream plus a constant pool into a running process:
//! loading (building the label table), the runtime value representation,
//! and the register-machine interpreter itself.

mod closure;
mod error;
mod frame;
mod program;
mod value;
mod vm;

pub use closure::{Callable, Closure, Function, NativeFn, NativeFunc, UpValue, UpValueState};
pub use error::RuntimeError;
pub use frame::{CallFrame, CallStack};
pub use program::Program;
pub use value::{VArray, VDict, VString, Value};
pub use vm::Vm;
