//! Shared scaffolding for the via toolchain: source spans, the diagnostic
//! bus, the AST arena, and the fixed capacities that the compiler and VM
//! agree on.

mod arena;
mod diagnostic;
pub mod limits;
mod span;

pub use arena::Arena;
pub use diagnostic::{Diagnostic, DiagnosticBus, Level};
pub use span::Span;
