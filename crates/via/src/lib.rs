//! Glues the pipeline together (§6.1): source text in, either a running
//! program's exit code or an aggregated error out. Each stage
//! (`via-syntax`'s lexer/parser, `via-compiler`'s codegen, `via-vm`'s
//! dispatch loop) already reports failures its own way — diagnostics
//! accumulating in a [`DiagnosticBus`], or a [`RuntimeError`] — this crate
//! is the one seam that needs to present both uniformly to a caller, so
//! it's the only place in the workspace that reaches for `thiserror`.

use std::io::Write;

use tracing::{debug, info};
use via_core::{Arena, Diagnostic, DiagnosticBus};
use via_vm::{Program, RuntimeError, Vm};

pub use via_core::Level as DiagnosticLevel;

/// Knobs for a single compilation (§6.1).
#[derive(Clone, Copy, Debug)]
pub struct CompileOptions {
    /// `0` disables constant folding/dead-store elision; `1` (the default)
    /// enables the passes `via-compiler::codegen` gates on `opt_level >= 1`.
    pub opt_level: u8,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self { opt_level: 1 }
    }
}

/// Everything that can end a run early, surfaced uniformly to `via-cli`.
#[derive(Debug, thiserror::Error)]
pub enum ViaError {
    #[error("{0}")]
    Compilation(String),
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

impl ViaError {
    fn from_diagnostics(diagnostics: &DiagnosticBus) -> Self {
        let rendered = diagnostics.sorted().iter().map(Diagnostic::to_string).collect::<Vec<_>>().join("\n");
        Self::Compilation(rendered)
    }
}

/// Lexes, parses, and compiles `source`, returning the disassembly text
/// `via-cli`'s `disassemble` subcommand prints. Self-contained: the arena
/// backing the constant pool's interned strings never escapes this
/// function, so the returned `String` owns everything it needs.
pub fn disassemble(source: &str, options: CompileOptions) -> Result<String, ViaError> {
    let arena = Arena::new();
    let mut diagnostics = DiagnosticBus::new();
    let tokens = via_syntax::lex(source);
    debug!(token_count = tokens.len(), "lexed source");
    let statements = via_syntax::parse(&arena, &tokens, &mut diagnostics);
    debug!(statement_count = statements.len(), "parsed source");
    let unit = via_compiler::compile(&arena, statements, options.opt_level, &mut diagnostics);
    if diagnostics.has_errors() {
        return Err(ViaError::from_diagnostics(&diagnostics));
    }
    Ok(via_compiler::disassemble(&unit))
}

/// Compiles and runs `source` to completion, writing `print`'s output to
/// `output` and returning the process exit code (§6.1: `run(path) ->
/// Result<i32, Vec<Diagnostic>>` generalized to accept source text directly
/// and fold the VM's own error reporting into one `Result`).
pub fn run(source: &str, output: Box<dyn Write>, options: CompileOptions) -> Result<i32, ViaError> {
    let arena = Arena::new();
    let mut diagnostics = DiagnosticBus::new();
    let tokens = via_syntax::lex(source);
    let statements = via_syntax::parse(&arena, &tokens, &mut diagnostics);
    let unit = via_compiler::compile(&arena, statements, options.opt_level, &mut diagnostics);
    if diagnostics.has_errors() {
        info!(error_count = diagnostics.error_count(), "compilation failed");
        return Err(ViaError::from_diagnostics(&diagnostics));
    }

    let program = Program::load(unit.instructions, unit.constants);
    let mut vm = Vm::new(output);
    let code = vm.run(&program)?;
    info!(exit_code = code, "program finished");
    Ok(code)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io;
    use std::rc::Rc;

    use super::*;

    /// Lets a test read back what `PRINT` wrote after `run` has already
    /// taken ownership of its `Box<dyn Write>`.
    struct SharedSink(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn run_to_string(source: &str) -> (String, i32) {
        let buffer = Rc::new(RefCell::new(Vec::new()));
        let code = run(source, Box::new(SharedSink(Rc::clone(&buffer))), CompileOptions::default()).expect("program runs");
        let stdout = String::from_utf8(buffer.borrow().clone()).unwrap();
        (stdout, code)
    }

    #[test]
    fn prints_constant_folded_arithmetic() {
        let (stdout, code) = run_to_string("print 1 + 2 * 3");
        assert_eq!(stdout, "7\n");
        assert_eq!(code, 0);
    }

    #[test]
    fn while_loop_counts_down_to_zero() {
        let (stdout, code) = run_to_string("local x = 10 while x > 0 { x = x - 1 } print x");
        assert_eq!(stdout, "0\n");
        assert_eq!(code, 0);
    }

    #[test]
    fn recursive_fibonacci() {
        let source = "fn f(n: int) -> int { if n < 2 : return n return f(n-1)+f(n-2) } print f(10)";
        let (stdout, code) = run_to_string(source);
        assert_eq!(stdout, "55\n");
        assert_eq!(code, 0);
    }

    #[test]
    fn array_auto_grows_on_out_of_range_assignment() {
        let (stdout, code) = run_to_string("local a = [1,2,3] a[5] = 9 print #a");
        assert_eq!(stdout, "6\n");
        assert_eq!(code, 0);
    }

    #[test]
    fn closures_share_a_counter_across_calls() {
        let source = "fn mk() -> fn()->int { local c = 0 return fn() -> int { c = c + 1 return c } } local g = mk() print g() print g()";
        let (stdout, code) = run_to_string(source);
        assert_eq!(stdout, "1\n2\n");
        assert_eq!(code, 0);
    }

    #[test]
    fn division_by_zero_aborts_with_a_traceback() {
        let err = run("print 1/0", Box::new(Vec::new()), CompileOptions::default()).unwrap_err();
        let message = err.to_string();
        assert!(message.to_lowercase().contains("division by zero"), "{message}");
    }

    #[test]
    fn unknown_names_are_reported_as_compilation_errors() {
        let err = run("print undeclared_name", Box::new(Vec::new()), CompileOptions::default()).unwrap_err();
        assert!(matches!(err, ViaError::Compilation(_)));
    }
}
