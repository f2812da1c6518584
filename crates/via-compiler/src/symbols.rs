//! Symbol resolution (§4.3): the function stack, local-variable slots,
//! upvalue capture bookkeeping, the global table, the defer stack, and
//! break/continue label pairs that the codegen visitor carries as it walks
//! the tree.

use crate::types::Ty;
use via_syntax::Node;

/// Where a name resolved to, in the order §4.3.1 specifies: local →
/// argument → global. Parameters are materialized as the first `argc`
/// local slots at function entry (a simplification documented in
/// DESIGN.md), so this design does not need a separate `Argument`
/// resolution — `GETARG`/`GETLOCAL` address the same slot space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Local(u16),
    Upvalue(u16),
    Global,
}

struct LocalVar<'a> {
    name: &'a str,
    is_const: bool,
    slot: u16,
    depth: u32,
    ty: Ty<'a>,
}

struct UpvalueSlot<'a> {
    name: &'a str,
    is_local: bool,
    index: u16,
}

struct FunctionScope<'a> {
    locals: Vec<LocalVar<'a>>,
    upvalues: Vec<UpvalueSlot<'a>>,
    next_slot: u16,
    scope_depth: u32,
    param_count: u16,
}

impl<'a> FunctionScope<'a> {
    fn new() -> Self {
        Self { locals: Vec::new(), upvalues: Vec::new(), next_slot: 0, scope_depth: 0, param_count: 0 }
    }
}

struct GlobalDecl<'a> {
    name: &'a str,
    is_const: bool,
    ty: Ty<'a>,
}

/// A loop's `break`/`continue` label pair (§4.3.2).
#[derive(Clone, Copy, Debug)]
pub struct LoopLabels {
    pub break_label: u16,
    pub continue_label: u16,
}

pub struct SymbolTable<'a> {
    functions: Vec<FunctionScope<'a>>,
    globals: Vec<GlobalDecl<'a>>,
    defer_stack: Vec<Vec<&'a Node<'a>>>,
    loop_stack: Vec<LoopLabels>,
    next_label: u16,
}

impl<'a> SymbolTable<'a> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            functions: vec![FunctionScope::new()],
            globals: Vec::new(),
            defer_stack: Vec::new(),
            loop_stack: Vec::new(),
            next_label: 0,
        }
    }

    #[must_use]
    pub fn fresh_label(&mut self) -> u16 {
        let label = self.next_label;
        self.next_label += 1;
        label
    }

    // -- Function stack -----------------------------------------------------

    pub fn push_function(&mut self) {
        self.functions.push(FunctionScope::new());
    }

    /// Pops the current function scope, returning its upvalue capture list
    /// in declaration order, consumed by the emitter's `CAPTURE`
    /// sub-instructions (§4.3.1).
    pub fn pop_function(&mut self) -> Vec<(bool, u16)> {
        let scope = self.functions.pop().expect("function stack underflow");
        scope.upvalues.into_iter().map(|u| (u.is_local, u.index)).collect()
    }

    pub fn declare_param(&mut self, name: &'a str, ty: Ty<'a>) -> u16 {
        let scope = self.current_function_mut();
        let slot = scope.next_slot;
        scope.next_slot += 1;
        scope.param_count += 1;
        scope.locals.push(LocalVar { name, is_const: false, slot, depth: scope.scope_depth, ty });
        slot
    }

    /// Declares a local in the current function's innermost scope. Returns
    /// `None` if the local-slot space (`via_core::limits::MAX_LOCALS`) is
    /// exhausted.
    pub fn declare_local(&mut self, name: &'a str, is_const: bool, ty: Ty<'a>) -> Option<u16> {
        let scope = self.current_function_mut();
        if scope.next_slot as u32 >= via_core::limits::MAX_LOCALS {
            return None;
        }
        let slot = scope.next_slot;
        scope.next_slot += 1;
        scope.locals.push(LocalVar { name, is_const, slot, depth: scope.scope_depth, ty });
        Some(slot)
    }

    #[must_use]
    pub fn local_ty(&self, name: &str) -> Option<Ty<'a>> {
        self.functions.last().unwrap().locals.iter().rev().find(|l| l.name == name).map(|l| l.ty.clone())
    }

    #[must_use]
    pub fn global_ty(&self, name: &str) -> Option<Ty<'a>> {
        self.globals.iter().find(|g| g.name == name).map(|g| g.ty.clone())
    }

    /// Patches a local's tracked type after the fact, used once a named
    /// function's own literal has been compiled and its real function type
    /// is known (it is declared before its body compiles, so recursive
    /// self-calls can resolve it as an upvalue).
    pub fn set_local_ty(&mut self, name: &str, ty: Ty<'a>) {
        if let Some(local) = self.current_function_mut().locals.iter_mut().rev().find(|l| l.name == name) {
            local.ty = ty;
        }
    }

    #[must_use]
    pub fn function_depth(&self) -> usize {
        self.functions.len()
    }

    pub fn declare_global(&mut self, name: &'a str, is_const: bool, ty: Ty<'a>) {
        self.globals.retain(|g| g.name != name);
        self.globals.push(GlobalDecl { name, is_const, ty });
    }

    #[must_use]
    pub fn global_is_const(&self, name: &str) -> bool {
        self.globals.iter().any(|g| g.name == name && g.is_const)
    }

    #[must_use]
    pub fn global_exists(&self, name: &str) -> bool {
        self.globals.iter().any(|g| g.name == name)
    }

    /// Enters a lexically nested scope (if/while/function body block).
    pub fn push_scope(&mut self) {
        self.current_function_mut().scope_depth += 1;
        self.defer_stack.push(Vec::new());
    }

    /// Leaves the current scope, returning the locals declared in it (for
    /// `DROP` emission) and the deferred statements registered in it, in
    /// insertion order (§4.3.2: "appended in insertion order before the
    /// scope's `DROP`s").
    pub fn pop_scope(&mut self) -> (Vec<u16>, Vec<&'a Node<'a>>) {
        let defers = self.defer_stack.pop().unwrap_or_default();
        let scope = self.current_function_mut();
        let depth = scope.scope_depth;
        let mut dropped = Vec::new();
        scope.locals.retain(|local| {
            if local.depth == depth {
                dropped.push(local.slot);
                false
            } else {
                true
            }
        });
        scope.scope_depth -= 1;
        (dropped, defers)
    }

    pub fn register_defer(&mut self, stmt: &'a Node<'a>) {
        if let Some(top) = self.defer_stack.last_mut() {
            top.push(stmt);
        }
    }

    pub fn push_loop(&mut self, labels: LoopLabels) {
        self.loop_stack.push(labels);
    }

    pub fn pop_loop(&mut self) {
        self.loop_stack.pop();
    }

    #[must_use]
    pub fn current_loop(&self) -> Option<LoopLabels> {
        self.loop_stack.last().copied()
    }

    /// Resolution order (§4.3.1): local in the current function, then an
    /// upvalue chasing the enclosing function chain, then global.
    pub fn resolve(&mut self, name: &str) -> Resolution {
        if let Some(slot) = Self::lookup_local(self.functions.last().unwrap(), name) {
            return Resolution::Local(slot);
        }
        if let Some(index) = self.resolve_upvalue(self.functions.len() - 1, name) {
            return Resolution::Upvalue(index);
        }
        Resolution::Global
    }

    #[must_use]
    pub fn local_is_const(&self, name: &str) -> bool {
        Self::lookup_local_const(self.functions.last().unwrap(), name)
    }

    fn lookup_local(scope: &FunctionScope<'a>, name: &str) -> Option<u16> {
        scope.locals.iter().rev().find(|l| l.name == name).map(|l| l.slot)
    }

    fn lookup_local_const(scope: &FunctionScope<'a>, name: &str) -> bool {
        scope.locals.iter().rev().find(|l| l.name == name).is_some_and(|l| l.is_const)
    }

    /// Walks the function stack outward looking for `name` as a local of an
    /// enclosing function, threading an upvalue capture through every
    /// intermediate function scope (the classic "upvalue chain" closure
    /// compilation technique).
    fn resolve_upvalue(&mut self, func_index: usize, name: &str) -> Option<u16> {
        if func_index == 0 {
            return None;
        }
        let parent_index = func_index - 1;

        if let Some(existing) = self.functions[func_index].upvalues.iter().position(|u| u.name == name) {
            return Some(existing as u16);
        }

        if let Some(slot) = Self::lookup_local(&self.functions[parent_index], name) {
            return Some(Self::add_upvalue(&mut self.functions[func_index], name, true, slot));
        }

        if let Some(index) = self.resolve_upvalue(parent_index, name) {
            return Some(Self::add_upvalue(&mut self.functions[func_index], name, false, index));
        }

        None
    }

    fn add_upvalue(scope: &mut FunctionScope<'a>, name: &'a str, is_local: bool, index: u16) -> u16 {
        let slot = scope.upvalues.len() as u16;
        scope.upvalues.push(UpvalueSlot { name, is_local, index });
        slot
    }

    fn current_function_mut(&mut self) -> &mut FunctionScope<'a> {
        self.functions.last_mut().expect("function stack underflow")
    }
}

impl Default for SymbolTable<'_> {
    fn default() -> Self {
        Self::new()
    }
}
