//! Code generation (§4.3): a single-pass tree-walking visitor that lowers the
//! arena-allocated statement list into flat bytecode, folding literal
//! expressions and checking declaration/assignment/call type compatibility
//! as it goes (§4.3.3, §4.3.4). `LBL`/`LJMP*` control-flow forms are emitted
//! label-relative; resolving them to PC-relative jumps is the loader's job
//! (`via`'s module ledger entry), not this pass's.

use crate::constpool::{ConstValue, ConstantPool};
use crate::instruction::{split_f32, split_i32, Instruction, Opcode};
use crate::regalloc::RegisterAllocator;
use crate::symbols::{LoopLabels, Resolution, SymbolTable};
use crate::types::{compatible, Ty};
use via_core::limits::UNUSED_OPERAND;
use via_core::{Arena, Diagnostic, DiagnosticBus, Span};
use via_syntax::{AssignOp, BinaryOp, IfArm, IntrinsicKind, Literal, Node, NodeKind, Param, StepOp, UnaryOp};

/// The flat result of a compilation pass: one instruction stream, a parallel
/// per-instruction comment (used by `disassemble`, never by the VM), and the
/// interned constant pool.
pub struct CompiledUnit<'a> {
    pub instructions: Vec<Instruction>,
    pub comments: Vec<String>,
    pub constants: Vec<ConstValue<'a>>,
}

/// Lowers a parsed top-level statement list into a [`CompiledUnit`].
/// Diagnostics accumulate in `diagnostics`; the caller decides whether to
/// use the resulting bytecode based on `diagnostics.has_errors()` (§7).
#[must_use]
pub fn compile<'a>(
    arena: &'a Arena,
    statements: &[&'a Node<'a>],
    opt_level: u8,
    diagnostics: &mut DiagnosticBus,
) -> CompiledUnit<'a> {
    let mut cg = Codegen::new(arena, opt_level, diagnostics);
    cg.symbols.push_scope();
    for &stmt in statements {
        cg.compile_stmt(stmt);
    }
    let (dropped, defers) = cg.symbols.pop_scope();
    for defer in defers {
        cg.compile_stmt(defer);
    }
    for _ in dropped {
        cg.emit(Instruction::nullary(Opcode::Drop), "drop top-level local");
    }
    cg.emit(Instruction::nullary(Opcode::Exit), "halt");
    CompiledUnit { instructions: cg.instructions, comments: cg.comments, constants: cg.pool.values().to_vec() }
}

/// Renders a compiled unit as one line per instruction, grounded on the
/// teacher's `compiler::disassemble` debug helper.
#[must_use]
pub fn disassemble(unit: &CompiledUnit<'_>) -> String {
    let mut out = String::new();
    for (i, (instr, comment)) in unit.instructions.iter().zip(&unit.comments).enumerate() {
        out.push_str(&format!(
            "{i:>4}: {:<10} {:>6} {:>6} {:>6}  ; {comment}\n",
            format!("{:?}", instr.op),
            instr.a as i32,
            instr.b as i32,
            instr.c as i32
        ));
    }
    out
}

struct Codegen<'a, 'd> {
    arena: &'a Arena,
    instructions: Vec<Instruction>,
    comments: Vec<String>,
    pool: ConstantPool<'a>,
    regs: RegisterAllocator,
    symbols: SymbolTable<'a>,
    diagnostics: &'d mut DiagnosticBus,
    opt_level: u8,
}

impl<'a, 'd> Codegen<'a, 'd> {
    fn new(arena: &'a Arena, opt_level: u8, diagnostics: &'d mut DiagnosticBus) -> Self {
        Self {
            arena,
            instructions: Vec::new(),
            comments: Vec::new(),
            pool: ConstantPool::new(),
            regs: RegisterAllocator::new(),
            symbols: SymbolTable::new(),
            diagnostics,
            opt_level,
        }
    }

    fn emit(&mut self, instr: Instruction, comment: impl Into<String>) -> usize {
        let pos = self.instructions.len();
        self.instructions.push(instr);
        self.comments.push(comment.into());
        pos
    }

    fn alloc_register(&mut self, span: Span) -> u16 {
        self.regs.alloc_register().unwrap_or_else(|| {
            self.diagnostics.push(Diagnostic::internal_compiler_error("register space exhausted", span));
            0
        })
    }

    fn intern_str(&mut self, s: &str) -> u16 {
        let interned: &str = self.arena.alloc_str(s);
        self.pool.intern(ConstValue::String(interned))
    }

    fn node_to_ty(&self, node: &'a Node<'a>) -> Ty<'a> {
        match node.kind {
            NodeKind::TypeAuto => Ty::Auto,
            NodeKind::TypePrimitive(name) => Ty::primitive(name).unwrap_or(Ty::Named(name)),
            NodeKind::TypeGeneric { name, .. } => Ty::Named(name),
            NodeKind::TypeUnion(_) => Ty::Unknown,
            NodeKind::TypeOptional(inner) => Ty::Optional(self.arena.alloc(self.node_to_ty(inner))),
            NodeKind::TypeFunction { params, ret } => {
                let param_tys: Vec<Ty<'a>> = params.iter().map(|p| self.node_to_ty(p)).collect();
                Ty::Function(self.arena.alloc_slice_copy(&param_tys), self.arena.alloc(self.node_to_ty(ret)))
            }
            NodeKind::TypeArray(elem) => Ty::Array(self.arena.alloc(self.node_to_ty(elem))),
            NodeKind::TypeDict { key, value } => {
                Ty::Dict(self.arena.alloc(self.node_to_ty(key)), self.arena.alloc(self.node_to_ty(value)))
            }
            _ => Ty::Unknown,
        }
    }

    // -- Statements -----------------------------------------------------

    fn compile_stmt(&mut self, node: &'a Node<'a>) {
        match node.kind {
            NodeKind::Declaration { is_global, is_const, name, declared_type, initializer } => {
                self.compile_declaration(is_global, is_const, name, declared_type, initializer, node.span);
            }
            NodeKind::Scope(stmts) => {
                self.symbols.push_scope();
                for &stmt in stmts {
                    self.compile_stmt(stmt);
                }
                let (dropped, defers) = self.symbols.pop_scope();
                for defer in defers {
                    self.compile_stmt(defer);
                }
                for _ in dropped {
                    self.emit(Instruction::nullary(Opcode::Drop), "drop scoped local");
                }
            }
            NodeKind::FunctionDecl { name, params, return_type, body } => {
                self.compile_function_decl(name, params, return_type, body, node.span);
            }
            NodeKind::Assignment { target, op, value } => {
                self.compile_assignment(target, op, value, node.span);
            }
            NodeKind::If { arms, else_branch } => self.compile_if(arms, else_branch),
            NodeKind::Return(value) => self.compile_return(value),
            NodeKind::While { cond, body } => self.compile_while(cond, body),
            NodeKind::Break => match self.symbols.current_loop() {
                Some(labels) => {
                    self.emit(Instruction::a_only(Opcode::LJmp, labels.break_label), "break");
                }
                None => self.diagnostics.error("'break' used outside a loop", node.span),
            },
            NodeKind::Continue => match self.symbols.current_loop() {
                Some(labels) => {
                    self.emit(Instruction::a_only(Opcode::LJmp, labels.continue_label), "continue");
                }
                None => self.diagnostics.error("'continue' used outside a loop", node.span),
            },
            NodeKind::Defer(stmt) => self.symbols.register_defer(stmt),
            NodeKind::ExprStmt(expr) => {
                let (reg, _ty) = self.compile_expr(expr);
                self.regs.free_register(reg);
            }
            _ => {
                self.diagnostics.push(Diagnostic::internal_compiler_error(
                    "statement codegen reached an expression/type node",
                    node.span,
                ));
            }
        }
    }

    fn compile_declaration(
        &mut self,
        is_global: bool,
        is_const: bool,
        name: &'a str,
        declared_type: &'a Node<'a>,
        initializer: Option<&'a Node<'a>>,
        span: Span,
    ) {
        let declared_ty = self.node_to_ty(declared_type);
        let (value_reg, value_ty) = match initializer {
            Some(init) => self.compile_expr(init),
            None => self.compile_literal(Literal::Nil, span),
        };
        let final_ty = if matches!(declared_ty, Ty::Auto) {
            value_ty
        } else {
            if !compatible(&value_ty, &declared_ty) {
                self.diagnostics.error(
                    format!(
                        "cannot initialize '{name}' of declared type '{}' with a value of type '{}'",
                        declared_ty.describe(self.arena),
                        value_ty.describe(self.arena)
                    ),
                    span,
                );
            }
            declared_ty
        };
        if is_global {
            if self.symbols.function_depth() > 1 {
                self.diagnostics.error("global declarations are only allowed at the top level", span);
            }
            let key = self.intern_str(name);
            let keyreg = self.alloc_register(span);
            self.emit(Instruction::ab(Opcode::LoadK, keyreg, key), format!("key for global '{name}'"));
            self.emit(Instruction::ab(Opcode::SetGlobal, value_reg, keyreg), format!("bind global '{name}'"));
            self.regs.free_register(keyreg);
            self.symbols.declare_global(name, is_const, final_ty);
        } else {
            match self.symbols.declare_local(name, is_const, final_ty) {
                Some(_slot) => {
                    self.emit(Instruction::a_only(Opcode::Push, value_reg), format!("bind local '{name}'"));
                }
                None => {
                    self.diagnostics.push(Diagnostic::internal_compiler_error("local slot space exhausted", span));
                }
            }
        }
        self.regs.free_register(value_reg);
    }

    fn compile_function_decl(
        &mut self,
        name: &'a str,
        params: &'a [Param<'a>],
        return_type: &'a Node<'a>,
        body: &'a Node<'a>,
        span: Span,
    ) {
        match self.symbols.declare_local(name, true, Ty::Unknown) {
            Some(slot) => {
                // Reserve the local slot before compiling the body so a self-call
                // inside it captures this frame's actual (boxed) cell as an
                // upvalue, rather than one that doesn't exist yet at CLOSURE time.
                self.emit(Instruction::nullary(Opcode::PushNil), format!("reserve local '{name}' for self-recursion"));
                let (reg, fn_ty) = self.compile_closure(params, return_type, body);
                self.symbols.set_local_ty(name, fn_ty);
                self.emit(Instruction::ab(Opcode::SetLocal, reg, slot), format!("bind function '{name}'"));
                self.regs.free_register(reg);
            }
            None => {
                self.diagnostics.push(Diagnostic::internal_compiler_error("local slot space exhausted", span));
            }
        }
    }

    fn compile_assignment(&mut self, target: &'a Node<'a>, op: AssignOp, value: &'a Node<'a>, span: Span) {
        let (vreg, _vty) = self.compile_expr(value);
        match target.kind {
            NodeKind::Symbol(name) => self.compile_symbol_assign(name, op, vreg, span),
            NodeKind::Index { target: base, index } => self.compile_index_assign(base, index, op, vreg, span),
            _ => {
                self.diagnostics.error("invalid assignment target", span);
                self.regs.free_register(vreg);
            }
        }
    }

    fn compile_symbol_assign(&mut self, name: &'a str, op: AssignOp, vreg: u16, span: Span) {
        let resolution = self.symbols.resolve(name);
        let is_const = match resolution {
            Resolution::Local(_) => self.symbols.local_is_const(name),
            Resolution::Global => self.symbols.global_is_const(name),
            Resolution::Upvalue(_) => false,
        };
        if is_const {
            self.diagnostics.error(format!("cannot assign to const binding '{name}'"), span);
        }
        if matches!(resolution, Resolution::Global) && !self.symbols.global_exists(name) {
            self.diagnostics.error(format!("assignment to unknown name '{name}'"), span);
        }

        let final_reg = if let Some(bin) = op.as_binary_op() {
            let cur = self.alloc_register(span);
            match resolution {
                Resolution::Local(slot) => {
                    self.emit(Instruction::ab(Opcode::GetLocal, cur, slot), "load current value");
                }
                Resolution::Upvalue(idx) => {
                    self.emit(Instruction::ab(Opcode::GetUpv, cur, idx), "load current value");
                }
                Resolution::Global => {
                    let key = self.intern_str(name);
                    let keyreg = self.alloc_register(span);
                    self.emit(Instruction::ab(Opcode::LoadK, keyreg, key), "load key");
                    self.emit(Instruction::ab(Opcode::GetGlobal, cur, keyreg), "load current value");
                    self.regs.free_register(keyreg);
                }
            }
            let dst = self.alloc_register(span);
            self.emit(Instruction::new(binary_opcode_for(bin), dst, cur, vreg), "combine with current value");
            self.regs.free_register(cur);
            self.regs.free_register(vreg);
            dst
        } else {
            vreg
        };

        match resolution {
            Resolution::Local(slot) => {
                self.emit(Instruction::ab(Opcode::SetLocal, final_reg, slot), format!("store local '{name}'"));
            }
            Resolution::Upvalue(idx) => {
                self.emit(Instruction::ab(Opcode::SetUpv, final_reg, idx), format!("store upvalue '{name}'"));
            }
            Resolution::Global => {
                let key = self.intern_str(name);
                let keyreg = self.alloc_register(span);
                self.emit(Instruction::ab(Opcode::LoadK, keyreg, key), "load key");
                self.emit(Instruction::ab(Opcode::SetGlobal, final_reg, keyreg), format!("store global '{name}'"));
                self.regs.free_register(keyreg);
            }
        }
        self.regs.free_register(final_reg);
    }

    fn compile_index_assign(&mut self, base: &'a Node<'a>, index: &'a Node<'a>, op: AssignOp, vreg: u16, span: Span) {
        let (breg, bty) = self.compile_expr(base);
        let (ireg, _ity) = self.compile_expr(index);

        let final_reg = if let Some(bin) = op.as_binary_op() {
            let cur = self.alloc_register(span);
            match bty {
                Ty::Array(_) => {
                    self.emit(Instruction::new(Opcode::GetArr, cur, breg, ireg), "load current element");
                }
                Ty::Dict(_, _) => {
                    self.emit(Instruction::new(Opcode::GetDict, cur, breg, ireg), "load current element");
                }
                Ty::String => {
                    self.emit(Instruction::new(Opcode::GetStr, cur, breg, ireg), "load current element");
                }
                _ => self.diagnostics.error("cannot index-assign a non-container", span),
            }
            let dst = self.alloc_register(span);
            self.emit(Instruction::new(binary_opcode_for(bin), dst, cur, vreg), "combine with current element");
            self.regs.free_register(cur);
            self.regs.free_register(vreg);
            dst
        } else {
            vreg
        };

        match bty {
            Ty::Array(_) => {
                self.emit(Instruction::new(Opcode::SetArr, breg, ireg, final_reg), "set array element");
            }
            Ty::Dict(_, _) => {
                self.emit(Instruction::new(Opcode::SetDict, breg, ireg, final_reg), "set dict element");
            }
            Ty::String => {
                self.emit(Instruction::new(Opcode::SetStr, breg, ireg, final_reg), "set string character");
            }
            _ => self.diagnostics.error(
                format!("cannot index-assign a value of type '{}'", bty.describe(self.arena)),
                span,
            ),
        }
        self.regs.free_register(breg);
        self.regs.free_register(ireg);
        self.regs.free_register(final_reg);
    }

    fn compile_if(&mut self, arms: &'a [IfArm<'a>], else_branch: Option<&'a Node<'a>>) {
        let escape = self.symbols.fresh_label();
        let arm_labels: Vec<u16> = arms.iter().map(|_| self.symbols.fresh_label()).collect();
        for (arm, &label) in arms.iter().zip(&arm_labels) {
            let (creg, _) = self.compile_expr(arm.cond);
            self.emit(Instruction::ab(Opcode::LJmpIf, creg, label), "jump to arm if true");
            self.regs.free_register(creg);
        }
        let else_label = if else_branch.is_some() { self.symbols.fresh_label() } else { escape };
        self.emit(Instruction::a_only(Opcode::LJmp, else_label), "fall through to else/escape");
        for (arm, &label) in arms.iter().zip(&arm_labels) {
            self.emit(Instruction::a_only(Opcode::Lbl, label), "arm body");
            self.compile_stmt(arm.body);
            self.emit(Instruction::a_only(Opcode::LJmp, escape), "leave if");
        }
        if let Some(eb) = else_branch {
            self.emit(Instruction::a_only(Opcode::Lbl, else_label), "else body");
            self.compile_stmt(eb);
            self.emit(Instruction::a_only(Opcode::LJmp, escape), "leave if");
        }
        self.emit(Instruction::a_only(Opcode::Lbl, escape), "escape");
    }

    fn compile_while(&mut self, cond: &'a Node<'a>, body: &'a Node<'a>) {
        let repeat = self.symbols.fresh_label();
        let escape = self.symbols.fresh_label();
        self.emit(Instruction::a_only(Opcode::Lbl, repeat), "loop test");
        let (creg, _) = self.compile_expr(cond);
        self.emit(Instruction::ab(Opcode::LJmpIfN, creg, escape), "exit loop if false");
        self.regs.free_register(creg);
        self.symbols.push_loop(LoopLabels { break_label: escape, continue_label: repeat });
        self.compile_stmt(body);
        self.symbols.pop_loop();
        self.emit(Instruction::a_only(Opcode::LJmp, repeat), "repeat");
        self.emit(Instruction::a_only(Opcode::Lbl, escape), "loop escape");
    }

    fn compile_return(&mut self, value: Option<&'a Node<'a>>) {
        match value {
            None => {
                self.emit(Instruction::nullary(Opcode::RetNil), "return nil");
            }
            Some(node) => match node.kind {
                NodeKind::Literal(Literal::Bool(true)) => {
                    self.emit(Instruction::nullary(Opcode::RetBt), "return true");
                }
                NodeKind::Literal(Literal::Bool(false)) => {
                    self.emit(Instruction::nullary(Opcode::RetBf), "return false");
                }
                NodeKind::Literal(Literal::Nil) => {
                    self.emit(Instruction::nullary(Opcode::RetNil), "return nil");
                }
                _ => {
                    let (reg, _ty) = self.compile_expr(node);
                    self.emit(Instruction::a_only(Opcode::Ret, reg), "return");
                    self.regs.free_register(reg);
                }
            },
        }
    }

    // -- Closures ---------------------------------------------------------

    fn compile_closure(&mut self, params: &'a [Param<'a>], return_type: &'a Node<'a>, body: &'a Node<'a>) -> (u16, Ty<'a>) {
        let dst = self.alloc_register(body.span);
        let header_pos =
            self.emit(Instruction::new(Opcode::Closure, dst, 0, params.len() as u16), "closure header (len backpatched)");

        self.symbols.push_function();
        let mut param_tys = Vec::with_capacity(params.len());
        for (i, param) in params.iter().enumerate() {
            let ty = self.node_to_ty(param.ty);
            param_tys.push(ty);
            self.symbols.declare_param(param.name, ty);
            let tmp = self.alloc_register(param.span);
            self.emit(Instruction::ab(Opcode::GetArg, tmp, i as u16), "materialize parameter");
            self.emit(Instruction::a_only(Opcode::Push, tmp), "push parameter as local");
            self.regs.free_register(tmp);
        }

        self.compile_stmt(body);
        self.ensure_trailing_return();

        let upvalues = self.symbols.pop_function();
        for (is_local, index) in &upvalues {
            self.emit(Instruction::new(Opcode::Capture, u16::from(*is_local), *index, UNUSED_OPERAND), "capture upvalue");
        }

        let total_len = (self.instructions.len() - header_pos - 1) as u16;
        self.instructions[header_pos].b = total_len;

        let ret_ty = self.node_to_ty(return_type);
        let fn_ty = Ty::Function(self.arena.alloc_slice_copy(&param_tys), self.arena.alloc(ret_ty));
        (dst, fn_ty)
    }

    fn ensure_trailing_return(&mut self) {
        let already_returns = self
            .instructions
            .last()
            .is_some_and(|i| matches!(i.op, Opcode::Ret | Opcode::RetBt | Opcode::RetBf | Opcode::RetNil));
        if !already_returns {
            self.emit(Instruction::nullary(Opcode::RetNil), "implicit return");
        }
    }

    // -- Expressions --------------------------------------------------------

    fn compile_expr(&mut self, node: &'a Node<'a>) -> (u16, Ty<'a>) {
        match node.kind {
            NodeKind::Literal(lit) => self.compile_literal(lit, node.span),
            NodeKind::Symbol(name) => self.compile_symbol_read(name, node.span),
            NodeKind::Unary { op, operand } => self.compile_unary(op, operand, node.span),
            NodeKind::Binary { op, lhs, rhs } => self.compile_binary(op, lhs, rhs, node.span),
            NodeKind::Group(inner) => self.compile_expr(inner),
            NodeKind::Call { callee, args } => self.compile_call(callee, args, node.span, false),
            NodeKind::Index { target, index } => self.compile_index_read(target, index, node.span),
            NodeKind::Cast { expr, ty } => self.compile_cast(expr, ty, node.span),
            NodeKind::Step { op, operand } => {
                let delta = match op {
                    StepOp::Inc => 1,
                    StepOp::Dec => -1,
                };
                self.compile_step(operand, delta, true, node.span)
            }
            NodeKind::ArrayLiteral(elems) => self.compile_array_literal(elems, node.span),
            NodeKind::Intrinsic { kind, arg } => self.compile_intrinsic(kind, arg, node.span),
            NodeKind::DeepEq { lhs, rhs } => self.compile_deep_eq(lhs, rhs, node.span),
            NodeKind::FunctionLiteral { params, return_type, body } => self.compile_closure(params, return_type, body),
            _ => {
                self.diagnostics.push(Diagnostic::internal_compiler_error(
                    "expression codegen reached a statement/type node",
                    node.span,
                ));
                self.compile_literal(Literal::Nil, node.span)
            }
        }
    }

    fn compile_literal(&mut self, lit: Literal<'a>, span: Span) -> (u16, Ty<'a>) {
        match lit {
            Literal::Nil => {
                let dst = self.alloc_register(span);
                self.emit(Instruction::a_only(Opcode::LoadNil, dst), "load nil");
                (dst, Ty::Nil)
            }
            Literal::Int(n) => {
                let dst = self.alloc_register(span);
                let (hi, lo) = split_i32(n);
                self.emit(Instruction::new(Opcode::LoadI, dst, hi, lo), format!("load int {n}"));
                (dst, Ty::Int)
            }
            Literal::Float(f) => {
                let dst = self.alloc_register(span);
                let (hi, lo) = split_f32(f);
                self.emit(Instruction::new(Opcode::LoadF, dst, hi, lo), format!("load float {f}"));
                (dst, Ty::Float)
            }
            Literal::Bool(true) => {
                let dst = self.alloc_register(span);
                self.emit(Instruction::a_only(Opcode::LoadBt, dst), "load true");
                (dst, Ty::Bool)
            }
            Literal::Bool(false) => {
                let dst = self.alloc_register(span);
                self.emit(Instruction::a_only(Opcode::LoadBf, dst), "load false");
                (dst, Ty::Bool)
            }
            Literal::String(s) => {
                let idx = self.intern_str(s);
                let dst = self.alloc_register(span);
                self.emit(Instruction::ab(Opcode::LoadK, dst, idx), format!("load string {s:?}"));
                (dst, Ty::String)
            }
        }
    }

    fn compile_symbol_read(&mut self, name: &'a str, span: Span) -> (u16, Ty<'a>) {
        match self.symbols.resolve(name) {
            Resolution::Local(slot) => {
                let dst = self.alloc_register(span);
                self.emit(Instruction::ab(Opcode::GetLocal, dst, slot), format!("get local '{name}'"));
                (dst, self.symbols.local_ty(name).unwrap_or(Ty::Unknown))
            }
            Resolution::Upvalue(idx) => {
                let dst = self.alloc_register(span);
                self.emit(Instruction::ab(Opcode::GetUpv, dst, idx), format!("get upvalue '{name}'"));
                (dst, Ty::Unknown)
            }
            Resolution::Global => {
                if !self.symbols.global_exists(name) {
                    self.diagnostics.error(format!("reference to unknown name '{name}'"), span);
                }
                let key = self.intern_str(name);
                let keyreg = self.alloc_register(span);
                self.emit(Instruction::ab(Opcode::LoadK, keyreg, key), format!("load key '{name}'"));
                let dst = self.alloc_register(span);
                self.emit(Instruction::ab(Opcode::GetGlobal, dst, keyreg), format!("get global '{name}'"));
                self.regs.free_register(keyreg);
                (dst, self.symbols.global_ty(name).unwrap_or(Ty::Unknown))
            }
        }
    }

    fn compile_unary(&mut self, op: UnaryOp, operand: &'a Node<'a>, span: Span) -> (u16, Ty<'a>) {
        match op {
            UnaryOp::Neg => {
                if self.opt_level >= 1 {
                    if let Some(folded) = try_fold_literal(operand).and_then(|lit| match lit {
                        Literal::Int(n) => Some(Literal::Int(n.wrapping_neg())),
                        Literal::Float(f) => Some(Literal::Float(-f)),
                        _ => None,
                    }) {
                        return self.compile_literal(folded, span);
                    }
                }
                let (reg, ty) = self.compile_expr(operand);
                if !matches!(ty, Ty::Int | Ty::Float | Ty::Unknown) {
                    self.diagnostics.error(format!("cannot negate a value of type '{}'", ty.describe(self.arena)), span);
                }
                self.emit(Instruction::a_only(Opcode::Neg, reg), "negate");
                (reg, ty)
            }
            UnaryOp::Len => {
                let (reg, ty) = self.compile_expr(operand);
                let dst = self.alloc_register(span);
                match ty {
                    Ty::Array(_) => {
                        self.emit(Instruction::ab(Opcode::LenArr, dst, reg), "length of array");
                    }
                    Ty::String => {
                        self.emit(Instruction::ab(Opcode::LenStr, dst, reg), "length of string");
                    }
                    Ty::Dict(_, _) => {
                        self.emit(Instruction::ab(Opcode::LenDict, dst, reg), "length of dict");
                    }
                    _ => {
                        self.diagnostics.error(
                            format!("cannot take the length of a value of type '{}'", ty.describe(self.arena)),
                            span,
                        );
                        self.emit(Instruction::ab(Opcode::LenArr, dst, reg), "length (best-effort)");
                    }
                }
                self.regs.free_register(reg);
                (dst, Ty::Int)
            }
            UnaryOp::PreInc => self.compile_step(operand, 1, false, span),
            UnaryOp::PreDec => self.compile_step(operand, -1, false, span),
        }
    }

    /// Shared prefix/postfix `++`/`--` lowering for both `NodeKind::Unary`
    /// (prefix) and `NodeKind::Step` (postfix) operands.
    fn compile_step(&mut self, target: &'a Node<'a>, delta: i32, want_post: bool, span: Span) -> (u16, Ty<'a>) {
        match target.kind {
            NodeKind::Symbol(name) => {
                let resolution = self.symbols.resolve(name);
                let is_const = match resolution {
                    Resolution::Local(_) => self.symbols.local_is_const(name),
                    Resolution::Global => self.symbols.global_is_const(name),
                    Resolution::Upvalue(_) => false,
                };
                if is_const {
                    self.diagnostics.error(format!("cannot modify const binding '{name}'"), span);
                }

                let cur = self.alloc_register(span);
                match resolution {
                    Resolution::Local(slot) => {
                        self.emit(Instruction::ab(Opcode::GetLocal, cur, slot), "load current");
                    }
                    Resolution::Upvalue(idx) => {
                        self.emit(Instruction::ab(Opcode::GetUpv, cur, idx), "load current");
                    }
                    Resolution::Global => {
                        if !self.symbols.global_exists(name) {
                            self.diagnostics.error(format!("reference to unknown name '{name}'"), span);
                        }
                        let key = self.intern_str(name);
                        let keyreg = self.alloc_register(span);
                        self.emit(Instruction::ab(Opcode::LoadK, keyreg, key), "load key");
                        self.emit(Instruction::ab(Opcode::GetGlobal, cur, keyreg), "load current");
                        self.regs.free_register(keyreg);
                    }
                }

                let updated = self.alloc_register(span);
                self.emit(Instruction::ab(Opcode::Mov, updated, cur), "copy before step");
                let (hi, lo) = split_i32(delta);
                self.emit(Instruction::new(Opcode::AddI, updated, hi, lo), "step");

                match resolution {
                    Resolution::Local(slot) => {
                        self.emit(Instruction::ab(Opcode::SetLocal, updated, slot), "store stepped");
                    }
                    Resolution::Upvalue(idx) => {
                        self.emit(Instruction::ab(Opcode::SetUpv, updated, idx), "store stepped");
                    }
                    Resolution::Global => {
                        let key = self.intern_str(name);
                        let keyreg = self.alloc_register(span);
                        self.emit(Instruction::ab(Opcode::LoadK, keyreg, key), "load key");
                        self.emit(Instruction::ab(Opcode::SetGlobal, updated, keyreg), "store stepped");
                        self.regs.free_register(keyreg);
                    }
                }

                let ty = self.symbols.local_ty(name).or_else(|| self.symbols.global_ty(name)).unwrap_or(Ty::Unknown);
                if want_post {
                    self.regs.free_register(updated);
                    (cur, ty)
                } else {
                    self.regs.free_register(cur);
                    (updated, ty)
                }
            }
            NodeKind::Index { target: base, index } => {
                let (breg, bty) = self.compile_expr(base);
                let (ireg, _ity) = self.compile_expr(index);
                let cur = self.alloc_register(span);
                match bty {
                    Ty::Array(_) => {
                        self.emit(Instruction::new(Opcode::GetArr, cur, breg, ireg), "load current element");
                    }
                    Ty::Dict(_, _) => {
                        self.emit(Instruction::new(Opcode::GetDict, cur, breg, ireg), "load current element");
                    }
                    _ => self.diagnostics.error("cannot step a non-container element", span),
                }
                let updated = self.alloc_register(span);
                self.emit(Instruction::ab(Opcode::Mov, updated, cur), "copy before step");
                let (hi, lo) = split_i32(delta);
                self.emit(Instruction::new(Opcode::AddI, updated, hi, lo), "step");
                match bty {
                    Ty::Array(_) => {
                        self.emit(Instruction::new(Opcode::SetArr, breg, ireg, updated), "store stepped element");
                    }
                    Ty::Dict(_, _) => {
                        self.emit(Instruction::new(Opcode::SetDict, breg, ireg, updated), "store stepped element");
                    }
                    _ => {}
                }
                self.regs.free_register(breg);
                self.regs.free_register(ireg);
                let elem_ty = match bty {
                    Ty::Array(e) | Ty::Dict(_, e) => *e,
                    _ => Ty::Unknown,
                };
                if want_post {
                    self.regs.free_register(updated);
                    (cur, elem_ty)
                } else {
                    self.regs.free_register(cur);
                    (updated, elem_ty)
                }
            }
            _ => {
                self.diagnostics.error("invalid step target", span);
                self.compile_literal(Literal::Nil, span)
            }
        }
    }

    fn compile_binary(&mut self, op: BinaryOp, lhs: &'a Node<'a>, rhs: &'a Node<'a>, span: Span) -> (u16, Ty<'a>) {
        if self.opt_level >= 1 {
            if let (Some(a), Some(b)) = (try_fold_literal(lhs), try_fold_literal(rhs)) {
                if let Some(folded) = self.fold_binary_literals(op, a, b, span) {
                    return self.compile_literal(folded, span);
                }
            }
        }

        let is_arithmetic =
            matches!(op, BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod | BinaryOp::Pow);
        if is_arithmetic {
            if let NodeKind::Literal(Literal::Int(n)) = rhs.kind {
                let (lreg, lty) = self.compile_expr(lhs);
                let (hi, lo) = split_i32(n);
                self.emit(Instruction::new(int_immediate_opcode(op), lreg, hi, lo), format!("{op:?} immediate (int)"));
                let result_ty = if matches!(lty, Ty::Float) { Ty::Float } else { Ty::Int };
                return (lreg, result_ty);
            }
            if let NodeKind::Literal(Literal::Float(f)) = rhs.kind {
                let (lreg, _lty) = self.compile_expr(lhs);
                let (hi, lo) = split_f32(f);
                self.emit(Instruction::new(float_immediate_opcode(op), lreg, hi, lo), format!("{op:?} immediate (float)"));
                return (lreg, Ty::Float);
            }
        }

        let (lreg, lty) = self.compile_expr(lhs);
        let (rreg, rty) = self.compile_expr(rhs);

        if op == BinaryOp::Add && (matches!(lty, Ty::String) || matches!(rty, Ty::String)) {
            self.emit(Instruction::ab(Opcode::ConStr, lreg, rreg), "concatenate strings");
            self.regs.free_register(rreg);
            return (lreg, Ty::String);
        }

        let dst = self.alloc_register(span);
        let (opcode, result_ty) = binary_opcode_and_type(op, &lty, &rty);
        self.emit(Instruction::new(opcode, dst, lreg, rreg), format!("{op:?}"));
        self.regs.free_register(lreg);
        self.regs.free_register(rreg);
        (dst, result_ty)
    }

    fn fold_binary_literals(&mut self, op: BinaryOp, a: Literal<'a>, b: Literal<'a>, span: Span) -> Option<Literal<'a>> {
        use Literal::{Bool, Float, Int};

        let as_f = |lit: Literal<'a>| -> Option<f32> {
            match lit {
                Int(n) => Some(n as f32),
                Float(f) => Some(f),
                _ => None,
            }
        };

        match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod | BinaryOp::Pow => {
                if let (Int(x), Int(y)) = (a, b) {
                    if matches!(op, BinaryOp::Div | BinaryOp::Mod) && y == 0 {
                        self.diagnostics.error("division by zero in constant expression", span);
                        return None;
                    }
                    return Some(Int(match op {
                        BinaryOp::Add => x.wrapping_add(y),
                        BinaryOp::Sub => x.wrapping_sub(y),
                        BinaryOp::Mul => x.wrapping_mul(y),
                        BinaryOp::Div => x.wrapping_div(y),
                        BinaryOp::Mod => x.wrapping_rem(y),
                        BinaryOp::Pow => x.checked_pow(y.max(0) as u32).unwrap_or(0),
                        _ => unreachable!(),
                    }));
                }
                let (x, y) = (as_f(a)?, as_f(b)?);
                if matches!(op, BinaryOp::Div | BinaryOp::Mod) && y == 0.0 {
                    self.diagnostics.error("division by zero in constant expression", span);
                    return None;
                }
                Some(Float(match op {
                    BinaryOp::Add => x + y,
                    BinaryOp::Sub => x - y,
                    BinaryOp::Mul => x * y,
                    BinaryOp::Div => x / y,
                    BinaryOp::Mod => x % y,
                    BinaryOp::Pow => x.powf(y),
                    _ => unreachable!(),
                }))
            }
            BinaryOp::Eq | BinaryOp::Neq | BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => {
                let (x, y) = (as_f(a)?, as_f(b)?);
                Some(Bool(match op {
                    BinaryOp::Eq => x == y,
                    BinaryOp::Neq => x != y,
                    BinaryOp::Lt => x < y,
                    BinaryOp::Gt => x > y,
                    BinaryOp::Le => x <= y,
                    BinaryOp::Ge => x >= y,
                    _ => unreachable!(),
                }))
            }
            BinaryOp::And | BinaryOp::Or => {
                let truthy = |lit: Literal<'a>| !matches!(lit, Literal::Nil | Bool(false));
                Some(Bool(match op {
                    BinaryOp::And => truthy(a) && truthy(b),
                    BinaryOp::Or => truthy(a) || truthy(b),
                    _ => unreachable!(),
                }))
            }
        }
    }

    fn compile_call(&mut self, callee: &'a Node<'a>, args: &'a [&'a Node<'a>], span: Span, protected: bool) -> (u16, Ty<'a>) {
        let (creg, cty) = self.compile_expr(callee);

        let arg_regs: Vec<(u16, Ty<'a>)> = args.iter().map(|&arg| self.compile_expr(arg)).collect();

        let base = if arg_regs.is_empty() {
            UNUSED_OPERAND
        } else {
            let base = self.regs.alloc_contiguous(arg_regs.len() as u16).unwrap_or_else(|| {
                self.diagnostics.push(Diagnostic::internal_compiler_error(
                    "register space exhausted for call arguments",
                    span,
                ));
                0
            });
            for (i, &(reg, _)) in arg_regs.iter().enumerate() {
                self.emit(Instruction::ab(Opcode::Mov, base + i as u16, reg), "move argument into call window");
            }
            base
        };
        for &(reg, _) in &arg_regs {
            self.regs.free_register(reg);
        }

        let ret = self.alloc_register(span);
        let op = if protected { Opcode::PCall } else { Opcode::Call };
        self.emit(Instruction::new(op, creg, base, ret), "call");
        self.regs.free_register(creg);
        if !arg_regs.is_empty() {
            for i in 0..arg_regs.len() as u16 {
                self.regs.free_register(base + i);
            }
        }

        let ret_ty = match cty {
            Ty::Function(_, ret_ty) => *ret_ty,
            _ => Ty::Unknown,
        };
        (ret, ret_ty)
    }

    fn compile_index_read(&mut self, target: &'a Node<'a>, index: &'a Node<'a>, span: Span) -> (u16, Ty<'a>) {
        let (treg, tty) = self.compile_expr(target);
        let (ireg, _ity) = self.compile_expr(index);
        let dst = self.alloc_register(span);
        let result_ty = match tty {
            Ty::Array(elem) => {
                self.emit(Instruction::new(Opcode::GetArr, dst, treg, ireg), "index array");
                *elem
            }
            Ty::Dict(_, value) => {
                self.emit(Instruction::new(Opcode::GetDict, dst, treg, ireg), "index dict");
                *value
            }
            Ty::String => {
                self.emit(Instruction::new(Opcode::GetStr, dst, treg, ireg), "index string");
                Ty::String
            }
            _ => {
                self.diagnostics.error(format!("cannot index a value of type '{}'", tty.describe(self.arena)), span);
                self.emit(Instruction::new(Opcode::GetArr, dst, treg, ireg), "index (best-effort)");
                Ty::Unknown
            }
        };
        self.regs.free_register(treg);
        self.regs.free_register(ireg);
        (dst, result_ty)
    }

    fn compile_cast(&mut self, expr: &'a Node<'a>, ty_node: &'a Node<'a>, span: Span) -> (u16, Ty<'a>) {
        let (ereg, _ety) = self.compile_expr(expr);
        let target = self.node_to_ty(ty_node);
        let dst = self.alloc_register(span);
        let opcode = match target {
            Ty::Int => Opcode::ICast,
            Ty::Float => Opcode::FCast,
            Ty::String => Opcode::StrCast,
            Ty::Bool => Opcode::BCast,
            _ => {
                self.diagnostics.error(format!("cannot cast to type '{}'", target.describe(self.arena)), span);
                Opcode::ICast
            }
        };
        self.emit(Instruction::ab(opcode, dst, ereg), "cast");
        self.regs.free_register(ereg);
        (dst, target)
    }

    fn compile_array_literal(&mut self, elems: &'a [&'a Node<'a>], span: Span) -> (u16, Ty<'a>) {
        let dst = self.alloc_register(span);
        self.emit(Instruction::a_only(Opcode::LoadArr, dst), "new array");
        let mut elem_ty = Ty::Unknown;
        for (i, &elem) in elems.iter().enumerate() {
            let (ereg, ety) = self.compile_expr(elem);
            if i == 0 {
                elem_ty = ety;
            }
            let keyreg = self.alloc_register(span);
            let (hi, lo) = split_i32(i as i32);
            self.emit(Instruction::new(Opcode::LoadI, keyreg, hi, lo), format!("array index {i}"));
            self.emit(Instruction::new(Opcode::SetArr, dst, keyreg, ereg), "set array element");
            self.regs.free_register(keyreg);
            self.regs.free_register(ereg);
        }
        (dst, Ty::Array(self.arena.alloc(elem_ty)))
    }

    fn compile_deep_eq(&mut self, lhs: &'a Node<'a>, rhs: &'a Node<'a>, span: Span) -> (u16, Ty<'a>) {
        let (lreg, _) = self.compile_expr(lhs);
        let (rreg, _) = self.compile_expr(rhs);
        let dst = self.alloc_register(span);
        self.emit(Instruction::new(Opcode::Deq, dst, lreg, rreg), "deep equality");
        self.regs.free_register(lreg);
        self.regs.free_register(rreg);
        (dst, Ty::Bool)
    }

    fn compile_intrinsic(&mut self, kind: IntrinsicKind, arg: Option<&'a Node<'a>>, span: Span) -> (u16, Ty<'a>) {
        match kind {
            IntrinsicKind::Print | IntrinsicKind::Error => {
                let Some(arg) = arg else {
                    self.diagnostics.error("intrinsic requires an argument", span);
                    return self.compile_literal(Literal::Nil, span);
                };
                let (reg, _ty) = self.compile_expr(arg);
                let opcode = if kind == IntrinsicKind::Print { Opcode::Print } else { Opcode::Error };
                self.emit(Instruction::a_only(opcode, reg), "intrinsic");
                self.regs.free_register(reg);
                self.compile_literal(Literal::Nil, span)
            }
            IntrinsicKind::TypeOf => {
                let Some(arg) = arg else {
                    self.diagnostics.error("typeof requires an argument", span);
                    return self.compile_literal(Literal::Nil, span);
                };
                let (reg, _ty) = self.compile_expr(arg);
                let dst = self.alloc_register(span);
                self.emit(Instruction::ab(Opcode::TypeOf, dst, reg), "runtime type tag");
                self.regs.free_register(reg);
                (dst, Ty::String)
            }
            IntrinsicKind::Type => {
                let ty = arg.map(|node| self.node_to_ty(node)).unwrap_or(Ty::Unknown);
                let name = ty.describe(self.arena);
                let idx = self.intern_str(name);
                let dst = self.alloc_register(span);
                self.emit(Instruction::ab(Opcode::LoadType, dst, idx), "load type descriptor");
                (dst, Ty::Named("type"))
            }
            IntrinsicKind::NameOf => {
                let name = match arg.map(|n| n.kind) {
                    Some(NodeKind::Symbol(name)) => name,
                    _ => {
                        self.diagnostics.error("nameof requires a plain identifier", span);
                        "?"
                    }
                };
                self.compile_literal(Literal::String(name), span)
            }
            IntrinsicKind::Try => {
                let Some(arg) = arg else {
                    self.diagnostics.error("try requires a call expression", span);
                    return self.compile_literal(Literal::Nil, span);
                };
                match arg.kind {
                    NodeKind::Call { callee, args } => self.compile_call(callee, args, span, true),
                    _ => {
                        self.diagnostics.error("try requires a call expression", span);
                        self.compile_expr(arg)
                    }
                }
            }
        }
    }
}

/// A literal appearing directly, or behind parentheses/unary negation — the
/// span of constant-folding this pass performs (§4.3.3). Deeper constexpr
/// chains through symbol references are not folded by this simplified
/// implementation (see DESIGN.md).
fn try_fold_literal<'a>(node: &'a Node<'a>) -> Option<Literal<'a>> {
    match node.kind {
        NodeKind::Literal(lit) => Some(lit),
        NodeKind::Group(inner) => try_fold_literal(inner),
        NodeKind::Unary { op: UnaryOp::Neg, operand } => match try_fold_literal(operand)? {
            Literal::Int(n) => Some(Literal::Int(n.wrapping_neg())),
            Literal::Float(f) => Some(Literal::Float(-f)),
            _ => None,
        },
        _ => None,
    }
}

fn int_immediate_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::AddI,
        BinaryOp::Sub => Opcode::SubI,
        BinaryOp::Mul => Opcode::MulI,
        BinaryOp::Div => Opcode::DivI,
        BinaryOp::Mod => Opcode::ModI,
        BinaryOp::Pow => Opcode::PowI,
        _ => unreachable!("non-arithmetic op has no immediate form"),
    }
}

fn float_immediate_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::AddF,
        BinaryOp::Sub => Opcode::SubF,
        BinaryOp::Mul => Opcode::MulF,
        BinaryOp::Div => Opcode::DivF,
        BinaryOp::Mod => Opcode::ModF,
        BinaryOp::Pow => Opcode::PowF,
        _ => unreachable!("non-arithmetic op has no immediate form"),
    }
}

fn binary_opcode_for(op: BinaryOp) -> Opcode {
    binary_opcode_and_type(op, &Ty::Unknown, &Ty::Unknown).0
}

fn binary_opcode_and_type<'a>(op: BinaryOp, lty: &Ty<'a>, rty: &Ty<'a>) -> (Opcode, Ty<'a>) {
    let numeric_result = if matches!(lty, Ty::Float) || matches!(rty, Ty::Float) { Ty::Float } else { Ty::Int };
    match op {
        BinaryOp::Add => (Opcode::Add, numeric_result),
        BinaryOp::Sub => (Opcode::Sub, numeric_result),
        BinaryOp::Mul => (Opcode::Mul, numeric_result),
        BinaryOp::Div => (Opcode::Div, numeric_result),
        BinaryOp::Mod => (Opcode::Mod, numeric_result),
        BinaryOp::Pow => (Opcode::Pow, numeric_result),
        BinaryOp::Eq => (Opcode::Eq, Ty::Bool),
        BinaryOp::Neq => (Opcode::Neq, Ty::Bool),
        BinaryOp::Lt => (Opcode::Lt, Ty::Bool),
        BinaryOp::Gt => (Opcode::Gt, Ty::Bool),
        BinaryOp::Le => (Opcode::LtEq, Ty::Bool),
        BinaryOp::Ge => (Opcode::GtEq, Ty::Bool),
        BinaryOp::And => (Opcode::And, Ty::Bool),
        BinaryOp::Or => (Opcode::Or, Ty::Bool),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use via_core::DiagnosticBus;

    fn compile_src<'a>(arena: &'a Arena, src: &'a str, opt_level: u8) -> (CompiledUnit<'a>, Vec<String>) {
        let tokens = via_syntax::lex(src);
        let mut diagnostics = DiagnosticBus::new();
        let statements = via_syntax::parse(arena, &tokens, &mut diagnostics);
        let unit = compile(arena, statements, opt_level, &mut diagnostics);
        (unit, diagnostics.into_records().iter().map(|d| d.message.clone()).collect())
    }

    #[test]
    fn folds_constant_arithmetic_at_opt_level_one() {
        let arena = Arena::new();
        let (unit, errors) = compile_src(&arena, "print 1 + 2", 1);
        assert!(errors.is_empty());
        assert!(unit.instructions.iter().any(|i| i.op == Opcode::Print));
    }

    #[test]
    fn division_by_zero_in_constant_expression_is_reported() {
        let arena = Arena::new();
        let (_unit, errors) = compile_src(&arena, "print 1 / 0", 1);
        assert!(errors.iter().any(|m| m.contains("division by zero")));
    }

    #[test]
    fn assigning_to_undeclared_const_local_is_rejected() {
        let arena = Arena::new();
        let (_unit, errors) = compile_src(&arena, "local const x = 1 x = 2", 0);
        assert!(errors.iter().any(|m| m.contains("const")));
    }

    #[test]
    fn while_loop_emits_labelled_control_flow() {
        let arena = Arena::new();
        let (unit, errors) = compile_src(&arena, "local x = 10 while x > 0 { x = x - 1 } print x", 0);
        assert!(errors.is_empty());
        assert!(unit.instructions.iter().any(|i| i.op == Opcode::LJmpIfN));
        assert!(unit.instructions.iter().any(|i| i.op == Opcode::Lbl));
    }

    #[test]
    fn recursive_function_compiles_without_unknown_name_errors() {
        let arena = Arena::new();
        let (_unit, errors) = compile_src(
            &arena,
            "fn f(n: int) -> int { if n < 2 : return n return f(n-1)+f(n-2) } print f(10)",
            0,
        );
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let arena = Arena::new();
        let (_unit, errors) = compile_src(&arena, "break", 0);
        assert!(errors.iter().any(|m| m.contains("break")));
    }

    #[test]
    fn array_index_assignment_compiles() {
        let arena = Arena::new();
        let (unit, errors) = compile_src(&arena, "local a = [1,2,3] a[5] = 9 print #a", 0);
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
        assert!(unit.instructions.iter().any(|i| i.op == Opcode::SetArr));
        assert!(unit.instructions.iter().any(|i| i.op == Opcode::LenArr));
    }
}
