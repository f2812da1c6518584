//! The dispatch loop: a register machine that steps one [`Instruction`] at
//! a time against the current [`CallFrame`]. Catchable runtime conditions
//! go through an in-band error flag and an explicit unwind step rather than
//! a host-language exception — `Result`-shaped control flow over
//! `panic!`/`catch_unwind`, generalized here to a resumable loop since
//! `PCALL`/`try` must resume execution at the caller, not merely report
//! failure once.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::io::Write;
use std::rc::Rc;

use via_compiler::{join_f32, join_i32, ConstValue, Instruction, Opcode};

use crate::closure::{Callable, Closure, Function};
use crate::error::RuntimeError;
use crate::frame::{CallFrame, CallStack};
use crate::program::Program;
use crate::value::{VArray, VDict, Value};

/// What the dispatch loop does after one instruction.
enum Flow {
    Advance,
    /// The current frame's `pc` was already repositioned by the handler
    /// (a taken branch, a pushed/popped call frame); don't touch it again.
    Switched,
    Halt(i32),
    Raise(RuntimeError),
}

/// Everything a running program needs beyond the instruction stream itself:
/// the call stack, the global namespace, and where `PRINT` writes to.
pub struct Vm {
    stack: CallStack,
    globals: HashMap<String, Value>,
    output: Box<dyn Write>,
}

impl Vm {
    #[must_use]
    pub fn new(output: Box<dyn Write>) -> Self {
        Self { stack: CallStack::new(), globals: HashMap::new(), output }
    }

    /// Runs `program` to completion, returning the process exit code
    /// (`EXIT`'s implicit `0`, or whatever a future exit-code opcode would
    /// carry) or the traceback of an error no `try`/`PCALL` caught.
    pub fn run(&mut self, program: &Program<'_>) -> Result<i32, RuntimeError> {
        let entry = Rc::new(Function {
            entry: 0,
            instr_count: program.instructions.len(),
            line: 0,
            name: Rc::from("main"),
            arity: 0,
            is_error_handler: false,
        });
        let closure = Rc::new(Closure::new(Callable::Function(entry), Vec::new()));
        self.stack.push(CallFrame::new(closure, 0, 0, 0, false, Vec::new()))?;

        loop {
            let Some(frame) = self.stack.current() else { return Ok(0) };
            let pc = frame.pc;
            let Some(instr) = program.instructions.get(pc).copied() else {
                return Err(RuntimeError::PcOutOfBounds);
            };

            match self.dispatch(program, instr)? {
                Flow::Advance => {
                    if let Some(frame) = self.stack.current_mut() {
                        frame.pc += 1;
                    }
                }
                Flow::Switched => {}
                Flow::Halt(code) => return Ok(code),
                Flow::Raise(err) => {
                    if let Some(code) = self.unwind(&err)? {
                        return Ok(code);
                    }
                }
            }
        }
    }

    /// Pops frames (closing their upvalues) looking for a protected one.
    /// Returns `Ok(None)` once execution should resume inside the caught
    /// frame; returns `Ok(Some(code))` only when the stack is exhausted and
    /// `err` turns out to be unrecoverable — never actually reached since
    /// that case returns `Err` instead, but kept as `Result` for `?` on the
    /// traceback-building step below.
    fn unwind(&mut self, err: &RuntimeError) -> Result<Option<i32>, RuntimeError> {
        let traceback: Vec<String> = self
            .stack
            .frames()
            .iter()
            .rev()
            .map(|frame| format!("{} (line {})", frame.closure.callable.name(), frame.closure.callable.callable_line()))
            .collect();

        while let Some(mut frame) = self.stack.pop() {
            let protected = frame.is_protected;
            let return_pc = frame.return_pc;
            let return_reg = frame.return_reg;
            frame.close_all_upvalues();
            if protected {
                if let Some(caller) = self.stack.current_mut() {
                    caller.set_register(return_reg, err.as_value());
                    caller.pc = return_pc;
                    return Ok(None);
                }
            }
        }

        Err(RuntimeError::Unhandled { message: err.to_string(), traceback })
    }

    fn dispatch(&mut self, program: &Program<'_>, instr: Instruction) -> Result<Flow, RuntimeError> {
        use Opcode as Op;
        match instr.op {
            Op::Nop | Op::Lbl => Ok(Flow::Advance),
            Op::Exit => Ok(Flow::Halt(0)),

            Op::Add => self.arith(instr, ArithOp::Add),
            Op::Sub => self.arith(instr, ArithOp::Sub),
            Op::Mul => self.arith(instr, ArithOp::Mul),
            Op::Div => self.arith(instr, ArithOp::Div),
            Op::Mod => self.arith(instr, ArithOp::Mod),
            Op::Pow => self.arith(instr, ArithOp::Pow),
            Op::AddI | Op::AddF => self.arith_imm(instr, ArithOp::Add),
            Op::SubI | Op::SubF => self.arith_imm(instr, ArithOp::Sub),
            Op::MulI | Op::MulF => self.arith_imm(instr, ArithOp::Mul),
            Op::DivI | Op::DivF => self.arith_imm(instr, ArithOp::Div),
            Op::ModI | Op::ModF => self.arith_imm(instr, ArithOp::Mod),
            Op::PowI | Op::PowF => self.arith_imm(instr, ArithOp::Pow),
            Op::Neg => {
                let value = self.reg(instr.a);
                let negated = match value {
                    Value::Int(n) => Value::Int(n.wrapping_neg()),
                    Value::Float(f) => Value::Float(-f),
                    other => return Ok(Flow::Raise(type_mismatch("int or float", &other, "NEG"))),
                };
                self.set_reg(instr.a, negated);
                Ok(Flow::Advance)
            }

            Op::Mov => {
                self.set_reg(instr.a, self.reg(instr.b));
                Ok(Flow::Advance)
            }
            Op::LoadK => {
                let value = self.const_value(program, instr.b)?;
                self.set_reg(instr.a, value);
                Ok(Flow::Advance)
            }
            Op::LoadNil => {
                self.set_reg(instr.a, Value::Nil);
                Ok(Flow::Advance)
            }
            Op::LoadI => {
                self.set_reg(instr.a, Value::Int(join_i32(instr.b, instr.c)));
                Ok(Flow::Advance)
            }
            Op::LoadF => {
                self.set_reg(instr.a, Value::Float(join_f32(instr.b, instr.c)));
                Ok(Flow::Advance)
            }
            Op::LoadBt => {
                self.set_reg(instr.a, Value::Bool(true));
                Ok(Flow::Advance)
            }
            Op::LoadBf => {
                self.set_reg(instr.a, Value::Bool(false));
                Ok(Flow::Advance)
            }
            Op::LoadArr => {
                self.set_reg(instr.a, Value::array(VArray::with_capacity(via_core::limits::ARRAY_INITIAL_CAPACITY)));
                Ok(Flow::Advance)
            }
            Op::LoadDict => {
                self.set_reg(instr.a, Value::dict(VDict::with_capacity(via_core::limits::DICT_INITIAL_CAPACITY)));
                Ok(Flow::Advance)
            }
            Op::LoadType => {
                let name = match self.const_value(program, instr.b)? {
                    Value::String(s) => s.borrow().display().into_owned(),
                    other => return Ok(Flow::Raise(type_mismatch("string", &other, "LOADTYPE"))),
                };
                self.set_reg(instr.a, Value::Type(Rc::from(name)));
                Ok(Flow::Advance)
            }

            Op::Push | Op::PushK | Op::PushNil | Op::PushI | Op::PushF | Op::PushBt | Op::PushBf => {
                let value = match instr.op {
                    Op::Push => self.reg(instr.a),
                    Op::PushK => self.const_value(program, instr.a)?,
                    Op::PushNil => Value::Nil,
                    Op::PushI => Value::Int(join_i32(instr.a, instr.b)),
                    Op::PushF => Value::Float(join_f32(instr.a, instr.b)),
                    Op::PushBt => Value::Bool(true),
                    Op::PushBf => Value::Bool(false),
                    _ => unreachable!(),
                };
                self.current_frame_mut()?.push_local(value)?;
                Ok(Flow::Advance)
            }
            Op::Drop => {
                self.current_frame_mut()?.drop_local();
                Ok(Flow::Advance)
            }

            Op::GetLocal => {
                let value = self.current_frame()?.local(instr.b);
                self.set_reg(instr.a, value);
                Ok(Flow::Advance)
            }
            Op::SetLocal => {
                let value = self.reg(instr.a);
                self.current_frame_mut()?.set_local(instr.b, value);
                Ok(Flow::Advance)
            }
            Op::GetArg => {
                let value = self.current_frame()?.arg(instr.b);
                self.set_reg(instr.a, value);
                Ok(Flow::Advance)
            }
            Op::GetGlobal => {
                let key = self.reg(instr.b);
                let name = display_string(&key);
                let value = self.globals.get(&name).cloned().unwrap_or(Value::Nil);
                self.set_reg(instr.a, value);
                Ok(Flow::Advance)
            }
            Op::SetGlobal => {
                let value = self.reg(instr.a);
                let name = display_string(&self.reg(instr.b));
                self.globals.insert(name, value);
                Ok(Flow::Advance)
            }
            Op::GetUpv => {
                let upvalue = self.current_closure()?.upvalues.get(instr.b as usize).cloned().ok_or(RuntimeError::LocalOutOfBounds(instr.b))?;
                self.set_reg(instr.a, upvalue.get());
                Ok(Flow::Advance)
            }
            Op::SetUpv => {
                let value = self.reg(instr.a);
                let upvalue = self.current_closure()?.upvalues.get(instr.b as usize).cloned().ok_or(RuntimeError::LocalOutOfBounds(instr.b))?;
                upvalue.set(value);
                Ok(Flow::Advance)
            }

            Op::Eq => {
                let result = self.reg(instr.b).shallow_eq(&self.reg(instr.c));
                self.set_reg(instr.a, Value::Bool(result));
                Ok(Flow::Advance)
            }
            Op::Neq => {
                let result = !self.reg(instr.b).shallow_eq(&self.reg(instr.c));
                self.set_reg(instr.a, Value::Bool(result));
                Ok(Flow::Advance)
            }
            Op::Deq => {
                let result = self.reg(instr.b).deep_eq(&self.reg(instr.c));
                self.set_reg(instr.a, Value::Bool(result));
                Ok(Flow::Advance)
            }
            Op::And => {
                let result = self.reg(instr.b).is_truthy() && self.reg(instr.c).is_truthy();
                self.set_reg(instr.a, Value::Bool(result));
                Ok(Flow::Advance)
            }
            Op::Or => {
                let result = self.reg(instr.b).is_truthy() || self.reg(instr.c).is_truthy();
                self.set_reg(instr.a, Value::Bool(result));
                Ok(Flow::Advance)
            }
            Op::Not => {
                let result = !self.reg(instr.a).is_truthy();
                self.set_reg(instr.a, Value::Bool(result));
                Ok(Flow::Advance)
            }
            Op::Lt => self.compare(instr, |ord| ord == Ordering::Less),
            Op::Gt => self.compare(instr, |ord| ord == Ordering::Greater),
            Op::LtEq => self.compare(instr, |ord| ord != Ordering::Greater),
            Op::GtEq => self.compare(instr, |ord| ord != Ordering::Less),

            Op::Jmp => Ok(self.relative_jump(instr.a as i16)),
            Op::JmpIf => Ok(self.conditional_relative_jump(instr.a, instr.b as i16, true)),
            Op::JmpIfN => Ok(self.conditional_relative_jump(instr.a, instr.b as i16, false)),
            Op::JmpIfEq => self.comparison_relative_jump(instr, |ord| ord == Ordering::Equal),
            Op::JmpIfNeq => self.comparison_relative_jump(instr, |ord| ord != Ordering::Equal),
            Op::JmpIfLt => self.comparison_relative_jump(instr, |ord| ord == Ordering::Less),
            Op::JmpIfGt => self.comparison_relative_jump(instr, |ord| ord == Ordering::Greater),
            Op::JmpIfLtEq => self.comparison_relative_jump(instr, |ord| ord != Ordering::Greater),
            Op::JmpIfGtEq => self.comparison_relative_jump(instr, |ord| ord != Ordering::Less),
            Op::LJmp => self.label_jump(program, instr.a),
            Op::LJmpIf => {
                let taken = self.reg(instr.a).is_truthy();
                if taken {
                    self.label_jump(program, instr.b)
                } else {
                    Ok(Flow::Advance)
                }
            }
            Op::LJmpIfN => {
                let taken = !self.reg(instr.a).is_truthy();
                if taken {
                    self.label_jump(program, instr.b)
                } else {
                    Ok(Flow::Advance)
                }
            }

            Op::Call | Op::PCall => self.call(instr),
            Op::Ret => {
                let value = self.reg(instr.a);
                Ok(self.do_return(value))
            }
            Op::RetBt => Ok(self.do_return(Value::Bool(true))),
            Op::RetBf => Ok(self.do_return(Value::Bool(false))),
            Op::RetNil => Ok(self.do_return(Value::Nil)),

            Op::Closure => self.make_closure(program, instr),
            Op::Capture => Err(RuntimeError::InvalidOpcode(instr.op as u16)),

            Op::GetArr => {
                let target = self.reg(instr.b);
                let index = self.reg(instr.c);
                match array_get(&target, &index) {
                    Ok(value) => {
                        self.set_reg(instr.a, value);
                        Ok(Flow::Advance)
                    }
                    Err(err) => Ok(Flow::Raise(err)),
                }
            }
            Op::SetArr => {
                let target = self.reg(instr.a);
                let index = self.reg(instr.b);
                let value = self.reg(instr.c);
                match array_set(&target, &index, value) {
                    Ok(()) => Ok(Flow::Advance),
                    Err(err) => Ok(Flow::Raise(err)),
                }
            }
            Op::LenArr => {
                let len = match self.reg(instr.b) {
                    Value::Array(a) => a.borrow().len() as i32,
                    other => return Ok(Flow::Raise(type_mismatch("array", &other, "LENARR"))),
                };
                self.set_reg(instr.a, Value::Int(len));
                Ok(Flow::Advance)
            }
            Op::NextArr => {
                let target = self.reg(instr.b);
                let cursor = self.reg(instr.c);
                match array_next(&target, &cursor) {
                    Ok((value, next_cursor)) => {
                        self.set_reg(instr.a, value);
                        self.set_reg(instr.c, next_cursor);
                        Ok(Flow::Advance)
                    }
                    Err(err) => Ok(Flow::Raise(err)),
                }
            }
            Op::GetDict => {
                let target = self.reg(instr.b);
                let key = self.reg(instr.c);
                match dict_get(&target, &key) {
                    Ok(value) => {
                        self.set_reg(instr.a, value);
                        Ok(Flow::Advance)
                    }
                    Err(err) => Ok(Flow::Raise(err)),
                }
            }
            Op::SetDict => {
                let target = self.reg(instr.a);
                let key = self.reg(instr.b);
                let value = self.reg(instr.c);
                match dict_set(&target, &key, value) {
                    Ok(()) => Ok(Flow::Advance),
                    Err(err) => Ok(Flow::Raise(err)),
                }
            }
            Op::LenDict => {
                let len = match self.reg(instr.b) {
                    Value::Dict(d) => d.borrow().len() as i32,
                    other => return Ok(Flow::Raise(type_mismatch("dict", &other, "LENDICT"))),
                };
                self.set_reg(instr.a, Value::Int(len));
                Ok(Flow::Advance)
            }
            Op::NextDict => {
                let target = self.reg(instr.b);
                let cursor = self.reg(instr.c);
                match dict_next(&target, &cursor) {
                    Ok((value, next_cursor)) => {
                        self.set_reg(instr.a, value);
                        self.set_reg(instr.c, next_cursor);
                        Ok(Flow::Advance)
                    }
                    Err(err) => Ok(Flow::Raise(err)),
                }
            }

            Op::ConStr => {
                let lhs = self.reg(instr.a);
                let rhs = self.reg(instr.b);
                self.set_reg(instr.a, Value::string(format!("{}{}", lhs.display(), rhs.display())));
                Ok(Flow::Advance)
            }
            Op::GetStr => {
                let target = self.reg(instr.b);
                let index = self.reg(instr.c);
                match string_get(&target, &index) {
                    Ok(value) => {
                        self.set_reg(instr.a, value);
                        Ok(Flow::Advance)
                    }
                    Err(err) => Ok(Flow::Raise(err)),
                }
            }
            Op::SetStr => {
                let target = self.reg(instr.a);
                let index = self.reg(instr.b);
                let value = self.reg(instr.c);
                match string_set(&target, &index, value) {
                    Ok(()) => Ok(Flow::Advance),
                    Err(err) => Ok(Flow::Raise(err)),
                }
            }
            Op::LenStr => {
                let len = match self.reg(instr.b) {
                    Value::String(s) => s.borrow().len() as i32,
                    other => return Ok(Flow::Raise(type_mismatch("string", &other, "LENSTR"))),
                };
                self.set_reg(instr.a, Value::Int(len));
                Ok(Flow::Advance)
            }

            Op::ICast => match to_int(&self.reg(instr.b)) {
                Ok(v) => {
                    self.set_reg(instr.a, v);
                    Ok(Flow::Advance)
                }
                Err(err) => Ok(Flow::Raise(err)),
            },
            Op::FCast => match to_float(&self.reg(instr.b)) {
                Ok(v) => {
                    self.set_reg(instr.a, v);
                    Ok(Flow::Advance)
                }
                Err(err) => Ok(Flow::Raise(err)),
            },
            Op::StrCast => {
                let value = self.reg(instr.b);
                self.set_reg(instr.a, Value::string(value.display()));
                Ok(Flow::Advance)
            }
            Op::BCast => {
                let truthy = self.reg(instr.b).is_truthy();
                self.set_reg(instr.a, Value::Bool(truthy));
                Ok(Flow::Advance)
            }

            Op::Print => {
                let value = self.reg(instr.a);
                writeln!(self.output, "{}", value.display()).ok();
                Ok(Flow::Advance)
            }
            Op::Error => {
                let value = self.reg(instr.a);
                Ok(Flow::Raise(RuntimeError::Raised(value.display())))
            }
            Op::TypeOf => {
                let name = self.reg(instr.b).type_name();
                self.set_reg(instr.a, Value::string(name));
                Ok(Flow::Advance)
            }
        }
    }

    fn reg(&self, idx: u16) -> Value {
        self.stack.current().map_or(Value::Nil, |frame| frame.register(idx))
    }

    fn set_reg(&mut self, idx: u16, value: Value) {
        if let Some(frame) = self.stack.current_mut() {
            frame.set_register(idx, value);
        }
    }

    fn current_frame(&self) -> Result<&CallFrame, RuntimeError> {
        self.stack.current().ok_or(RuntimeError::PcOutOfBounds)
    }

    fn current_frame_mut(&mut self) -> Result<&mut CallFrame, RuntimeError> {
        self.stack.current_mut().ok_or(RuntimeError::PcOutOfBounds)
    }

    fn current_closure(&self) -> Result<&Closure, RuntimeError> {
        Ok(&self.current_frame()?.closure)
    }

    fn const_value(&self, program: &Program<'_>, idx: u16) -> Result<Value, RuntimeError> {
        match program.constants.get(idx as usize) {
            Some(ConstValue::Int(n)) => Ok(Value::Int(*n)),
            Some(ConstValue::Float(f)) => Ok(Value::Float(*f)),
            Some(ConstValue::Bool(b)) => Ok(Value::Bool(*b)),
            Some(ConstValue::String(s)) => Ok(Value::string(*s)),
            None => Err(RuntimeError::ConstantOutOfBounds(idx)),
        }
    }

    fn arith(&mut self, instr: Instruction, kind: ArithOp) -> Result<Flow, RuntimeError> {
        match apply_arith(kind, &self.reg(instr.b), &self.reg(instr.c)) {
            Ok(value) => {
                self.set_reg(instr.a, value);
                Ok(Flow::Advance)
            }
            Err(err) => Ok(Flow::Raise(err)),
        }
    }

    /// The `*I`/`*F` immediate families (§4.5.1): in-place, dst doubles as
    /// the left operand, the right operand is a packed `(hi, lo)` literal
    /// rather than a register. The opcode variant itself (`AddI` vs `AddF`)
    /// only ever tells the compiler which packing the constant used; the
    /// runtime behavior collapses to the same typed-promotion arithmetic
    /// either way once the immediate is unpacked as a `Value`.
    fn arith_imm(&mut self, instr: Instruction, kind: ArithOp) -> Result<Flow, RuntimeError> {
        let immediate = Value::Int(join_i32(instr.b, instr.c));
        let lhs = self.reg(instr.a);
        let rhs = if matches!(lhs, Value::Float(_)) { Value::Float(join_f32(instr.b, instr.c)) } else { immediate };
        match apply_arith(kind, &lhs, &rhs) {
            Ok(value) => {
                self.set_reg(instr.a, value);
                Ok(Flow::Advance)
            }
            Err(err) => Ok(Flow::Raise(err)),
        }
    }

    fn compare(&mut self, instr: Instruction, pred: impl Fn(Ordering) -> bool) -> Result<Flow, RuntimeError> {
        match compare_values(&self.reg(instr.b), &self.reg(instr.c)) {
            Ok(ord) => {
                self.set_reg(instr.a, Value::Bool(pred(ord)));
                Ok(Flow::Advance)
            }
            Err(err) => Ok(Flow::Raise(err)),
        }
    }

    fn relative_jump(&mut self, offset: i16) -> Flow {
        if let Some(frame) = self.stack.current_mut() {
            frame.pc = (frame.pc as i64 + offset as i64) as usize;
        }
        Flow::Switched
    }

    fn conditional_relative_jump(&mut self, cond_reg: u16, offset: i16, when: bool) -> Flow {
        if self.reg(cond_reg).is_truthy() == when {
            self.relative_jump(offset)
        } else {
            Flow::Advance
        }
    }

    fn comparison_relative_jump(&mut self, instr: Instruction, pred: impl Fn(Ordering) -> bool) -> Result<Flow, RuntimeError> {
        match compare_values(&self.reg(instr.a), &self.reg(instr.b)) {
            Ok(ord) if pred(ord) => Ok(self.relative_jump(instr.c as i16)),
            Ok(_) => Ok(Flow::Advance),
            Err(err) => Ok(Flow::Raise(err)),
        }
    }

    fn label_jump(&mut self, program: &Program<'_>, label: u16) -> Result<Flow, RuntimeError> {
        let target = *program.labels.get(&label).ok_or(RuntimeError::PcOutOfBounds)?;
        if let Some(frame) = self.stack.current_mut() {
            frame.pc = target;
        }
        Ok(Flow::Switched)
    }

    /// `CALL`/`PCALL` (§4.5.1): `a` is the callee register, `b` the first of
    /// a contiguous argument window (or `UNUSED_OPERAND` for a zero-arg
    /// call), `c` the register the result lands in. The instruction itself
    /// carries no argument count — the callee's own declared arity says how
    /// many registers starting at `b` to read, matching how `compile_call`
    /// always moves exactly `arity`-many values into the window before
    /// emitting `CALL`.
    fn call(&mut self, instr: Instruction) -> Result<Flow, RuntimeError> {
        let callee = self.reg(instr.a);
        let Value::Function(closure) = callee else {
            return Ok(Flow::Raise(RuntimeError::NotCallable { type_name: callee.type_name() }));
        };
        let protected = instr.op == Opcode::PCall;
        let arity = closure.callable.arity();
        let args: Vec<Value> = if instr.b == via_core::limits::UNUSED_OPERAND {
            Vec::new()
        } else {
            (0..arity).map(|i| self.reg(instr.b + i)).collect()
        };

        match &closure.callable {
            Callable::Function(function) => {
                let caller_pc = self.current_frame()?.pc;
                let frame = CallFrame::new(Rc::clone(&closure), function.entry, caller_pc + 1, instr.c, protected, args);
                match self.stack.push(frame) {
                    Ok(()) => Ok(Flow::Switched),
                    Err(err) => Ok(Flow::Raise(err)),
                }
            }
            Callable::Native(native) => match (native.func)(&args) {
                Ok(value) => {
                    self.set_reg(instr.c, value);
                    Ok(Flow::Advance)
                }
                Err(err) if protected => {
                    self.set_reg(instr.c, err.as_value());
                    Ok(Flow::Advance)
                }
                Err(err) => Ok(Flow::Raise(err)),
            },
        }
    }

    fn do_return(&mut self, value: Value) -> Flow {
        let Some(mut frame) = self.stack.pop() else { return Flow::Halt(0) };
        frame.close_all_upvalues();
        match self.stack.current_mut() {
            Some(caller) => {
                caller.set_register(frame.return_reg, value);
                caller.pc = frame.return_pc;
                Flow::Switched
            }
            None => Flow::Halt(0),
        }
    }

    /// `CLOSURE dst,len,argc` (§4.5.1): the `len`-sized block of
    /// instructions immediately after this one is the function body,
    /// followed inline by one `CAPTURE is_local,index` per upvalue; this
    /// reads those sub-instructions without executing them, builds the
    /// closure's upvalue list, and skips the frame's `pc` past the whole
    /// block.
    fn make_closure(&mut self, program: &Program<'_>, instr: Instruction) -> Result<Flow, RuntimeError> {
        let body_start = self.current_frame()?.pc + 1;
        let len = instr.b as usize;
        let mut upvalues = Vec::new();
        for offset in 0..len {
            let sub = program.instructions.get(body_start + offset).copied().ok_or(RuntimeError::PcOutOfBounds)?;
            if sub.op != Opcode::Capture {
                continue;
            }
            let is_local = sub.a != 0;
            let index = sub.b;
            let upvalue = if is_local {
                self.current_frame_mut()?.capture_local(index).ok_or(RuntimeError::LocalOutOfBounds(index))?
            } else {
                let outer = self.current_closure()?.upvalues.get(index as usize).cloned().ok_or(RuntimeError::LocalOutOfBounds(index))?;
                outer.close();
                outer
            };
            upvalues.push(upvalue);
        }

        let function = Rc::new(Function {
            entry: body_start,
            instr_count: len,
            line: 0,
            name: Rc::from("<closure>"),
            arity: instr.c,
            is_error_handler: false,
        });
        let closure = Rc::new(Closure::new(Callable::Function(function), upvalues));
        self.set_reg(instr.a, Value::Function(closure));
        if let Some(frame) = self.stack.current_mut() {
            frame.pc = body_start + len;
        }
        Ok(Flow::Switched)
    }
}

impl Callable {
    fn callable_line(&self) -> u32 {
        match self {
            Self::Function(f) => f.line,
            Self::Native(_) => 0,
        }
    }
}

#[derive(Clone, Copy)]
enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

fn as_f32(value: &Value, op: &'static str) -> Result<f32, RuntimeError> {
    match value {
        Value::Int(n) => Ok(*n as f32),
        Value::Float(f) => Ok(*f),
        other => Err(type_mismatch("int or float", other, op)),
    }
}

/// Type-promotion rules for `+ - * / % ^`: int op int stays int (wrapping,
/// per the compiler's own constant-folding discipline); either operand a
/// float promotes the whole operation to float.
fn apply_arith(kind: ArithOp, lhs: &Value, rhs: &Value) -> Result<Value, RuntimeError> {
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        return match kind {
            ArithOp::Add => Ok(Value::Int(a.wrapping_add(*b))),
            ArithOp::Sub => Ok(Value::Int(a.wrapping_sub(*b))),
            ArithOp::Mul => Ok(Value::Int(a.wrapping_mul(*b))),
            ArithOp::Div => {
                if *b == 0 {
                    Err(RuntimeError::DivisionByZero)
                } else {
                    Ok(Value::Int(a.wrapping_div(*b)))
                }
            }
            ArithOp::Mod => {
                if *b == 0 {
                    Err(RuntimeError::ModuloByZero)
                } else {
                    Ok(Value::Int(a.wrapping_rem(*b)))
                }
            }
            ArithOp::Pow => Ok(Value::Int(a.wrapping_pow((*b).max(0) as u32))),
        };
    }

    let a = as_f32(lhs, "arithmetic")?;
    let b = as_f32(rhs, "arithmetic")?;
    match kind {
        ArithOp::Add => Ok(Value::Float(a + b)),
        ArithOp::Sub => Ok(Value::Float(a - b)),
        ArithOp::Mul => Ok(Value::Float(a * b)),
        ArithOp::Div => {
            if b == 0.0 {
                Err(RuntimeError::DivisionByZero)
            } else {
                Ok(Value::Float(a / b))
            }
        }
        ArithOp::Mod => {
            if b == 0.0 {
                Err(RuntimeError::ModuloByZero)
            } else {
                Ok(Value::Float(a % b))
            }
        }
        ArithOp::Pow => Ok(Value::Float(a.powf(b))),
    }
}

fn compare_values(lhs: &Value, rhs: &Value) -> Result<Ordering, RuntimeError> {
    match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => Ok(a.borrow().bytes.cmp(&b.borrow().bytes)),
        _ => {
            let a = as_f32(lhs, "comparison")?;
            let b = as_f32(rhs, "comparison")?;
            a.partial_cmp(&b).ok_or(RuntimeError::TypeMismatch { expected: "orderable", got: "NaN", op: "comparison" })
        }
    }
}

fn type_mismatch(expected: &'static str, got: &Value, op: &'static str) -> RuntimeError {
    RuntimeError::TypeMismatch { expected, got: got.type_name(), op }
}

fn display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.borrow().display().into_owned(),
        other => other.display(),
    }
}

fn index_to_usize(index: &Value, op: &'static str) -> Result<usize, RuntimeError> {
    match index {
        Value::Int(n) if *n >= 0 => Ok(*n as usize),
        Value::Int(n) => Err(RuntimeError::IndexOutOfRange { index: *n as i64 }),
        other => Err(type_mismatch("int", other, op)),
    }
}

fn array_get(target: &Value, index: &Value) -> Result<Value, RuntimeError> {
    let Value::Array(arr) = target else { return Err(type_mismatch("array", target, "GETARR")) };
    let idx = index_to_usize(index, "GETARR")?;
    Ok(arr.borrow().get(idx))
}

fn array_set(target: &Value, index: &Value, value: Value) -> Result<(), RuntimeError> {
    let Value::Array(arr) = target else { return Err(type_mismatch("array", target, "SETARR")) };
    let idx = index_to_usize(index, "SETARR")?;
    arr.borrow_mut().set(idx, value);
    Ok(())
}

/// `NEXTARR dst,target,cursor`: the surface grammar never emits this
/// opcode directly (there is no `for`/`foreach` construct), so it is
/// modeled as a stateless iterator step: `cursor` holds the next index to
/// read; returns the element at `cursor` and `cursor + 1`, erroring once
/// `cursor` runs past the array's length.
fn array_next(target: &Value, cursor: &Value) -> Result<(Value, Value), RuntimeError> {
    let Value::Array(arr) = target else { return Err(type_mismatch("array", target, "NEXTARR")) };
    let idx = index_to_usize(cursor, "NEXTARR")?;
    let arr = arr.borrow();
    if idx >= arr.len() {
        return Err(RuntimeError::IndexOutOfRange { index: idx as i64 });
    }
    Ok((arr.get(idx), Value::Int(idx as i32 + 1)))
}

fn dict_get(target: &Value, key: &Value) -> Result<Value, RuntimeError> {
    let Value::Dict(dict) = target else { return Err(type_mismatch("dict", target, "GETDICT")) };
    let Value::String(key) = key else { return Err(type_mismatch("string", key, "GETDICT")) };
    Ok(dict.borrow().get(&key.borrow().display()))
}

fn dict_set(target: &Value, key: &Value, value: Value) -> Result<(), RuntimeError> {
    let Value::Dict(dict) = target else { return Err(type_mismatch("dict", target, "SETDICT")) };
    let Value::String(key) = key else { return Err(type_mismatch("string", key, "SETDICT")) };
    dict.borrow_mut().set(&key.borrow().display(), value);
    Ok(())
}

/// `NEXTDICT dst,target,cursor` — same rationale as [`array_next`], walking
/// the dict's internal slot order (an implementation detail, not the
/// insertion order `DEQ`'s dict ordering question in DESIGN.md is about)
/// and packaging each entry as a two-element `[key, value]` array.
fn dict_next(target: &Value, cursor: &Value) -> Result<(Value, Value), RuntimeError> {
    let Value::Dict(dict) = target else { return Err(type_mismatch("dict", target, "NEXTDICT")) };
    let start = index_to_usize(cursor, "NEXTDICT")?;
    let dict = dict.borrow();
    match dict.next_occupied(start) {
        Some((slot, key, value)) => {
            let pair = Value::array(VArray { values: vec![Value::string(key.as_ref()), value] });
            Ok((pair, Value::Int(slot as i32 + 1)))
        }
        None => Err(RuntimeError::IndexOutOfRange { index: start as i64 }),
    }
}

/// `GETSTR dst,target,index`: addressed by byte offset, reading one byte
/// surfaced as an `int` rather than a one-character string, to keep with
/// `VString`'s byte-oriented storage and `SETSTR`'s own byte-valued
/// counterpart below.
fn string_get(target: &Value, index: &Value) -> Result<Value, RuntimeError> {
    let Value::String(s) = target else { return Err(type_mismatch("string", target, "GETSTR")) };
    let idx = index_to_usize(index, "GETSTR")?;
    s.borrow().get(idx).map(|byte| Value::Int(i32::from(byte))).ok_or(RuntimeError::IndexOutOfRange { index: idx as i64 })
}

fn string_set(target: &Value, index: &Value, value: Value) -> Result<(), RuntimeError> {
    let Value::String(s) = target else { return Err(type_mismatch("string", target, "SETSTR")) };
    let idx = index_to_usize(index, "SETSTR")?;
    let Value::Int(byte) = value else { return Err(type_mismatch("int", &value, "SETSTR")) };
    if !(0..=255).contains(&byte) {
        return Err(RuntimeError::IndexOutOfRange { index: i64::from(byte) });
    }
    if s.borrow_mut().set(idx, byte as u8) {
        Ok(())
    } else {
        Err(RuntimeError::IndexOutOfRange { index: idx as i64 })
    }
}

/// `to_int`'s string case: a standard textual parse; failure raises a VM
/// error rather than silently coercing to `0`.
fn to_int(value: &Value) -> Result<Value, RuntimeError> {
    match value {
        Value::Int(n) => Ok(Value::Int(*n)),
        Value::Float(f) => Ok(Value::Int(*f as i32)),
        Value::Bool(b) => Ok(Value::Int(i32::from(*b))),
        Value::String(s) => {
            let text = s.borrow().display().into_owned();
            text.trim().parse::<i32>().map(Value::Int).map_err(|_| RuntimeError::CastFailed { value: text, target: "int" })
        }
        other => Err(type_mismatch("int-convertible value", other, "ICAST")),
    }
}

fn to_float(value: &Value) -> Result<Value, RuntimeError> {
    match value {
        Value::Int(n) => Ok(Value::Float(*n as f32)),
        Value::Float(f) => Ok(Value::Float(*f)),
        Value::Bool(b) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
        Value::String(s) => {
            let text = s.borrow().display().into_owned();
            text.trim().parse::<f32>().map(Value::Float).map_err(|_| RuntimeError::CastFailed { value: text, target: "float" })
        }
        other => Err(type_mismatch("float-convertible value", other, "FCAST")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use via_compiler::{split_f32, Instruction};

    fn run_instructions(instructions: Vec<Instruction>) -> (Vm, i32) {
        let program = Program::load(instructions, Vec::new());
        let mut vm = Vm::new(Box::new(Vec::new()));
        let code = vm.run(&program).expect("program runs to completion");
        (vm, code)
    }

    #[test]
    fn arithmetic_promotes_to_float_when_either_operand_is_float() {
        let (hi, lo) = split_f32(2.5);
        let instructions = vec![
            Instruction::new(Opcode::LoadI, 0, 0, 5),
            Instruction::new(Opcode::LoadF, 1, hi, lo),
            Instruction::new(Opcode::Add, 2, 0, 1),
            Instruction::nullary(Opcode::Exit),
        ];
        let (mut vm, code) = run_instructions(instructions);
        assert_eq!(code, 0);
        assert!(matches!(vm.stack.current_mut().unwrap().register(2), Value::Float(f) if (f - 7.5).abs() < 1e-6));
    }

    #[test]
    fn division_by_zero_is_catchable_through_pcall() {
        // fn divider(a, b) { return a / b }
        // main: push 10, push 0, pcall divider(10, 0) -> reg 2
        let divider_body = vec![
            Instruction::new(Opcode::GetArg, 0, 0, via_core::limits::UNUSED_OPERAND),
            Instruction::new(Opcode::GetArg, 1, 1, via_core::limits::UNUSED_OPERAND),
            Instruction::new(Opcode::Div, 2, 0, 1),
            Instruction::a_only(Opcode::Ret, 2),
        ];
        let mut instructions = vec![
            Instruction::new(Opcode::Closure, 0, divider_body.len() as u16, 2),
        ];
        instructions.extend(divider_body);
        instructions.push(Instruction::new(Opcode::LoadI, 1, 0, 10));
        instructions.push(Instruction::new(Opcode::LoadI, 2, 0, 0));
        instructions.push(Instruction::ab(Opcode::Mov, 3, 1));
        instructions.push(Instruction::ab(Opcode::Mov, 4, 2));
        instructions.push(Instruction::new(Opcode::PCall, 0, 3, 5));
        instructions.push(Instruction::nullary(Opcode::Exit));

        let (mut vm, code) = run_instructions(instructions);
        assert_eq!(code, 0);
        assert!(matches!(vm.stack.current_mut().unwrap().register(5), Value::String(_)));
    }

    #[test]
    fn unhandled_error_produces_a_traceback() {
        let instructions = vec![
            Instruction::new(Opcode::LoadI, 0, 0, 1),
            Instruction::new(Opcode::LoadI, 1, 0, 0),
            Instruction::new(Opcode::Div, 2, 0, 1),
        ];
        let program = Program::load(instructions, Vec::new());
        let mut vm = Vm::new(Box::new(Vec::new()));
        let err = vm.run(&program).unwrap_err();
        assert!(matches!(err, RuntimeError::Unhandled { .. }));
    }
}
