//! Call frames and the call stack.

use std::cell::RefCell;
use std::rc::Rc;

use via_core::limits::{MAX_CALL_FRAMES, MAX_LOCALS};

use crate::closure::{Closure, UpValue};
use crate::error::RuntimeError;
use crate::value::Value;

/// One activation record. `registers` and `locals` are both per-frame (the
/// register file is a `Vec<Value>` per call frame, not a single flat
/// 16-bit-addressed global array); `locals` slots are individually boxed
/// in `Rc<RefCell<_>>` cells so an `UpValue` can share one directly while
/// it is open.
pub struct CallFrame {
    pub closure: Rc<Closure>,
    pub pc: usize,
    pub return_pc: usize,
    pub return_reg: u16,
    pub is_protected: bool,
    registers: Vec<Value>,
    locals: Vec<Rc<RefCell<Value>>>,
    pub args: Vec<Value>,
    open_upvalues: Vec<Rc<UpValue>>,
}

impl CallFrame {
    #[must_use]
    pub fn new(closure: Rc<Closure>, entry: usize, return_pc: usize, return_reg: u16, is_protected: bool, args: Vec<Value>) -> Self {
        Self {
            closure,
            pc: entry,
            return_pc,
            return_reg,
            is_protected,
            registers: Vec::new(),
            locals: Vec::new(),
            args,
            open_upvalues: Vec::new(),
        }
    }

    #[must_use]
    pub fn register(&self, idx: u16) -> Value {
        self.registers.get(idx as usize).cloned().unwrap_or(Value::Nil)
    }

    pub fn set_register(&mut self, idx: u16, value: Value) {
        let idx = idx as usize;
        if idx >= self.registers.len() {
            self.registers.resize(idx + 1, Value::Nil);
        }
        self.registers[idx] = value;
    }

    #[must_use]
    pub fn arg(&self, idx: u16) -> Value {
        self.args.get(idx as usize).cloned().unwrap_or(Value::Nil)
    }

    /// `PUSH reg`: appends a new boxed local slot holding a clone of
    /// `value`. Slot numbers are assigned by the compiler as
    /// `locals.len()` at the point of declaration (`via-compiler::symbols`),
    /// so this always lands at the slot GETLOCAL/SETLOCAL expect.
    pub fn push_local(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.locals.len() >= MAX_LOCALS {
            return Err(RuntimeError::LocalsOverflow);
        }
        self.locals.push(Rc::new(RefCell::new(value)));
        Ok(())
    }

    /// `DROP`: pops the top local, closing any upvalue that still shares
    /// its cell so the `Rc<RefCell<Value>>` can actually
    /// be freed rather than kept alive by a dangling open reference.
    pub fn drop_local(&mut self) {
        if let Some(slot) = self.locals.pop() {
            self.open_upvalues.retain(|uv| {
                let shares = uv.shares_cell(&slot);
                if shares {
                    uv.close();
                }
                !shares
            });
        }
    }

    #[must_use]
    pub fn local(&self, slot: u16) -> Value {
        self.locals.get(slot as usize).map_or(Value::Nil, |cell| cell.borrow().clone())
    }

    pub fn set_local(&mut self, slot: u16, value: Value) {
        if let Some(cell) = self.locals.get(slot as usize) {
            *cell.borrow_mut() = value;
        }
    }

    /// Shares (or creates) an open upvalue over local slot `slot`, used
    /// when a nested `CLOSURE` captures `is_local = true`.
    pub fn capture_local(&mut self, slot: u16) -> Option<Rc<UpValue>> {
        let cell = self.locals.get(slot as usize)?.clone();
        if let Some(existing) = self.open_upvalues.iter().find(|uv| uv.shares_cell(&cell)) {
            return Some(Rc::clone(existing));
        }
        let upvalue = UpValue::open(cell);
        self.open_upvalues.push(Rc::clone(&upvalue));
        Some(upvalue)
    }

    /// Closes every upvalue still open over this frame's locals, called
    /// just before the frame leaves the call stack.
    pub fn close_all_upvalues(&mut self) {
        for upvalue in &self.open_upvalues {
            upvalue.close();
        }
        self.open_upvalues.clear();
    }
}

/// Fixed-capacity call stack.
#[derive(Default)]
pub struct CallStack {
    frames: Vec<CallFrame>,
}

impl CallStack {
    #[must_use]
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    pub fn push(&mut self, frame: CallFrame) -> Result<(), RuntimeError> {
        if self.frames.len() >= MAX_CALL_FRAMES {
            return Err(RuntimeError::StackOverflow);
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<CallFrame> {
        self.frames.pop()
    }

    #[must_use]
    pub fn current(&self) -> Option<&CallFrame> {
        self.frames.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut CallFrame> {
        self.frames.last_mut()
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Index from the top, used when writing a return value into the
    /// caller's register file after a frame pops.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut CallFrame> {
        self.frames.get_mut(index)
    }

    #[must_use]
    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }
}
