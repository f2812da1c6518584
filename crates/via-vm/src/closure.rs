//! Functions, closures, and upvalues.
//!
//! A `Function` is a view into the shared instruction stream; a `Closure`
//! pairs a `Callable` with the upvalues it captured at construction time.
//! `UpValueState`'s open/closed transition: an open upvalue shares a call
//! frame's local cell, a closed one owns a snapshot copied out of it —
//! independent of the frame's own lifetime from that point on.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::RuntimeError;
use crate::value::Value;

/// A user-defined function: an address range into the program's flat
/// instruction stream, paired with a source line for diagnostics and a
/// debug name.
pub struct Function {
    pub entry: usize,
    pub instr_count: usize,
    pub line: u32,
    pub name: Rc<str>,
    pub arity: u16,
    /// Cosmetic only: set on a function compiled as the sole body of a
    /// `try`-guarded call,
    /// rendered by the disassembler/debug name table, never read by
    /// dispatch (`try` already lowers to `PCALL`, which carries its own
    /// `is_protected` flag on the *call frame*, not the function).
    pub is_error_handler: bool,
}

pub type NativeFunc = dyn Fn(&[Value]) -> Result<Value, RuntimeError>;

/// A host-provided function — `print`/`error` dispatch directly as
/// dedicated opcodes rather than going through this path (see
/// `via-vm::vm`), but `NativeFn` stays a first-class `Callable` arm so any
/// future host intrinsic can be wired in without widening the sum type.
pub struct NativeFn {
    pub name: Rc<str>,
    pub arity: u16,
    pub func: Rc<NativeFunc>,
}

impl Clone for NativeFn {
    fn clone(&self) -> Self {
        Self { name: Rc::clone(&self.name), arity: self.arity, func: Rc::clone(&self.func) }
    }
}

/// Sum of user function and native function.
#[derive(Clone)]
pub enum Callable {
    Function(Rc<Function>),
    Native(NativeFn),
}

impl Callable {
    #[must_use]
    pub fn arity(&self) -> u16 {
        match self {
            Self::Function(f) => f.arity,
            Self::Native(n) => n.arity,
        }
    }

    #[must_use]
    pub fn name(&self) -> Rc<str> {
        match self {
            Self::Function(f) => Rc::clone(&f.name),
            Self::Native(n) => Rc::clone(&n.name),
        }
    }
}

/// An upvalue's state.
pub enum UpValueState {
    /// Still referencing a live call frame's local cell; reads/writes go
    /// through it, so mutations from either side are visible to both.
    Open { frame_slot: Rc<RefCell<Value>> },
    /// The referenced value has been copied into the upvalue's own storage.
    Closed(Value),
}

pub struct UpValue(RefCell<UpValueState>);

impl UpValue {
    #[must_use]
    pub fn open(frame_slot: Rc<RefCell<Value>>) -> Rc<Self> {
        Rc::new(Self(RefCell::new(UpValueState::Open { frame_slot })))
    }

    #[must_use]
    pub fn get(&self) -> Value {
        match &*self.0.borrow() {
            UpValueState::Open { frame_slot } => frame_slot.borrow().clone(),
            UpValueState::Closed(value) => value.clone(),
        }
    }

    pub fn set(&self, value: Value) {
        match &mut *self.0.borrow_mut() {
            UpValueState::Open { frame_slot } => *frame_slot.borrow_mut() = value,
            UpValueState::Closed(slot) => *slot = value,
        }
    }

    /// Whether this upvalue is still open over exactly `cell`, used to dedup
    /// captures of the same local slot and to find upvalues a popped frame
    /// must close.
    #[must_use]
    pub fn shares_cell(&self, cell: &Rc<RefCell<Value>>) -> bool {
        match &*self.0.borrow() {
            UpValueState::Open { frame_slot } => Rc::ptr_eq(frame_slot, cell),
            UpValueState::Closed(_) => false,
        }
    }

    /// Copies the currently-referenced value into owned storage and drops
    /// the shared frame cell, since the prior stack slot is no longer
    /// referenced. A no-op if already closed.
    pub fn close(&self) {
        let already_closed = matches!(&*self.0.borrow(), UpValueState::Closed(_));
        if already_closed {
            return;
        }
        let current = self.get();
        *self.0.borrow_mut() = UpValueState::Closed(current);
    }
}

/// A callable paired with the upvalues it closed over at construction.
/// Function equality is identity — `Rc::ptr_eq` on the closure, not on the
/// callable it wraps.
pub struct Closure {
    pub callable: Callable,
    pub upvalues: Vec<Rc<UpValue>>,
}

impl Closure {
    #[must_use]
    pub fn new(callable: Callable, upvalues: Vec<Rc<UpValue>>) -> Self {
        Self { callable, upvalues }
    }
}
