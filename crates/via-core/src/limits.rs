//! Fixed capacities shared by the compiler and the VM (§3.3, §3.4, §3.6, §4.3).
//!
//! Kept in one place so `via-compiler` (register allocator) and `via-vm`
//! (call stack, locals buffer) agree on the same numbers without duplicating
//! magic constants.

/// Width of the register address space (§4.3: "a fixed 16-bit register
/// space (64k addresses)").
pub const REGISTER_SPACE: usize = 1 << 16;

/// Sentinel for an unused instruction operand (§4.3: "unused operands carry
/// the sentinel 0xFFFF").
pub const UNUSED_OPERAND: u16 = 0xFFFF;

/// Capacity of the call stack (§3.6).
pub const MAX_CALL_FRAMES: usize = 200;

/// Fixed capacity of a call frame's locals buffer (§3.6).
pub const MAX_LOCALS: usize = 200;

/// Initial capacity of a freshly constructed `Array` (§3.4).
pub const ARRAY_INITIAL_CAPACITY: usize = 64;

/// Default capacity of a freshly constructed `Dict` (§3.4).
pub const DICT_INITIAL_CAPACITY: usize = 64;

/// Load factor (numerator over 10) past which a `Dict` doubles its capacity.
pub const DICT_LOAD_FACTOR_NUM: usize = 7;
pub const DICT_LOAD_FACTOR_DEN: usize = 10;

/// Maximum depth of constexpr symbol-chain folding (§4.3.3: "up to a depth
/// of 5").
pub const MAX_CONSTEXPR_FOLD_DEPTH: u32 = 5;
