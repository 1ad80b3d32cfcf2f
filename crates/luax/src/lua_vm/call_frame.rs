// Call frames.

use crate::lua_value::LuaValue;

/// One activation record. `func_slot` is the stack slot holding the closure;
/// for a vararg Lua function the prologue relocates `func_slot`/`base` above
/// the extra arguments (which stay parked below, addressed by `n_extra_args`).
pub struct CallFrame {
    pub func: LuaValue,
    pub func_slot: usize,
    /// First register of the frame; registers are `base..top`.
    pub base: usize,
    pub top: usize,
    pub pc: usize,
    /// Results the caller expects; -1 means "all".
    pub nresults: i32,
    pub n_extra_args: usize,
    pub is_host: bool,
    /// Set when this frame was reused by a tail call: the frame below is no
    /// longer inspectable, and debug output reports the boundary.
    pub is_tail_call: bool,
    /// Stack slots of <close> locals in declaration order.
    pub tbc: Vec<usize>,
}

impl CallFrame {
    pub fn new_lua(func: LuaValue, func_slot: usize, base: usize, top: usize, nresults: i32) -> Self {
        CallFrame {
            func,
            func_slot,
            base,
            top,
            pc: 0,
            nresults,
            n_extra_args: 0,
            is_host: false,
            is_tail_call: false,
            tbc: Vec::new(),
        }
    }

    pub fn new_host(func: LuaValue, func_slot: usize, base: usize, top: usize, nresults: i32) -> Self {
        CallFrame {
            func,
            func_slot,
            base,
            top,
            pc: 0,
            nresults,
            n_extra_args: 0,
            is_host: true,
            is_tail_call: false,
            tbc: Vec::new(),
        }
    }
}
