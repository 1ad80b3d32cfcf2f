// Closures and upvalue cells.
//
// A Lua closure pairs an immutable prototype with an ordered list of upvalue
// cells; a host closure pairs a host function with the same. Cells are pooled
// so sibling closures capturing the same enclosing local share one cell and
// observe each other's writes. A cell is open while it aliases a live stack
// slot and closes (takes ownership of the value) when the owning frame exits.

use std::rc::Rc;

use crate::gc::UpvalueId;
use crate::lua_value::{LuaValue, Proto};
use crate::lua_vm::HostFn;

/// Either side of an upvalue cell's lifecycle.
pub enum UpvalueState {
    /// Aliases a slot (absolute index) on the state's value stack.
    Open(usize),
    /// Owns its value.
    Closed(LuaValue),
}

/// A shared upvalue cell. The frozen flag is set by the freeze subsystem and
/// blocks writes through every closure holding the cell.
pub struct LuaUpvalue {
    pub state: UpvalueState,
    pub frozen: bool,
}

impl LuaUpvalue {
    pub fn open(slot: usize) -> Self {
        LuaUpvalue {
            state: UpvalueState::Open(slot),
            frozen: false,
        }
    }

    pub fn closed(value: LuaValue) -> Self {
        LuaUpvalue {
            state: UpvalueState::Closed(value),
            frozen: false,
        }
    }

    #[inline(always)]
    pub fn is_open(&self) -> bool {
        matches!(self.state, UpvalueState::Open(_))
    }

    /// The aliased stack slot, while open.
    pub fn stack_slot(&self) -> Option<usize> {
        match self.state {
            UpvalueState::Open(slot) => Some(slot),
            UpvalueState::Closed(_) => None,
        }
    }

    /// Transition open -> closed, capturing the slot contents.
    pub fn close(&mut self, value: LuaValue) {
        self.state = UpvalueState::Closed(value);
    }
}

/// A closure over a compiled prototype.
pub struct LuaFunction {
    pub proto: Rc<Proto>,
    pub upvalues: Vec<UpvalueId>,
    pub frozen: bool,
}

/// A closure over a host function.
///
/// Internal slot 0 of `upvalues` is reserved for the host function's own
/// identity value; user-visible upvalue 1 lives at internal slot 1. The
/// `upvalue_index` helper on the stack API compensates, so embedders never
/// see the reserved slot.
pub struct HostClosure {
    pub func: HostFn,
    pub upvalues: Vec<UpvalueId>,
    /// Declared side-effect-free at creation; only pure closures may be
    /// frozen.
    pub pure_fn: bool,
    pub frozen: bool,
    /// Name used in error messages and tracebacks.
    pub name: &'static str,
}

/// A callable value in the function pool.
pub enum LuaClosure {
    Lua(LuaFunction),
    Host(HostClosure),
}

impl LuaClosure {
    pub fn new_lua(proto: Rc<Proto>, upvalues: Vec<UpvalueId>) -> Self {
        LuaClosure::Lua(LuaFunction {
            proto,
            upvalues,
            frozen: false,
        })
    }

    pub fn new_host(name: &'static str, func: HostFn, upvalues: Vec<UpvalueId>, pure_fn: bool) -> Self {
        LuaClosure::Host(HostClosure {
            func,
            upvalues,
            pure_fn,
            frozen: false,
            name,
        })
    }

    #[inline(always)]
    pub fn is_lua(&self) -> bool {
        matches!(self, LuaClosure::Lua(_))
    }

    #[inline(always)]
    pub fn is_host(&self) -> bool {
        matches!(self, LuaClosure::Host(_))
    }

    pub fn as_lua(&self) -> Option<&LuaFunction> {
        match self {
            LuaClosure::Lua(f) => Some(f),
            LuaClosure::Host(_) => None,
        }
    }

    pub fn as_host(&self) -> Option<&HostClosure> {
        match self {
            LuaClosure::Lua(_) => None,
            LuaClosure::Host(h) => Some(h),
        }
    }

    pub fn proto(&self) -> Option<&Rc<Proto>> {
        match self {
            LuaClosure::Lua(f) => Some(&f.proto),
            LuaClosure::Host(_) => None,
        }
    }

    pub fn upvalues(&self) -> &[UpvalueId] {
        match self {
            LuaClosure::Lua(f) => &f.upvalues,
            LuaClosure::Host(h) => &h.upvalues,
        }
    }

    pub fn is_frozen(&self) -> bool {
        match self {
            LuaClosure::Lua(f) => f.frozen,
            LuaClosure::Host(h) => h.frozen,
        }
    }

    pub fn set_frozen(&mut self) {
        match self {
            LuaClosure::Lua(f) => f.frozen = true,
            LuaClosure::Host(h) => h.frozen = true,
        }
    }
}
