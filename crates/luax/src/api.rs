// The embedder-facing stack API.
//
// Indices follow the C-API convention: positive indices count from the
// current frame's base (1-origin), negative indices count back from the top,
// and pseudo-indices address the registry and the running host closure's
// upvalues. Queries on out-of-range indices yield `None`; mutations raise a
// `Type` error.

use crate::lua_value::{HostValue, LuaValue, LuaValueKind, StrContext};
use crate::lua_vm::execute::{self, Protected};
use crate::lua_vm::{HostFn, LuaError, LuaResult, LuaVM};

/// Largest addressable frame window; pseudo-indices live below its negation.
pub const MAX_STACK_INDEX: i32 = 1_000_000;

/// Pseudo-index of the registry table.
pub const REGISTRY_INDEX: i32 = -MAX_STACK_INDEX - 1000;

/// Pseudo-index of user upvalue `i` (1-based) of the running host closure.
/// Internally upvalue slot 0 holds the function itself; this helper
/// compensates so callers never see the reserved slot.
pub const fn upvalue_index(i: u32) -> i32 {
    REGISTRY_INDEX - i as i32
}

/// Where an API index points after resolution.
enum Resolved {
    /// Absolute value-stack slot.
    Slot(usize),
    Registry,
    /// Internal upvalue slot (reserved slot already skipped).
    Upvalue(usize),
    OutOfRange,
}

impl LuaVM {
    /// The window `(base, top)` the API operates on: the current frame's, or
    /// the whole stack outside any call.
    fn frame_window(&self) -> (usize, usize) {
        match self.current_frame() {
            Some(f) => (f.base, self.top.max(f.base)),
            None => (0, self.top),
        }
    }

    fn resolve_index(&self, idx: i32) -> Resolved {
        if idx == REGISTRY_INDEX {
            return Resolved::Registry;
        }
        if idx < REGISTRY_INDEX {
            let i = (REGISTRY_INDEX - idx) as usize;
            return Resolved::Upvalue(i);
        }
        let (base, top) = self.frame_window();
        if idx > 0 {
            let slot = base + idx as usize - 1;
            if slot < top { Resolved::Slot(slot) } else { Resolved::OutOfRange }
        } else if idx < 0 {
            let n = top - base;
            let back = (-idx) as usize;
            if back <= n {
                Resolved::Slot(top - back)
            } else {
                Resolved::OutOfRange
            }
        } else {
            Resolved::OutOfRange
        }
    }

    /// Normalizes a relative index into an absolute (positive) one.
    pub fn abs_index(&self, idx: i32) -> i32 {
        if idx > 0 || idx <= REGISTRY_INDEX {
            return idx;
        }
        let (base, top) = self.frame_window();
        (top - base) as i32 + idx + 1
    }

    /// Number of values in the current frame window.
    pub fn stack_size(&self) -> usize {
        let (base, top) = self.frame_window();
        top - base
    }

    /// Reads the value at `idx`; `None` for an empty or invalid slot.
    pub fn value_at(&self, idx: i32) -> Option<LuaValue> {
        match self.resolve_index(idx) {
            Resolved::Slot(slot) => Some(self.stack_get(slot)),
            Resolved::Registry => Some(LuaValue::Table(self.registry())),
            Resolved::Upvalue(i) => self.host_upvalue(i),
            Resolved::OutOfRange => None,
        }
    }

    /// Replaces the value at `idx`. Mutating an invalid index is an error.
    pub fn set_value_at(&mut self, idx: i32, v: LuaValue) -> LuaResult<()> {
        match self.resolve_index(idx) {
            Resolved::Slot(slot) => self.stack_set(slot, v),
            Resolved::Upvalue(i) => {
                if self.set_host_upvalue(i, v)? {
                    Ok(())
                } else {
                    Err(self.raise(LuaError::Type, format!("no upvalue at index {}", idx)))
                }
            }
            Resolved::Registry => {
                Err(self.raise(LuaError::Type, "cannot replace the registry".to_string()))
            }
            Resolved::OutOfRange => {
                Err(self.raise(LuaError::Type, format!("invalid stack index {}", idx)))
            }
        }
    }

    // ----- pushes -----

    pub fn push_nil(&mut self) -> LuaResult<()> {
        self.push_value(LuaValue::Nil)
    }

    pub fn push_boolean(&mut self, b: bool) -> LuaResult<()> {
        self.push_value(LuaValue::Boolean(b))
    }

    pub fn push_integer(&mut self, i: i64) -> LuaResult<()> {
        self.push_value(LuaValue::Integer(i))
    }

    pub fn push_float(&mut self, f: f64) -> LuaResult<()> {
        self.push_value(LuaValue::Float(f))
    }

    pub fn push_str(&mut self, s: &str) -> LuaResult<()> {
        let v = self.new_string(s);
        self.push_value(v)
    }

    pub fn push_bytes(&mut self, b: &[u8]) -> LuaResult<()> {
        let v = self.new_string_bytes(b);
        self.push_value(v)
    }

    /// Pushes a string carrying a context set.
    pub fn push_str_with_context(&mut self, bytes: Vec<u8>, context: StrContext) -> LuaResult<()> {
        let v = self.new_string_with_context(bytes, context);
        self.push_value(v)
    }

    /// Creates and pushes an empty table.
    pub fn push_new_table(&mut self) -> LuaResult<()> {
        let t = self.new_table();
        self.push_value(t)
    }

    /// Creates and pushes a userdata with `n_user_values` associated slots.
    pub fn push_new_userdata(
        &mut self,
        data: Box<dyn HostValue>,
        n_user_values: usize,
    ) -> LuaResult<()> {
        let u = self.new_userdata(data, n_user_values);
        self.push_value(u)
    }

    /// Creates a host closure capturing the top `n_upvalues` values (popped),
    /// and pushes it.
    pub fn push_host_closure(
        &mut self,
        name: &'static str,
        f: HostFn,
        n_upvalues: usize,
        pure_fn: bool,
    ) -> LuaResult<()> {
        if n_upvalues > self.stack_size() {
            return Err(self.raise(
                LuaError::Type,
                format!("not enough values for {} upvalues", n_upvalues),
            ));
        }
        let start = self.top - n_upvalues;
        let mut upvalues = Vec::with_capacity(n_upvalues);
        for i in 0..n_upvalues {
            upvalues.push(self.stack_get(start + i));
        }
        self.set_top(start)?;
        let v = self.new_host_closure(name, f, upvalues, pure_fn);
        self.push_value(v)
    }

    /// Pushes a copy of the value at `idx`.
    pub fn push_index(&mut self, idx: i32) -> LuaResult<()> {
        match self.value_at(idx) {
            Some(v) => self.push_value(v),
            None => Err(self.raise(LuaError::Type, format!("invalid stack index {}", idx))),
        }
    }

    /// Pops `n` values.
    pub fn pop_n(&mut self, n: usize) -> LuaResult<()> {
        let (base, top) = self.frame_window();
        if n > top - base {
            return Err(self.raise(LuaError::Type, "stack underflow in pop".to_string()));
        }
        self.set_top(top - n)
    }

    // ----- type queries -----

    pub fn kind_at(&self, idx: i32) -> Option<LuaValueKind> {
        self.value_at(idx).map(|v| v.kind())
    }

    pub fn type_name_at(&self, idx: i32) -> &'static str {
        match self.value_at(idx) {
            Some(v) => v.type_name(),
            None => "no value",
        }
    }

    pub fn is_none_at(&self, idx: i32) -> bool {
        self.value_at(idx).is_none()
    }

    pub fn is_nil_at(&self, idx: i32) -> bool {
        matches!(self.value_at(idx), Some(LuaValue::Nil))
    }

    // ----- conversions -----

    pub fn to_boolean(&self, idx: i32) -> bool {
        self.value_at(idx).map(|v| v.is_truthy()).unwrap_or(false)
    }

    /// Integer conversion with the full coercion rules (numeric strings
    /// included).
    pub fn to_integer(&self, idx: i32) -> Option<i64> {
        let v = self.value_at(idx)?;
        self.coerce_integer(&v)
    }

    pub fn to_number(&self, idx: i32) -> Option<f64> {
        let v = self.value_at(idx)?;
        self.coerce_number(&v).and_then(|n| n.as_number())
    }

    /// String conversion: strings and numbers convert, everything else is
    /// `None` (no metamethods; use `tostring_value` for those).
    pub fn to_lua_string(&mut self, idx: i32) -> Option<crate::lua_value::LuaStr> {
        let v = self.value_at(idx)?;
        self.coerce_string(&v)
    }

    // ----- table access through the API -----

    pub fn get_field(&mut self, idx: i32, name: &str) -> LuaResult<LuaValue> {
        let Some(t) = self.value_at(idx) else {
            return Err(self.raise(LuaError::Type, format!("invalid stack index {}", idx)));
        };
        let key = self.new_string(name);
        self.table_get(&t, &key)
    }

    pub fn set_field(&mut self, idx: i32, name: &str, v: LuaValue) -> LuaResult<()> {
        let Some(t) = self.value_at(idx) else {
            return Err(self.raise(LuaError::Type, format!("invalid stack index {}", idx)));
        };
        let key = self.new_string(name);
        self.table_set(&t, key, v)
    }

    // ----- calls -----

    /// Unprotected call: the function and `nargs` arguments must be the top
    /// values. Results replace them, adjusted to `nresults` unless negative.
    pub fn api_call(&mut self, nargs: usize, nresults: i32) -> LuaResult<()> {
        let (_, top) = self.frame_window();
        if nargs + 1 > self.stack_size() {
            return Err(self.raise(
                LuaError::Type,
                "not enough values for call".to_string(),
            ));
        }
        let func_slot = top - nargs - 1;
        let f = self.stack_get(func_slot);
        let mut args = Vec::with_capacity(nargs);
        for i in 0..nargs {
            args.push(self.stack_get(func_slot + 1 + i));
        }
        self.set_top(func_slot)?;
        let results = execute::call_function(self, f, args, nresults)?;
        for r in results {
            self.push_value(r)?;
        }
        Ok(())
    }

    /// Protected call with an optional message handler at `msg_handler_idx`
    /// (0 means none). On failure the single (possibly handler-replaced)
    /// error value is pushed and the error kind returned. A failing handler
    /// yields the distinct `Handler` kind.
    pub fn api_pcall(
        &mut self,
        nargs: usize,
        nresults: i32,
        msg_handler_idx: i32,
    ) -> LuaResult<()> {
        let handler = if msg_handler_idx == 0 {
            None
        } else {
            match self.value_at(msg_handler_idx) {
                Some(h) => Some(h),
                None => {
                    return Err(self.raise(
                        LuaError::Type,
                        format!("invalid message handler index {}", msg_handler_idx),
                    ));
                }
            }
        };
        let (_, top) = self.frame_window();
        if nargs + 1 > self.stack_size() {
            return Err(self.raise(
                LuaError::Type,
                "not enough values for call".to_string(),
            ));
        }
        let func_slot = top - nargs - 1;
        let f = self.stack_get(func_slot);
        let mut args = Vec::with_capacity(nargs);
        for i in 0..nargs {
            args.push(self.stack_get(func_slot + 1 + i));
        }
        self.set_top(func_slot)?;
        match execute::protected_call(self, f, args, handler) {
            Protected::Ok(mut results) => {
                if nresults >= 0 {
                    results.resize(nresults as usize, LuaValue::Nil);
                }
                for r in results {
                    self.push_value(r)?;
                }
                Ok(())
            }
            Protected::Caught { kind, error } => {
                self.push_value(error)?;
                Err(kind)
            }
        }
    }

    // ----- globals through the API -----

    pub fn push_globals(&mut self) -> LuaResult<()> {
        let g = LuaValue::Table(self.globals());
        self.push_value(g)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua_vm::VmOptions;

    #[test]
    fn push_and_index_arithmetic() {
        let mut vm = LuaVM::new(VmOptions::default());
        vm.push_integer(10).unwrap();
        vm.push_str("x").unwrap();
        vm.push_boolean(true).unwrap();
        assert_eq!(vm.stack_size(), 3);

        assert_eq!(vm.value_at(1).unwrap().as_integer_strict(), Some(10));
        assert_eq!(vm.value_at(-3).unwrap().as_integer_strict(), Some(10));
        assert_eq!(vm.value_at(-1).unwrap().as_boolean(), Some(true));
        assert!(vm.value_at(4).is_none());
        assert!(vm.value_at(-4).is_none());
        assert_eq!(vm.abs_index(-1), 3);
        assert_eq!(vm.abs_index(2), 2);
    }

    #[test]
    fn registry_pseudo_index() {
        let mut vm = LuaVM::new(VmOptions::default());
        let v = vm.value_at(REGISTRY_INDEX).unwrap();
        assert!(v.is_table());
        // Globals live at the fixed registry slot.
        let g = vm
            .table_get(&v, &LuaValue::Integer(crate::lua_vm::RIDX_GLOBALS))
            .unwrap();
        assert!(g.is_table());
    }

    #[test]
    fn mutating_invalid_index_is_an_error() {
        let mut vm = LuaVM::new(VmOptions::default());
        vm.push_nil().unwrap();
        let err = vm.set_value_at(9, LuaValue::Integer(1)).unwrap_err();
        assert_eq!(err, LuaError::Type);
    }

    #[test]
    fn closure_upvalues_pop_from_stack() {
        fn reader(vm: &mut LuaVM) -> LuaResult<usize> {
            let v = vm.host_upvalue(1).unwrap_or(LuaValue::Nil);
            vm.push_value(v)?;
            Ok(1)
        }
        let mut vm = LuaVM::new(VmOptions::default());
        vm.push_integer(99).unwrap();
        vm.push_host_closure("reader", reader, 1, true).unwrap();
        assert_eq!(vm.stack_size(), 1);
        let f = vm.value_at(-1).unwrap();
        let r = vm.call_values(f, vec![], 1).unwrap();
        assert_eq!(r[0].as_integer_strict(), Some(99));
    }

    #[test]
    fn upvalue_pseudo_index_constant() {
        assert_eq!(upvalue_index(1), REGISTRY_INDEX - 1);
        assert!(upvalue_index(2) < upvalue_index(1));
    }
}
