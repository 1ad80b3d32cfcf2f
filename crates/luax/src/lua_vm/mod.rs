// The VM state: one value stack, one frame stack, the object pools, the
// registry, and everything the execution loop and the embedder API share.

mod call_frame;
mod cancel;
pub mod execute;
mod lua_error;
mod metamethod;
pub mod opcode;

pub use call_frame::CallFrame;
pub use cancel::CancelToken;
pub use lua_error::{LuaError, LuaFullError, LuaResult};
pub use metamethod::{TmHandler, TmKind};
pub use opcode::{Instruction, OpCode};

use ahash::AHashMap;
use std::any::Any;
use std::rc::Rc;

use crate::branch::unlikely;
use crate::gc::{ObjectPool, StringInterner, TableId, UpvalueId};
use crate::lua_value::{
    ContextBuilder, HostValue, LuaClosure, LuaStr, LuaStrData, LuaTable, LuaUpvalue, LuaUserdata,
    LuaValue, Proto, StrContext, TableSetError, UpvalueState, number,
};

/// Host function: reads its arguments through the frame window, pushes its
/// results, returns how many it pushed.
pub type HostFn = fn(&mut LuaVM) -> LuaResult<usize>;

/// What kinds of chunk `load` accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Text,
    Binary,
    Both,
}

/// Resource limits and tuning knobs, injected at state creation.
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Hard cap on value-stack slots.
    pub max_stack_size: usize,
    /// Hard cap on Lua frame depth.
    pub max_call_depth: usize,
    /// Hard cap on nested host-function calls.
    pub max_host_depth: usize,
    /// Bound on `__index`/`__newindex` chain length (cycle guard).
    pub max_meta_depth: usize,
    /// Bound on split states in a compiled pattern automaton.
    pub max_pattern_splits: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            max_stack_size: 1_000_000,
            max_call_depth: 200,
            max_host_depth: 200,
            max_meta_depth: 100,
            max_pattern_splits: 200,
        }
    }
}

/// Registry slot holding the globals table.
pub const RIDX_GLOBALS: i64 = 2;

pub struct LuaVM {
    pub(crate) pool: ObjectPool,
    pub(crate) strings: StringInterner,

    /// Physical value stack; only grows. Slots past `top` are garbage.
    pub(crate) stack: Vec<LuaValue>,
    pub(crate) top: usize,

    pub(crate) frames: Vec<CallFrame>,
    pub(crate) host_depth: usize,

    /// Open upvalue cells, each aliasing a live stack slot.
    pub(crate) open_upvalues: Vec<UpvalueId>,

    registry: TableId,
    globals: TableId,
    pub(crate) string_meta: Option<TableId>,

    /// The pending error object once a raise is in flight.
    pub(crate) error_value: LuaValue,

    cancel: CancelToken,
    options: VmOptions,

    /// Embedder/library state keyed by a static name (random source, etc.).
    app_data: AHashMap<&'static str, Box<dyn Any>>,
}

impl LuaVM {
    pub fn new(options: VmOptions) -> Self {
        let mut pool = ObjectPool::new();
        let registry = pool.create_table(LuaTable::new(0, 4));
        let globals = pool.create_table(LuaTable::new(0, 32));
        // Registry slot RIDX_GLOBALS holds the globals table; the slot index
        // is fixed so pseudo-index access stays stable.
        let _ = pool
            .table_mut(registry)
            .raw_set_int(RIDX_GLOBALS, LuaValue::Table(globals));

        LuaVM {
            pool,
            strings: StringInterner::new(),
            stack: Vec::with_capacity(64),
            top: 0,
            frames: Vec::new(),
            host_depth: 0,
            open_upvalues: Vec::new(),
            registry,
            globals,
            string_meta: None,
            error_value: LuaValue::Nil,
            cancel: CancelToken::new(),
            options,
            app_data: AHashMap::new(),
        }
    }

    #[inline(always)]
    pub fn options(&self) -> &VmOptions {
        &self.options
    }

    // ----- cancellation -----

    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.cancel = token;
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Suspension-point check; raises the `Cancelled` kind when the token has
    /// been tripped. Called at every backward branch and call entry.
    #[inline(always)]
    pub(crate) fn check_cancelled(&mut self) -> LuaResult<()> {
        if unlikely(self.cancel.is_cancelled()) {
            log::trace!("cancellation observed");
            let msg = self.new_string("execution cancelled");
            self.error_value = msg;
            return Err(LuaError::Cancelled);
        }
        Ok(())
    }

    // ----- app data -----

    pub fn set_app_data<T: Any>(&mut self, key: &'static str, value: T) {
        self.app_data.insert(key, Box::new(value));
    }

    pub fn app_data_mut<T: Any>(&mut self, key: &'static str) -> Option<&mut T> {
        self.app_data.get_mut(key).and_then(|b| b.downcast_mut())
    }

    // ----- string creation -----

    pub fn new_string(&mut self, s: &str) -> LuaValue {
        LuaValue::String(self.strings.intern(s.as_bytes()))
    }

    pub fn new_string_bytes(&mut self, b: &[u8]) -> LuaValue {
        LuaValue::String(self.strings.intern(b))
    }

    pub fn new_string_owned(&mut self, s: String) -> LuaValue {
        LuaValue::String(self.strings.intern(s.as_bytes()))
    }

    /// A string carrying a context set; never interned.
    pub fn new_string_with_context(&mut self, bytes: Vec<u8>, context: StrContext) -> LuaValue {
        LuaValue::String(LuaStrData::with_context(bytes, context))
    }

    // ----- object creation -----

    pub fn new_table(&mut self) -> LuaValue {
        LuaValue::Table(self.pool.create_table(LuaTable::new(0, 0)))
    }

    pub fn new_table_with_capacity(&mut self, narr: usize, nrec: usize) -> LuaValue {
        LuaValue::Table(self.pool.create_table(LuaTable::new(narr, nrec)))
    }

    pub(crate) fn new_lua_closure(
        &mut self,
        proto: Rc<Proto>,
        upvalues: Vec<UpvalueId>,
    ) -> LuaValue {
        LuaValue::Function(self.pool.create_function(LuaClosure::new_lua(proto, upvalues)))
    }

    /// A host function with no user upvalues. `pure_fn` marks it freezable.
    pub fn new_host_function_named(
        &mut self,
        name: &'static str,
        f: HostFn,
        pure_fn: bool,
    ) -> LuaValue {
        self.new_host_closure(name, f, Vec::new(), pure_fn)
    }

    /// A host closure over `upvalues`. Internal upvalue slot 0 is reserved
    /// for the function's own identity; user slots follow.
    pub fn new_host_closure(
        &mut self,
        name: &'static str,
        f: HostFn,
        upvalues: Vec<LuaValue>,
        pure_fn: bool,
    ) -> LuaValue {
        let mut cells = Vec::with_capacity(upvalues.len() + 1);
        // Reserve slot 0 now; patched to the closure's own value below.
        cells.push(self.pool.create_upvalue(LuaUpvalue::closed(LuaValue::Nil)));
        for v in upvalues {
            cells.push(self.pool.create_upvalue(LuaUpvalue::closed(v)));
        }
        let id = self
            .pool
            .create_function(LuaClosure::new_host(name, f, cells, pure_fn));
        let self_value = LuaValue::Function(id);
        if let LuaClosure::Host(h) = self.pool.function(id) {
            let slot0 = h.upvalues[0];
            self.pool.upvalue_mut(slot0).state = UpvalueState::Closed(self_value.clone());
        }
        self_value
    }

    pub fn new_userdata(&mut self, data: Box<dyn HostValue>, n_user_values: usize) -> LuaValue {
        LuaValue::Userdata(self.pool.create_userdata(LuaUserdata::new(data, n_user_values)))
    }

    // ----- registry and globals -----

    #[inline(always)]
    pub fn registry(&self) -> TableId {
        self.registry
    }

    #[inline(always)]
    pub fn globals(&self) -> TableId {
        self.globals
    }

    pub fn get_global(&mut self, name: &str) -> LuaResult<LuaValue> {
        let key = self.new_string(name);
        let globals = LuaValue::Table(self.globals);
        self.table_get(&globals, &key)
    }

    pub fn set_global(&mut self, name: &str, value: LuaValue) -> LuaResult<()> {
        let key = self.new_string(name);
        let globals = LuaValue::Table(self.globals);
        self.table_set(&globals, key, value)
    }

    // ----- error machinery -----

    /// Raises an error with a plain message object of the given kind.
    pub(crate) fn raise(&mut self, kind: LuaError, msg: String) -> LuaError {
        let v = self.new_string_owned(msg);
        self.error_value = v;
        kind
    }

    /// Raises a runtime error, prefixing the current source position.
    pub(crate) fn error_runtime(&mut self, msg: impl Into<String>) -> LuaError {
        let msg = msg.into();
        let located = match self.current_position() {
            Some((source, line)) if line > 0 => format!("{}:{}: {}", source, line, msg),
            Some((source, _)) => format!("{}: {}", source, msg),
            None => msg,
        };
        self.raise(LuaError::Runtime, located)
    }

    /// Raises with an arbitrary error object, preserving non-string values.
    pub(crate) fn raise_value(&mut self, kind: LuaError, value: LuaValue) -> LuaError {
        self.error_value = value;
        kind
    }

    pub(crate) fn frozen_error(&mut self, what: &str) -> LuaError {
        let msg = format!("attempt to modify a frozen {}", what);
        let located = match self.current_position() {
            Some((source, line)) if line > 0 => format!("{}:{}: {}", source, line, msg),
            _ => msg,
        };
        self.raise(LuaError::Frozen, located)
    }

    pub(crate) fn table_set_error(&mut self, e: TableSetError) -> LuaError {
        match e {
            TableSetError::Frozen => self.frozen_error("table"),
            TableSetError::NilKey => self.error_runtime("table index is nil"),
            TableSetError::NanKey => self.error_runtime("table index is NaN"),
        }
    }

    /// Takes the pending error object, leaving nil.
    pub fn take_error_value(&mut self) -> LuaValue {
        std::mem::replace(&mut self.error_value, LuaValue::Nil)
    }

    /// Renders the pending error as a message string and clears it.
    pub fn error_message(&mut self, kind: LuaError) -> String {
        let v = self.take_error_value();
        match &v {
            LuaValue::Nil => kind.to_string(),
            LuaValue::String(s) => s.to_display().into_owned(),
            other => format!("(error object is a {} value)", other.type_name()),
        }
    }

    pub fn into_full_error(&mut self, kind: LuaError) -> LuaFullError {
        LuaFullError {
            kind,
            message: self.error_message(kind),
        }
    }

    /// Source name and current line of the innermost Lua frame.
    pub(crate) fn current_position(&self) -> Option<(String, u32)> {
        for frame in self.frames.iter().rev() {
            if frame.is_host {
                continue;
            }
            let Some(id) = frame.func.as_function_id() else {
                continue;
            };
            let Some(proto) = self.pool.function(id).proto() else {
                continue;
            };
            let pc = frame.pc.saturating_sub(1);
            return Some((proto.source_name().to_string(), proto.line_at(pc)));
        }
        None
    }

    /// Lua-style traceback over the live frames, newest first.
    pub fn generate_traceback(&self) -> String {
        let mut out = String::from("stack traceback:\n");
        for (level, frame) in self.frames.iter().rev().enumerate() {
            if level >= 22 {
                out.push_str("\t...\n");
                break;
            }
            if frame.is_host {
                let name = frame
                    .func
                    .as_function_id()
                    .and_then(|id| self.pool.function(id).as_host().map(|h| h.name))
                    .unwrap_or("?");
                out.push_str(&format!("\t[host]: in function '{}'\n", name));
                continue;
            }
            let proto = frame
                .func
                .as_function_id()
                .and_then(|id| self.pool.function(id).proto().cloned());
            match proto {
                Some(p) => {
                    let source = p.source_name().trim_start_matches('@').to_string();
                    let line = p.line_at(frame.pc.saturating_sub(1));
                    let what = if p.is_main_chunk() { "main chunk" } else { "function" };
                    if line > 0 {
                        out.push_str(&format!("\t{}:{}: in {}\n", source, line, what));
                    } else {
                        out.push_str(&format!("\t{}: in {}\n", source, what));
                    }
                }
                None => out.push_str("\t?: in function\n"),
            }
            if frame.is_tail_call {
                out.push_str("\t(...tail calls...)\n");
            }
        }
        out
    }

    // ----- stack -----

    pub(crate) fn ensure_stack(&mut self, needed: usize) -> LuaResult<()> {
        if unlikely(needed > self.options.max_stack_size) {
            return Err(self.raise(
                LuaError::Memory,
                format!("stack overflow (needed {} slots)", needed),
            ));
        }
        if self.stack.len() < needed {
            self.stack.resize(needed, LuaValue::Nil);
        }
        Ok(())
    }

    #[inline(always)]
    pub(crate) fn stack_get(&self, idx: usize) -> LuaValue {
        self.stack.get(idx).cloned().unwrap_or(LuaValue::Nil)
    }

    #[inline(always)]
    pub(crate) fn stack_set(&mut self, idx: usize, v: LuaValue) -> LuaResult<()> {
        if idx >= self.stack.len() {
            self.ensure_stack(idx + 1)?;
        }
        self.stack[idx] = v;
        Ok(())
    }

    pub(crate) fn push_value(&mut self, v: LuaValue) -> LuaResult<()> {
        let t = self.top;
        self.stack_set(t, v)?;
        self.top = t + 1;
        if let Some(frame) = self.frames.last_mut() {
            if frame.is_host && frame.top < t + 1 {
                frame.top = t + 1;
            }
        }
        Ok(())
    }

    #[inline(always)]
    pub(crate) fn set_top(&mut self, new_top: usize) -> LuaResult<()> {
        if new_top > self.stack.len() {
            self.ensure_stack(new_top)?;
        }
        self.top = new_top;
        Ok(())
    }

    // ----- frames -----

    #[inline(always)]
    pub(crate) fn current_frame(&self) -> Option<&CallFrame> {
        self.frames.last()
    }

    #[inline(always)]
    pub(crate) fn current_frame_mut(&mut self) -> Option<&mut CallFrame> {
        self.frames.last_mut()
    }

    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    // ----- host function argument access -----

    /// Argument `i` (1-based) of the current host call.
    pub fn arg(&self, i: usize) -> Option<LuaValue> {
        if i == 0 {
            return None;
        }
        let frame = self.current_frame()?;
        let idx = frame.base + i - 1;
        if idx < frame.top { Some(self.stack_get(idx)) } else { None }
    }

    pub fn arg_count(&self) -> usize {
        match self.current_frame() {
            Some(f) if f.top > f.base => f.top - f.base,
            _ => 0,
        }
    }

    /// Upvalue `i` (1-based, user numbering) of the running host closure.
    pub fn host_upvalue(&self, i: usize) -> Option<LuaValue> {
        let frame = self.current_frame()?;
        let id = frame.func.as_function_id()?;
        let h = self.pool.function(id).as_host()?;
        // Internal slot 0 is the function itself; user upvalue 1 follows it.
        let cell = *h.upvalues.get(i)?;
        Some(self.read_upvalue(cell))
    }

    pub fn set_host_upvalue(&mut self, i: usize, v: LuaValue) -> LuaResult<bool> {
        let Some(frame) = self.current_frame() else {
            return Ok(false);
        };
        let Some(id) = frame.func.as_function_id() else {
            return Ok(false);
        };
        let Some(h) = self.pool.function(id).as_host() else {
            return Ok(false);
        };
        let Some(&cell) = h.upvalues.get(i) else {
            return Ok(false);
        };
        if i == 0 {
            return Ok(false);
        }
        self.write_upvalue(cell, v)?;
        Ok(true)
    }

    // ----- upvalues -----

    pub(crate) fn find_or_create_upvalue(&mut self, slot: usize) -> UpvalueId {
        for &id in &self.open_upvalues {
            if self.pool.upvalue(id).stack_slot() == Some(slot) {
                return id;
            }
        }
        let id = self.pool.create_upvalue(LuaUpvalue::open(slot));
        self.open_upvalues.push(id);
        id
    }

    #[inline]
    pub(crate) fn read_upvalue(&self, id: UpvalueId) -> LuaValue {
        match &self.pool.upvalue(id).state {
            UpvalueState::Open(slot) => self.stack_get(*slot),
            UpvalueState::Closed(v) => v.clone(),
        }
    }

    pub(crate) fn write_upvalue(&mut self, id: UpvalueId, v: LuaValue) -> LuaResult<()> {
        if self.pool.upvalue(id).frozen {
            return Err(self.frozen_error("upvalue"));
        }
        match self.pool.upvalue(id).state {
            UpvalueState::Open(slot) => self.stack_set(slot, v),
            UpvalueState::Closed(_) => {
                self.pool.upvalue_mut(id).state = UpvalueState::Closed(v);
                Ok(())
            }
        }
    }

    /// Closes every open upvalue aliasing a slot >= `level`: each cell copies
    /// its slot contents and becomes owning, atomically from the Lua side.
    pub(crate) fn close_upvalues_from(&mut self, level: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let id = self.open_upvalues[i];
            match self.pool.upvalue(id).stack_slot() {
                Some(slot) if slot >= level => {
                    let value = self.stack_get(slot);
                    self.pool.upvalue_mut(id).close(value);
                    self.open_upvalues.swap_remove(i);
                }
                Some(_) => i += 1,
                None => {
                    self.open_upvalues.swap_remove(i);
                }
            }
        }
    }

    // ----- metatables -----

    pub fn get_metatable_of(&self, v: &LuaValue) -> Option<TableId> {
        match v {
            LuaValue::Table(id) => self.pool.table(*id).metatable(),
            LuaValue::Userdata(id) => self.pool.userdata(*id).meta,
            LuaValue::String(_) => self.string_meta,
            _ => None,
        }
    }

    /// Raw metatable assignment; `__metatable` locking lives in the stdlib.
    pub fn set_metatable_of(&mut self, v: &LuaValue, meta: Option<TableId>) -> LuaResult<()> {
        match v {
            LuaValue::Table(id) => {
                if self.pool.table(*id).is_frozen() {
                    return Err(self.frozen_error("table"));
                }
                self.pool.table_mut(*id).set_metatable(meta);
                Ok(())
            }
            LuaValue::Userdata(id) => {
                if self.pool.userdata(*id).frozen {
                    return Err(self.frozen_error("userdata"));
                }
                self.pool.userdata_mut(*id).meta = meta;
                Ok(())
            }
            LuaValue::String(_) => {
                self.string_meta = meta;
                Ok(())
            }
            other => Err(self.error_runtime(format!(
                "cannot set a metatable on a {} value",
                other.type_name()
            ))),
        }
    }

    /// Fetches metatable[event] for the value, nil filtered out.
    pub(crate) fn get_metamethod(&mut self, v: &LuaValue, event: TmKind) -> Option<LuaValue> {
        let meta = self.get_metatable_of(v)?;
        let key = LuaValue::String(self.strings.intern(event.name().as_bytes()));
        let m = self.pool.table(meta).raw_get(&key);
        if m.is_nil() { None } else { Some(m) }
    }

    /// Resolves an indexing event to its tagged handler.
    pub(crate) fn index_handler(&mut self, v: &LuaValue, event: TmKind) -> TmHandler {
        match self.get_metamethod(v, event) {
            None => TmHandler::Raw,
            Some(LuaValue::Table(id)) => TmHandler::Table(id),
            Some(m) => TmHandler::Function(m),
        }
    }

    // ----- meta-aware table access -----

    /// `t[key]` honoring `__index` chains, bounded to guard cycles.
    pub fn table_get(&mut self, t: &LuaValue, key: &LuaValue) -> LuaResult<LuaValue> {
        let mut current = t.clone();
        for _ in 0..self.options.max_meta_depth {
            if let LuaValue::Table(id) = &current {
                let raw = self.pool.table(*id).raw_get(key);
                if !raw.is_nil() {
                    return Ok(raw);
                }
                match self.index_handler(&current, TmKind::Index) {
                    TmHandler::Raw => return Ok(LuaValue::Nil),
                    TmHandler::Table(next) => {
                        current = LuaValue::Table(next);
                        continue;
                    }
                    TmHandler::Function(f) => {
                        let results =
                            execute::call_function(self, f, vec![current, key.clone()], 1)?;
                        return Ok(results.into_iter().next().unwrap_or(LuaValue::Nil));
                    }
                }
            }
            // Not a table: only a metamethod can make it indexable.
            match self.index_handler(&current, TmKind::Index) {
                TmHandler::Raw => {
                    let tn = current.type_name();
                    return Err(self.error_runtime(format!("attempt to index a {} value", tn)));
                }
                TmHandler::Table(next) => current = LuaValue::Table(next),
                TmHandler::Function(f) => {
                    let results = execute::call_function(self, f, vec![current, key.clone()], 1)?;
                    return Ok(results.into_iter().next().unwrap_or(LuaValue::Nil));
                }
            }
        }
        Err(self.error_runtime("'__index' chain too long; possible loop"))
    }

    /// `t[key] = value` honoring `__newindex` chains.
    pub fn table_set(&mut self, t: &LuaValue, key: LuaValue, value: LuaValue) -> LuaResult<()> {
        let mut current = t.clone();
        for _ in 0..self.options.max_meta_depth {
            if let LuaValue::Table(id) = &current {
                let has_key = !self.pool.table(*id).raw_get(&key).is_nil();
                if has_key {
                    return match self.pool.table_mut(*id).raw_set(key, value) {
                        Ok(()) => Ok(()),
                        Err(e) => Err(self.table_set_error(e)),
                    };
                }
                match self.index_handler(&current, TmKind::NewIndex) {
                    TmHandler::Raw => {
                        return match self.pool.table_mut(*id).raw_set(key, value) {
                            Ok(()) => Ok(()),
                            Err(e) => Err(self.table_set_error(e)),
                        };
                    }
                    TmHandler::Table(next) => {
                        current = LuaValue::Table(next);
                        continue;
                    }
                    TmHandler::Function(f) => {
                        execute::call_function(self, f, vec![current, key, value], 0)?;
                        return Ok(());
                    }
                }
            }
            match self.index_handler(&current, TmKind::NewIndex) {
                TmHandler::Raw => {
                    let tn = current.type_name();
                    return Err(self.error_runtime(format!("attempt to index a {} value", tn)));
                }
                TmHandler::Table(next) => current = LuaValue::Table(next),
                TmHandler::Function(f) => {
                    execute::call_function(self, f, vec![current, key, value], 0)?;
                    return Ok(());
                }
            }
        }
        Err(self.error_runtime("'__newindex' chain too long; possible loop"))
    }

    // ----- conversions shared by the VM and the API -----

    /// Number coercion: numbers pass through, strings parse with the numeral
    /// grammar.
    pub fn coerce_number(&self, v: &LuaValue) -> Option<LuaValue> {
        match v {
            LuaValue::Integer(_) | LuaValue::Float(_) => Some(v.clone()),
            LuaValue::String(s) => number::str_to_number(s.as_bytes()),
            _ => None,
        }
    }

    /// Integer coercion (`tointeger` rules over numbers and numeric strings).
    pub fn coerce_integer(&self, v: &LuaValue) -> Option<i64> {
        match v {
            LuaValue::Integer(i) => Some(*i),
            LuaValue::Float(f) => number::float_to_integer(*f),
            LuaValue::String(s) => number::str_to_integer(s.as_bytes()),
            _ => None,
        }
    }

    /// String coercion for concat and the string library: strings pass
    /// through, numbers format.
    pub fn coerce_string(&mut self, v: &LuaValue) -> Option<LuaStr> {
        match v {
            LuaValue::String(s) => Some(s.clone()),
            LuaValue::Integer(i) => Some(self.strings.intern(number::int_to_lua_string(*i).as_bytes())),
            LuaValue::Float(f) => Some(self.strings.intern(number::float_to_lua_string(*f).as_bytes())),
            _ => None,
        }
    }

    /// `tostring` honoring `__tostring` and `__name`.
    pub fn tostring_value(&mut self, v: &LuaValue) -> LuaResult<LuaStr> {
        if let Some(mm) = self.get_metamethod(v, TmKind::ToString) {
            let results = execute::call_function(self, mm, vec![v.clone()], 1)?;
            let r = results.into_iter().next().unwrap_or(LuaValue::Nil);
            return match r {
                LuaValue::String(s) => Ok(s),
                _ => Err(self.error_runtime("'__tostring' must return a string")),
            };
        }
        if let Some(s) = self.coerce_string(v) {
            return Ok(s);
        }
        let rendered = match self.get_metamethod(v, TmKind::Name) {
            Some(LuaValue::String(n)) => {
                format!("{}: {}", n.to_display(), identity_suffix(v))
            }
            _ => format!("{}", v),
        };
        Ok(self.strings.intern(rendered.as_bytes()))
    }

    /// `#v` honoring `__len`.
    pub fn length_of(&mut self, v: &LuaValue) -> LuaResult<LuaValue> {
        match v {
            LuaValue::String(s) => Ok(LuaValue::Integer(s.len() as i64)),
            LuaValue::Table(id) => {
                if let Some(mm) = self.get_metamethod(v, TmKind::Len) {
                    let results = execute::call_function(self, mm, vec![v.clone()], 1)?;
                    return Ok(results.into_iter().next().unwrap_or(LuaValue::Nil));
                }
                Ok(LuaValue::Integer(self.pool.table(*id).border()))
            }
            _ => {
                if let Some(mm) = self.get_metamethod(v, TmKind::Len) {
                    let results = execute::call_function(self, mm, vec![v.clone()], 1)?;
                    return Ok(results.into_iter().next().unwrap_or(LuaValue::Nil));
                }
                let tn = v.type_name();
                Err(self.error_runtime(format!("attempt to get length of a {} value", tn)))
            }
        }
    }

    /// Concatenation of two values with context union and `__concat`.
    pub fn concat_values(&mut self, a: LuaValue, b: LuaValue) -> LuaResult<LuaValue> {
        let a_ok = a.is_string() || a.is_number();
        let b_ok = b.is_string() || b.is_number();
        if a_ok && b_ok {
            let sa = match self.coerce_string(&a) {
                Some(s) => s,
                None => return Err(self.error_runtime("attempt to concatenate")),
            };
            let sb = match self.coerce_string(&b) {
                Some(s) => s,
                None => return Err(self.error_runtime("attempt to concatenate")),
            };
            let mut bytes = Vec::with_capacity(sa.len() + sb.len());
            bytes.extend_from_slice(sa.as_bytes());
            bytes.extend_from_slice(sb.as_bytes());
            let mut ctx = ContextBuilder::new();
            ctx.absorb(&sa);
            ctx.absorb(&sb);
            return Ok(LuaValue::String(ctx.build(bytes)));
        }
        let mm = self
            .get_metamethod(&a, TmKind::Concat)
            .or_else(|| self.get_metamethod(&b, TmKind::Concat));
        match mm {
            Some(f) => {
                let results = execute::call_function(self, f, vec![a, b], 1)?;
                Ok(results.into_iter().next().unwrap_or(LuaValue::Nil))
            }
            None => {
                let bad = if a_ok { &b } else { &a };
                let tn = bad.type_name();
                Err(self.error_runtime(format!("attempt to concatenate a {} value", tn)))
            }
        }
    }

    // ----- garbage collection -----

    /// Explicit full collection: marks from the stack, registry, frames and
    /// open upvalues, sweeps the pools, and purges dead interned strings.
    pub fn collect_garbage(&mut self) -> usize {
        let mut roots: Vec<LuaValue> = Vec::with_capacity(self.top + self.frames.len() + 4);
        roots.extend(self.stack[..self.top.min(self.stack.len())].iter().cloned());
        roots.push(LuaValue::Table(self.registry));
        if let Some(m) = self.string_meta {
            roots.push(LuaValue::Table(m));
        }
        roots.push(self.error_value.clone());
        for frame in &self.frames {
            roots.push(frame.func.clone());
        }
        let upvalue_roots: Vec<UpvalueId> = self.open_upvalues.clone();
        let freed = self.pool.collect(&roots, &upvalue_roots);
        let purged = self.strings.purge();
        log::debug!("collect_garbage: {} objects freed, {} strings purged", freed, purged);
        freed
    }

    // ----- compile / load / execute -----

    pub fn compile(&mut self, source: &str, chunk_name: &str) -> LuaResult<Proto> {
        crate::compiler::Compiler::compile(self, source, chunk_name)
    }

    /// Loads a chunk from bytes (text or precompiled) into a closure value
    /// whose first upvalue is bound to the globals table.
    pub fn load_chunk(&mut self, bytes: &[u8], chunk_name: &str, mode: LoadMode) -> LuaResult<LuaValue> {
        let is_binary = bytes.first() == Some(&0x1b);
        let proto = if is_binary {
            if mode == LoadMode::Text {
                return Err(self.raise(
                    LuaError::Syntax,
                    format!("attempt to load a binary chunk (mode is '{}')", "t"),
                ));
            }
            crate::binary::undump(self, bytes)?
        } else {
            if mode == LoadMode::Binary {
                return Err(self.raise(
                    LuaError::Syntax,
                    format!("attempt to load a text chunk (mode is '{}')", "b"),
                ));
            }
            let text = String::from_utf8_lossy(bytes);
            self.compile(&text, chunk_name)?
        };
        Ok(self.make_main_closure(Rc::new(proto)))
    }

    /// Wraps a main-chunk prototype into a closure with `_ENV` bound to the
    /// globals table.
    pub(crate) fn make_main_closure(&mut self, proto: Rc<Proto>) -> LuaValue {
        let env = self
            .pool
            .create_upvalue(LuaUpvalue::closed(LuaValue::Table(self.globals)));
        self.new_lua_closure(proto, vec![env])
    }

    /// Runs a main chunk and returns all of its results.
    pub fn execute(&mut self, proto: Rc<Proto>) -> LuaResult<Vec<LuaValue>> {
        let f = self.make_main_closure(proto);
        execute::call_function(self, f, Vec::new(), -1)
    }

    pub fn execute_string(&mut self, source: &str) -> LuaResult<Vec<LuaValue>> {
        let proto = self.compile(source, "chunk")?;
        self.execute(Rc::new(proto))
    }

    /// Registers the standard libraries.
    pub fn open_libs(&mut self) -> LuaResult<()> {
        crate::lib_registry::standard_registry().load_all(self)
    }

    // ----- calls (thin wrappers over the execute module) -----

    /// Unprotected call with argument values; errors propagate.
    pub fn call_values(
        &mut self,
        f: LuaValue,
        args: Vec<LuaValue>,
        nresults: i32,
    ) -> LuaResult<Vec<LuaValue>> {
        execute::call_function(self, f, args, nresults)
    }

    /// Protected call; on failure returns `(false, [error object])`.
    pub fn pcall_values(
        &mut self,
        f: LuaValue,
        args: Vec<LuaValue>,
    ) -> LuaResult<(bool, Vec<LuaValue>)> {
        match execute::protected_call(self, f, args, None) {
            execute::Protected::Ok(results) => Ok((true, results)),
            execute::Protected::Caught { error, .. } => Ok((false, vec![error])),
        }
    }
}

fn identity_suffix(v: &LuaValue) -> String {
    match v {
        LuaValue::Table(id) => format!("{:#x}", id.index()),
        LuaValue::Userdata(id) => format!("{:#x}", id.index()),
        LuaValue::Function(id) => format!("{:#x}", id.index()),
        _ => String::from("?"),
    }
}
