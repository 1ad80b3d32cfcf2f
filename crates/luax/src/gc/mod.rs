// Object pools for the reference values owned by a VM state.
//
// Tables, closures, userdata and upvalue cells live in slab pools and are
// addressed by Copy ids; values on the Lua stack stay small and the state can
// be torn down as a unit. Strings are immutable and reference-counted
// (`LuaStr`), so they are not traced here; the interner purge drops unused
// entries instead.
//
// Collection is a stop-the-world mark-sweep that only runs at explicit safe
// points (`collectgarbage("collect")` or embedder request), so no write
// barriers are required.

mod object_pool;
mod string_interner;

pub use object_pool::{ObjectPool, Slab};
pub use string_interner::StringInterner;

use crate::lua_value::{LuaClosure, LuaValue, UpvalueState};

/// Id of a table in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableId(pub(crate) u32);

/// Id of a closure (Lua or host) in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub(crate) u32);

/// Id of a full userdata in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserdataId(pub(crate) u32);

/// Id of an upvalue cell in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpvalueId(pub(crate) u32);

impl TableId {
    #[inline(always)]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl FunctionId {
    #[inline(always)]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl UserdataId {
    #[inline(always)]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl UpvalueId {
    #[inline(always)]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// A reference into one of the four pools, used on the mark worklist.
#[derive(Debug, Clone, Copy)]
enum GcRef {
    Table(TableId),
    Function(FunctionId),
    Userdata(UserdataId),
    Upvalue(UpvalueId),
}

/// Transient mark state for one collection cycle.
struct Marker {
    tables: Vec<bool>,
    functions: Vec<bool>,
    userdata: Vec<bool>,
    upvalues: Vec<bool>,
    worklist: Vec<GcRef>,
}

impl Marker {
    fn new(pool: &ObjectPool) -> Self {
        Marker {
            tables: vec![false; pool.tables.capacity_slots()],
            functions: vec![false; pool.functions.capacity_slots()],
            userdata: vec![false; pool.userdata.capacity_slots()],
            upvalues: vec![false; pool.upvalues.capacity_slots()],
            worklist: Vec::new(),
        }
    }

    fn mark_value(&mut self, v: &LuaValue) {
        match v {
            LuaValue::Table(id) => self.mark(GcRef::Table(*id)),
            LuaValue::Function(id) => self.mark(GcRef::Function(*id)),
            LuaValue::Userdata(id) => self.mark(GcRef::Userdata(*id)),
            _ => {}
        }
    }

    fn mark(&mut self, r: GcRef) {
        let seen = match r {
            GcRef::Table(id) => {
                let s = self.tables[id.0 as usize];
                self.tables[id.0 as usize] = true;
                s
            }
            GcRef::Function(id) => {
                let s = self.functions[id.0 as usize];
                self.functions[id.0 as usize] = true;
                s
            }
            GcRef::Userdata(id) => {
                let s = self.userdata[id.0 as usize];
                self.userdata[id.0 as usize] = true;
                s
            }
            GcRef::Upvalue(id) => {
                let s = self.upvalues[id.0 as usize];
                self.upvalues[id.0 as usize] = true;
                s
            }
        };
        if !seen {
            self.worklist.push(r);
        }
    }
}

impl ObjectPool {
    /// Full mark-sweep over the pools. `roots` must name every value the VM
    /// can still reach: the live stack window, the registry, frame closures
    /// and open upvalue cells.
    pub fn collect(&mut self, roots: &[LuaValue], upvalue_roots: &[UpvalueId]) -> usize {
        let mut m = Marker::new(self);
        for v in roots {
            m.mark_value(v);
        }
        for &id in upvalue_roots {
            m.mark(GcRef::Upvalue(id));
        }

        while let Some(r) = m.worklist.pop() {
            self.trace(r, &mut m);
        }

        let mut freed = 0;
        freed += self.tables.sweep(&m.tables);
        freed += self.functions.sweep(&m.functions);
        freed += self.userdata.sweep(&m.userdata);
        freed += self.upvalues.sweep(&m.upvalues);
        log::debug!("gc: swept {} objects", freed);
        freed
    }

    fn trace(&self, r: GcRef, m: &mut Marker) {
        match r {
            GcRef::Table(id) => {
                if let Some(t) = self.tables.get(id.0) {
                    for v in t.array_part() {
                        m.mark_value(v);
                    }
                    for (k, v) in t.hash_entries() {
                        m.mark_value(k);
                        m.mark_value(v);
                    }
                    if let Some(meta) = t.metatable() {
                        m.mark(GcRef::Table(meta));
                    }
                }
            }
            GcRef::Function(id) => {
                if let Some(f) = self.functions.get(id.0) {
                    match f {
                        LuaClosure::Lua(lf) => {
                            for &uv in &lf.upvalues {
                                m.mark(GcRef::Upvalue(uv));
                            }
                        }
                        LuaClosure::Host(hf) => {
                            for &uv in &hf.upvalues {
                                m.mark(GcRef::Upvalue(uv));
                            }
                        }
                    }
                }
            }
            GcRef::Userdata(id) => {
                if let Some(u) = self.userdata.get(id.0) {
                    for v in &u.user_values {
                        m.mark_value(v);
                    }
                    if let Some(meta) = u.meta {
                        m.mark(GcRef::Table(meta));
                    }
                }
            }
            GcRef::Upvalue(id) => {
                if let Some(uv) = self.upvalues.get(id.0) {
                    // An open cell aliases a stack slot; the stack is a root.
                    if let UpvalueState::Closed(v) = &uv.state {
                        m.mark_value(v);
                    }
                }
            }
        }
    }
}
