// The tagged value model.
//
// Scalars (nil/boolean/integer/float) are stored inline and compare by value.
// Strings are immutable reference-counted byte sequences carrying an optional
// context set; they compare by bytes. Tables, closures and userdata live in
// the state's object pools and are addressed by Copy ids, so identity is the
// id and the whole state can be torn down as a unit.

mod lua_closure;
mod lua_table;
pub mod number;
mod proto;
mod userdata;

pub use lua_closure::{HostClosure, LuaClosure, LuaFunction, LuaUpvalue, UpvalueState};
pub use lua_table::{LuaTable, TableSetError};
pub use proto::{LocVar, Proto, UpvalueDesc};
pub use userdata::{HostValue, LuaUserdata};

use ahash::AHashSet;
use smol_str::SmolStr;
use std::rc::Rc;

use crate::gc::{FunctionId, TableId, UserdataId};

/// The context of a string: an unordered set of marker strings that
/// propagates through every string-producing operation. Compares by
/// membership.
pub type StrContext = AHashSet<SmolStr>;

/// Immutable string payload. The hash over the bytes is precomputed so table
/// lookups never rehash, and the context rides along without affecting
/// equality or hashing.
pub struct LuaStrData {
    bytes: Box<[u8]>,
    hash: u64,
    context: Option<Box<StrContext>>,
}

/// Shared handle to a string payload.
pub type LuaStr = Rc<LuaStrData>;

fn hash_bytes(bytes: &[u8]) -> u64 {
    use std::hash::{BuildHasher, Hasher};
    // Fixed seeds: string hashes must agree across all values in a process.
    let state = ahash::RandomState::with_seeds(
        0x243f_6a88_85a3_08d3,
        0x1319_8a2e_0370_7344,
        0xa409_3822_299f_31d0,
        0x082e_fa98_ec4e_6c89,
    );
    let mut h = state.build_hasher();
    h.write(bytes);
    h.finish()
}

impl LuaStrData {
    pub fn new(bytes: Vec<u8>) -> LuaStr {
        let hash = hash_bytes(&bytes);
        Rc::new(LuaStrData {
            bytes: bytes.into_boxed_slice(),
            hash,
            context: None,
        })
    }

    pub fn with_context(bytes: Vec<u8>, context: StrContext) -> LuaStr {
        let hash = hash_bytes(&bytes);
        let context = if context.is_empty() {
            None
        } else {
            Some(Box::new(context))
        };
        Rc::new(LuaStrData {
            bytes: bytes.into_boxed_slice(),
            hash,
            context,
        })
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The bytes as UTF-8, if they are valid UTF-8.
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    /// Lossy UTF-8 view for error messages and diagnostics.
    pub fn to_display(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline(always)]
    pub fn hash_value(&self) -> u64 {
        self.hash
    }

    /// The context set; empty when the string carries none.
    pub fn context(&self) -> Option<&StrContext> {
        self.context.as_deref()
    }

    pub fn has_context(&self) -> bool {
        self.context.is_some()
    }

    /// Union of this string's context with `other`'s, for operations that
    /// combine strings. Returns `None` when both are context-free.
    pub fn merged_context(&self, other: &LuaStrData) -> Option<StrContext> {
        match (&self.context, &other.context) {
            (None, None) => None,
            (Some(a), None) => Some((**a).clone()),
            (None, Some(b)) => Some((**b).clone()),
            (Some(a), Some(b)) => {
                let mut out = (**a).clone();
                for s in b.iter() {
                    out.insert(s.clone());
                }
                Some(out)
            }
        }
    }
}

/// Accumulates contexts across several operand strings; used by concat,
/// `string.format`, `string.gsub`, `string.rep` and friends.
#[derive(Default)]
pub struct ContextBuilder {
    set: StrContext,
}

impl ContextBuilder {
    pub fn new() -> Self {
        ContextBuilder {
            set: StrContext::new(),
        }
    }

    pub fn absorb(&mut self, s: &LuaStrData) {
        if let Some(ctx) = s.context() {
            for m in ctx.iter() {
                self.set.insert(m.clone());
            }
        }
    }

    pub fn absorb_value(&mut self, v: &LuaValue) {
        if let LuaValue::String(s) = v {
            self.absorb(s);
        }
    }

    pub fn build(self, bytes: Vec<u8>) -> LuaStr {
        if self.set.is_empty() {
            LuaStrData::new(bytes)
        } else {
            LuaStrData::with_context(bytes, self.set)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// A Lua value. `Clone` is cheap: scalars copy, strings bump a refcount and
/// reference kinds copy an id.
#[derive(Clone)]
pub enum LuaValue {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(LuaStr),
    Table(TableId),
    Function(FunctionId),
    Userdata(UserdataId),
}

/// Discriminant-only view for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LuaValueKind {
    Nil,
    Boolean,
    Integer,
    Float,
    String,
    Table,
    Function,
    Userdata,
}

impl LuaValue {
    #[inline(always)]
    pub fn nil() -> Self {
        LuaValue::Nil
    }

    #[inline(always)]
    pub fn boolean(b: bool) -> Self {
        LuaValue::Boolean(b)
    }

    #[inline(always)]
    pub fn integer(i: i64) -> Self {
        LuaValue::Integer(i)
    }

    #[inline(always)]
    pub fn float(f: f64) -> Self {
        LuaValue::Float(f)
    }

    #[inline(always)]
    pub fn string(s: LuaStr) -> Self {
        LuaValue::String(s)
    }

    pub fn kind(&self) -> LuaValueKind {
        match self {
            LuaValue::Nil => LuaValueKind::Nil,
            LuaValue::Boolean(_) => LuaValueKind::Boolean,
            LuaValue::Integer(_) => LuaValueKind::Integer,
            LuaValue::Float(_) => LuaValueKind::Float,
            LuaValue::String(_) => LuaValueKind::String,
            LuaValue::Table(_) => LuaValueKind::Table,
            LuaValue::Function(_) => LuaValueKind::Function,
            LuaValue::Userdata(_) => LuaValueKind::Userdata,
        }
    }

    /// The name `type()` reports.
    pub fn type_name(&self) -> &'static str {
        match self {
            LuaValue::Nil => "nil",
            LuaValue::Boolean(_) => "boolean",
            LuaValue::Integer(_) | LuaValue::Float(_) => "number",
            LuaValue::String(_) => "string",
            LuaValue::Table(_) => "table",
            LuaValue::Function(_) => "function",
            LuaValue::Userdata(_) => "userdata",
        }
    }

    // ----- type predicates -----

    #[inline(always)]
    pub fn is_nil(&self) -> bool {
        matches!(self, LuaValue::Nil)
    }

    #[inline(always)]
    pub fn is_boolean(&self) -> bool {
        matches!(self, LuaValue::Boolean(_))
    }

    #[inline(always)]
    pub fn is_integer(&self) -> bool {
        matches!(self, LuaValue::Integer(_))
    }

    #[inline(always)]
    pub fn is_float(&self) -> bool {
        matches!(self, LuaValue::Float(_))
    }

    #[inline(always)]
    pub fn is_number(&self) -> bool {
        matches!(self, LuaValue::Integer(_) | LuaValue::Float(_))
    }

    #[inline(always)]
    pub fn is_string(&self) -> bool {
        matches!(self, LuaValue::String(_))
    }

    #[inline(always)]
    pub fn is_table(&self) -> bool {
        matches!(self, LuaValue::Table(_))
    }

    #[inline(always)]
    pub fn is_function(&self) -> bool {
        matches!(self, LuaValue::Function(_))
    }

    #[inline(always)]
    pub fn is_userdata(&self) -> bool {
        matches!(self, LuaValue::Userdata(_))
    }

    // ----- truthiness: only nil and false are falsy -----

    #[inline(always)]
    pub fn is_truthy(&self) -> bool {
        !self.is_falsy()
    }

    #[inline(always)]
    pub fn is_falsy(&self) -> bool {
        matches!(self, LuaValue::Nil | LuaValue::Boolean(false))
    }

    // ----- accessors -----

    #[inline(always)]
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            LuaValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Strict: integers only, no float demotion.
    #[inline(always)]
    pub fn as_integer_strict(&self) -> Option<i64> {
        match self {
            LuaValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Lua `tointeger` semantics: floats with an exact integer value convert.
    #[inline]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            LuaValue::Integer(i) => Some(*i),
            LuaValue::Float(f) => number::float_to_integer(*f),
            _ => None,
        }
    }

    /// Any number as a float.
    #[inline(always)]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            LuaValue::Integer(i) => Some(*i as f64),
            LuaValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_lua_str(&self) -> Option<&LuaStr> {
        match self {
            LuaValue::String(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            LuaValue::String(s) => s.as_str(),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_table_id(&self) -> Option<TableId> {
        match self {
            LuaValue::Table(id) => Some(*id),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_function_id(&self) -> Option<FunctionId> {
        match self {
            LuaValue::Function(id) => Some(*id),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_userdata_id(&self) -> Option<UserdataId> {
        match self {
            LuaValue::Userdata(id) => Some(*id),
            _ => None,
        }
    }

    /// Raw equality (`rawequal`, and the fast path of `==`): numbers by
    /// mathematical value, strings by bytes, references by identity.
    pub fn raw_equal(&self, other: &LuaValue) -> bool {
        match (self, other) {
            (LuaValue::Nil, LuaValue::Nil) => true,
            (LuaValue::Boolean(a), LuaValue::Boolean(b)) => a == b,
            (LuaValue::Integer(a), LuaValue::Integer(b)) => a == b,
            (LuaValue::Float(a), LuaValue::Float(b)) => a == b,
            // Mixed subkinds are equal only when the float holds that exact
            // integer; casting the integer would lose precision past 2^53.
            (LuaValue::Integer(a), LuaValue::Float(b)) => number::float_to_integer(*b) == Some(*a),
            (LuaValue::Float(a), LuaValue::Integer(b)) => number::float_to_integer(*a) == Some(*b),
            (LuaValue::String(a), LuaValue::String(b)) => {
                Rc::ptr_eq(a, b) || (a.hash == b.hash && a.bytes == b.bytes)
            }
            (LuaValue::Table(a), LuaValue::Table(b)) => a == b,
            (LuaValue::Function(a), LuaValue::Function(b)) => a == b,
            (LuaValue::Userdata(a), LuaValue::Userdata(b)) => a == b,
            _ => false,
        }
    }

    /// Normalizes a table key: a float with an exact integer value becomes
    /// that integer, so `t[1.0]` and `t[1]` address the same slot.
    pub fn normalize_key(self) -> LuaValue {
        if let LuaValue::Float(f) = self {
            if let Some(i) = number::float_to_integer(f) {
                return LuaValue::Integer(i);
            }
        }
        self
    }

    /// True for a float NaN; NaN is rejected as a table key.
    pub fn is_nan(&self) -> bool {
        matches!(self, LuaValue::Float(f) if f.is_nan())
    }
}

impl Default for LuaValue {
    fn default() -> Self {
        LuaValue::Nil
    }
}

impl PartialEq for LuaValue {
    fn eq(&self, other: &Self) -> bool {
        self.raw_equal(other)
    }
}

// Table keys are never NaN (rejected on write), so reflexivity holds for
// every value actually used as a key.
impl Eq for LuaValue {}

impl std::hash::Hash for LuaValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            LuaValue::Nil => state.write_u8(0),
            LuaValue::Boolean(b) => {
                state.write_u8(1);
                state.write_u8(*b as u8);
            }
            // Integers and integral floats must hash alike; keys are
            // normalized on write but raw lookups may still pass floats.
            LuaValue::Integer(i) => {
                state.write_u8(2);
                state.write_i64(*i);
            }
            LuaValue::Float(f) => {
                if let Some(i) = number::float_to_integer(*f) {
                    state.write_u8(2);
                    state.write_i64(i);
                } else {
                    state.write_u8(3);
                    state.write_u64(f.to_bits());
                }
            }
            LuaValue::String(s) => {
                state.write_u8(4);
                state.write_u64(s.hash);
            }
            LuaValue::Table(id) => {
                state.write_u8(5);
                state.write_u32(id.index());
            }
            LuaValue::Function(id) => {
                state.write_u8(6);
                state.write_u32(id.index());
            }
            LuaValue::Userdata(id) => {
                state.write_u8(7);
                state.write_u32(id.index());
            }
        }
    }
}

impl std::fmt::Debug for LuaValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LuaValue::Nil => write!(f, "nil"),
            LuaValue::Boolean(b) => write!(f, "{}", b),
            LuaValue::Integer(i) => write!(f, "{}", i),
            LuaValue::Float(x) => write!(f, "{}", number::float_to_lua_string(*x)),
            LuaValue::String(s) => write!(f, "{:?}", s.to_display()),
            LuaValue::Table(id) => write!(f, "table: {:#x}", id.index()),
            LuaValue::Function(id) => write!(f, "function: {:#x}", id.index()),
            LuaValue::Userdata(id) => write!(f, "userdata: {:#x}", id.index()),
        }
    }
}

impl std::fmt::Display for LuaValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LuaValue::Nil => write!(f, "nil"),
            LuaValue::Boolean(b) => write!(f, "{}", b),
            LuaValue::Integer(i) => write!(f, "{}", i),
            LuaValue::Float(x) => write!(f, "{}", number::float_to_lua_string(*x)),
            LuaValue::String(s) => write!(f, "{}", s.to_display()),
            LuaValue::Table(id) => write!(f, "table: {:#x}", id.index()),
            LuaValue::Function(id) => write!(f, "function: {:#x}", id.index()),
            LuaValue::Userdata(id) => write!(f, "userdata: {:#x}", id.index()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(LuaValue::Nil.is_falsy());
        assert!(LuaValue::Boolean(false).is_falsy());
        assert!(LuaValue::Boolean(true).is_truthy());
        assert!(LuaValue::Integer(0).is_truthy());
        assert!(LuaValue::Float(0.0).is_truthy());
    }

    #[test]
    fn number_equality_crosses_subkinds() {
        assert!(LuaValue::Integer(1).raw_equal(&LuaValue::Float(1.0)));
        assert!(!LuaValue::Integer(1).raw_equal(&LuaValue::Float(1.5)));
        assert_ne!(LuaValue::Integer(1).kind(), LuaValue::Float(1.0).kind());
    }

    #[test]
    fn string_equality_ignores_context() {
        let plain = LuaStrData::new(b"path".to_vec());
        let mut ctx = StrContext::new();
        ctx.insert(SmolStr::new("drv:abc"));
        let tagged = LuaStrData::with_context(b"path".to_vec(), ctx);
        assert!(LuaValue::String(plain).raw_equal(&LuaValue::String(tagged.clone())));
        assert!(tagged.has_context());
    }

    #[test]
    fn key_normalization() {
        let k = LuaValue::Float(2.0).normalize_key();
        assert!(matches!(k, LuaValue::Integer(2)));
        let k = LuaValue::Float(2.5).normalize_key();
        assert!(matches!(k, LuaValue::Float(_)));
    }

    #[test]
    fn context_builder_unions() {
        let mut a_ctx = StrContext::new();
        a_ctx.insert(SmolStr::new("a"));
        let mut b_ctx = StrContext::new();
        b_ctx.insert(SmolStr::new("b"));
        let a = LuaStrData::with_context(b"x".to_vec(), a_ctx);
        let b = LuaStrData::with_context(b"y".to_vec(), b_ctx);
        let mut builder = ContextBuilder::new();
        builder.absorb(&a);
        builder.absorb(&b);
        let merged = builder.build(b"xy".to_vec());
        let ctx = merged.context().unwrap();
        assert_eq!(ctx.len(), 2);
        assert!(ctx.contains("a") && ctx.contains("b"));
    }
}
