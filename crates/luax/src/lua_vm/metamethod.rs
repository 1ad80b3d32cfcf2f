// Metamethod events.
//
// Every polymorphic operator resolves through `TmKind`; the result of a
// lookup is a `TmHandler` tagged variant so indexing chains can walk tables
// without re-dispatching through function calls.

use crate::gc::TableId;
use crate::lua_value::LuaValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TmKind {
    Index,
    NewIndex,
    Call,
    ToString,
    Pairs,
    Metatable,
    Close,
    Name,
    Eq,
    Lt,
    Le,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    BNot,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Concat,
    Len,
}

impl TmKind {
    pub fn name(self) -> &'static str {
        match self {
            TmKind::Index => "__index",
            TmKind::NewIndex => "__newindex",
            TmKind::Call => "__call",
            TmKind::ToString => "__tostring",
            TmKind::Pairs => "__pairs",
            TmKind::Metatable => "__metatable",
            TmKind::Close => "__close",
            TmKind::Name => "__name",
            TmKind::Eq => "__eq",
            TmKind::Lt => "__lt",
            TmKind::Le => "__le",
            TmKind::Add => "__add",
            TmKind::Sub => "__sub",
            TmKind::Mul => "__mul",
            TmKind::Div => "__div",
            TmKind::Mod => "__mod",
            TmKind::Pow => "__pow",
            TmKind::Unm => "__unm",
            TmKind::BNot => "__bnot",
            TmKind::IDiv => "__idiv",
            TmKind::BAnd => "__band",
            TmKind::BOr => "__bor",
            TmKind::BXor => "__bxor",
            TmKind::Shl => "__shl",
            TmKind::Shr => "__shr",
            TmKind::Concat => "__concat",
            TmKind::Len => "__len",
        }
    }

    /// Event code carried in the C field of MMBIN/MMBINI/MMBINK, following
    /// the reference TMS numbering.
    pub fn code(self) -> u32 {
        match self {
            TmKind::Add => 6,
            TmKind::Sub => 7,
            TmKind::Mul => 8,
            TmKind::Mod => 9,
            TmKind::Pow => 10,
            TmKind::Div => 11,
            TmKind::IDiv => 12,
            TmKind::BAnd => 13,
            TmKind::BOr => 14,
            TmKind::BXor => 15,
            TmKind::Shl => 16,
            TmKind::Shr => 17,
            TmKind::Unm => 18,
            TmKind::BNot => 19,
            TmKind::Concat => 22,
            _ => 0,
        }
    }

    /// Decodes an MMBIN event code.
    pub fn from_code(code: u32) -> Option<TmKind> {
        Some(match code {
            6 => TmKind::Add,
            7 => TmKind::Sub,
            8 => TmKind::Mul,
            9 => TmKind::Mod,
            10 => TmKind::Pow,
            11 => TmKind::Div,
            12 => TmKind::IDiv,
            13 => TmKind::BAnd,
            14 => TmKind::BOr,
            15 => TmKind::BXor,
            16 => TmKind::Shl,
            17 => TmKind::Shr,
            18 => TmKind::Unm,
            19 => TmKind::BNot,
            22 => TmKind::Concat,
            _ => return None,
        })
    }

    /// Human-readable operator description for error messages.
    pub fn describe(self) -> &'static str {
        match self {
            TmKind::Index => "index",
            TmKind::NewIndex => "index",
            TmKind::Call => "call",
            TmKind::Concat => "concatenate",
            TmKind::Len => "get length of",
            TmKind::BAnd | TmKind::BOr | TmKind::BXor | TmKind::Shl | TmKind::Shr | TmKind::BNot => {
                "perform bitwise operation on"
            }
            _ => "perform arithmetic on",
        }
    }
}

/// How an indexing event resolved.
pub enum TmHandler {
    /// No metamethod: raw access applies.
    Raw,
    /// `__index`/`__newindex` is a table: indexing recurses into it.
    Table(TableId),
    /// The metamethod is callable: invoke it.
    Function(LuaValue),
}
