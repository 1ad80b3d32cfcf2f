// Function prototypes: the immutable compiled form of a Lua function.

use smol_str::SmolStr;
use std::rc::Rc;

use crate::lua_value::LuaValue;

/// How an upvalue of a prototype is captured from the enclosing function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpvalueDesc {
    pub name: SmolStr,
    /// True when the upvalue captures a parent local (stack slot); false when
    /// it re-captures one of the parent's upvalues.
    pub in_stack: bool,
    /// Register index (when `in_stack`) or parent upvalue index.
    pub index: u8,
    /// Declaration kind of the captured variable (regular / const / close),
    /// carried for the binary format.
    pub kind: u8,
}

/// Debug record for a local variable's live range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocVar {
    pub name: SmolStr,
    pub start_pc: u32,
    pub end_pc: u32,
}

/// Immutable after compilation. Constants are restricted by construction to
/// nil, booleans, numbers and strings.
#[derive(Debug)]
pub struct Proto {
    pub code: Vec<u32>,
    pub constants: Vec<LuaValue>,
    pub protos: Vec<Rc<Proto>>,
    pub upvalues: Vec<UpvalueDesc>,

    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,

    // Debug information.
    pub source: Option<String>,
    pub line_defined: u32,
    pub last_line_defined: u32,
    /// Absolute source line per instruction.
    pub line_info: Vec<u32>,
    pub loc_vars: Vec<LocVar>,
}

impl Proto {
    pub fn new() -> Self {
        Proto {
            code: Vec::new(),
            constants: Vec::new(),
            protos: Vec::new(),
            upvalues: Vec::new(),
            num_params: 0,
            is_vararg: false,
            max_stack_size: 2,
            source: None,
            line_defined: 0,
            last_line_defined: 0,
            line_info: Vec::new(),
            loc_vars: Vec::new(),
        }
    }

    /// Source line for the instruction at `pc`, or 0 when stripped.
    pub fn line_at(&self, pc: usize) -> u32 {
        self.line_info.get(pc).copied().unwrap_or(0)
    }

    /// Name shown in error positions ("[string ...]" or a chunk name).
    pub fn source_name(&self) -> &str {
        self.source.as_deref().unwrap_or("?")
    }

    /// True for the top-level chunk of a compilation.
    pub fn is_main_chunk(&self) -> bool {
        self.line_defined == 0
    }
}

impl Default for Proto {
    fn default() -> Self {
        Self::new()
    }
}

/// Structural equality for prototypes, used by round-trip tests. Compares
/// everything the binary format carries.
impl PartialEq for Proto {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
            && self.num_params == other.num_params
            && self.is_vararg == other.is_vararg
            && self.max_stack_size == other.max_stack_size
            && self.upvalues == other.upvalues
            && self.source == other.source
            && self.line_defined == other.line_defined
            && self.last_line_defined == other.last_line_defined
            && self.line_info == other.line_info
            && self.loc_vars == other.loc_vars
            && self.constants.len() == other.constants.len()
            && self
                .constants
                .iter()
                .zip(&other.constants)
                .all(|(a, b)| constant_eq(a, b))
            && self.protos.len() == other.protos.len()
            && self.protos.iter().zip(&other.protos).all(|(a, b)| a == b)
    }
}

/// Constant equality must distinguish subkinds (`1` vs `1.0` dump to
/// different tags), unlike Lua value equality.
fn constant_eq(a: &LuaValue, b: &LuaValue) -> bool {
    match (a, b) {
        (LuaValue::Nil, LuaValue::Nil) => true,
        (LuaValue::Boolean(x), LuaValue::Boolean(y)) => x == y,
        (LuaValue::Integer(x), LuaValue::Integer(y)) => x == y,
        (LuaValue::Float(x), LuaValue::Float(y)) => x.to_bits() == y.to_bits(),
        (LuaValue::String(x), LuaValue::String(y)) => x.as_bytes() == y.as_bytes(),
        _ => false,
    }
}
