// Per-function compilation state: the prototype being built, the register
// allocator, active locals, blocks, and pending gotos/labels.

use ahash::AHashMap;
use smol_str::SmolStr;

use crate::lua_value::{LuaValue, Proto};

/// Key for constant-pool deduplication. Integers and floats never share an
/// entry even when numerically equal (`1` vs `1.0` are distinct constants).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstKey {
    Nil,
    True,
    False,
    Int(i64),
    Flt(u64),
    Str(Vec<u8>),
}

/// Declaration attribute of a local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarAttrib {
    Regular,
    /// `<const>`: read-only; when the initializer is a compile-time constant
    /// the variable occupies no register at all.
    Const,
    /// `<close>`: read-only and to-be-closed on scope exit.
    Close,
}

/// Numeric codes recorded in upvalue descriptors (binary format field).
pub fn attrib_code(a: VarAttrib) -> u8 {
    match a {
        VarAttrib::Regular => 0,
        VarAttrib::Const => 1,
        VarAttrib::Close => 2,
    }
}

pub struct ActiveVar {
    pub name: SmolStr,
    pub attrib: VarAttrib,
    /// Register, for register-resident variables.
    pub reg: u32,
    /// Set for `<const>` locals whose initializer folded to a constant; such
    /// variables live only in the compiler.
    pub k_value: Option<LuaValue>,
    pub start_pc: u32,
}

impl ActiveVar {
    pub fn in_register(&self) -> bool {
        self.k_value.is_none()
    }
}

/// A pending `goto` (or `break`) waiting for its label.
pub struct GotoDesc {
    pub name: SmolStr,
    /// pc of the jump instruction to patch.
    pub pc: i32,
    pub line: u32,
    /// Register level of active locals at the jump.
    pub nact_regs: u32,
    /// The jump left a scope whose locals are captured; the label must
    /// close.
    pub close: bool,
}

/// A declared label.
pub struct LabelDesc {
    pub name: SmolStr,
    /// Code position of the label.
    pub pc: i32,
    pub nact_regs: u32,
}

/// Lexical block bookkeeping.
pub struct BlockCnt {
    pub prev: Option<Box<BlockCnt>>,
    /// Index of the first label/goto belonging to this block.
    pub first_label: usize,
    pub first_goto: usize,
    /// Active locals outside the block (restored on exit).
    pub nactvar: usize,
    pub free_reg: u32,
    /// Some local in the block is captured by a closure.
    pub upval: bool,
    pub is_loop: bool,
    /// Block declares (or is inside the scope of) a to-be-closed local.
    pub inside_tbc: bool,
}

pub struct FuncState {
    pub proto: Proto,
    pub constants: AHashMap<ConstKey, u32>,

    /// First free register.
    pub free_reg: u32,
    /// Declared locals, compile-time constants included. Entries past
    /// `nactive` are declared but not yet in scope (their initializers are
    /// still being compiled).
    pub actvar: Vec<ActiveVar>,
    pub nactive: usize,
    pub block: Option<Box<BlockCnt>>,

    pub gotos: Vec<GotoDesc>,
    pub labels: Vec<LabelDesc>,

    /// Function needs a CLOSE before returning (captured locals exist).
    pub needs_close: bool,
    /// pc of the latest jump target, for dead-store decisions.
    pub last_target: i32,
    /// Current source line fed to emitted instructions.
    pub line: u32,
}

/// Register file limit per function.
pub const MAX_REGS: u32 = 255;

impl FuncState {
    pub fn new(source: Option<String>, line_defined: u32) -> Self {
        let mut proto = Proto::new();
        proto.source = source;
        proto.line_defined = line_defined;
        FuncState {
            proto,
            constants: AHashMap::new(),
            free_reg: 0,
            actvar: Vec::new(),
            nactive: 0,
            block: None,
            gotos: Vec::new(),
            labels: Vec::new(),
            needs_close: false,
            last_target: -1,
            line: line_defined.max(1),
        }
    }

    /// Number of registers currently held by in-scope locals.
    pub fn nvar_regs(&self) -> u32 {
        self.actvar[..self.nactive]
            .iter()
            .filter(|v| v.in_register())
            .count() as u32
    }

    /// Resolves a name among in-scope locals, innermost first. Pending
    /// declarations are invisible, so `local x = x` reads the outer x.
    pub fn search_var(&self, name: &str) -> Option<usize> {
        self.actvar[..self.nactive]
            .iter()
            .rposition(|v| v.name.as_str() == name)
    }

    /// Marks the block that declared the local at register `level` as having
    /// a captured local, so its exits emit CLOSE. `free_reg` at block entry
    /// is the register level of its first local.
    pub fn mark_upval_block(&mut self, level: u32) {
        self.needs_close = true;
        let mut bl = self.block.as_mut();
        while let Some(b) = bl {
            if b.free_reg <= level || b.prev.is_none() {
                b.upval = true;
                return;
            }
            bl = b.prev.as_mut();
        }
    }
}
