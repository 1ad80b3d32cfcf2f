// Lightweight error kinds - 1 byte on the wire of every Result.
// The error object itself (any Lua value) is stored in the VM; embedders
// recover it, or a formatted message, through `LuaVM::take_error`.

/// What went wrong, without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LuaError {
    /// Lexer, parser or binary loader rejected the input.
    Syntax,
    /// The VM rejected an operation at runtime.
    Runtime,
    /// A stack API argument failed a type check.
    Type,
    /// The allocator refused a request (stack or pool growth limit).
    Memory,
    /// The message handler of a protected call itself raised.
    Handler,
    /// The cancellation token was observed.
    Cancelled,
    /// A mutation was attempted on a frozen value.
    Frozen,
}

impl std::fmt::Display for LuaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LuaError::Syntax => write!(f, "syntax error"),
            LuaError::Runtime => write!(f, "runtime error"),
            LuaError::Type => write!(f, "type error"),
            LuaError::Memory => write!(f, "not enough memory"),
            LuaError::Handler => write!(f, "error in error handling"),
            LuaError::Cancelled => write!(f, "execution cancelled"),
            LuaError::Frozen => write!(f, "attempt to modify a frozen value"),
        }
    }
}

impl std::error::Error for LuaError {}

pub type LuaResult<T> = Result<T, LuaError>;

/// Error kind plus the rendered message, for embedders that want a single
/// `std::error::Error` value after the VM call returns.
///
/// ```ignore
/// let results = vm.execute(proto).map_err(|e| vm.into_full_error(e))?;
/// ```
#[derive(Debug, Clone)]
pub struct LuaFullError {
    pub kind: LuaError,
    pub message: String,
}

impl LuaFullError {
    #[inline]
    pub fn kind(&self) -> LuaError {
        self.kind
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for LuaFullError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for LuaFullError {}
