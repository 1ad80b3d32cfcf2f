// Library registration.
//
// Each standard library is a named module of host functions plus constant
// values; the registry materializes them into per-state tables at startup
// (no process-wide state). Functions declare purity so the freeze subsystem
// can tell which are safely immutable.

use crate::lua_value::LuaValue;
use crate::lua_vm::{HostFn, LuaError, LuaResult, LuaVM};

/// Builds a constant value for a module slot at load time.
pub type ValueInitializer = fn(&mut LuaVM) -> LuaValue;

/// Runs after a module's table is populated (metatable wiring, seeds).
pub type ModuleInitializer = fn(&mut LuaVM, &LuaValue) -> LuaResult<()>;

pub enum LibraryEntry {
    Function { f: HostFn, pure_fn: bool },
    Value(ValueInitializer),
}

pub struct LibraryModule {
    pub name: &'static str,
    pub entries: Vec<(&'static str, LibraryEntry)>,
    pub initializer: Option<ModuleInitializer>,
}

impl LibraryModule {
    pub fn new(name: &'static str) -> Self {
        LibraryModule {
            name,
            entries: Vec::new(),
            initializer: None,
        }
    }

    pub fn with_function(mut self, name: &'static str, f: HostFn) -> Self {
        self.entries
            .push((name, LibraryEntry::Function { f, pure_fn: true }));
        self
    }

    /// A function with observable side effects; the freeze subsystem will
    /// refuse to freeze it.
    pub fn with_impure_function(mut self, name: &'static str, f: HostFn) -> Self {
        self.entries
            .push((name, LibraryEntry::Function { f, pure_fn: false }));
        self
    }

    pub fn with_value(mut self, name: &'static str, init: ValueInitializer) -> Self {
        self.entries.push((name, LibraryEntry::Value(init)));
        self
    }

    pub fn with_initializer(mut self, init: ModuleInitializer) -> Self {
        self.initializer = Some(init);
        self
    }
}

/// Declarative module table:
/// `lib_module!("math", { "abs" => math_abs, ... })`.
#[macro_export]
macro_rules! lib_module {
    ($name:expr, { $($fname:expr => $f:expr),* $(,)? }) => {{
        let mut module = $crate::lib_registry::LibraryModule::new($name);
        $( module = module.with_function($fname, $f); )*
        module
    }};
}

pub struct LibraryRegistry {
    modules: Vec<LibraryModule>,
}

impl LibraryRegistry {
    pub fn new() -> Self {
        LibraryRegistry {
            modules: Vec::new(),
        }
    }

    pub fn register(&mut self, module: LibraryModule) {
        self.modules.push(module);
    }

    pub fn load_all(&self, vm: &mut LuaVM) -> LuaResult<()> {
        for module in &self.modules {
            self.load_module(vm, module)?;
        }
        Ok(())
    }

    pub fn load_module(&self, vm: &mut LuaVM, module: &LibraryModule) -> LuaResult<()> {
        let target = if module.name == "_G" {
            LuaValue::Table(vm.globals())
        } else {
            let t = vm.new_table_with_capacity(0, module.entries.len());
            vm.set_global(module.name, t.clone())?;
            t
        };

        for (name, entry) in &module.entries {
            let value = match entry {
                LibraryEntry::Function { f, pure_fn } => {
                    vm.new_host_function_named(name, *f, *pure_fn)
                }
                LibraryEntry::Value(init) => init(vm),
            };
            let key = vm.new_string(name);
            vm.table_set(&target, key, value)?;
        }

        if let Some(init) = module.initializer {
            init(vm, &target)?;
        }
        Ok(())
    }
}

impl Default for LibraryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The standard library set: base, string, table, math, utf8.
pub fn standard_registry() -> LibraryRegistry {
    let mut registry = LibraryRegistry::new();
    registry.register(crate::stdlib::basic::create_basic_lib());
    registry.register(crate::stdlib::string::create_string_lib());
    registry.register(crate::stdlib::table::create_table_lib());
    registry.register(crate::stdlib::math::create_math_lib());
    registry.register(crate::stdlib::utf8::create_utf8_lib());
    registry
}

// ----- argument checking helpers shared by the libraries -----

pub fn arg_or_nil(vm: &LuaVM, n: usize) -> LuaValue {
    vm.arg(n).unwrap_or(LuaValue::Nil)
}

pub fn type_error(vm: &mut LuaVM, n: usize, fname: &str, expected: &str) -> LuaError {
    let got = match vm.arg(n) {
        Some(v) => v.type_name(),
        None => "no value",
    };
    vm.raise(
        LuaError::Type,
        format!(
            "bad argument #{} to '{}' ({} expected, got {})",
            n, fname, expected, got
        ),
    )
}

pub fn check_any(vm: &mut LuaVM, n: usize, fname: &str) -> LuaResult<LuaValue> {
    match vm.arg(n) {
        Some(v) => Ok(v),
        None => Err(type_error(vm, n, fname, "value")),
    }
}

pub fn check_integer(vm: &mut LuaVM, n: usize, fname: &str) -> LuaResult<i64> {
    let v = arg_or_nil(vm, n);
    match vm.coerce_integer(&v) {
        Some(i) => Ok(i),
        None => {
            if v.is_number() {
                Err(vm.raise(
                    LuaError::Type,
                    format!(
                        "bad argument #{} to '{}' (number has no integer representation)",
                        n, fname
                    ),
                ))
            } else {
                Err(type_error(vm, n, fname, "number"))
            }
        }
    }
}

pub fn check_number(vm: &mut LuaVM, n: usize, fname: &str) -> LuaResult<f64> {
    let v = arg_or_nil(vm, n);
    match vm.coerce_number(&v).and_then(|x| x.as_number()) {
        Some(f) => Ok(f),
        None => Err(type_error(vm, n, fname, "number")),
    }
}

pub fn check_str(vm: &mut LuaVM, n: usize, fname: &str) -> LuaResult<crate::lua_value::LuaStr> {
    let v = arg_or_nil(vm, n);
    match vm.coerce_string(&v) {
        Some(s) => Ok(s),
        None => Err(type_error(vm, n, fname, "string")),
    }
}

pub fn check_table(vm: &mut LuaVM, n: usize, fname: &str) -> LuaResult<crate::gc::TableId> {
    match arg_or_nil(vm, n) {
        LuaValue::Table(id) => Ok(id),
        _ => Err(type_error(vm, n, fname, "table")),
    }
}

pub fn check_function(vm: &mut LuaVM, n: usize, fname: &str) -> LuaResult<LuaValue> {
    let v = arg_or_nil(vm, n);
    if v.is_function() {
        Ok(v)
    } else {
        Err(type_error(vm, n, fname, "function"))
    }
}

pub fn opt_integer(vm: &mut LuaVM, n: usize, fname: &str, default: i64) -> LuaResult<i64> {
    match vm.arg(n) {
        None | Some(LuaValue::Nil) => Ok(default),
        Some(_) => check_integer(vm, n, fname),
    }
}
