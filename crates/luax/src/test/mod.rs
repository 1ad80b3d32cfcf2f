// Integration tests driving whole programs through the VM.

pub mod test_basic;
pub mod test_cancel;
pub mod test_closures;
pub mod test_contexts;
pub mod test_freeze;
pub mod test_math;
pub mod test_metamethods;
pub mod test_operators;
pub mod test_string;
pub mod test_syntax;
pub mod test_table;
pub mod test_utf8;

use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaVM, VmOptions};

/// Fresh VM with the standard libraries open.
pub fn new_vm() -> LuaVM {
    let mut vm = LuaVM::new(VmOptions::default());
    vm.open_libs().expect("open stdlib");
    vm
}

/// Runs a chunk and returns all results.
pub fn run(src: &str) -> Vec<LuaValue> {
    let mut vm = new_vm();
    match vm.execute_string(src) {
        Ok(r) => r,
        Err(kind) => panic!("script failed ({}): {}", kind, vm.error_message(kind)),
    }
}

/// Runs a chunk expected to produce a single integer.
pub fn run_int(src: &str) -> i64 {
    let r = run(src);
    r.first()
        .and_then(|v| v.as_integer_strict())
        .unwrap_or_else(|| panic!("expected integer result, got {:?}", r))
}

/// Runs a chunk expected to produce a single string.
pub fn run_str(src: &str) -> String {
    let r = run(src);
    r.first()
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .unwrap_or_else(|| panic!("expected string result, got {:?}", r))
}

/// Runs a chunk expected to produce a single boolean.
pub fn run_bool(src: &str) -> bool {
    let r = run(src);
    r.first()
        .and_then(|v| v.as_boolean())
        .unwrap_or_else(|| panic!("expected boolean result, got {:?}", r))
}
