// luax - a Lua 5.4 execution engine
// Bytecode compiler, register VM, pattern engine and embedder stack API,
// extended with deep freeze, string contexts and cooperative cancellation.

#[cfg(test)]
mod test;

pub mod api;
pub mod binary;
pub mod branch;
pub mod compiler;
pub mod freeze;
pub mod gc;
pub mod lib_registry;
pub mod lua_pattern;
pub mod lua_value;
pub mod lua_vm;
pub mod stdlib;

pub use compiler::Compiler;
pub use gc::{FunctionId, ObjectPool, TableId, UpvalueId, UserdataId};
pub use lib_registry::LibraryRegistry;
pub use lua_value::{HostValue, LuaStr, LuaTable, LuaValue, Proto};
pub use lua_vm::{
    CancelToken, HostFn, Instruction, LuaError, LuaFullError, LuaResult, LuaVM, OpCode, VmOptions,
};

use std::rc::Rc;

/// Compile and run a source chunk on a fresh VM with all standard libraries.
pub fn execute(source: &str) -> LuaResult<Vec<LuaValue>> {
    let mut vm = LuaVM::new(VmOptions::default());
    vm.open_libs()?;
    let proto = vm.compile(source, "chunk")?;
    vm.execute(Rc::new(proto))
}

/// Run a source chunk against a caller-provided VM.
pub fn execute_with_vm(vm: &mut LuaVM, source: &str) -> LuaResult<Vec<LuaValue>> {
    let proto = vm.compile(source, "chunk")?;
    vm.execute(Rc::new(proto))
}
