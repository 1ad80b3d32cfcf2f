// Source-to-bytecode compiler.
//
// lexer -> recursive-descent parser -> register-based code generation, all
// single pass. The parser drives code emission directly; prototypes come out
// finished (constants deduplicated, jumps patched, returns fixed up).

pub mod code;
pub mod expdesc;
pub mod func_state;
pub mod lexer;
pub mod parser;
pub mod token;

use crate::lua_value::Proto;
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

pub struct Compiler;

impl Compiler {
    /// Compiles a source chunk into a prototype. Syntax errors carry the
    /// `"<source>:<line>: <message>"` form.
    pub fn compile(vm: &mut LuaVM, source: &str, chunk_name: &str) -> LuaResult<Proto> {
        match parser::parse_chunk(vm, source.as_bytes(), chunk_name) {
            Ok(proto) => Ok(proto),
            Err(msg) => Err(vm.raise(LuaError::Syntax, msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua_vm::{OpCode, VmOptions};

    fn compile_ok(src: &str) -> Proto {
        let mut vm = LuaVM::new(VmOptions::default());
        Compiler::compile(&mut vm, src, "test").expect("compile")
    }

    fn compile_err(src: &str) -> String {
        let mut vm = LuaVM::new(VmOptions::default());
        match Compiler::compile(&mut vm, src, "test") {
            Ok(_) => panic!("expected syntax error for {:?}", src),
            Err(kind) => {
                assert_eq!(kind, LuaError::Syntax);
                vm.error_message(kind)
            }
        }
    }

    #[test]
    fn compiles_trivial_chunks() {
        let p = compile_ok("return 1 + 2");
        assert!(!p.code.is_empty());
        assert!(p.is_vararg);
        assert_eq!(p.upvalues.len(), 1); // _ENV
    }

    #[test]
    fn literal_arithmetic_folds() {
        let p = compile_ok("return 2 + 2");
        // Folded to a single constant/immediate load plus the return.
        assert!(
            p.code
                .iter()
                .all(|&i| crate::lua_vm::Instruction::opcode(i) != OpCode::Add)
        );
    }

    #[test]
    fn nested_functions_capture_upvalues() {
        let p = compile_ok(
            "local x = 1\nlocal function f() return x end\nreturn f",
        );
        assert_eq!(p.protos.len(), 1);
        let inner = &p.protos[0];
        assert_eq!(inner.upvalues.len(), 1);
        assert!(inner.upvalues[0].in_stack);
    }

    #[test]
    fn syntax_errors_carry_position() {
        let msg = compile_err("local = 5");
        assert!(msg.starts_with("test:1:"), "got {}", msg);
        let msg = compile_err("return 1 +");
        assert!(msg.contains("test:"), "got {}", msg);
    }

    #[test]
    fn goto_without_label_is_rejected() {
        let msg = compile_err("goto nowhere");
        assert!(msg.contains("nowhere"), "got {}", msg);
    }

    #[test]
    fn const_attribute_is_read_only() {
        let msg = compile_err("local x <const> = 1\nx = 2");
        assert!(msg.contains("const"), "got {}", msg);
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let msg = compile_err("break");
        assert!(msg.contains("break"), "got {}", msg);
    }

    #[test]
    fn vararg_outside_vararg_function_is_rejected() {
        let msg = compile_err("local f = function() return ... end");
        assert!(msg.contains("vararg"), "got {}", msg);
    }
}
