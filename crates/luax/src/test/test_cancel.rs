// Cooperative cancellation.

use super::new_vm;
use crate::lua_vm::{CancelToken, LuaError};

#[test]
fn pre_cancelled_state_refuses_to_run() {
    let mut vm = new_vm();
    let token = CancelToken::new();
    vm.set_cancel_token(token.clone());
    token.cancel();
    let err = vm.execute_string("return 1").unwrap_err();
    assert_eq!(err, LuaError::Cancelled);
}

#[test]
fn cancellation_interrupts_a_loop() {
    // A host function trips the token mid-run; the backward branch of the
    // loop observes it.
    fn trip(vm: &mut crate::lua_vm::LuaVM) -> crate::lua_vm::LuaResult<usize> {
        vm.cancel_token().cancel();
        Ok(0)
    }
    let mut vm = new_vm();
    let f = vm.new_host_function_named("trip", trip, false);
    vm.set_global("trip", f).unwrap();
    let err = vm
        .execute_string(
            "trip() \
             local i = 0 \
             while true do i = i + 1 end",
        )
        .unwrap_err();
    assert_eq!(err, LuaError::Cancelled);
    // The state is intact afterwards: reset and run again.
    vm.cancel_token().reset();
    let r = vm.execute_string("return 7").expect("state survives");
    assert_eq!(r[0].as_integer_strict(), Some(7));
}

#[test]
fn protected_calls_catch_cancellation() {
    fn trip(vm: &mut crate::lua_vm::LuaVM) -> crate::lua_vm::LuaResult<usize> {
        vm.cancel_token().cancel();
        Ok(0)
    }
    let mut vm = new_vm();
    let f = vm.new_host_function_named("trip", trip, false);
    vm.set_global("trip", f).unwrap();
    // pcall sees the cancellation as an ordinary failure, so structured
    // cleanup can run; re-observation then stops the program.
    let err = vm
        .execute_string(
            "local ok, e = pcall(function() \
               trip() \
               for i = 1, 100 do end \
             end) \
             caught = ok == false \
             for i = 1, 100 do end \
             return 1",
        )
        .unwrap_err();
    assert_eq!(err, LuaError::Cancelled);
    vm.cancel_token().reset();
    let r = vm.execute_string("return caught").expect("read back");
    assert_eq!(r[0].as_boolean(), Some(true));
}

#[test]
fn close_handlers_run_during_cancellation_unwind() {
    fn trip(vm: &mut crate::lua_vm::LuaVM) -> crate::lua_vm::LuaResult<usize> {
        vm.cancel_token().cancel();
        Ok(0)
    }
    let mut vm = new_vm();
    let f = vm.new_host_function_named("trip", trip, false);
    vm.set_global("trip", f).unwrap();
    let err = vm
        .execute_string(
            "closed = false \
             local guard <close> = setmetatable({}, {__close = function() closed = true end}) \
             trip() \
             while true do end",
        )
        .unwrap_err();
    assert_eq!(err, LuaError::Cancelled);
    vm.cancel_token().reset();
    let r = vm.execute_string("return closed").expect("read back");
    assert_eq!(r[0].as_boolean(), Some(true));
}

#[test]
fn call_entry_observes_the_token() {
    fn trip(vm: &mut crate::lua_vm::LuaVM) -> crate::lua_vm::LuaResult<usize> {
        vm.cancel_token().cancel();
        Ok(0)
    }
    let mut vm = new_vm();
    let f = vm.new_host_function_named("trip", trip, false);
    vm.set_global("trip", f).unwrap();
    // No backward branches here; the next call checks the token.
    let err = vm
        .execute_string(
            "local function f() return 1 end \
             trip() \
             return f()",
        )
        .unwrap_err();
    assert_eq!(err, LuaError::Cancelled);
}
