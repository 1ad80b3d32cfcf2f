// The freeze extension: deep immutability and uniform rejection.

use super::{run, run_bool, run_int};

#[test]
fn freeze_propagates_to_reachable_subtables() {
    let r = run(
        "local t = {inner = {x = 1}} \
         freeze(t) \
         local ok1 = pcall(function() t.y = 2 end) \
         local ok2 = pcall(function() t.inner.x = 3 end) \
         return ok1, ok2, t.inner.x",
    );
    assert_eq!(r[0].as_boolean(), Some(false));
    assert_eq!(r[1].as_boolean(), Some(false));
    // Reads still succeed.
    assert_eq!(r[2].as_integer_strict(), Some(1));
}

#[test]
fn rewriting_an_existing_key_to_its_value_still_fails() {
    // Mutation is denied regardless of the resulting value.
    assert!(!run_bool(
        "local t = {x = 1} freeze(t) return (pcall(function() t.x = 1 end))"
    ));
}

#[test]
fn erasing_an_absent_key_is_a_no_op() {
    assert!(run_bool(
        "local t = {x = 1} freeze(t) return (pcall(function() t.nothing = nil end))"
    ));
    // But erasing a present key is a mutation.
    assert!(!run_bool(
        "local t = {x = 1} freeze(t) return (pcall(function() t.x = nil end))"
    ));
}

#[test]
fn freeze_returns_its_argument_and_reports() {
    assert!(run_bool("return frozen(freeze({}))"));
    assert!(!run_bool("return frozen({})"));
    // Scalars count as frozen (immutable by construction).
    assert!(run_bool("return frozen(42)"));
    assert!(run_bool("return frozen('s')"));
}

#[test]
fn freeze_handles_cycles() {
    assert!(run_bool(
        "local a, b = {}, {} \
         a.other = b \
         b.other = a \
         freeze(a) \
         return frozen(a) and frozen(b)"
    ));
}

#[test]
fn frozen_closure_upvalue_writes_fail_for_all_siblings() {
    let r = run(
        "local x = 1 \
         local function get() return x end \
         local function set(v) x = v end \
         set(5) \
         freeze(get) \
         local ok = pcall(set, 9) \
         return ok, get()",
    );
    // The sibling shares the frozen cell, so its write fails too.
    assert_eq!(r[0].as_boolean(), Some(false));
    assert_eq!(r[1].as_integer_strict(), Some(5));
}

#[test]
fn freeze_reaches_values_held_by_upvalues() {
    assert!(run_bool(
        "local inner = {} \
         local function carrier() return inner end \
         freeze(carrier) \
         return frozen(inner)"
    ));
}

#[test]
fn table_library_respects_frozen() {
    assert!(!run_bool(
        "local t = freeze({1, 2, 3}) return (pcall(table.insert, t, 4))"
    ));
    assert!(!run_bool(
        "local t = freeze({3, 1, 2}) return (pcall(table.sort, t))"
    ));
    assert!(!run_bool(
        "local t = freeze({}) return (pcall(rawset, t, 'k', 1))"
    ));
}

#[test]
fn setmetatable_on_frozen_table_fails() {
    assert!(!run_bool(
        "local t = freeze({}) return (pcall(setmetatable, t, {}))"
    ));
}

#[test]
fn frozen_error_kind_is_distinct() {
    let mut vm = super::new_vm();
    let err = vm
        .execute_string("local t = freeze({}) t.x = 1")
        .unwrap_err();
    assert_eq!(err, crate::lua_vm::LuaError::Frozen);
    let msg = vm.error_message(err);
    assert!(msg.contains("frozen"), "got {}", msg);
}

#[test]
fn frozen_keys_in_hash_part() {
    assert_eq!(
        run_int(
            "local t = {} \
             t['k'] = 10 \
             t[50] = 20 \
             freeze(t) \
             return t.k + t[50]"
        ),
        30
    );
}
