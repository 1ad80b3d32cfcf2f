// Control flow, scoping, goto, attributes - the parser/codegen surface.

use super::{run, run_bool, run_int, run_str};

#[test]
fn if_elseif_else_chain() {
    assert_eq!(
        run_str(
            "local function grade(n) \
               if n >= 90 then return 'A' \
               elseif n >= 80 then return 'B' \
               elseif n >= 70 then return 'C' \
               else return 'F' end \
             end \
             return grade(95) .. grade(85) .. grade(75) .. grade(5)"
        ),
        "ABCF"
    );
}

#[test]
fn while_and_repeat() {
    assert_eq!(
        run_int("local n = 0 while n < 10 do n = n + 2 end return n"),
        10
    );
    assert_eq!(
        run_int("local n = 0 repeat n = n + 3 until n > 10 return n"),
        12
    );
    // repeat-scope locals reach the condition.
    assert_eq!(
        run_int(
            "local n = 0 \
             repeat \
               local step = 5 \
               n = n + step \
             until step + n > 10 \
             return n"
        ),
        10
    );
}

#[test]
fn numeric_for_shapes() {
    assert_eq!(run_int("local s = 0 for i = 1, 5 do s = s + i end return s"), 15);
    assert_eq!(
        run_int("local s = 0 for i = 10, 1, -3 do s = s + i end return s"),
        10 + 7 + 4 + 1
    );
    // Loop that never runs.
    assert_eq!(run_int("local s = 0 for i = 5, 1 do s = s + 1 end return s"), 0);
    // Float loop.
    assert!(run_bool(
        "local s = 0.0 for x = 0.5, 2.0, 0.5 do s = s + x end return s == 5.0"
    ));
    // Step zero raises.
    assert!(!run_bool(
        "return (pcall(function() for i = 1, 2, 0 do end end))"
    ));
    // The control variable is per-iteration and writes do not affect the
    // loop counter.
    assert_eq!(
        run_int("local n = 0 for i = 1, 3 do i = 100 n = n + 1 end return n"),
        3
    );
}

#[test]
fn numeric_for_near_overflow() {
    assert_eq!(
        run_int(
            "local n = 0 \
             for i = math.maxinteger - 2, math.maxinteger do n = n + 1 end \
             return n"
        ),
        3
    );
}

#[test]
fn generic_for_with_custom_iterator() {
    assert_eq!(
        run_int(
            "local function range(limit) \
               local i = 0 \
               return function() \
                 i = i + 1 \
                 if i <= limit then return i end \
               end \
             end \
             local s = 0 \
             for v in range(4) do s = s + v end \
             return s"
        ),
        10
    );
}

#[test]
fn break_and_nested_loops() {
    assert_eq!(
        run_int(
            "local hits = 0 \
             for i = 1, 10 do \
               if i > 3 then break end \
               for j = 1, 10 do \
                 if j > 2 then break end \
                 hits = hits + 1 \
               end \
             end \
             return hits"
        ),
        6
    );
}

#[test]
fn goto_forward_and_backward() {
    assert_eq!(
        run_int(
            "local n = 0 \
             ::again:: \
             n = n + 1 \
             if n < 5 then goto again end \
             return n"
        ),
        5
    );
    assert_eq!(
        run_int(
            "do goto done end \
             x_never = true \
             ::done:: \
             return 9"
        ),
        9
    );
    // continue idiom.
    assert_eq!(
        run_int(
            "local s = 0 \
             for i = 1, 6 do \
               if i % 2 == 0 then goto continue end \
               s = s + i \
               ::continue:: \
             end \
             return s"
        ),
        9
    );
}

#[test]
fn multiple_assignment_adjusts_and_swaps() {
    let r = run("local a, b, c = 1, 2 return a, b, c");
    assert_eq!(r[0].as_integer_strict(), Some(1));
    assert!(r[2].is_nil());
    assert_eq!(run_int("local a, b = 1, 2, 3 return a + b"), 3);
    // Parallel evaluation: a swap works.
    let r = run("local a, b = 1, 2 a, b = b, a return a, b");
    assert_eq!(r[0].as_integer_strict(), Some(2));
    assert_eq!(r[1].as_integer_strict(), Some(1));
    // Index/target conflict: `a.x` keeps addressing the table `a` held
    // before `a` itself is reassigned.
    assert_eq!(
        run_int(
            "local old = {x = 0} \
             local new = {x = 0} \
             local a = old \
             a.x, a = 5, new \
             return old.x * 10 + (a == new and 1 or 0)"
        ),
        51
    );
}

#[test]
fn const_attribute_folds_and_rejects_writes() {
    assert_eq!(run_int("local k <const> = 21 return k * 2"), 42);
    // Write rejection is a compile error.
    let mut vm = super::new_vm();
    let err = vm
        .execute_string("local k <const> = 1 k = 2")
        .unwrap_err();
    assert_eq!(err, crate::lua_vm::LuaError::Syntax);
}

#[test]
fn method_definition_and_call() {
    assert_eq!(
        run_int(
            "local obj = {base = 40} \
             function obj:offset(n) return self.base + n end \
             return obj:offset(2)"
        ),
        42
    );
    assert_eq!(
        run_int(
            "local ns = {inner = {}} \
             function ns.inner.helper() return 5 end \
             function ns.inner:method() return ns.inner.helper() + 1 end \
             return ns.inner:method()"
        ),
        6
    );
}

#[test]
fn long_strings_and_comments() {
    assert_eq!(run_str("return [[raw ]=] text]]"), "raw ]=] text");
    assert_eq!(
        run_int("--[==[ a long\ncomment ]==] return 3"),
        3
    );
}

#[test]
fn semicolons_and_empty_statements() {
    assert_eq!(run_int(";;; local x = 1 ;; return x"), 1);
}

#[test]
fn deep_expression_nesting() {
    assert_eq!(
        run_int("return ((((1 + 2) * 3 - 4) % 5) << 2) | 1"),
        1 | (((3 * 3 - 4) % 5) << 2)
    );
    // Operator precedence: ^ binds tighter than unary minus, and is
    // right-associative.
    assert!(run_bool("return -2^2 == -4"));
    assert!(run_bool("return 2^3^2 == 512.0"));
    assert!(run_bool("return 1 .. 2 == '12'"));
}

#[test]
fn call_syntax_sugar() {
    assert_eq!(run_int("local function id(t) return t.x end return id{x = 5}"), 5);
    assert_eq!(run_int("local function len(s) return #s end return len'abc'"), 3);
}

#[test]
fn runtime_errors_carry_chunk_and_line() {
    let mut vm = super::new_vm();
    let err = vm
        .execute_string("local x = 1\nlocal y = x + nil")
        .unwrap_err();
    let msg = vm.error_message(err);
    assert!(msg.contains("chunk:2:"), "got {}", msg);
}
