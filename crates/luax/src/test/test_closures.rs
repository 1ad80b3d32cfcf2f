// Closures, upvalue sharing and the open/closed transition.

use super::{run, run_int};

#[test]
fn siblings_share_one_cell() {
    // Two closures over the same local observe each other's writes.
    assert_eq!(
        run_int(
            "local x = 0 \
             local function get() return x end \
             local function bump() x = x + 1 end \
             bump(); bump(); bump() \
             return get()"
        ),
        3
    );
}

#[test]
fn counter_keeps_state_after_frame_exit() {
    assert_eq!(
        run_int(
            "local function make() \
               local n = 0 \
               return function() n = n + 1 return n end \
             end \
             local c = make() \
             c(); c() \
             return c()"
        ),
        3
    );
}

#[test]
fn loop_iterations_get_fresh_cells() {
    // Each iteration's local is a distinct variable once captured.
    assert_eq!(
        run_int(
            "local fns = {} \
             for i = 1, 3 do \
               local v = i * 10 \
               fns[i] = function() return v end \
             end \
             return fns[1]() + fns[2]() + fns[3]()"
        ),
        60
    );
}

#[test]
fn block_exit_closes_upvalues() {
    assert_eq!(
        run_int(
            "local f \
             do \
               local hidden = 21 \
               f = function() return hidden * 2 end \
             end \
             return f()"
        ),
        42
    );
}

#[test]
fn upvalues_chain_through_nesting_levels() {
    assert_eq!(
        run_int(
            "local a = 1 \
             local function outer() \
               local b = 2 \
               local function middle() \
                 local c = 4 \
                 return function() return a + b + c end \
               end \
               return middle() \
             end \
             return outer()()"
        ),
        7
    );
}

#[test]
fn recursion_through_local_function() {
    assert_eq!(
        run_int(
            "local function fact(n) \
               if n <= 1 then return 1 end \
               return n * fact(n - 1) \
             end \
             return fact(6)"
        ),
        720
    );
}

#[test]
fn tail_calls_do_not_grow_the_frame_stack() {
    // Deep tail recursion would overflow the 200-frame limit if frames
    // were not reused.
    assert_eq!(
        run_int(
            "local function count(n, acc) \
               if n == 0 then return acc end \
               return count(n - 1, acc + 1) \
             end \
             return count(10000, 0)"
        ),
        10000
    );
}

#[test]
fn mutual_recursion_via_forward_locals() {
    assert_eq!(
        run_int(
            "local is_even, is_odd \
             function is_even(n) if n == 0 then return 1 else return is_odd(n - 1) end end \
             function is_odd(n) if n == 0 then return 0 else return is_even(n - 1) end end \
             return is_even(10)"
        ),
        1
    );
}

#[test]
fn varargs_pass_through_closures() {
    let r = run(
        "local function collect(...) \
           local n = select('#', ...) \
           local first = ... \
           return n, first \
         end \
         return collect(7, 8, 9)",
    );
    assert_eq!(r[0].as_integer_strict(), Some(3));
    assert_eq!(r[1].as_integer_strict(), Some(7));
}

#[test]
fn vararg_table_packing() {
    assert_eq!(
        run_int(
            "local function sum(...) \
               local t = {...} \
               local s = 0 \
               for i = 1, #t do s = s + t[i] end \
               return s \
             end \
             return sum(1, 2, 3, 4)"
        ),
        10
    );
}

#[test]
fn multiple_returns_adjust() {
    let r = run(
        "local function three() return 1, 2, 3 end \
         local a, b = three() \
         local c = (three()) \
         return a, b, c",
    );
    assert_eq!(r[0].as_integer_strict(), Some(1));
    assert_eq!(r[1].as_integer_strict(), Some(2));
    assert_eq!(r[2].as_integer_strict(), Some(1)); // parens truncate
}
