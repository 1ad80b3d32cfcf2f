// Metatable protocol: operators, indexing chains, locks, close handlers.

use super::{run, run_bool, run_int, run_str};

#[test]
fn index_function_and_table_chain() {
    assert_eq!(
        run_int(
            "local t = setmetatable({}, {__index = function(_, k) return 40 + #k end}) \
             return t.ab"
        ),
        42
    );
    // __index as a table recurses.
    assert_eq!(
        run_int(
            "local base = {x = 9} \
             local mid = setmetatable({}, {__index = base}) \
             local top = setmetatable({}, {__index = mid}) \
             return top.x"
        ),
        9
    );
}

#[test]
fn newindex_redirects_writes() {
    assert_eq!(
        run_int(
            "local log = {} \
             local t = setmetatable({}, {__newindex = function(_, k, v) log[k] = v end}) \
             t.x = 5 \
             return log.x + (rawget(t, 'x') == nil and 1 or 0)"
        ),
        6
    );
    // Existing keys bypass __newindex.
    assert_eq!(
        run_int(
            "local hits = 0 \
             local t = setmetatable({x = 1}, {__newindex = function() hits = hits + 1 end}) \
             t.x = 2 \
             return t.x * 10 + hits"
        ),
        20
    );
}

#[test]
fn arith_metamethods() {
    assert_eq!(
        run_int(
            "local mt = {__add = function(a, b) return a.v + b.v end} \
             local x = setmetatable({v = 30}, mt) \
             local y = setmetatable({v = 12}, mt) \
             return x + y"
        ),
        42
    );
    assert_eq!(
        run_int(
            "local mt = {__unm = function(a) return -a.v end} \
             return -setmetatable({v = 5}, mt)"
        ),
        -5
    );
    // Metamethod applies when either operand carries it.
    assert_eq!(
        run_int(
            "local mt = {__mul = function(a, b) \
               local av = type(a) == 'table' and a.v or a \
               local bv = type(b) == 'table' and b.v or b \
               return av * bv end} \
             local x = setmetatable({v = 6}, mt) \
             return 7 * x"
        ),
        42
    );
}

#[test]
fn comparison_metamethods() {
    assert!(run_bool(
        "local mt = {__lt = function(a, b) return a.v < b.v end, \
                     __le = function(a, b) return a.v <= b.v end, \
                     __eq = function(a, b) return a.v == b.v end} \
         local small = setmetatable({v = 1}, mt) \
         local big = setmetatable({v = 2}, mt) \
         return small < big and small <= big and not (big < small) \
                and small == setmetatable({v = 1}, mt)"
    ));
}

#[test]
fn eq_only_fires_for_same_reference_kind() {
    assert!(!run_bool(
        "local t = setmetatable({}, {__eq = function() return true end}) \
         return t == 5"
    ));
}

#[test]
fn call_metamethod() {
    assert_eq!(
        run_int(
            "local t = setmetatable({base = 40}, \
               {__call = function(self, n) return self.base + n end}) \
             return t(2)"
        ),
        42
    );
}

#[test]
fn len_and_concat_metamethods() {
    assert_eq!(
        run_int("return #setmetatable({}, {__len = function() return 77 end})"),
        77
    );
    assert_eq!(
        run_str(
            "local t = setmetatable({}, {__concat = function(a, b) \
               if type(a) == 'string' then return a .. '<t>' end \
               return '<t>' .. b end}) \
             return 'x' .. t"
        ),
        "x<t>"
    );
}

#[test]
fn tostring_metamethod() {
    assert_eq!(
        run_str("return tostring(setmetatable({}, {__tostring = function() return 'custom' end}))"),
        "custom"
    );
}

#[test]
fn metatable_lock() {
    // __metatable both masks the metatable and forbids replacement.
    let r = run(
        "local m = {__metatable = 'locked'} \
         local x = setmetatable({}, m) \
         local seen = getmetatable(x) \
         local ok = pcall(setmetatable, x, {}) \
         return seen, ok",
    );
    assert_eq!(r[0].as_str(), Some("locked"));
    assert_eq!(r[1].as_boolean(), Some(false));
}

#[test]
fn pairs_metamethod() {
    assert_eq!(
        run_int(
            "local t = setmetatable({}, {__pairs = function() \
               local i = 0 \
               return function() i = i + 1 if i <= 3 then return i, i * 2 end end, t, nil \
             end}) \
             local sum = 0 \
             for _, v in pairs(t) do sum = sum + v end \
             return sum"
        ),
        12
    );
}

#[test]
fn close_runs_exactly_once_inside_pcall() {
    let r = run(
        "local closed = 0 \
         local ok = pcall(function() \
           local guard <close> = setmetatable({}, {__close = function() closed = closed + 1 end}) \
           error('fail') \
         end) \
         return ok, closed",
    );
    assert_eq!(r[0].as_boolean(), Some(false));
    assert_eq!(r[1].as_integer_strict(), Some(1));
}

#[test]
fn close_receives_the_error_object() {
    let r = run(
        "local seen \
         pcall(function() \
           local guard <close> = setmetatable({}, {__close = function(_, e) seen = e end}) \
           error('the-reason') \
         end) \
         return seen",
    );
    assert!(r[0].as_str().unwrap_or("").contains("the-reason"));
}

#[test]
fn close_runs_on_normal_exit_in_reverse_order() {
    assert_eq!(
        run_str(
            "local order = '' \
             do \
               local a <close> = setmetatable({}, {__close = function() order = order .. 'a' end}) \
               local b <close> = setmetatable({}, {__close = function() order = order .. 'b' end}) \
             end \
             return order"
        ),
        "ba"
    );
}

#[test]
fn non_closable_value_is_rejected() {
    assert!(!run_bool(
        "return (pcall(function() local x <close> = {} end))"
    ));
    // nil and false are fine.
    assert!(run_bool(
        "return (pcall(function() local x <close> = nil end))"
    ));
}
