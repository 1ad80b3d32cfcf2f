// Base library behavior and the end-to-end arithmetic scenarios.

use super::{run, run_bool, run_int, run_str};
use crate::lua_value::LuaValue;

#[test]
fn two_plus_two() {
    assert_eq!(run_int("return 2 + 2"), 4);
}

#[test]
fn loop_accumulates_squares() {
    assert_eq!(
        run_int("local t={}; for i=1,3 do t[i]=i*i end; return t[1]+t[2]+t[3]"),
        14
    );
}

#[test]
fn pcall_preserves_nonstring_error_objects() {
    let r = run("local ok, err = pcall(function() error({code=7}) end); return ok, err.code");
    assert_eq!(r[0].as_boolean(), Some(false));
    assert_eq!(r[1].as_integer_strict(), Some(7));
}

#[test]
fn type_names() {
    assert_eq!(run_str("return type(nil)"), "nil");
    assert_eq!(run_str("return type(true)"), "boolean");
    assert_eq!(run_str("return type(42)"), "number");
    assert_eq!(run_str("return type('x')"), "string");
    assert_eq!(run_str("return type({})"), "table");
    assert_eq!(run_str("return type(print)"), "function");
}

#[test]
fn tostring_and_tonumber_round_integers() {
    // Integer identity through the string round trip.
    assert!(run_bool(
        "local i = 9007199254740993 \
         return tostring(i) == tostring(math.tointeger(tonumber(tostring(i))))"
    ));
    assert_eq!(run_str("return tostring(1.0)"), "1.0");
    assert_eq!(run_str("return tostring(1)"), "1");
    assert_eq!(run_int("return tonumber('  42  ')"), 42);
    assert_eq!(run_int("return tonumber('ff', 16)"), 255);
    assert!(run("return tonumber('nope')")[0].is_nil());
}

#[test]
fn integer_and_float_subkinds() {
    assert!(run_bool("return 1 == 1.0"));
    assert!(run_bool("return math.type(1) ~= math.type(1.0)"));
    assert_eq!(run_str("return math.type(1)"), "integer");
    assert_eq!(run_str("return math.type(1.0)"), "float");
}

#[test]
fn assert_passes_values_and_raises() {
    let r = run("return assert(1, 'unused')");
    assert_eq!(r[0].as_integer_strict(), Some(1));
    assert!(!run_bool("return (pcall(function() assert(false, 'boom') end))"));
    let r = run("local ok, e = pcall(function() assert(nil) end) return e");
    assert!(r[0].as_str().unwrap_or("").contains("assertion failed"));
}

#[test]
fn select_counts_and_slices() {
    assert_eq!(run_int("return select('#', 'a', 'b', 'c')"), 3);
    assert_eq!(run_str("return select(2, 'a', 'b', 'c')"), "b");
    assert_eq!(run_str("return select(-1, 'a', 'b', 'c')"), "c");
}

#[test]
fn error_levels_prefix_position() {
    let r = run("local ok, e = pcall(function() error('oops') end) return e");
    let msg = r[0].as_str().unwrap_or("").to_string();
    assert!(msg.contains("oops"));
    assert!(msg.contains(':'), "expected position prefix, got {}", msg);

    // Level 0 leaves the message untouched.
    let r = run("local ok, e = pcall(function() error('bare', 0) end) return e");
    assert_eq!(r[0].as_str(), Some("bare"));
}

#[test]
fn pcall_returns_all_results() {
    let r = run("return pcall(function() return 1, 2, 3 end)");
    assert_eq!(r.len(), 4);
    assert_eq!(r[0].as_boolean(), Some(true));
    assert_eq!(r[3].as_integer_strict(), Some(3));
}

#[test]
fn xpcall_handler_replaces_error() {
    let r = run(
        "local ok, e = xpcall(function() error('raw') end, function(m) return 'handled: ' .. m end) \
         return ok, e",
    );
    assert_eq!(r[0].as_boolean(), Some(false));
    assert!(r[1].as_str().unwrap_or("").starts_with("handled: "));
}

#[test]
fn failing_handler_reports_handler_error() {
    let r = run(
        "local ok, e = xpcall(function() error('raw') end, function() error('meta') end) \
         return ok, e",
    );
    assert_eq!(r[0].as_boolean(), Some(false));
    assert!(
        r[1].as_str().unwrap_or("").contains("error in error handling"),
        "got {:?}",
        r[1]
    );
}

#[test]
fn ipairs_stops_at_first_hole() {
    assert_eq!(
        run_int(
            "local t = {10, 20, nil, 40} \
             local sum = 0 \
             for _, v in ipairs(t) do sum = sum + v end \
             return sum"
        ),
        30
    );
}

#[test]
fn pairs_visits_every_key_once() {
    assert_eq!(
        run_int(
            "local t = {a=1, b=2, c=3, 4, 5} \
             local n = 0 \
             for k, v in pairs(t) do n = n + v end \
             return n"
        ),
        15
    );
}

#[test]
fn next_rejects_invalid_keys() {
    assert!(!run_bool("return (pcall(next, {}, 'ghost'))"));
}

#[test]
fn rawops_bypass_metamethods() {
    assert_eq!(
        run_int(
            "local t = setmetatable({}, {__index = function() return 99 end}) \
             return t.missing, rawget(t, 'missing')"
        ),
        99
    );
    let r = run(
        "local t = setmetatable({}, {__index = function() return 99 end}) \
         return rawget(t, 'missing')",
    );
    assert!(r[0].is_nil());
    assert!(run_bool("return rawequal('a', 'a')"));
    assert_eq!(run_int("return rawlen({1, 2, 3})"), 3);
}

#[test]
fn load_compiles_strings_and_readers() {
    assert_eq!(run_int("return load('return 40 + 2')()"), 42);
    assert_eq!(
        run_int(
            "local parts = {'return ', '1 + ', '2'} \
             local i = 0 \
             local f = load(function() i = i + 1 return parts[i] end) \
             return f()"
        ),
        3
    );
    // Syntax errors come back as nil + message.
    let r = run("local f, err = load('return return') return f, err");
    assert!(r[0].is_nil());
    assert!(!r[1].is_nil());
}

#[test]
fn load_respects_custom_env() {
    assert_eq!(
        run_int(
            "local env = {x = 5} \
             local f = load('return x', 'chunk', 't', env) \
             return f()"
        ),
        5
    );
}

#[test]
fn string_dump_round_trips_through_load() {
    assert_eq!(
        run_int(
            "local f = function(a, b) return a * b end \
             local chunk = string.dump(f) \
             local g = load(chunk, 'dumped', 'b') \
             return g(6, 7)"
        ),
        42
    );
}

#[test]
fn collectgarbage_reclaims_unreachable_objects() {
    let mut vm = super::new_vm();
    vm.execute_string("local t = {} for i = 1, 100 do t[i] = {i} end")
        .expect("run");
    let before = vm.pool.live_objects();
    let freed = vm.collect_garbage();
    assert!(freed > 0, "expected garbage, had {} live", before);
}

#[test]
fn version_string() {
    assert_eq!(run_str("return _VERSION"), "Lua 5.4");
}

#[test]
fn globals_table_is_reachable() {
    assert!(matches!(run("return _G")[0], LuaValue::Table(_)));
    assert_eq!(run_int("x_global_test = 11 return _G.x_global_test"), 11);
}
