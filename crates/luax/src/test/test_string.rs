// The string library, pattern entry points included.

use super::{run, run_bool, run_int, run_str};

#[test]
fn gsub_scenario_from_the_suite() {
    let r = run(r#"return string.gsub("hello world", "(%w+)", "%1 %1")"#);
    assert_eq!(r[0].as_str(), Some("hello hello world world"));
    assert_eq!(r[1].as_integer_strict(), Some(2));
}

#[test]
fn format_scenario_from_the_suite() {
    assert_eq!(
        run_str(r#"return string.format("%-10s|%5d", "lua", 42)"#),
        "lua       |   42"
    );
}

#[test]
fn sub_and_negative_indices() {
    assert_eq!(run_str(r#"return ("hello"):sub(2, 4)"#), "ell");
    assert_eq!(run_str(r#"return ("hello"):sub(-3)"#), "llo");
    assert_eq!(run_str(r#"return ("hello"):sub(2)"#), "ello");
    assert_eq!(run_str(r#"return ("hello"):sub(4, 2)"#), "");
    assert_eq!(run_str(r#"return ("hello"):sub(-100, 100)"#), "hello");
}

#[test]
fn byte_char_rep_reverse_case() {
    assert_eq!(run_int(r#"return string.byte("A")"#), 65);
    let r = run(r#"return string.byte("AB", 1, 2)"#);
    assert_eq!(r[1].as_integer_strict(), Some(66));
    assert_eq!(run_str(r#"return string.char(104, 105)"#), "hi");
    assert_eq!(run_str(r#"return ("ab"):rep(3)"#), "ababab");
    assert_eq!(run_str(r#"return ("ab"):rep(3, "-")"#), "ab-ab-ab");
    assert_eq!(run_str(r#"return ("ab"):rep(0)"#), "");
    assert_eq!(run_str(r#"return ("abc"):reverse()"#), "cba");
    assert_eq!(run_str(r#"return ("MiXeD"):lower()"#), "mixed");
    assert_eq!(run_str(r#"return ("MiXeD"):upper()"#), "MIXED");
    assert_eq!(run_int(r#"return ("hello"):len()"#), 5);
}

#[test]
fn method_syntax_through_string_metatable() {
    assert_eq!(run_str(r#"local s = "abc" return s:upper()"#), "ABC");
}

#[test]
fn find_returns_indices_and_captures() {
    let r = run(r#"return string.find("hello world", "o w")"#);
    assert_eq!(r[0].as_integer_strict(), Some(5));
    assert_eq!(r[1].as_integer_strict(), Some(7));
    let r = run(r#"return string.find("key=value", "(%w+)=(%w+)")"#);
    assert_eq!(r[2].as_str(), Some("key"));
    assert_eq!(r[3].as_str(), Some("value"));
    // Plain search ignores magic characters.
    let r = run(r#"return string.find("a.c", ".", 1, true)"#);
    assert_eq!(r[0].as_integer_strict(), Some(2));
    // init offset.
    let r = run(r#"return string.find("aXaX", "X", 3)"#);
    assert_eq!(r[0].as_integer_strict(), Some(4));
    assert!(run(r#"return string.find("abc", "z")"#)[0].is_nil());
}

#[test]
fn match_returns_captures_or_whole() {
    assert_eq!(run_str(r#"return ("hello 42"):match("%d+")"#), "42");
    let r = run(r#"return ("2026-08-01"):match("(%d+)-(%d+)-(%d+)")"#);
    assert_eq!(r[0].as_str(), Some("2026"));
    assert_eq!(r[2].as_str(), Some("01"));
    // Position capture yields an integer.
    assert_eq!(run_int(r#"return ("ab1"):match("()%d")"#), 3);
}

#[test]
fn gmatch_iterates_all_matches() {
    assert_eq!(
        run_int(
            r#"local sum = 0
               for n in ("1 22 333"):gmatch("%d+") do sum = sum + tonumber(n) end
               return sum"#
        ),
        356
    );
    assert_eq!(
        run_str(
            r#"local out = {}
               for k, v in ("a=1,b=2"):gmatch("(%w+)=(%w+)") do out[#out+1] = k .. v end
               return table.concat(out)"#
        ),
        "a1b2"
    );
}

#[test]
fn gsub_with_table_function_and_limit() {
    assert_eq!(
        run_str(r#"return (string.gsub("a b", "%a", {a = "X"}))"#),
        "X b"
    );
    assert_eq!(
        run_str(r#"return (string.gsub("ab", "%a", function(c) return c:upper() end))"#),
        "AB"
    );
    let r = run(r#"return string.gsub("aaaa", "a", "b", 2)"#);
    assert_eq!(r[0].as_str(), Some("bbaa"));
    assert_eq!(r[1].as_integer_strict(), Some(2));
    // nil/false replacement keeps the original match.
    assert_eq!(
        run_str(r#"return (string.gsub("ab", "%a", function() return nil end))"#),
        "ab"
    );
    // %% escapes in replacement strings.
    assert_eq!(
        run_str(r#"return (string.gsub("x", "x", "100%%"))"#),
        "100%"
    );
}

#[test]
fn gsub_zero_length_matches_advance() {
    let r = run(r#"return string.gsub("abc", "x*", "-")"#);
    assert_eq!(r[0].as_str(), Some("-a-b-c-"));
    assert_eq!(r[1].as_integer_strict(), Some(4));
}

#[test]
fn anchored_patterns() {
    assert_eq!(run_str(r#"return ("hello"):match("^h%a+")"#), "hello");
    assert!(run(r#"return ("hello"):match("^e")"#)[0].is_nil());
    assert_eq!(run_str(r#"return ("hello"):match("l+o$")"#), "llo");
}

#[test]
fn balanced_and_backrefs_are_rejected() {
    assert!(!run_bool(r#"return (pcall(string.find, "s", "%bxy"))"#));
    assert!(!run_bool(r#"return (pcall(string.find, "s", "(a)%1"))"#));
    // The rejection carries a recognizable message.
    let r = run(r#"local ok, e = pcall(string.find, "s", "%b()") return e"#);
    assert!(
        r[0].as_str().unwrap_or("").contains("not supported"),
        "got {:?}",
        r[0]
    );
}

#[test]
fn format_conversions() {
    assert_eq!(run_str(r#"return string.format("%d/%i", 7, -7)"#), "7/-7");
    assert_eq!(run_str(r#"return string.format("%o", 8)"#), "10");
    assert_eq!(run_str(r#"return string.format("%c%c", 104, 105)"#), "hi");
    assert_eq!(run_str(r#"return string.format("%.3s", "abcdef")"#), "abc");
    assert_eq!(run_str(r#"return string.format("%5.1f", 3.14)"#), "  3.1");
    assert_eq!(run_str(r#"return string.format("%s=%s", "k", 42)"#), "k=42");
    // %s honors __tostring.
    assert_eq!(
        run_str(
            r#"local t = setmetatable({}, {__tostring = function() return "T" end})
               return string.format("[%s]", t)"#
        ),
        "[T]"
    );
}

#[test]
fn string_arguments_accept_numbers() {
    // Number arguments to string functions coerce.
    assert_eq!(run_int("return string.len(12345)"), 5);
    assert_eq!(run_str("return string.upper(3.5)"), "3.5");
}
