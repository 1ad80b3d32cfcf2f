// The utf8 library.

use super::{run, run_bool, run_int, run_str};

#[test]
fn char_and_codepoint_round_trip() {
    assert_eq!(run_str("return utf8.char(72, 105)"), "Hi");
    assert_eq!(run_int("return utf8.codepoint('A')"), 65);
    let r = run("return utf8.codepoint(utf8.char(0x20AC))");
    assert_eq!(r[0].as_integer_strict(), Some(0x20AC));
    // Multiple codepoints over a range.
    let r = run("return utf8.codepoint('abc', 1, 3)");
    assert_eq!(r.len(), 3);
    assert_eq!(r[2].as_integer_strict(), Some(99));
}

#[test]
fn len_counts_codepoints() {
    assert_eq!(run_int("return utf8.len('abc')"), 3);
    assert_eq!(run_int("return utf8.len(utf8.char(0x20AC) .. 'x')"), 2);
    // Invalid bytes report the failing position.
    let r = run("return utf8.len('a' .. string.char(0x80))");
    assert!(r[0].is_nil());
    assert_eq!(r[1].as_integer_strict(), Some(2));
}

#[test]
fn codes_iterates_positions_and_values() {
    assert_eq!(
        run_int(
            "local total = 0 \
             for p, c in utf8.codes('abc') do total = total + p + c end \
             return total"
        ),
        1 + 2 + 3 + 97 + 98 + 99
    );
}

#[test]
fn offset_navigates_sequences() {
    assert_eq!(run_int("return utf8.offset('abc', 2)"), 2);
    assert_eq!(run_int("return utf8.offset('abc', -1)"), 3);
    // The euro sign is three bytes, so the second character starts at 4.
    assert_eq!(
        run_int("return utf8.offset(utf8.char(0x20AC) .. 'x', 2)"),
        4
    );
    assert!(run("return utf8.offset('ab', 5)")[0].is_nil());
}

#[test]
fn extended_range_and_lax_mode() {
    // Codepoints beyond 0x10FFFF encode (six bytes) and only decode in lax
    // mode.
    assert_eq!(run_int("return #utf8.char(0x7FFFFFFF)"), 6);
    assert_eq!(
        run_int("return utf8.codepoint(utf8.char(0x7FFFFFFF), 1, 1, true)"),
        0x7FFF_FFFF
    );
    assert!(!run_bool(
        "return (pcall(utf8.codepoint, utf8.char(0x7FFFFFFF), 1, 1))"
    ));
    // Surrogates only pass in lax mode.
    assert!(run_bool("return utf8.len(utf8.char(0xD800), 1, -1, true) == 1"));
    assert!(run_bool("return utf8.len(utf8.char(0xD800)) == nil"));
}

#[test]
fn charpattern_matches_single_sequences() {
    assert_eq!(
        run_int(
            "local n = 0 \
             for _ in ('a' .. utf8.char(0x20AC) .. 'b'):gmatch(utf8.charpattern) do n = n + 1 end \
             return n"
        ),
        3
    );
}
