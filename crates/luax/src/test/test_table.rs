// Table semantics: borders, traversal, and the table library.

use super::{run, run_bool, run_int, run_str};

#[test]
fn border_after_sequential_fill() {
    assert_eq!(
        run_int("local t = {} for i = 1, 10 do t[i] = i end return #t"),
        10
    );
    // Removing the last element lowers the border.
    assert!(run_bool(
        "local t = {} for i = 1, 10 do t[i] = i end t[10] = nil return #t < 10"
    ));
    assert_eq!(run_int("return #{}"), 0);
}

#[test]
fn constructor_forms() {
    assert_eq!(run_int("local t = {1, 2, 3, x = 10} return #t + t.x"), 13);
    assert_eq!(run_int("local t = {[5] = 50} return t[5]"), 50);
    assert_eq!(
        run_int(
            "local function multi() return 4, 5, 6 end \
             local t = {1, multi()} \
             return #t"
        ),
        4
    );
    assert_eq!(
        run_int(
            "local function multi() return 4, 5 end \
             local t = {(multi())} \
             return #t"
        ),
        1
    );
}

#[test]
fn large_constructor_flushes_in_batches() {
    assert_eq!(
        run_int(
            "local t = {} \
             local src = {} \
             for i = 1, 120 do src[i] = i end \
             t = {table.unpack(src)} \
             return #t + t[120]"
        ),
        240
    );
}

#[test]
fn float_keys_normalize_to_integers() {
    assert_eq!(run_int("local t = {} t[1.0] = 7 return t[1]"), 7);
    assert_eq!(run_int("local t = {} t[2] = 9 return t[2.0]"), 9);
    assert!(!run_bool("return (pcall(function() local t = {} t[0/0] = 1 end))"));
}

#[test]
fn nil_removes_and_nil_key_rejected() {
    assert!(run_bool(
        "local t = {x = 1} t.x = nil return t.x == nil"
    ));
    assert!(!run_bool(
        "return (pcall(function() local t = {} t[nil] = 1 end))"
    ));
}

#[test]
fn insert_and_remove() {
    assert_eq!(
        run_str(
            "local t = {'a', 'c'} \
             table.insert(t, 2, 'b') \
             table.insert(t, 'd') \
             return table.concat(t)"
        ),
        "abcd"
    );
    assert_eq!(
        run_str(
            "local t = {'a', 'b', 'c'} \
             local gone = table.remove(t, 1) \
             return gone .. table.concat(t)"
        ),
        "abc"
    );
    assert_eq!(
        run_str("local t = {'a', 'b'} return table.remove(t) .. #t"),
        "b1"
    );
}

#[test]
fn sort_default_and_custom() {
    assert_eq!(
        run_str("local t = {3, 1, 2} table.sort(t) return table.concat(t)"),
        "123"
    );
    assert_eq!(
        run_str(
            "local t = {3, 1, 2} \
             table.sort(t, function(a, b) return a > b end) \
             return table.concat(t)"
        ),
        "321"
    );
    // Each element lands in order.
    let r = run("local t = {3, 1, 2} table.sort(t) return t[1], t[2], t[3]");
    assert_eq!(r[0].as_integer_strict(), Some(1));
    assert_eq!(r[1].as_integer_strict(), Some(2));
    assert_eq!(r[2].as_integer_strict(), Some(3));
    // Strings sort lexicographically.
    assert_eq!(
        run_str(
            "local t = {'pear', 'apple', 'mango'} table.sort(t) return t[1]"
        ),
        "apple"
    );
}

#[test]
fn sort_larger_input() {
    assert!(run_bool(
        "local t = {} \
         for i = 1, 100 do t[i] = (i * 37) % 101 end \
         table.sort(t) \
         for i = 2, 100 do if t[i-1] > t[i] then return false end end \
         return true"
    ));
}

#[test]
fn concat_with_separator_and_range() {
    assert_eq!(
        run_str("return table.concat({'a', 'b', 'c'}, ',')"),
        "a,b,c"
    );
    assert_eq!(
        run_str("return table.concat({'a', 'b', 'c'}, '-', 2, 3)"),
        "b-c"
    );
    assert_eq!(run_str("return table.concat({})"), "");
    assert_eq!(run_str("return table.concat({1, 2})"), "12");
}

#[test]
fn move_copies_ranges() {
    assert_eq!(
        run_str(
            "local t = table.move({1, 2, 3, 4}, 2, 4, 1, {}) \
             return table.concat(t)"
        ),
        "234"
    );
    // Overlapping move within one table.
    assert_eq!(
        run_str(
            "local t = {1, 2, 3, 4, 5} \
             table.move(t, 1, 3, 2) \
             return table.concat(t)"
        ),
        "11235"
    );
}

#[test]
fn pack_and_unpack() {
    assert_eq!(
        run_int("local t = table.pack(9, 8, 7) return t.n * 100 + t[3]"),
        307
    );
    let r = run("return table.unpack({10, 20, 30})");
    assert_eq!(r.len(), 3);
    assert_eq!(r[2].as_integer_strict(), Some(30));
    assert_eq!(run_int("return table.unpack({10, 20, 30}, 2, 2)"), 20);
    // nil travels through pack/unpack.
    assert_eq!(
        run_int(
            "local t = table.pack(1, nil, 3) \
             local a, b, c = table.unpack(t, 1, t.n) \
             return (b == nil) and (a + c) or 0"
        ),
        4
    );
}

#[test]
fn mixed_array_hash_traversal() {
    assert_eq!(
        run_int(
            "local t = {10, 20, 30} \
             t.extra = 40 \
             t[100] = 50 \
             local sum = 0 \
             for _, v in pairs(t) do sum = sum + v end \
             return sum"
        ),
        150
    );
}

#[test]
fn clearing_during_traversal_is_allowed() {
    assert_eq!(
        run_int(
            "local t = {a = 1, b = 2, c = 3} \
             local visited = 0 \
             for k in pairs(t) do \
               visited = visited + 1 \
               t[k] = nil \
             end \
             return visited"
        ),
        3
    );
}
