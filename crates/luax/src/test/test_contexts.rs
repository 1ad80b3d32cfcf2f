// String contexts: the attached marker set that rides through string
// operations and is visible only to the embedder.

use super::new_vm;
use crate::lua_value::{LuaValue, StrContext};
use smol_str::SmolStr;

fn ctx(members: &[&str]) -> StrContext {
    members.iter().map(|m| SmolStr::new(m)).collect()
}

fn context_of(v: &LuaValue) -> Vec<String> {
    let mut out: Vec<String> = v
        .as_lua_str()
        .and_then(|s| s.context())
        .map(|c| c.iter().map(|m| m.to_string()).collect())
        .unwrap_or_default();
    out.sort();
    out
}

#[test]
fn contexts_survive_concatenation() {
    let mut vm = new_vm();
    let tagged = vm.new_string_with_context(b"/store/abc".to_vec(), ctx(&["drv:abc"]));
    vm.set_global("path", tagged).unwrap();
    let r = vm
        .execute_string("return 'prefix-' .. path .. '-suffix'")
        .expect("run");
    assert_eq!(r[0].as_str(), Some("prefix-/store/abc-suffix"));
    assert_eq!(context_of(&r[0]), vec!["drv:abc"]);
}

#[test]
fn concatenation_unions_multiple_contexts() {
    let mut vm = new_vm();
    let a = vm.new_string_with_context(b"a".to_vec(), ctx(&["one"]));
    let b = vm.new_string_with_context(b"b".to_vec(), ctx(&["two"]));
    vm.set_global("a", a).unwrap();
    vm.set_global("b", b).unwrap();
    let r = vm.execute_string("return a .. b").expect("run");
    assert_eq!(context_of(&r[0]), vec!["one", "two"]);
}

#[test]
fn format_and_gsub_and_rep_propagate() {
    let mut vm = new_vm();
    let tagged = vm.new_string_with_context(b"X".to_vec(), ctx(&["m"]));
    vm.set_global("x", tagged).unwrap();

    let r = vm
        .execute_string("return string.format('v=%s', x)")
        .expect("format");
    assert_eq!(context_of(&r[0]), vec!["m"]);

    let r = vm
        .execute_string("return (string.gsub('aXa', 'X', x))")
        .expect("gsub");
    assert_eq!(context_of(&r[0]), vec!["m"]);

    let r = vm.execute_string("return x:rep(3)").expect("rep");
    assert_eq!(r[0].as_str(), Some("XXX"));
    assert_eq!(context_of(&r[0]), vec!["m"]);

    let r = vm.execute_string("return x:sub(1, 1)").expect("sub");
    assert_eq!(context_of(&r[0]), vec!["m"]);
}

#[test]
fn table_concat_unions_contexts() {
    let mut vm = new_vm();
    let a = vm.new_string_with_context(b"a".to_vec(), ctx(&["ca"]));
    let b = vm.new_string_with_context(b"b".to_vec(), ctx(&["cb"]));
    vm.set_global("a", a).unwrap();
    vm.set_global("b", b).unwrap();
    let r = vm
        .execute_string("return table.concat({a, 'plain', b}, '-')")
        .expect("concat");
    assert_eq!(r[0].as_str(), Some("a-plain-b"));
    assert_eq!(context_of(&r[0]), vec!["ca", "cb"]);
}

#[test]
fn plain_strings_carry_no_context() {
    let mut vm = new_vm();
    let r = vm.execute_string("return 'just bytes'").expect("run");
    assert!(r[0].as_lua_str().unwrap().context().is_none());
}

#[test]
fn context_is_invisible_to_equality_and_keys() {
    let mut vm = new_vm();
    let tagged = vm.new_string_with_context(b"key".to_vec(), ctx(&["c"]));
    vm.set_global("tagged", tagged).unwrap();
    // Equal bytes compare equal regardless of context, and address the
    // same table slot.
    let r = vm
        .execute_string(
            "local t = {} \
             t[tagged] = 1 \
             return tagged == 'key', t['key']",
        )
        .expect("run");
    assert_eq!(r[0].as_boolean(), Some(true));
    assert_eq!(r[1].as_integer_strict(), Some(1));
}

#[test]
fn contexts_compare_by_membership() {
    let a = ctx(&["x", "y"]);
    let b = ctx(&["y", "x"]);
    assert_eq!(a, b);
}
