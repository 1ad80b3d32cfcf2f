// The table library.

use crate::lib_registry::{
    LibraryModule, arg_or_nil, check_any, check_integer, check_table, opt_integer, type_error,
};
use crate::lua_value::{ContextBuilder, LuaValue};
use crate::lua_vm::{LuaError, LuaResult, LuaVM, execute};

pub fn create_table_lib() -> LibraryModule {
    let module = crate::lib_module!("table", {
        "concat" => table_concat,
        "pack" => table_pack,
        "unpack" => table_unpack,
    });
    module
        .with_impure_function("insert", table_insert)
        .with_impure_function("move", table_move)
        .with_impure_function("remove", table_remove)
        .with_impure_function("sort", table_sort)
}

fn table_len(vm: &mut LuaVM, id: crate::gc::TableId) -> i64 {
    vm.pool.table(id).border()
}

fn table_concat(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = check_table(vm, 1, "concat")?;
    let sep = match vm.arg(2) {
        None | Some(LuaValue::Nil) => None,
        Some(_) => Some(crate::lib_registry::check_str(vm, 2, "concat")?),
    };
    let i = opt_integer(vm, 3, "concat", 1)?;
    let default_j = table_len(vm, t);
    let j = opt_integer(vm, 4, "concat", default_j)?;

    let mut ctx = ContextBuilder::new();
    if let Some(sep) = &sep {
        ctx.absorb(sep);
    }
    let mut out: Vec<u8> = Vec::new();
    for k in i..=j {
        let v = vm.pool.table(t).raw_get_int(k);
        let Some(s) = vm.coerce_string(&v) else {
            return Err(vm.error_runtime(format!(
                "invalid value (at index {}) in table for 'concat'",
                k
            )));
        };
        ctx.absorb(&s);
        if k > i {
            if let Some(sep) = &sep {
                out.extend_from_slice(sep.as_bytes());
            }
        }
        out.extend_from_slice(s.as_bytes());
    }
    vm.push_value(LuaValue::String(ctx.build(out)))?;
    Ok(1)
}

fn table_insert(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = check_table(vm, 1, "insert")?;
    let len = table_len(vm, t);
    let nargs = vm.arg_count();
    let (pos, value) = match nargs {
        2 => (len + 1, arg_or_nil(vm, 2)),
        3 => {
            let pos = check_integer(vm, 2, "insert")?;
            if pos < 1 || pos > len + 1 {
                return Err(vm.raise(
                    LuaError::Type,
                    "bad argument #2 to 'insert' (position out of bounds)".to_string(),
                ));
            }
            (pos, arg_or_nil(vm, 3))
        }
        _ => {
            return Err(vm.error_runtime("wrong number of arguments to 'insert'"));
        }
    };
    // Shift the tail up one slot.
    let mut k = len;
    while k >= pos {
        let v = vm.pool.table(t).raw_get_int(k);
        if let Err(e) = vm.pool.table_mut(t).raw_set_int(k + 1, v) {
            return Err(vm.table_set_error(e));
        }
        k -= 1;
    }
    if let Err(e) = vm.pool.table_mut(t).raw_set_int(pos, value) {
        return Err(vm.table_set_error(e));
    }
    Ok(0)
}

fn table_remove(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = check_table(vm, 1, "remove")?;
    let len = table_len(vm, t);
    let pos = opt_integer(vm, 2, "remove", len)?;
    if len == 0 && vm.arg(2).is_none() {
        vm.push_value(LuaValue::Nil)?;
        return Ok(1);
    }
    if len + 1 == pos {
        // Removing just past the border is allowed and removes nothing.
        let v = vm.pool.table(t).raw_get_int(pos);
        if let Err(e) = vm.pool.table_mut(t).raw_set_int(pos, LuaValue::Nil) {
            return Err(vm.table_set_error(e));
        }
        vm.push_value(v)?;
        return Ok(1);
    }
    if pos < 1 || pos > len {
        return Err(vm.raise(
            LuaError::Type,
            "bad argument #2 to 'remove' (position out of bounds)".to_string(),
        ));
    }
    let removed = vm.pool.table(t).raw_get_int(pos);
    let mut k = pos;
    while k < len {
        let v = vm.pool.table(t).raw_get_int(k + 1);
        if let Err(e) = vm.pool.table_mut(t).raw_set_int(k, v) {
            return Err(vm.table_set_error(e));
        }
        k += 1;
    }
    if let Err(e) = vm.pool.table_mut(t).raw_set_int(len, LuaValue::Nil) {
        return Err(vm.table_set_error(e));
    }
    vm.push_value(removed)?;
    Ok(1)
}

fn table_move(vm: &mut LuaVM) -> LuaResult<usize> {
    let a1 = check_table(vm, 1, "move")?;
    let f = check_integer(vm, 2, "move")?;
    let e = check_integer(vm, 3, "move")?;
    let d = check_integer(vm, 4, "move")?;
    let a2 = match vm.arg(5) {
        None | Some(LuaValue::Nil) => a1,
        Some(_) => check_table(vm, 5, "move")?,
    };
    if e >= f {
        if e - f > i64::MAX - d {
            return Err(vm.error_runtime("destination wrap around"));
        }
        // Overlapping same-table moves copy in the safe direction.
        if d > f && d <= e && a1 == a2 {
            let mut k = e - f;
            while k >= 0 {
                let v = vm.pool.table(a1).raw_get_int(f + k);
                if let Err(err) = vm.pool.table_mut(a2).raw_set_int(d + k, v) {
                    return Err(vm.table_set_error(err));
                }
                k -= 1;
            }
        } else {
            for k in 0..=(e - f) {
                let v = vm.pool.table(a1).raw_get_int(f + k);
                if let Err(err) = vm.pool.table_mut(a2).raw_set_int(d + k, v) {
                    return Err(vm.table_set_error(err));
                }
            }
        }
    }
    vm.push_value(LuaValue::Table(a2))?;
    Ok(1)
}

fn table_pack(vm: &mut LuaVM) -> LuaResult<usize> {
    let n = vm.arg_count();
    let t = vm.new_table_with_capacity(n, 1);
    let id = t.as_table_id().expect("fresh table");
    for i in 1..=n {
        let v = arg_or_nil(vm, i);
        if let Err(e) = vm.pool.table_mut(id).raw_set_int(i as i64, v) {
            return Err(vm.table_set_error(e));
        }
    }
    let key = vm.new_string("n");
    if let Err(e) = vm.pool.table_mut(id).raw_set(key, LuaValue::Integer(n as i64)) {
        return Err(vm.table_set_error(e));
    }
    vm.push_value(t)?;
    Ok(1)
}

fn table_unpack(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = check_any(vm, 1, "unpack")?;
    if !t.is_table() {
        return Err(type_error(vm, 1, "unpack", "table"));
    }
    let id = t.as_table_id().expect("checked above");
    let i = opt_integer(vm, 2, "unpack", 1)?;
    let default_j = table_len(vm, id);
    let j = opt_integer(vm, 3, "unpack", default_j)?;
    if i > j {
        return Ok(0);
    }
    let count = (j - i + 1) as usize;
    if count > 1_000_000 {
        return Err(vm.error_runtime("too many results to unpack"));
    }
    for k in i..=j {
        let v = vm.pool.table(id).raw_get_int(k);
        vm.push_value(v)?;
    }
    Ok(count)
}

fn table_sort(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = check_table(vm, 1, "sort")?;
    let cmp = match vm.arg(2) {
        None | Some(LuaValue::Nil) => None,
        Some(v) if v.is_function() => Some(v),
        Some(_) => return Err(type_error(vm, 2, "sort", "function")),
    };
    let len = table_len(vm, t);
    if len < 2 {
        return Ok(0);
    }
    // Pull out, sort, write back: the comparator may reenter the VM
    // arbitrarily, so the table itself is not touched mid-sort.
    let mut items: Vec<LuaValue> = (1..=len)
        .map(|k| vm.pool.table(t).raw_get_int(k))
        .collect();
    quicksort(vm, &mut items, &cmp)?;
    for (k, v) in items.into_iter().enumerate() {
        if let Err(e) = vm.pool.table_mut(t).raw_set_int(k as i64 + 1, v) {
            return Err(vm.table_set_error(e));
        }
    }
    Ok(0)
}

fn sort_less(
    vm: &mut LuaVM,
    cmp: &Option<LuaValue>,
    a: &LuaValue,
    b: &LuaValue,
) -> LuaResult<bool> {
    match cmp {
        Some(f) => {
            let r = execute::call_function(vm, f.clone(), vec![a.clone(), b.clone()], 1)?;
            Ok(r.into_iter().next().unwrap_or(LuaValue::Nil).is_truthy())
        }
        None => crate::lua_vm::execute::arith::less_than(vm, a.clone(), b.clone()),
    }
}

/// Plain recursive quicksort with a median-of-three pivot and insertion
/// sort for short runs. Recursion depth is bounded by the partition
/// structure, so an inconsistent comparator can misorder but not loop.
fn quicksort(vm: &mut LuaVM, items: &mut [LuaValue], cmp: &Option<LuaValue>) -> LuaResult<()> {
    if items.len() < 2 {
        return Ok(());
    }
    if items.len() < 12 {
        // Insertion sort for short runs.
        for i in 1..items.len() {
            let mut j = i;
            while j > 0 {
                if sort_less(vm, cmp, &items[j], &items[j - 1])? {
                    items.swap(j, j - 1);
                    j -= 1;
                } else {
                    break;
                }
            }
        }
        return Ok(());
    }
    let mid = items.len() / 2;
    let last = items.len() - 1;
    // Median of first/middle/last as the pivot, parked at the end.
    if sort_less(vm, cmp, &items[mid], &items[0])? {
        items.swap(mid, 0);
    }
    if sort_less(vm, cmp, &items[last], &items[mid])? {
        items.swap(last, mid);
        if sort_less(vm, cmp, &items[mid], &items[0])? {
            items.swap(mid, 0);
        }
    }
    items.swap(mid, last);
    let mut store = 0usize;
    for i in 0..last {
        let pivot = items[last].clone();
        if sort_less(vm, cmp, &items[i], &pivot)? {
            items.swap(i, store);
            store += 1;
        }
    }
    items.swap(store, last);
    let (left, right) = items.split_at_mut(store);
    quicksort(vm, left, cmp)?;
    quicksort(vm, &mut right[1..], cmp)?;
    Ok(())
}
