// Deep immutability.
//
// `freeze(v)` walks everything reachable from `v` with an identity-keyed
// visited set (cycles are fine) and sets the frozen flag on tables, closures
// and userdata. Freezing a closure freezes its upvalue *cells*, so a sibling
// closure sharing a cell loses write access too. Host closures must have
// been declared pure at creation; userdata delegates to its host freeze
// hook. Scalars and strings are already immutable and pass through.
//
// Purity of reachable host closures is validated before any flag is set, so
// that rejection path leaves the graph untouched. A userdata hook can only
// answer by running, so its rejection surfaces mid-walk; values already
// frozen stay frozen (the flag is one-way by design of the mutation checks).

use ahash::AHashSet;

use crate::lua_value::{LuaClosure, LuaValue, UpvalueState};
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Id {
    Table(u32),
    Function(u32),
    Userdata(u32),
}

fn id_of(v: &LuaValue) -> Option<Id> {
    match v {
        LuaValue::Table(t) => Some(Id::Table(t.index())),
        LuaValue::Function(f) => Some(Id::Function(f.index())),
        LuaValue::Userdata(u) => Some(Id::Userdata(u.index())),
        _ => None,
    }
}

/// Freezes `v` and everything reachable from it. Returns `v`'s own value
/// unchanged for call-through convenience.
pub fn freeze_value(vm: &mut LuaVM, v: &LuaValue) -> LuaResult<()> {
    let Some(root) = id_of(v) else {
        return Ok(()); // scalars and strings: no-op
    };

    // Collect the reachable object set first; reject impure host closures
    // before mutating anything.
    let mut visited: AHashSet<Id> = AHashSet::new();
    let mut order: Vec<Id> = Vec::new();
    let mut work = vec![root];
    while let Some(id) = work.pop() {
        if !visited.insert(id) {
            continue;
        }
        order.push(id);
        match id {
            Id::Table(raw) => {
                let t = vm.pool.table(crate::gc::TableId(raw));
                for value in t.all_values() {
                    if let Some(next) = id_of(&value) {
                        work.push(next);
                    }
                }
            }
            Id::Function(raw) => {
                let f = vm.pool.function(crate::gc::FunctionId(raw));
                if let LuaClosure::Host(h) = f {
                    if !h.pure_fn {
                        let name = h.name;
                        return Err(vm.raise(
                            LuaError::Frozen,
                            format!("cannot freeze impure function '{}'", name),
                        ));
                    }
                }
                let cells: Vec<_> = f.upvalues().to_vec();
                for cell in cells {
                    if let UpvalueState::Closed(value) = &vm.pool.upvalue(cell).state {
                        if let Some(next) = id_of(value) {
                            work.push(next);
                        }
                    } else if let Some(slot) = vm.pool.upvalue(cell).stack_slot() {
                        let value = vm.stack_get(slot);
                        if let Some(next) = id_of(&value) {
                            work.push(next);
                        }
                    }
                }
            }
            Id::Userdata(raw) => {
                let u = vm.pool.userdata(crate::gc::UserdataId(raw));
                for value in u.user_values.clone() {
                    if let Some(next) = id_of(&value) {
                        work.push(next);
                    }
                }
            }
        }
    }

    // Apply.
    for id in order {
        match id {
            Id::Table(raw) => {
                vm.pool.table_mut(crate::gc::TableId(raw)).set_frozen();
            }
            Id::Function(raw) => {
                let fid = crate::gc::FunctionId(raw);
                vm.pool.function_mut(fid).set_frozen();
                let cells: Vec<_> = vm.pool.function(fid).upvalues().to_vec();
                for cell in cells {
                    vm.pool.upvalue_mut(cell).frozen = true;
                }
            }
            Id::Userdata(raw) => {
                let uid = crate::gc::UserdataId(raw);
                if !vm.pool.userdata_mut(uid).data.freeze() {
                    return Err(vm.raise(
                        LuaError::Frozen,
                        "userdata does not support freezing".to_string(),
                    ));
                }
                vm.pool.userdata_mut(uid).frozen = true;
            }
        }
    }
    Ok(())
}

/// Whether a value is (already) frozen. Scalars and strings report true:
/// they are immutable by construction.
pub fn is_frozen(vm: &LuaVM, v: &LuaValue) -> bool {
    match v {
        LuaValue::Table(id) => vm.pool.table(*id).is_frozen(),
        LuaValue::Function(id) => vm.pool.function(*id).is_frozen(),
        LuaValue::Userdata(id) => vm.pool.userdata(*id).frozen,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua_value::TableSetError;
    use crate::lua_vm::VmOptions;

    #[test]
    fn deep_freeze_propagates_through_tables() {
        let mut vm = LuaVM::new(VmOptions::default());
        let inner = vm.new_table();
        let outer = vm.new_table();
        let key = vm.new_string("child");
        vm.table_set(&outer, key, inner.clone()).unwrap();

        freeze_value(&mut vm, &outer).unwrap();
        assert!(is_frozen(&vm, &outer));
        assert!(is_frozen(&vm, &inner));

        let id = inner.as_table_id().unwrap();
        assert_eq!(
            vm.pool
                .table_mut(id)
                .raw_set_int(1, LuaValue::Integer(1)),
            Err(TableSetError::Frozen)
        );
    }

    #[test]
    fn cycles_terminate() {
        let mut vm = LuaVM::new(VmOptions::default());
        let a = vm.new_table();
        let b = vm.new_table();
        let k = vm.new_string("other");
        vm.table_set(&a, k.clone(), b.clone()).unwrap();
        vm.table_set(&b, k, a.clone()).unwrap();
        freeze_value(&mut vm, &a).unwrap();
        assert!(is_frozen(&vm, &a) && is_frozen(&vm, &b));
    }

    #[test]
    fn impure_host_closure_rejects_freeze_untouched() {
        fn noop(_vm: &mut LuaVM) -> crate::lua_vm::LuaResult<usize> {
            Ok(0)
        }
        let mut vm = LuaVM::new(VmOptions::default());
        let f = vm.new_host_function_named("noop", noop, false);
        let t = vm.new_table();
        let k = vm.new_string("f");
        vm.table_set(&t, k, f).unwrap();

        let err = freeze_value(&mut vm, &t).unwrap_err();
        assert_eq!(err, LuaError::Frozen);
        // Validation happens before any flag is set.
        assert!(!is_frozen(&vm, &t));
    }

    #[test]
    fn pure_host_closure_freezes() {
        fn noop(_vm: &mut LuaVM) -> crate::lua_vm::LuaResult<usize> {
            Ok(0)
        }
        let mut vm = LuaVM::new(VmOptions::default());
        let f = vm.new_host_function_named("noop", noop, true);
        freeze_value(&mut vm, &f).unwrap();
        assert!(is_frozen(&vm, &f));
    }

    #[test]
    fn scalars_are_a_no_op() {
        let mut vm = LuaVM::new(VmOptions::default());
        freeze_value(&mut vm, &LuaValue::Integer(5)).unwrap();
        freeze_value(&mut vm, &LuaValue::Nil).unwrap();
    }
}
