// The base library.

use crate::lib_registry::{
    LibraryModule, arg_or_nil, check_any, check_function, check_integer, check_str, check_table,
    type_error,
};
use crate::lua_value::{LuaValue, number};
use crate::lua_vm::execute::Protected;
use crate::lua_vm::{LoadMode, LuaError, LuaResult, LuaVM, TmKind, execute};

pub fn create_basic_lib() -> LibraryModule {
    let mut module = crate::lib_module!("_G", {
        "assert" => lua_assert,
        "error" => lua_error,
        "getmetatable" => lua_getmetatable,
        "ipairs" => lua_ipairs,
        "load" => lua_load,
        "loadfile" => lua_loadfile,
        "dofile" => lua_dofile,
        "next" => lua_next,
        "pairs" => lua_pairs,
        "pcall" => lua_pcall,
        "rawequal" => lua_rawequal,
        "rawget" => lua_rawget,
        "rawlen" => lua_rawlen,
        "select" => lua_select,
        "tonumber" => lua_tonumber,
        "tostring" => lua_tostring,
        "type" => lua_type,
        "xpcall" => lua_xpcall,
        "freeze" => lua_freeze,
        "frozen" => lua_frozen,
    });
    // Mutating or I/O-backed entries are impure: they must reject freezing.
    module = module
        .with_impure_function("collectgarbage", lua_collectgarbage)
        .with_impure_function("print", lua_print)
        .with_impure_function("rawset", lua_rawset)
        .with_impure_function("setmetatable", lua_setmetatable)
        .with_impure_function("warn", lua_warn);
    module = module.with_value("_VERSION", |vm| vm.new_string("Lua 5.4"));
    module = module.with_initializer(|vm, _table| {
        let g = LuaValue::Table(vm.globals());
        vm.set_global("_G", g)
    });
    module
}

fn lua_assert(vm: &mut LuaVM) -> LuaResult<usize> {
    let v = arg_or_nil(vm, 1);
    if v.is_truthy() {
        // Pass every argument through.
        let n = vm.arg_count();
        let args: Vec<LuaValue> = (1..=n).map(|i| arg_or_nil(vm, i)).collect();
        for a in args {
            vm.push_value(a)?;
        }
        return Ok(n);
    }
    match vm.arg(2) {
        Some(msg) => Err(vm.raise_value(LuaError::Runtime, msg)),
        None => Err(vm.error_runtime("assertion failed!")),
    }
}

fn lua_error(vm: &mut LuaVM) -> LuaResult<usize> {
    let v = arg_or_nil(vm, 1);
    let level = match vm.arg(2) {
        Some(l) => vm.coerce_integer(&l).unwrap_or(1),
        None => 1,
    };
    // String errors at level >= 1 gain position information; any other
    // error object passes through untouched.
    if level > 0 {
        if let LuaValue::String(s) = &v {
            let located = match position_at_level(vm, level as usize) {
                Some((source, line)) if line > 0 => {
                    format!("{}:{}: {}", source, line, s.to_display())
                }
                _ => s.to_display().into_owned(),
            };
            let obj = vm.new_string_owned(located);
            return Err(vm.raise_value(LuaError::Runtime, obj));
        }
    }
    Err(vm.raise_value(LuaError::Runtime, v))
}

/// Source position of the `level`-th Lua frame below the current host call.
fn position_at_level(vm: &LuaVM, level: usize) -> Option<(String, u32)> {
    let mut remaining = level;
    for frame in vm.frames.iter().rev() {
        if frame.is_host {
            continue;
        }
        remaining -= 1;
        let id = frame.func.as_function_id()?;
        let proto = vm.pool.function(id).proto()?;
        if remaining == 0 {
            let pc = frame.pc.saturating_sub(1);
            return Some((proto.source_name().to_string(), proto.line_at(pc)));
        }
    }
    None
}

fn lua_getmetatable(vm: &mut LuaVM) -> LuaResult<usize> {
    let v = check_any(vm, 1, "getmetatable")?;
    match vm.get_metatable_of(&v) {
        None => {
            vm.push_value(LuaValue::Nil)?;
        }
        Some(mt) => {
            // A __metatable field locks the real table away.
            let key = vm.new_string(TmKind::Metatable.name());
            let lock = vm.pool.table(mt).raw_get(&key);
            if lock.is_nil() {
                vm.push_value(LuaValue::Table(mt))?;
            } else {
                vm.push_value(lock)?;
            }
        }
    }
    Ok(1)
}

fn lua_setmetatable(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = check_any(vm, 1, "setmetatable")?;
    if !t.is_table() {
        return Err(type_error(vm, 1, "setmetatable", "table"));
    }
    let mt = match arg_or_nil(vm, 2) {
        LuaValue::Nil => None,
        LuaValue::Table(id) => Some(id),
        _ => return Err(type_error(vm, 2, "setmetatable", "nil or table")),
    };
    if let Some(old) = vm.get_metatable_of(&t) {
        let key = vm.new_string(TmKind::Metatable.name());
        if !vm.pool.table(old).raw_get(&key).is_nil() {
            return Err(vm.error_runtime("cannot change a protected metatable"));
        }
    }
    vm.set_metatable_of(&t, mt)?;
    vm.push_value(t)?;
    Ok(1)
}

fn lua_ipairs(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = check_any(vm, 1, "ipairs")?;
    let iter = vm.new_host_function_named("ipairs_iterator", ipairs_iterator, true);
    vm.push_value(iter)?;
    vm.push_value(t)?;
    vm.push_value(LuaValue::Integer(0))?;
    Ok(3)
}

fn ipairs_iterator(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = arg_or_nil(vm, 1);
    let i = check_integer(vm, 2, "ipairs_iterator")?;
    let next = i.wrapping_add(1);
    let v = vm.table_get(&t, &LuaValue::Integer(next))?;
    if v.is_nil() {
        vm.push_value(LuaValue::Nil)?;
        Ok(1)
    } else {
        vm.push_value(LuaValue::Integer(next))?;
        vm.push_value(v)?;
        Ok(2)
    }
}

fn lua_pairs(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = check_any(vm, 1, "pairs")?;
    if let Some(mm) = vm.get_metamethod(&t, TmKind::Pairs) {
        let results = execute::call_function(vm, mm, vec![t], 3)?;
        for r in results {
            vm.push_value(r)?;
        }
        return Ok(3);
    }
    if !t.is_table() {
        return Err(type_error(vm, 1, "pairs", "table"));
    }
    let next = vm.new_host_function_named("next", lua_next, true);
    vm.push_value(next)?;
    vm.push_value(t)?;
    vm.push_value(LuaValue::Nil)?;
    Ok(3)
}

fn lua_next(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = check_table(vm, 1, "next")?;
    let key = arg_or_nil(vm, 2);
    match vm.pool.table(t).next(&key) {
        Ok(Some((k, v))) => {
            vm.push_value(k)?;
            vm.push_value(v)?;
            Ok(2)
        }
        Ok(None) => {
            vm.push_value(LuaValue::Nil)?;
            Ok(1)
        }
        Err(()) => Err(vm.error_runtime("invalid key to 'next'")),
    }
}

fn lua_pcall(vm: &mut LuaVM) -> LuaResult<usize> {
    let f = check_any(vm, 1, "pcall")?;
    let args: Vec<LuaValue> = (2..=vm.arg_count()).map(|i| arg_or_nil(vm, i)).collect();
    match execute::protected_call(vm, f, args, None) {
        Protected::Ok(results) => {
            let n = results.len();
            vm.push_value(LuaValue::Boolean(true))?;
            for r in results {
                vm.push_value(r)?;
            }
            Ok(n + 1)
        }
        Protected::Caught { error, .. } => {
            vm.push_value(LuaValue::Boolean(false))?;
            vm.push_value(error)?;
            Ok(2)
        }
    }
}

fn lua_xpcall(vm: &mut LuaVM) -> LuaResult<usize> {
    let f = check_any(vm, 1, "xpcall")?;
    let handler = check_function(vm, 2, "xpcall")?;
    let args: Vec<LuaValue> = (3..=vm.arg_count()).map(|i| arg_or_nil(vm, i)).collect();
    match execute::protected_call(vm, f, args, Some(handler)) {
        Protected::Ok(results) => {
            let n = results.len();
            vm.push_value(LuaValue::Boolean(true))?;
            for r in results {
                vm.push_value(r)?;
            }
            Ok(n + 1)
        }
        Protected::Caught { error, .. } => {
            vm.push_value(LuaValue::Boolean(false))?;
            vm.push_value(error)?;
            Ok(2)
        }
    }
}

fn lua_rawequal(vm: &mut LuaVM) -> LuaResult<usize> {
    let a = check_any(vm, 1, "rawequal")?;
    let b = check_any(vm, 2, "rawequal")?;
    vm.push_value(LuaValue::Boolean(a.raw_equal(&b)))?;
    Ok(1)
}

fn lua_rawget(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = check_table(vm, 1, "rawget")?;
    let key = check_any(vm, 2, "rawget")?;
    let v = vm.pool.table(t).raw_get(&key);
    vm.push_value(v)?;
    Ok(1)
}

fn lua_rawset(vm: &mut LuaVM) -> LuaResult<usize> {
    let t = check_table(vm, 1, "rawset")?;
    let key = check_any(vm, 2, "rawset")?;
    let value = arg_or_nil(vm, 3);
    if let Err(e) = vm.pool.table_mut(t).raw_set(key, value) {
        return Err(vm.table_set_error(e));
    }
    vm.push_value(LuaValue::Table(t))?;
    Ok(1)
}

fn lua_rawlen(vm: &mut LuaVM) -> LuaResult<usize> {
    let v = check_any(vm, 1, "rawlen")?;
    let len = match &v {
        LuaValue::Table(id) => vm.pool.table(*id).border(),
        LuaValue::String(s) => s.len() as i64,
        _ => return Err(type_error(vm, 1, "rawlen", "table or string")),
    };
    vm.push_value(LuaValue::Integer(len))?;
    Ok(1)
}

fn lua_select(vm: &mut LuaVM) -> LuaResult<usize> {
    let total = vm.arg_count();
    let selector = check_any(vm, 1, "select")?;
    if let Some(s) = selector.as_str() {
        if s == "#" {
            vm.push_value(LuaValue::Integer(total as i64 - 1))?;
            return Ok(1);
        }
    }
    let n = check_integer(vm, 1, "select")?;
    let start = if n > 0 {
        n as usize
    } else if n < 0 {
        let back = (-n) as usize;
        if back >= total {
            return Err(vm.raise(
                LuaError::Type,
                "bad argument #1 to 'select' (index out of range)".to_string(),
            ));
        }
        total - back
    } else {
        return Err(vm.raise(
            LuaError::Type,
            "bad argument #1 to 'select' (index out of range)".to_string(),
        ));
    };
    let mut pushed = 0;
    let args: Vec<LuaValue> = ((start + 1)..=total).map(|i| arg_or_nil(vm, i)).collect();
    for a in args {
        vm.push_value(a)?;
        pushed += 1;
    }
    Ok(pushed)
}

fn lua_tonumber(vm: &mut LuaVM) -> LuaResult<usize> {
    match vm.arg(2) {
        None | Some(LuaValue::Nil) => {
            let v = check_any(vm, 1, "tonumber")?;
            match vm.coerce_number(&v) {
                Some(n) => vm.push_value(n)?,
                None => vm.push_value(LuaValue::Nil)?,
            }
        }
        Some(_) => {
            let base = check_integer(vm, 2, "tonumber")?;
            if !(2..=36).contains(&base) {
                return Err(vm.raise(
                    LuaError::Type,
                    "bad argument #2 to 'tonumber' (base out of range)".to_string(),
                ));
            }
            let s = check_str(vm, 1, "tonumber")?;
            match number::str_to_integer_radix(s.as_bytes(), base as u32) {
                Some(i) => vm.push_value(LuaValue::Integer(i))?,
                None => vm.push_value(LuaValue::Nil)?,
            }
        }
    }
    Ok(1)
}

fn lua_tostring(vm: &mut LuaVM) -> LuaResult<usize> {
    let v = check_any(vm, 1, "tostring")?;
    let s = vm.tostring_value(&v)?;
    vm.push_value(LuaValue::String(s))?;
    Ok(1)
}

fn lua_type(vm: &mut LuaVM) -> LuaResult<usize> {
    let v = check_any(vm, 1, "type")?;
    let name = vm.new_string(v.type_name());
    vm.push_value(name)?;
    Ok(1)
}

fn lua_print(vm: &mut LuaVM) -> LuaResult<usize> {
    let n = vm.arg_count();
    let mut parts = Vec::with_capacity(n);
    for i in 1..=n {
        let v = arg_or_nil(vm, i);
        parts.push(vm.tostring_value(&v)?.to_display().into_owned());
    }
    println!("{}", parts.join("\t"));
    Ok(0)
}

fn lua_warn(vm: &mut LuaVM) -> LuaResult<usize> {
    let n = vm.arg_count();
    let mut message = String::new();
    for i in 1..=n {
        let s = check_str(vm, i, "warn")?;
        message.push_str(&s.to_display());
    }
    // Control messages start with '@' and are not emitted.
    if !message.starts_with('@') {
        eprintln!("Lua warning: {}", message);
    }
    Ok(0)
}

fn lua_collectgarbage(vm: &mut LuaVM) -> LuaResult<usize> {
    let opt = match vm.arg(1) {
        None | Some(LuaValue::Nil) => "collect".to_string(),
        Some(v) => match v.as_str() {
            Some(s) => s.to_string(),
            None => return Err(type_error(vm, 1, "collectgarbage", "string")),
        },
    };
    match opt.as_str() {
        "collect" | "step" | "full" => {
            vm.collect_garbage();
            vm.push_value(LuaValue::Integer(0))?;
        }
        "count" => {
            // Rough accounting: live pooled objects, scaled to KB units.
            let kb = (vm.pool.live_objects() * 64) as f64 / 1024.0;
            vm.push_value(LuaValue::Float(kb))?;
        }
        other => {
            return Err(vm.raise(
                LuaError::Type,
                format!("bad argument #1 to 'collectgarbage' (invalid option '{}')", other),
            ));
        }
    }
    Ok(1)
}

fn parse_mode(mode: Option<&str>) -> LoadMode {
    match mode {
        Some("b") => LoadMode::Binary,
        Some("t") => LoadMode::Text,
        _ => LoadMode::Both,
    }
}

fn lua_load(vm: &mut LuaVM) -> LuaResult<usize> {
    let chunk_arg = check_any(vm, 1, "load")?;
    let chunk_name = match vm.arg(2) {
        Some(LuaValue::String(s)) => s.to_display().into_owned(),
        _ => "=(load)".to_string(),
    };
    let mode = match vm.arg(3) {
        Some(LuaValue::String(s)) => parse_mode(s.as_str()),
        _ => LoadMode::Both,
    };
    let env = vm.arg(4);

    let bytes: Vec<u8> = match &chunk_arg {
        LuaValue::String(s) => s.as_bytes().to_vec(),
        LuaValue::Function(_) => {
            // Reader function: concatenate pieces until nil/empty.
            let mut buf = Vec::new();
            loop {
                let piece = execute::call_function(vm, chunk_arg.clone(), vec![], 1)?
                    .into_iter()
                    .next()
                    .unwrap_or(LuaValue::Nil);
                match piece {
                    LuaValue::Nil => break,
                    LuaValue::String(s) => {
                        if s.is_empty() {
                            break;
                        }
                        buf.extend_from_slice(s.as_bytes());
                    }
                    _ => {
                        let msg = vm.new_string("reader function must return a string");
                        vm.push_value(LuaValue::Nil)?;
                        vm.push_value(msg)?;
                        return Ok(2);
                    }
                }
            }
            buf
        }
        _ => return Err(type_error(vm, 1, "load", "string or function")),
    };

    match vm.load_chunk(&bytes, &chunk_name, mode) {
        Ok(closure) => {
            if let Some(env) = env {
                set_env_upvalue(vm, &closure, env);
            }
            vm.push_value(closure)?;
            Ok(1)
        }
        Err(kind) => {
            // load reports failure as (nil, message) rather than raising.
            let msg = vm.error_message(kind);
            let msg = vm.new_string_owned(msg);
            vm.push_value(LuaValue::Nil)?;
            vm.push_value(msg)?;
            Ok(2)
        }
    }
}

fn set_env_upvalue(vm: &mut LuaVM, closure: &LuaValue, env: LuaValue) {
    if let Some(id) = closure.as_function_id() {
        let cell = vm.pool.function(id).upvalues().first().copied();
        if let Some(cell) = cell {
            use crate::lua_value::UpvalueState;
            vm.pool.upvalue_mut(cell).state = UpvalueState::Closed(env);
        }
    }
}

fn lua_loadfile(vm: &mut LuaVM) -> LuaResult<usize> {
    let path = check_str(vm, 1, "loadfile")?;
    let path_str = path.to_display().into_owned();
    match std::fs::read(&path_str) {
        Ok(bytes) => {
            let name = format!("@{}", path_str);
            match vm.load_chunk(&bytes, &name, LoadMode::Both) {
                Ok(closure) => {
                    vm.push_value(closure)?;
                    Ok(1)
                }
                Err(kind) => {
                    let msg = vm.error_message(kind);
                    let msg = vm.new_string_owned(msg);
                    vm.push_value(LuaValue::Nil)?;
                    vm.push_value(msg)?;
                    Ok(2)
                }
            }
        }
        Err(e) => {
            let msg = vm.new_string_owned(format!("cannot open {}: {}", path_str, e));
            vm.push_value(LuaValue::Nil)?;
            vm.push_value(msg)?;
            Ok(2)
        }
    }
}

fn lua_dofile(vm: &mut LuaVM) -> LuaResult<usize> {
    let path = check_str(vm, 1, "dofile")?;
    let path_str = path.to_display().into_owned();
    let bytes = match std::fs::read(&path_str) {
        Ok(b) => b,
        Err(e) => {
            return Err(vm.error_runtime(format!("cannot open {}: {}", path_str, e)));
        }
    };
    let name = format!("@{}", path_str);
    let closure = vm.load_chunk(&bytes, &name, LoadMode::Both)?;
    let results = execute::call_function(vm, closure, vec![], -1)?;
    let n = results.len();
    for r in results {
        vm.push_value(r)?;
    }
    Ok(n)
}

fn lua_freeze(vm: &mut LuaVM) -> LuaResult<usize> {
    let v = check_any(vm, 1, "freeze")?;
    crate::freeze::freeze_value(vm, &v)?;
    vm.push_value(v)?;
    Ok(1)
}

fn lua_frozen(vm: &mut LuaVM) -> LuaResult<usize> {
    let v = check_any(vm, 1, "frozen")?;
    let f = crate::freeze::is_frozen(vm, &v);
    vm.push_value(LuaValue::Boolean(f))?;
    Ok(1)
}
