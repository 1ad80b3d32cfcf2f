// The string library.
//
// Byte-oriented like the language itself. Every derived string unions the
// contexts of its string inputs; plain reads (byte, len) do not produce
// strings and carry nothing.

use crate::lib_registry::{
    LibraryModule, arg_or_nil, check_any, check_integer, check_str, opt_integer, type_error,
};
use crate::lua_pattern::{self, CapVal, Captures, PatternError};
use crate::lua_value::{ContextBuilder, LuaStr, LuaValue};
use crate::lua_vm::{LuaError, LuaResult, LuaVM, execute};

pub fn create_string_lib() -> LibraryModule {
    let module = crate::lib_module!("string", {
        "byte" => str_byte,
        "char" => str_char,
        "dump" => str_dump,
        "find" => str_find,
        "format" => super::string_format::str_format,
        "gmatch" => str_gmatch,
        "gsub" => str_gsub,
        "len" => str_len,
        "lower" => str_lower,
        "match" => str_match,
        "pack" => super::string_pack::str_pack,
        "packsize" => super::string_pack::str_packsize,
        "rep" => str_rep,
        "reverse" => str_reverse,
        "sub" => str_sub,
        "unpack" => super::string_pack::str_unpack,
        "upper" => str_upper,
    });
    // Wire the shared string metatable: indexing a string reaches the
    // library, so "x":upper() works.
    module.with_initializer(|vm, lib| {
        let meta = vm.new_table_with_capacity(0, 1);
        let meta_id = meta.as_table_id().expect("metatable is a table");
        let index_key = vm.new_string("__index");
        vm.table_set(&meta, index_key, lib.clone())?;
        vm.string_meta = Some(meta_id);
        Ok(())
    })
}

fn str_dump(vm: &mut LuaVM) -> LuaResult<usize> {
    let f = check_any(vm, 1, "dump")?;
    let strip = arg_or_nil(vm, 2).is_truthy();
    let Some(id) = f.as_function_id() else {
        return Err(type_error(vm, 1, "dump", "function"));
    };
    let Some(proto) = vm.pool.function(id).proto().cloned() else {
        return Err(vm.error_runtime("unable to dump given function"));
    };
    let bytes = crate::binary::dump(&proto, strip);
    let v = vm.new_string_bytes(&bytes);
    vm.push_value(v)?;
    Ok(1)
}

/// Translates a 1-based (possibly negative) string index to a byte offset.
/// Follows the reference rules: negative counts from the end, 0 clamps to 1.
fn str_index(i: i64, len: usize) -> i64 {
    if i >= 0 { i } else { len as i64 + i + 1 }
}

pub(super) fn compile_pattern(
    vm: &mut LuaVM,
    pat: &LuaStr,
) -> LuaResult<lua_pattern::LuaPattern> {
    let max = vm.options().max_pattern_splits;
    match lua_pattern::compile(pat.as_bytes(), max) {
        Ok(p) => Ok(p),
        Err(PatternError::Unsupported(what)) => {
            Err(vm.error_runtime(format!("unsupported pattern feature: {}", what)))
        }
        Err(e) => Err(vm.error_runtime(e.to_string())),
    }
}

/// A capture as a Lua value; spans inherit the subject's context.
fn capture_value(subject: &LuaStr, cap: CapVal) -> LuaValue {
    match cap {
        CapVal::Pos(p) => LuaValue::Integer(p as i64 + 1),
        CapVal::Span(s, e) => {
            let mut ctx = ContextBuilder::new();
            ctx.absorb(subject);
            LuaValue::String(ctx.build(subject.as_bytes()[s..e].to_vec()))
        }
    }
}

fn push_captures(
    vm: &mut LuaVM,
    subject: &LuaStr,
    m: &Captures,
) -> LuaResult<usize> {
    let caps = m.effective();
    let n = caps.len();
    for c in caps {
        let v = capture_value(subject, c);
        vm.push_value(v)?;
    }
    Ok(n)
}

fn str_byte(vm: &mut LuaVM) -> LuaResult<usize> {
    let s = check_str(vm, 1, "byte")?;
    let len = s.len();
    let i = str_index(opt_integer(vm, 2, "byte", 1)?, len).max(1);
    let j = str_index(opt_integer(vm, 3, "byte", i)?, len).min(len as i64);
    let mut n = 0;
    for k in i..=j {
        if k >= 1 && k <= len as i64 {
            vm.push_value(LuaValue::Integer(s.as_bytes()[(k - 1) as usize] as i64))?;
            n += 1;
        }
    }
    Ok(n)
}

fn str_char(vm: &mut LuaVM) -> LuaResult<usize> {
    let n = vm.arg_count();
    let mut bytes = Vec::with_capacity(n);
    for i in 1..=n {
        let c = check_integer(vm, i, "char")?;
        if !(0..=255).contains(&c) {
            return Err(vm.raise(
                LuaError::Type,
                format!("bad argument #{} to 'char' (value out of range)", i),
            ));
        }
        bytes.push(c as u8);
    }
    let v = vm.new_string_bytes(&bytes);
    vm.push_value(v)?;
    Ok(1)
}

fn str_len(vm: &mut LuaVM) -> LuaResult<usize> {
    let s = check_str(vm, 1, "len")?;
    vm.push_value(LuaValue::Integer(s.len() as i64))?;
    Ok(1)
}

fn map_bytes(vm: &mut LuaVM, fname: &str, f: impl Fn(u8) -> u8) -> LuaResult<usize> {
    let s = check_str(vm, 1, fname)?;
    let bytes: Vec<u8> = s.as_bytes().iter().map(|&b| f(b)).collect();
    let mut ctx = ContextBuilder::new();
    ctx.absorb(&s);
    vm.push_value(LuaValue::String(ctx.build(bytes)))?;
    Ok(1)
}

fn str_lower(vm: &mut LuaVM) -> LuaResult<usize> {
    map_bytes(vm, "lower", |b| b.to_ascii_lowercase())
}

fn str_upper(vm: &mut LuaVM) -> LuaResult<usize> {
    map_bytes(vm, "upper", |b| b.to_ascii_uppercase())
}

fn str_reverse(vm: &mut LuaVM) -> LuaResult<usize> {
    let s = check_str(vm, 1, "reverse")?;
    let mut bytes = s.as_bytes().to_vec();
    bytes.reverse();
    let mut ctx = ContextBuilder::new();
    ctx.absorb(&s);
    vm.push_value(LuaValue::String(ctx.build(bytes)))?;
    Ok(1)
}

fn str_rep(vm: &mut LuaVM) -> LuaResult<usize> {
    let s = check_str(vm, 1, "rep")?;
    let n = check_integer(vm, 2, "rep")?;
    let sep = match vm.arg(3) {
        None | Some(LuaValue::Nil) => None,
        Some(_) => Some(check_str(vm, 3, "rep")?),
    };
    let mut ctx = ContextBuilder::new();
    ctx.absorb(&s);
    if let Some(sep) = &sep {
        ctx.absorb(sep);
    }
    let mut out = Vec::new();
    if n > 0 {
        let total = s.len() as i64 * n + sep.as_ref().map(|x| x.len() as i64).unwrap_or(0) * (n - 1);
        if total > 512 * 1024 * 1024 {
            return Err(vm.raise(LuaError::Memory, "resulting string too large".to_string()));
        }
        for i in 0..n {
            if i > 0 {
                if let Some(sep) = &sep {
                    out.extend_from_slice(sep.as_bytes());
                }
            }
            out.extend_from_slice(s.as_bytes());
        }
    }
    vm.push_value(LuaValue::String(ctx.build(out)))?;
    Ok(1)
}

fn str_sub(vm: &mut LuaVM) -> LuaResult<usize> {
    let s = check_str(vm, 1, "sub")?;
    let len = s.len() as i64;
    let mut i = str_index(check_integer(vm, 2, "sub")?, s.len());
    let mut j = str_index(opt_integer(vm, 3, "sub", -1)?, s.len());
    if i < 1 {
        i = 1;
    }
    if j > len {
        j = len;
    }
    let bytes = if i > j {
        Vec::new()
    } else {
        s.as_bytes()[(i - 1) as usize..j as usize].to_vec()
    };
    let mut ctx = ContextBuilder::new();
    ctx.absorb(&s);
    vm.push_value(LuaValue::String(ctx.build(bytes)))?;
    Ok(1)
}

/// Shared init-offset handling for find/match/gmatch.
fn start_offset(init: i64, len: usize) -> usize {
    let i = str_index(init, len);
    if i < 1 { 0 } else { (i - 1) as usize }
}

fn str_find(vm: &mut LuaVM) -> LuaResult<usize> {
    let s = check_str(vm, 1, "find")?;
    let pat = check_str(vm, 2, "find")?;
    let init = opt_integer(vm, 3, "find", 1)?;
    let plain = arg_or_nil(vm, 4).is_truthy();
    let start = start_offset(init, s.len());
    if start > s.len() {
        vm.push_value(LuaValue::Nil)?;
        return Ok(1);
    }

    if plain {
        // Plain substring search, no pattern machinery.
        let hay = &s.as_bytes()[start..];
        let needle = pat.as_bytes();
        let found = if needle.is_empty() {
            Some(0)
        } else {
            hay.windows(needle.len()).position(|w| w == needle)
        };
        match found {
            Some(off) => {
                let b = start + off;
                vm.push_value(LuaValue::Integer(b as i64 + 1))?;
                vm.push_value(LuaValue::Integer((b + needle.len()) as i64))?;
                return Ok(2);
            }
            None => {
                vm.push_value(LuaValue::Nil)?;
                return Ok(1);
            }
        }
    }

    let compiled = compile_pattern(vm, &pat)?;
    match compiled.find_from(s.as_bytes(), start) {
        Some(m) => {
            vm.push_value(LuaValue::Integer(m.start as i64 + 1))?;
            vm.push_value(LuaValue::Integer(m.end as i64))?;
            let mut pushed = 2;
            for i in 0..m.n() {
                if let Some(c) = m.get(i) {
                    let v = capture_value(&s, c);
                    vm.push_value(v)?;
                    pushed += 1;
                }
            }
            Ok(pushed)
        }
        None => {
            vm.push_value(LuaValue::Nil)?;
            Ok(1)
        }
    }
}

fn str_match(vm: &mut LuaVM) -> LuaResult<usize> {
    let s = check_str(vm, 1, "match")?;
    let pat = check_str(vm, 2, "match")?;
    let init = opt_integer(vm, 3, "match", 1)?;
    let start = start_offset(init, s.len());
    if start > s.len() {
        vm.push_value(LuaValue::Nil)?;
        return Ok(1);
    }
    let compiled = compile_pattern(vm, &pat)?;
    match compiled.find_from(s.as_bytes(), start) {
        Some(m) => push_captures(vm, &s, &m),
        None => {
            vm.push_value(LuaValue::Nil)?;
            Ok(1)
        }
    }
}

fn str_gmatch(vm: &mut LuaVM) -> LuaResult<usize> {
    let s = check_any(vm, 1, "gmatch")?;
    let p = check_any(vm, 2, "gmatch")?;
    if !s.is_string() && !s.is_number() {
        return Err(type_error(vm, 1, "gmatch", "string"));
    }
    if !p.is_string() && !p.is_number() {
        return Err(type_error(vm, 2, "gmatch", "string"));
    }
    // Iterator state rides in the closure's upvalues: subject, pattern,
    // and a mutable scan position.
    let iter = vm.new_host_closure(
        "gmatch_iterator",
        gmatch_iterator,
        vec![s, p, LuaValue::Integer(0)],
        false,
    );
    vm.push_value(iter)?;
    Ok(1)
}

fn gmatch_iterator(vm: &mut LuaVM) -> LuaResult<usize> {
    let s_val = vm.host_upvalue(1).unwrap_or(LuaValue::Nil);
    let p_val = vm.host_upvalue(2).unwrap_or(LuaValue::Nil);
    let pos = vm
        .host_upvalue(3)
        .and_then(|v| v.as_integer_strict())
        .unwrap_or(0) as usize;
    let Some(subject) = vm.coerce_string(&s_val) else {
        vm.push_value(LuaValue::Nil)?;
        return Ok(1);
    };
    let Some(pattern) = vm.coerce_string(&p_val) else {
        vm.push_value(LuaValue::Nil)?;
        return Ok(1);
    };
    if pos > subject.len() {
        vm.push_value(LuaValue::Nil)?;
        return Ok(1);
    }
    let compiled = compile_pattern(vm, &pattern)?;
    match compiled.find_from(subject.as_bytes(), pos) {
        Some(m) => {
            // A zero-length match must advance the scan.
            let next = if m.end > m.start { m.end } else { m.end + 1 };
            vm.set_host_upvalue(3, LuaValue::Integer(next as i64))?;
            push_captures(vm, &subject, &m)
        }
        None => {
            vm.set_host_upvalue(3, LuaValue::Integer(subject.len() as i64 + 1))?;
            vm.push_value(LuaValue::Nil)?;
            Ok(1)
        }
    }
}

fn str_gsub(vm: &mut LuaVM) -> LuaResult<usize> {
    let s = check_str(vm, 1, "gsub")?;
    let pat = check_str(vm, 2, "gsub")?;
    let repl = check_any(vm, 3, "gsub")?;
    let max_n = match vm.arg(4) {
        None | Some(LuaValue::Nil) => i64::MAX,
        Some(_) => check_integer(vm, 4, "gsub")?,
    };
    match &repl {
        LuaValue::String(_) | LuaValue::Integer(_) | LuaValue::Float(_)
        | LuaValue::Table(_) | LuaValue::Function(_) => {}
        _ => {
            return Err(type_error(vm, 3, "gsub", "string/function/table"));
        }
    }

    let compiled = compile_pattern(vm, &pat)?;
    let subject = s.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(subject.len());
    let mut ctx = ContextBuilder::new();
    ctx.absorb(&s);
    if let LuaValue::String(r) = &repl {
        ctx.absorb(r);
    }

    let mut pos = 0usize;
    let mut count: i64 = 0;
    while count < max_n && pos <= subject.len() {
        let Some(m) = compiled.find_from(subject, pos) else {
            break;
        };
        // Copy the unmatched gap.
        out.extend_from_slice(&subject[pos..m.start]);
        count += 1;
        apply_replacement(vm, &s, &m, &repl, &mut out, &mut ctx)?;
        if m.end > m.start {
            pos = m.end;
        } else {
            // Zero-length match: emit the next byte and advance.
            if m.end < subject.len() {
                out.push(subject[m.end]);
            }
            pos = m.end + 1;
        }
        if compiled.anchored {
            break;
        }
    }
    if pos < subject.len() {
        out.extend_from_slice(&subject[pos..]);
    }

    vm.push_value(LuaValue::String(ctx.build(out)))?;
    vm.push_value(LuaValue::Integer(count))?;
    Ok(2)
}

fn whole_match_bytes(subject: &LuaStr, m: &Captures) -> Vec<u8> {
    subject.as_bytes()[m.start..m.end].to_vec()
}

fn apply_replacement(
    vm: &mut LuaVM,
    subject: &LuaStr,
    m: &Captures,
    repl: &LuaValue,
    out: &mut Vec<u8>,
    ctx: &mut ContextBuilder,
) -> LuaResult<()> {
    match repl {
        LuaValue::String(_) | LuaValue::Integer(_) | LuaValue::Float(_) => {
            let r = match vm.coerce_string(repl) {
                Some(r) => r,
                None => return Err(vm.error_runtime("invalid replacement value")),
            };
            let bytes = r.as_bytes();
            let mut i = 0;
            while i < bytes.len() {
                let b = bytes[i];
                if b == b'%' {
                    i += 1;
                    let Some(&d) = bytes.get(i) else {
                        return Err(vm.error_runtime("invalid use of '%' in replacement string"));
                    };
                    match d {
                        b'%' => out.push(b'%'),
                        b'0' => out.extend_from_slice(&whole_match_bytes(subject, m)),
                        b'1'..=b'9' => {
                            let idx = (d - b'1') as usize;
                            let caps = m.effective();
                            let Some(c) = caps.get(idx) else {
                                return Err(vm.error_runtime(format!(
                                    "invalid capture index %{} in replacement string",
                                    d - b'0'
                                )));
                            };
                            match capture_value(subject, *c) {
                                LuaValue::String(cs) => out.extend_from_slice(cs.as_bytes()),
                                LuaValue::Integer(p) => {
                                    out.extend_from_slice(p.to_string().as_bytes())
                                }
                                _ => {}
                            }
                        }
                        _ => {
                            return Err(
                                vm.error_runtime("invalid use of '%' in replacement string")
                            );
                        }
                    }
                    i += 1;
                } else {
                    out.push(b);
                    i += 1;
                }
            }
            Ok(())
        }
        LuaValue::Table(id) => {
            let caps = m.effective();
            let key = capture_value(subject, caps[0]);
            let v = vm.pool.table(*id).raw_get(&key);
            replacement_result(vm, subject, m, v, out, ctx)
        }
        LuaValue::Function(_) => {
            let caps = m.effective();
            let args: Vec<LuaValue> = caps
                .into_iter()
                .map(|c| capture_value(subject, c))
                .collect();
            let v = execute::call_function(vm, repl.clone(), args, 1)?
                .into_iter()
                .next()
                .unwrap_or(LuaValue::Nil);
            replacement_result(vm, subject, m, v, out, ctx)
        }
        _ => Err(vm.error_runtime("invalid replacement value")),
    }
}

/// A table/function replacement result: nil/false keeps the original match,
/// strings and numbers substitute.
fn replacement_result(
    vm: &mut LuaVM,
    subject: &LuaStr,
    m: &Captures,
    v: LuaValue,
    out: &mut Vec<u8>,
    ctx: &mut ContextBuilder,
) -> LuaResult<()> {
    match v {
        LuaValue::Nil | LuaValue::Boolean(false) => {
            out.extend_from_slice(&whole_match_bytes(subject, m));
            Ok(())
        }
        other => match vm.coerce_string(&other) {
            Some(r) => {
                ctx.absorb(&r);
                out.extend_from_slice(r.as_bytes());
                Ok(())
            }
            None => {
                let tn = other.type_name();
                Err(vm.error_runtime(format!("invalid replacement value (a {})", tn)))
            }
        },
    }
}
