// The utf8 library.
//
// Accepts the full 31-bit range with the historical five/six-byte extension
// encodings above 0x10FFFF; the `lax` flag on codepoint/len/codes disables
// surrogate and range checks.

use crate::lib_registry::{
    LibraryModule, arg_or_nil, check_integer, check_str, opt_integer, type_error,
};
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

/// Pattern matching exactly one UTF-8 byte sequence.
const CHAR_PATTERN_BYTES: &[u8] = b"[\x00-\x7F\xC2-\xFD][\x80-\xBF]*";

const MAX_UNICODE: u32 = 0x10FFFF;
const MAX_EXTENDED: u32 = 0x7FFF_FFFF;

pub fn create_utf8_lib() -> LibraryModule {
    let module = crate::lib_module!("utf8", {
        "char" => utf8_char,
        "codepoint" => utf8_codepoint,
        "codes" => utf8_codes,
        "len" => utf8_len,
        "offset" => utf8_offset,
    });
    module.with_value("charpattern", |vm| vm.new_string_bytes(CHAR_PATTERN_BYTES))
}

/// Decodes one sequence at `pos`. Returns `(codepoint, length)`.
/// `lax` skips the surrogate, overlong-ish and >MAX_UNICODE checks.
fn decode(bytes: &[u8], pos: usize, lax: bool) -> Option<(u32, usize)> {
    let first = *bytes.get(pos)?;
    if first < 0x80 {
        return Some((first as u32, 1));
    }
    let len = match first {
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF7 => 4,
        0xF8..=0xFB => 5,
        0xFC..=0xFD => 6,
        _ => return None,
    };
    if pos + len > bytes.len() {
        return None;
    }
    let mut cp = (first as u32) & (0x7F >> len);
    for i in 1..len {
        let b = bytes[pos + i];
        if b & 0xC0 != 0x80 {
            return None;
        }
        cp = (cp << 6) | (b as u32 & 0x3F);
    }
    if !lax {
        if cp > MAX_UNICODE {
            return None;
        }
        if (0xD800..=0xDFFF).contains(&cp) {
            return None;
        }
    } else if cp > MAX_EXTENDED {
        return None;
    }
    Some((cp, len))
}

fn encode(cp: u32, out: &mut Vec<u8>) {
    crate::compiler::lexer::encode_utf8(cp, out);
}

fn utf8_char(vm: &mut LuaVM) -> LuaResult<usize> {
    let n = vm.arg_count();
    let mut out = Vec::with_capacity(n * 2);
    for i in 1..=n {
        let cp = check_integer(vm, i, "char")?;
        if !(0..=MAX_EXTENDED as i64).contains(&cp) {
            return Err(vm.raise(
                LuaError::Type,
                format!("bad argument #{} to 'char' (value out of range)", i),
            ));
        }
        encode(cp as u32, &mut out);
    }
    let v = vm.new_string_bytes(&out);
    vm.push_value(v)?;
    Ok(1)
}

/// Translates a 1-based (possibly negative) index to a byte offset.
fn byte_pos(i: i64, len: usize) -> i64 {
    if i >= 0 { i } else { len as i64 + i + 1 }
}

fn utf8_codepoint(vm: &mut LuaVM) -> LuaResult<usize> {
    let s = check_str(vm, 1, "codepoint")?;
    let i = opt_integer(vm, 2, "codepoint", 1)?;
    let j = opt_integer(vm, 3, "codepoint", i)?;
    let lax = arg_or_nil(vm, 4).is_truthy();
    let len = s.len();
    let i = byte_pos(i, len);
    let j = byte_pos(j, len);
    if i < 1 {
        return Err(vm.raise(
            LuaError::Type,
            "bad argument #2 to 'codepoint' (out of bounds)".to_string(),
        ));
    }
    if j > len as i64 {
        return Err(vm.raise(
            LuaError::Type,
            "bad argument #3 to 'codepoint' (out of bounds)".to_string(),
        ));
    }
    let bytes = s.as_bytes().to_vec();
    let mut pos = (i - 1) as usize;
    let mut pushed = 0;
    while pos < j as usize {
        let Some((cp, adv)) = decode(&bytes, pos, lax) else {
            return Err(vm.error_runtime(format!("invalid UTF-8 code at position {}", pos + 1)));
        };
        vm.push_value(LuaValue::Integer(cp as i64))?;
        pushed += 1;
        pos += adv;
    }
    Ok(pushed)
}

fn utf8_len(vm: &mut LuaVM) -> LuaResult<usize> {
    let s = check_str(vm, 1, "len")?;
    let len = s.len();
    let i = byte_pos(opt_integer(vm, 2, "len", 1)?, len);
    let j = byte_pos(opt_integer(vm, 3, "len", -1)?, len);
    let lax = arg_or_nil(vm, 4).is_truthy();
    if i < 1 || i > len as i64 + 1 {
        return Err(vm.raise(
            LuaError::Type,
            "bad argument #2 to 'len' (initial position out of bounds)".to_string(),
        ));
    }
    if j > len as i64 {
        return Err(vm.raise(
            LuaError::Type,
            "bad argument #3 to 'len' (final position out of bounds)".to_string(),
        ));
    }
    let bytes = s.as_bytes();
    let mut pos = (i - 1) as usize;
    let mut count = 0i64;
    while (pos as i64) < j {
        match decode(bytes, pos, lax) {
            Some((_, adv)) => {
                count += 1;
                pos += adv;
            }
            None => {
                // Report the failing position instead of raising.
                vm.push_value(LuaValue::Nil)?;
                vm.push_value(LuaValue::Integer(pos as i64 + 1))?;
                return Ok(2);
            }
        }
    }
    vm.push_value(LuaValue::Integer(count))?;
    Ok(1)
}

/// A continuation byte (not a sequence start).
fn is_continuation(b: u8) -> bool {
    b & 0xC0 == 0x80
}

fn utf8_offset(vm: &mut LuaVM) -> LuaResult<usize> {
    let s = check_str(vm, 1, "offset")?;
    let n = check_integer(vm, 2, "offset")?;
    let len = s.len();
    let default_i = if n >= 0 { 1 } else { len as i64 + 1 };
    let i = byte_pos(opt_integer(vm, 3, "offset", default_i)?, len);
    if i < 1 || i > len as i64 + 1 {
        return Err(vm.raise(
            LuaError::Type,
            "bad argument #3 to 'offset' (position out of bounds)".to_string(),
        ));
    }
    let bytes = s.as_bytes();
    let mut pos = (i - 1) as i64;
    if n == 0 {
        // Start of the sequence containing byte i.
        while pos > 0 && is_continuation(bytes[pos as usize]) {
            pos -= 1;
        }
        vm.push_value(LuaValue::Integer(pos + 1))?;
        return Ok(1);
    }
    if (pos as usize) < len && is_continuation(bytes[pos as usize]) {
        return Err(vm.error_runtime("initial position is a continuation byte"));
    }
    let mut n = n;
    if n > 0 {
        n -= 1;
        while n > 0 && pos < len as i64 {
            pos += 1;
            while (pos as usize) < len && is_continuation(bytes[pos as usize]) {
                pos += 1;
            }
            n -= 1;
        }
        if n > 0 {
            vm.push_value(LuaValue::Nil)?;
            return Ok(1);
        }
    } else {
        while n < 0 && pos > 0 {
            pos -= 1;
            while pos > 0 && is_continuation(bytes[pos as usize]) {
                pos -= 1;
            }
            n += 1;
        }
        if n < 0 {
            vm.push_value(LuaValue::Nil)?;
            return Ok(1);
        }
    }
    vm.push_value(LuaValue::Integer(pos + 1))?;
    Ok(1)
}

fn utf8_codes(vm: &mut LuaVM) -> LuaResult<usize> {
    let s = arg_or_nil(vm, 1);
    if !s.is_string() {
        return Err(type_error(vm, 1, "codes", "string"));
    }
    let lax = arg_or_nil(vm, 2);
    let iter = vm.new_host_closure("utf8_codes_iterator", codes_iterator, vec![lax], false);
    vm.push_value(iter)?;
    vm.push_value(s)?;
    vm.push_value(LuaValue::Integer(0))?;
    Ok(3)
}

fn codes_iterator(vm: &mut LuaVM) -> LuaResult<usize> {
    let s = check_str(vm, 1, "codes")?;
    let prev = check_integer(vm, 2, "codes")?;
    let lax = vm
        .host_upvalue(1)
        .map(|v| v.is_truthy())
        .unwrap_or(false);
    let bytes = s.as_bytes().to_vec();
    // Skip past the sequence that starts at `prev`.
    let mut pos = if prev <= 0 { 0 } else { prev as usize };
    while pos < bytes.len() && is_continuation(bytes[pos]) {
        pos += 1;
    }
    if pos >= bytes.len() {
        vm.push_value(LuaValue::Nil)?;
        return Ok(1);
    }
    let Some((cp, _)) = decode(&bytes, pos, lax) else {
        return Err(vm.error_runtime(format!("invalid UTF-8 code at position {}", pos + 1)));
    };
    vm.push_value(LuaValue::Integer(pos as i64 + 1))?;
    vm.push_value(LuaValue::Integer(cp as i64))?;
    Ok(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_basic_and_extended() {
        assert_eq!(decode(b"A", 0, false), Some((65, 1)));
        assert_eq!(decode("é".as_bytes(), 0, false), Some((0xE9, 2)));
        assert_eq!(decode("€".as_bytes(), 0, false), Some((0x20AC, 3)));
        // Six-byte extension encoding of a value above 0x10FFFF.
        let mut big = Vec::new();
        encode(0x7FFF_FFFF, &mut big);
        assert_eq!(big.len(), 6);
        assert_eq!(decode(&big, 0, true), Some((0x7FFF_FFFF, 6)));
        // Strict mode rejects it.
        assert_eq!(decode(&big, 0, false), None);
    }

    #[test]
    fn strict_mode_rejects_surrogates() {
        let mut surrogate = Vec::new();
        encode(0xD800, &mut surrogate);
        assert_eq!(decode(&surrogate, 0, false), None);
        assert!(decode(&surrogate, 0, true).is_some());
    }

    #[test]
    fn invalid_sequences() {
        assert_eq!(decode(&[0x80], 0, true), None); // bare continuation
        assert_eq!(decode(&[0xC2], 0, true), None); // truncated
        assert_eq!(decode(&[0xC2, 0x41], 0, true), None); // bad continuation
    }
}
