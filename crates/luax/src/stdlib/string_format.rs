// string.format - the printf subset the string library exposes:
// d i o u x X c s q a A e E f g G p and %%.

use crate::lib_registry::{check_integer, check_str, type_error};
use crate::lua_value::{ContextBuilder, LuaValue, number};
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

#[derive(Default, Clone, Copy)]
struct Spec {
    minus: bool,
    plus: bool,
    space: bool,
    alt: bool,
    zero: bool,
    width: Option<usize>,
    precision: Option<usize>,
}

pub fn str_format(vm: &mut LuaVM) -> LuaResult<usize> {
    let fmt = check_str(vm, 1, "format")?;
    let bytes = fmt.as_bytes().to_vec();
    let mut ctx = ContextBuilder::new();
    ctx.absorb(&fmt);

    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut argn = 1usize;
    let mut i = 0usize;
    while i < bytes.len() {
        let b = bytes[i];
        if b != b'%' {
            out.push(b);
            i += 1;
            continue;
        }
        i += 1;
        if bytes.get(i) == Some(&b'%') {
            out.push(b'%');
            i += 1;
            continue;
        }
        let (spec, conv, next) = parse_spec(vm, &bytes, i)?;
        i = next;
        argn += 1;
        let piece = render(vm, &mut ctx, spec, conv, argn)?;
        out.extend_from_slice(&piece);
    }

    vm.push_value(LuaValue::String(ctx.build(out)))?;
    Ok(1)
}

fn parse_spec(vm: &mut LuaVM, bytes: &[u8], mut i: usize) -> LuaResult<(Spec, u8, usize)> {
    let mut spec = Spec::default();
    while let Some(&b) = bytes.get(i) {
        match b {
            b'-' => spec.minus = true,
            b'+' => spec.plus = true,
            b' ' => spec.space = true,
            b'#' => spec.alt = true,
            b'0' => spec.zero = true,
            _ => break,
        }
        i += 1;
    }
    let mut width = 0usize;
    let mut has_width = false;
    while let Some(&b) = bytes.get(i) {
        if b.is_ascii_digit() {
            width = width * 10 + (b - b'0') as usize;
            has_width = true;
            i += 1;
        } else {
            break;
        }
    }
    if has_width {
        if width > 99 {
            return Err(vm.error_runtime("invalid conversion width (too large)"));
        }
        spec.width = Some(width);
    }
    if bytes.get(i) == Some(&b'.') {
        i += 1;
        let mut prec = 0usize;
        while let Some(&b) = bytes.get(i) {
            if b.is_ascii_digit() {
                prec = prec * 10 + (b - b'0') as usize;
                i += 1;
            } else {
                break;
            }
        }
        if prec > 99 {
            return Err(vm.error_runtime("invalid conversion precision (too large)"));
        }
        spec.precision = Some(prec);
    }
    match bytes.get(i) {
        Some(&conv) => Ok((spec, conv, i + 1)),
        None => Err(vm.error_runtime("invalid conversion to 'format' (ends with '%')")),
    }
}

fn render(
    vm: &mut LuaVM,
    ctx: &mut ContextBuilder,
    spec: Spec,
    conv: u8,
    argn: usize,
) -> LuaResult<Vec<u8>> {
    let n = argn - 1; // Lua argument position (1 is the format string)
    match conv {
        b'd' | b'i' => {
            let v = check_integer(vm, n + 1, "format")?;
            Ok(pad_number(format_signed(v, spec), spec))
        }
        b'u' => {
            let v = check_integer(vm, n + 1, "format")? as u64;
            Ok(pad_number(v.to_string().into_bytes(), spec))
        }
        b'o' => {
            let v = check_integer(vm, n + 1, "format")? as u64;
            Ok(pad_number(format!("{:o}", v).into_bytes(), spec))
        }
        b'x' => {
            let v = check_integer(vm, n + 1, "format")? as u64;
            let body = if spec.alt && v != 0 {
                format!("0x{:x}", v)
            } else {
                format!("{:x}", v)
            };
            Ok(pad_number(body.into_bytes(), spec))
        }
        b'X' => {
            let v = check_integer(vm, n + 1, "format")? as u64;
            let body = if spec.alt && v != 0 {
                format!("0X{:X}", v)
            } else {
                format!("{:X}", v)
            };
            Ok(pad_number(body.into_bytes(), spec))
        }
        b'c' => {
            let v = check_integer(vm, n + 1, "format")?;
            Ok(pad_text(vec![v as u8], spec))
        }
        b'f' | b'F' => {
            let v = float_arg(vm, n + 1)?;
            let body = number::fmt_f(v, spec.precision.unwrap_or(6));
            Ok(pad_number(sign_float(body, v, spec), spec))
        }
        b'e' | b'E' => {
            let v = float_arg(vm, n + 1)?;
            let body = number::fmt_e(v, spec.precision.unwrap_or(6), conv == b'E');
            Ok(pad_number(sign_float(body, v, spec), spec))
        }
        b'g' | b'G' => {
            let v = float_arg(vm, n + 1)?;
            let mut body = number::fmt_g(v, spec.precision.unwrap_or(6).max(1));
            if conv == b'G' {
                body = body.to_uppercase();
            }
            Ok(pad_number(sign_float(body, v, spec), spec))
        }
        b'a' | b'A' => {
            let v = float_arg(vm, n + 1)?;
            let body = number::fmt_hex_float(v, conv == b'A');
            Ok(pad_number(body.into_bytes(), spec))
        }
        b's' => {
            let v = match vm.arg(n + 1) {
                Some(v) => v,
                None => return Err(type_error(vm, n + 1, "format", "value")),
            };
            let s = vm.tostring_value(&v)?;
            ctx.absorb(&s);
            let mut body = s.as_bytes().to_vec();
            if let Some(p) = spec.precision {
                body.truncate(p);
            }
            Ok(pad_text(body, spec))
        }
        b'q' => {
            let v = match vm.arg(n + 1) {
                Some(v) => v,
                None => return Err(type_error(vm, n + 1, "format", "value")),
            };
            quoted(vm, ctx, &v)
        }
        b'p' => {
            let v = vm.arg(n + 1).unwrap_or(LuaValue::Nil);
            let body = match &v {
                LuaValue::Table(id) => format!("0x{:012x}", id.index()),
                LuaValue::Function(id) => format!("0x{:012x}", id.index()),
                LuaValue::Userdata(id) => format!("0x{:012x}", id.index()),
                LuaValue::String(s) => format!("{:p}", std::rc::Rc::as_ptr(s)),
                _ => "(null)".to_string(),
            };
            Ok(pad_text(body.into_bytes(), spec))
        }
        other => Err(vm.raise(
            LuaError::Runtime,
            format!(
                "invalid conversion '%{}' to 'format'",
                (other as char).escape_default()
            ),
        )),
    }
}

fn float_arg(vm: &mut LuaVM, n: usize) -> LuaResult<f64> {
    crate::lib_registry::check_number(vm, n, "format")
}

fn format_signed(v: i64, spec: Spec) -> Vec<u8> {
    let mut s = v.to_string();
    if v >= 0 {
        if spec.plus {
            s.insert(0, '+');
        } else if spec.space {
            s.insert(0, ' ');
        }
    }
    s.into_bytes()
}

fn sign_float(body: String, v: f64, spec: Spec) -> Vec<u8> {
    let mut s = body;
    if v >= 0.0 || v.is_nan() {
        if spec.plus {
            s.insert(0, '+');
        } else if spec.space {
            s.insert(0, ' ');
        }
    }
    s.into_bytes()
}

/// Width for numbers: zero-padding goes between the sign and the digits.
fn pad_number(body: Vec<u8>, spec: Spec) -> Vec<u8> {
    let Some(width) = spec.width else {
        return body;
    };
    if body.len() >= width {
        return body;
    }
    let fill = width - body.len();
    if spec.minus {
        let mut out = body;
        out.extend(std::iter::repeat(b' ').take(fill));
        out
    } else if spec.zero {
        let sign_len = match body.first() {
            Some(b'+') | Some(b'-') | Some(b' ') => 1,
            _ => 0,
        };
        let mut out = body[..sign_len].to_vec();
        out.extend(std::iter::repeat(b'0').take(fill));
        out.extend_from_slice(&body[sign_len..]);
        out
    } else {
        let mut out: Vec<u8> = std::iter::repeat(b' ').take(fill).collect();
        out.extend_from_slice(&body);
        out
    }
}

/// Width for text: spaces only.
fn pad_text(body: Vec<u8>, spec: Spec) -> Vec<u8> {
    let Some(width) = spec.width else {
        return body;
    };
    if body.len() >= width {
        return body;
    }
    let fill = width - body.len();
    if spec.minus {
        let mut out = body;
        out.extend(std::iter::repeat(b' ').take(fill));
        out
    } else {
        let mut out: Vec<u8> = std::iter::repeat(b' ').take(fill).collect();
        out.extend_from_slice(&body);
        out
    }
}

/// `%q`: a literal form that reads back as the same value.
fn quoted(vm: &mut LuaVM, ctx: &mut ContextBuilder, v: &LuaValue) -> LuaResult<Vec<u8>> {
    match v {
        LuaValue::String(s) => {
            ctx.absorb(s);
            let mut out = vec![b'"'];
            for &b in s.as_bytes() {
                match b {
                    b'"' => out.extend_from_slice(b"\\\""),
                    b'\\' => out.extend_from_slice(b"\\\\"),
                    b'\n' => out.extend_from_slice(b"\\n"),
                    b'\r' => out.extend_from_slice(b"\\r"),
                    0 => out.extend_from_slice(b"\\0"),
                    c if c < 32 || c == 127 => {
                        out.extend_from_slice(format!("\\{}", c).as_bytes());
                    }
                    c => out.push(c),
                }
            }
            out.push(b'"');
            Ok(out)
        }
        LuaValue::Integer(i) => Ok(i.to_string().into_bytes()),
        LuaValue::Float(f) => {
            // Hex float form survives a round trip exactly.
            if f.is_finite() {
                Ok(number::fmt_hex_float(*f, false).into_bytes())
            } else if f.is_nan() {
                Ok(b"(0/0)".to_vec())
            } else if *f > 0.0 {
                Ok(b"1e9999".to_vec())
            } else {
                Ok(b"-1e9999".to_vec())
            }
        }
        LuaValue::Nil => Ok(b"nil".to_vec()),
        LuaValue::Boolean(true) => Ok(b"true".to_vec()),
        LuaValue::Boolean(false) => Ok(b"false".to_vec()),
        other => {
            let tn = other.type_name();
            Err(vm.error_runtime(format!("value has no literal form (a {})", tn)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua_vm::VmOptions;

    fn fmt(vm: &mut LuaVM, src: &str) -> String {
        let r = vm.execute_string(src).expect("format program");
        r[0].as_str().expect("string result").to_string()
    }

    #[test]
    fn widths_and_alignment() {
        let mut vm = LuaVM::new(VmOptions::default());
        vm.open_libs().unwrap();
        assert_eq!(
            fmt(&mut vm, r#"return string.format("%-10s|%5d", "lua", 42)"#),
            "lua       |   42"
        );
        assert_eq!(
            fmt(&mut vm, r#"return string.format("%05d", 7)"#),
            "00007"
        );
        assert_eq!(
            fmt(&mut vm, r#"return string.format("%+d %x %X", 3, 255, 255)"#),
            "+3 ff FF"
        );
    }

    #[test]
    fn float_conversions() {
        let mut vm = LuaVM::new(VmOptions::default());
        vm.open_libs().unwrap();
        assert_eq!(
            fmt(&mut vm, r#"return string.format("%.2f", 3.14159)"#),
            "3.14"
        );
        assert_eq!(fmt(&mut vm, r#"return string.format("%g", 0.5)"#), "0.5");
        assert_eq!(
            fmt(&mut vm, r#"return string.format("%e", 1200.0)"#),
            "1.200000e+03"
        );
    }

    #[test]
    fn quoted_round_trips() {
        let mut vm = LuaVM::new(VmOptions::default());
        vm.open_libs().unwrap();
        assert_eq!(
            fmt(&mut vm, r#"return string.format("%q", "a\nb\"c")"#),
            "\"a\\nb\\\"c\""
        );
        assert_eq!(fmt(&mut vm, r#"return string.format("%q", 17)"#), "17");
    }
}
