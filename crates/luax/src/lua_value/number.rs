// Numeric conversions and formatting.
//
// Lua numbers are one type with two subkinds (64-bit integer, IEEE double).
// String<->number conversions follow the lexer's numeral grammar plus
// surrounding whitespace; float formatting is C's "%.14g" with Lua's trailing
// ".0" rule for integral floats.

use super::LuaValue;

/// Decimal precision used by `tostring` on floats, matching LUAI_NUMFFORMAT.
pub const FLOAT_FMT_PRECISION: usize = 14;

/// Exact float->integer conversion (`math.tointeger` semantics).
#[inline]
pub fn float_to_integer(f: f64) -> Option<i64> {
    if f.fract() != 0.0 || !f.is_finite() {
        return None;
    }
    // i64::MAX as f64 rounds up to 2^63, which is out of range; compare in
    // float space against the exactly representable bounds.
    if f >= -(i64::MIN as f64) || f < i64::MIN as f64 {
        return None;
    }
    Some(f as i64)
}

/// Integer formatting via `itoa` (no allocation beyond the output String).
pub fn int_to_lua_string(i: i64) -> String {
    let mut buf = itoa::Buffer::new();
    buf.format(i).to_string()
}

/// Float formatting: `%.14g`, then append ".0" when the result reads as an
/// integer so `tostring(1.0)` is distinguishable from `tostring(1)`.
pub fn float_to_lua_string(f: f64) -> String {
    if f.is_nan() {
        return if f.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if f.is_infinite() {
        return if f < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    let mut s = fmt_g(f, FLOAT_FMT_PRECISION);
    if !s.contains(['.', 'e', 'E']) {
        s.push_str(".0");
    }
    s
}

/// C `%g`-style formatting with the given significant-digit precision.
pub fn fmt_g(x: f64, prec: usize) -> String {
    let prec = prec.max(1);
    if x == 0.0 {
        return if x.is_sign_negative() { "-0" } else { "0" }.to_string();
    }
    // Probe the decimal exponent through Rust's scientific formatting, which
    // rounds exactly like %e at the same precision.
    let sci = format!("{:.*e}", prec - 1, x);
    let (mant, exp) = match sci.split_once('e') {
        Some(pair) => pair,
        None => return sci,
    };
    let exp: i32 = exp.parse().unwrap_or(0);
    if exp < -4 || exp >= prec as i32 {
        let mant = strip_trailing_zeros(mant);
        format!("{}e{}{:02}", mant, if exp < 0 { '-' } else { '+' }, exp.abs())
    } else {
        let p = (prec as i32 - 1 - exp).max(0) as usize;
        let fixed = format!("{:.*}", p, x);
        strip_trailing_zeros(&fixed).to_string()
    }
}

/// C `%e`-style formatting: two-digit minimum exponent with a sign.
pub fn fmt_e(x: f64, prec: usize, upper: bool) -> String {
    if !x.is_finite() {
        return special_float(x, upper);
    }
    let sci = format!("{:.*e}", prec, x);
    let (mant, exp) = match sci.split_once('e') {
        Some(pair) => pair,
        None => return sci,
    };
    let exp: i32 = exp.parse().unwrap_or(0);
    let e = if upper { 'E' } else { 'e' };
    format!("{}{}{}{:02}", mant, e, if exp < 0 { '-' } else { '+' }, exp.abs())
}

/// C `%f`-style formatting.
pub fn fmt_f(x: f64, prec: usize) -> String {
    if !x.is_finite() {
        return special_float(x, false);
    }
    format!("{:.*}", prec, x)
}

/// C `%a`-style hexadecimal float formatting.
pub fn fmt_hex_float(x: f64, upper: bool) -> String {
    if x.is_nan() {
        return special_float(x, upper);
    }
    if x.is_infinite() {
        return special_float(x, upper);
    }
    let bits = x.to_bits();
    let sign = if bits >> 63 != 0 { "-" } else { "" };
    let biased = ((bits >> 52) & 0x7ff) as i64;
    let frac = bits & 0xf_ffff_ffff_ffff;
    let (lead, exp, frac) = if biased == 0 {
        if frac == 0 {
            let s = format!("{}0x0p+0", sign);
            return if upper { s.to_uppercase() } else { s };
        }
        (0u64, -1022i64, frac)
    } else {
        (1u64, biased - 1023, frac)
    };
    let mut hex = format!("{:013x}", frac);
    while hex.len() > 1 && hex.ends_with('0') {
        hex.pop();
    }
    let s = if frac == 0 {
        format!("{}0x{}p{}{}", sign, lead, if exp < 0 { '-' } else { '+' }, exp.abs())
    } else {
        format!(
            "{}0x{}.{}p{}{}",
            sign,
            lead,
            hex,
            if exp < 0 { '-' } else { '+' },
            exp.abs()
        )
    };
    if upper { s.to_uppercase() } else { s }
}

fn special_float(x: f64, upper: bool) -> String {
    let s = if x.is_nan() {
        if x.is_sign_negative() { "-nan" } else { "nan" }
    } else if x > 0.0 {
        "inf"
    } else {
        "-inf"
    };
    if upper { s.to_uppercase() } else { s.to_string() }
}

fn strip_trailing_zeros(s: &str) -> &str {
    if !s.contains('.') {
        return s;
    }
    let s = s.trim_end_matches('0');
    s.trim_end_matches('.')
}

// ----- string -> number -----

#[inline]
fn is_lua_space(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c)
}

fn trim_spaces(s: &[u8]) -> &[u8] {
    let mut start = 0;
    let mut end = s.len();
    while start < end && is_lua_space(s[start]) {
        start += 1;
    }
    while end > start && is_lua_space(s[end - 1]) {
        end -= 1;
    }
    &s[start..end]
}

/// Full conversion used by `tonumber` and arithmetic coercion: accepts the
/// lexer's numeral grammar with leading/trailing whitespace. Produces an
/// integer when the literal is an integer literal that fits, a float
/// otherwise.
pub fn str_to_number(s: &[u8]) -> Option<LuaValue> {
    let t = trim_spaces(s);
    if t.is_empty() {
        return None;
    }
    let (neg, body) = match t[0] {
        b'-' => (true, &t[1..]),
        b'+' => (false, &t[1..]),
        _ => (false, t),
    };
    if body.is_empty() {
        return None;
    }
    let v = if body.len() > 2 && body[0] == b'0' && (body[1] | 0x20) == b'x' {
        parse_hex_body(&body[2..])?
    } else {
        parse_dec_body(body)?
    };
    Some(match v {
        LuaValue::Integer(i) => {
            if neg {
                LuaValue::Integer(i.wrapping_neg())
            } else {
                LuaValue::Integer(i)
            }
        }
        LuaValue::Float(f) => LuaValue::Float(if neg { -f } else { f }),
        other => other,
    })
}

/// Integer-only conversion (string keys, `string.format("%d")` coercion).
pub fn str_to_integer(s: &[u8]) -> Option<i64> {
    match str_to_number(s)? {
        LuaValue::Integer(i) => Some(i),
        LuaValue::Float(f) => float_to_integer(f),
        _ => None,
    }
}

/// `tonumber(s, base)` for bases 2..=36: digits only, wrapping accumulation
/// as in the reference implementation.
pub fn str_to_integer_radix(s: &[u8], base: u32) -> Option<i64> {
    let t = trim_spaces(s);
    if t.is_empty() {
        return None;
    }
    let (neg, body) = match t[0] {
        b'-' => (true, &t[1..]),
        b'+' => (false, &t[1..]),
        _ => (false, t),
    };
    if body.is_empty() {
        return None;
    }
    let mut acc: u64 = 0;
    for &c in body {
        let d = (c as char).to_digit(36)?;
        if d >= base {
            return None;
        }
        acc = acc.wrapping_mul(base as u64).wrapping_add(d as u64);
    }
    let i = acc as i64;
    Some(if neg { i.wrapping_neg() } else { i })
}

/// Hex numeral after the `0x` prefix: integer (wrapping) unless it has a
/// fraction dot or a binary exponent.
fn parse_hex_body(body: &[u8]) -> Option<LuaValue> {
    if body.is_empty() {
        return None;
    }
    let has_dot = body.contains(&b'.');
    let has_p = body.iter().any(|&c| (c | 0x20) == b'p');
    if !has_dot && !has_p {
        let mut acc: u64 = 0;
        for &c in body {
            let d = (c as char).to_digit(16)?;
            acc = acc.wrapping_mul(16).wrapping_add(d as u64);
        }
        return Some(LuaValue::Integer(acc as i64));
    }
    // Hex float: mantissa digits around an optional dot, then p±dd.
    let mut mantissa = 0.0f64;
    let mut exp4: i32 = 0;
    let mut seen_digit = false;
    let mut seen_dot = false;
    let mut i = 0;
    while i < body.len() {
        let c = body[i];
        if c == b'.' {
            if seen_dot {
                return None;
            }
            seen_dot = true;
        } else if let Some(d) = (c as char).to_digit(16) {
            mantissa = mantissa * 16.0 + d as f64;
            if seen_dot {
                exp4 -= 4;
            }
            seen_digit = true;
        } else {
            break;
        }
        i += 1;
    }
    if !seen_digit {
        return None;
    }
    let mut pexp: i32 = 0;
    if i < body.len() {
        if (body[i] | 0x20) != b'p' {
            return None;
        }
        i += 1;
        let mut pneg = false;
        if i < body.len() && (body[i] == b'+' || body[i] == b'-') {
            pneg = body[i] == b'-';
            i += 1;
        }
        if i >= body.len() || !body[i].is_ascii_digit() {
            return None;
        }
        while i < body.len() {
            if !body[i].is_ascii_digit() {
                return None;
            }
            pexp = pexp.saturating_mul(10).saturating_add((body[i] - b'0') as i32);
            i += 1;
        }
        if pneg {
            pexp = -pexp;
        }
    }
    if i != body.len() {
        return None;
    }
    Some(LuaValue::Float(ldexp(mantissa, exp4 + pexp)))
}

fn ldexp(m: f64, e: i32) -> f64 {
    m * (2.0f64).powi(e)
}

/// Decimal numeral: integer when it has no dot/exponent and fits an i64;
/// float otherwise (including overflowing integer literals).
fn parse_dec_body(body: &[u8]) -> Option<LuaValue> {
    let mut has_dot = false;
    let mut has_exp = false;
    let mut digits = 0;
    let mut i = 0;
    while i < body.len() {
        match body[i] {
            b'0'..=b'9' => digits += 1,
            b'.' => {
                if has_dot || has_exp {
                    return None;
                }
                has_dot = true;
            }
            b'e' | b'E' => {
                if has_exp || digits == 0 {
                    return None;
                }
                has_exp = true;
                if i + 1 < body.len() && (body[i + 1] == b'+' || body[i + 1] == b'-') {
                    i += 1;
                }
                if i + 1 >= body.len() || !body[i + 1].is_ascii_digit() {
                    return None;
                }
            }
            _ => return None,
        }
        i += 1;
    }
    if digits == 0 {
        return None;
    }
    let text = std::str::from_utf8(body).ok()?;
    if !has_dot && !has_exp {
        if let Ok(i) = text.parse::<i64>() {
            return Some(LuaValue::Integer(i));
        }
        // Overflowing decimal integer literals become floats.
    }
    text.parse::<f64>().ok().map(LuaValue::Float)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_float_to_integer() {
        assert_eq!(float_to_integer(3.0), Some(3));
        assert_eq!(float_to_integer(3.5), None);
        assert_eq!(float_to_integer(f64::INFINITY), None);
        assert_eq!(float_to_integer(-9.223372036854776e18), Some(i64::MIN));
        assert_eq!(float_to_integer(9.223372036854776e18), None);
    }

    #[test]
    fn g_format_matches_c() {
        assert_eq!(fmt_g(0.1, 14), "0.1");
        assert_eq!(fmt_g(1e20, 14), "1e+20");
        assert_eq!(fmt_g(3.0, 14), "3");
        assert_eq!(fmt_g(1.5, 14), "1.5");
        assert_eq!(fmt_g(-0.0, 14), "-0");
        assert_eq!(fmt_g(0.000001, 14), "1e-06");
        assert_eq!(fmt_g(0.0001, 14), "0.0001");
    }

    #[test]
    fn float_tostring_keeps_subkind_visible() {
        assert_eq!(float_to_lua_string(1.0), "1.0");
        assert_eq!(float_to_lua_string(1e20), "1e+20");
        assert_eq!(float_to_lua_string(0.5), "0.5");
        assert_eq!(float_to_lua_string(f64::INFINITY), "inf");
    }

    #[test]
    fn parse_decimal() {
        assert!(matches!(str_to_number(b"  42 "), Some(LuaValue::Integer(42))));
        assert!(matches!(str_to_number(b"-7"), Some(LuaValue::Integer(-7))));
        assert!(matches!(str_to_number(b"3.14"), Some(LuaValue::Float(_))));
        assert!(matches!(str_to_number(b"1e2"), Some(LuaValue::Float(_))));
        assert!(str_to_number(b"").is_none());
        assert!(str_to_number(b"1e").is_none());
        assert!(str_to_number(b"0x").is_none());
        assert!(str_to_number(b"inf").is_none());
    }

    #[test]
    fn parse_hex() {
        assert!(matches!(str_to_number(b"0xFF"), Some(LuaValue::Integer(255))));
        match str_to_number(b"0x1p4") {
            Some(LuaValue::Float(f)) => assert_eq!(f, 16.0),
            other => panic!("unexpected {:?}", other),
        }
        match str_to_number(b"0x.8") {
            Some(LuaValue::Float(f)) => assert_eq!(f, 0.5),
            other => panic!("unexpected {:?}", other),
        }
        // Hex integers wrap modulo 2^64.
        assert!(matches!(
            str_to_number(b"0xFFFFFFFFFFFFFFFF"),
            Some(LuaValue::Integer(-1))
        ));
    }

    #[test]
    fn radix_conversion() {
        assert_eq!(str_to_integer_radix(b"ff", 16), Some(255));
        assert_eq!(str_to_integer_radix(b"101", 2), Some(5));
        assert_eq!(str_to_integer_radix(b"z", 36), Some(35));
        assert_eq!(str_to_integer_radix(b"2", 2), None);
    }
}
