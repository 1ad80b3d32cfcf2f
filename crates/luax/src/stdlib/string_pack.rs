// string.pack / string.packsize / string.unpack.
//
// The 5.4 format string: endianness marks (< > =), alignment (![n], Xop, x),
// fixed-size integers (b B h H l L j J i[n] I[n]), floats (f d n), counted
// and zero-terminated strings (s[n], z). Sizes are in bytes; integers narrower
// than eight bytes range-check on pack and sign-extend on unpack.

use crate::lib_registry::{arg_or_nil, check_integer, check_str, type_error};
use crate::lua_value::{ContextBuilder, LuaValue};
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

const MAX_INT_SIZE: usize = 16;
const DEFAULT_INT_SIZE: usize = 4;
const DEFAULT_STR_PREFIX: usize = 8;
const NATIVE_ALIGN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Opt {
    Int { size: usize, signed: bool },
    Float32,
    Float64,
    /// Length-prefixed string; `prefix` is the size of the length field.
    Str { prefix: usize },
    ZStr,
    PadByte,
    /// `Xop`: align as `op` without reading/writing data.
    AlignOnly,
    Nothing,
}

struct FormatParser<'a> {
    fmt: &'a [u8],
    pos: usize,
    little: bool,
    maxalign: usize,
}

impl<'a> FormatParser<'a> {
    fn new(fmt: &'a [u8]) -> Self {
        FormatParser {
            fmt,
            pos: 0,
            little: true, // native for every target this crate builds on
            maxalign: 1,
        }
    }

    fn optional_size(&mut self, default: usize) -> usize {
        let mut n = 0usize;
        let mut any = false;
        while let Some(&c) = self.fmt.get(self.pos) {
            if c.is_ascii_digit() {
                n = n * 10 + (c - b'0') as usize;
                any = true;
                self.pos += 1;
            } else {
                break;
            }
        }
        if any { n } else { default }
    }

    /// Next option plus its natural alignment size; `None` at the end.
    fn next(&mut self) -> Result<Option<(Opt, usize)>, String> {
        loop {
            let Some(&c) = self.fmt.get(self.pos) else {
                return Ok(None);
            };
            self.pos += 1;
            let (opt, align) = match c {
                b' ' => continue,
                b'<' => {
                    self.little = true;
                    continue;
                }
                b'>' => {
                    self.little = false;
                    continue;
                }
                b'=' => {
                    self.little = true;
                    continue;
                }
                b'!' => {
                    let n = self.optional_size(NATIVE_ALIGN);
                    if !n.is_power_of_two() || n == 0 || n > MAX_INT_SIZE {
                        return Err(format!("integral size {} is not a power of 2", n));
                    }
                    self.maxalign = n;
                    continue;
                }
                b'b' => (Opt::Int { size: 1, signed: true }, 1),
                b'B' => (Opt::Int { size: 1, signed: false }, 1),
                b'h' => (Opt::Int { size: 2, signed: true }, 2),
                b'H' => (Opt::Int { size: 2, signed: false }, 2),
                b'l' | b'j' => (Opt::Int { size: 8, signed: true }, 8),
                b'L' | b'J' | b'T' => (Opt::Int { size: 8, signed: false }, 8),
                b'i' | b'I' => {
                    let n = self.optional_size(DEFAULT_INT_SIZE);
                    if n == 0 || n > MAX_INT_SIZE {
                        return Err(format!(
                            "integral size ({}) out of limits [1,{}]",
                            n, MAX_INT_SIZE
                        ));
                    }
                    (
                        Opt::Int {
                            size: n,
                            signed: c == b'i',
                        },
                        n.min(NATIVE_ALIGN),
                    )
                }
                b'f' => (Opt::Float32, 4),
                b'd' | b'n' => (Opt::Float64, 8),
                b's' => {
                    let n = self.optional_size(DEFAULT_STR_PREFIX);
                    if n == 0 || n > MAX_INT_SIZE {
                        return Err("string length size out of limits".to_string());
                    }
                    (Opt::Str { prefix: n }, n.min(NATIVE_ALIGN))
                }
                b'z' => (Opt::ZStr, 1),
                b'x' => (Opt::PadByte, 1),
                b'X' => (Opt::AlignOnly, 0),
                other => {
                    return Err(format!(
                        "invalid format option '{}'",
                        (other as char).escape_default()
                    ));
                }
            };
            return Ok(Some((opt, align)));
        }
    }

    /// Padding needed before an option of natural alignment `align`.
    fn padding(&self, at: usize, align: usize) -> usize {
        let a = align.min(self.maxalign).max(1);
        (a - at % a) % a
    }
}

fn pack_error(vm: &mut LuaVM, msg: impl Into<String>) -> LuaError {
    vm.raise(LuaError::Runtime, format!("bad pack format: {}", msg.into()))
}

fn write_int(out: &mut Vec<u8>, v: i64, size: usize, little: bool) {
    let bytes = (v as u64).to_le_bytes();
    let mut buf = vec![0u8; size];
    let fill = if v < 0 { 0xff } else { 0x00 };
    for (i, slot) in buf.iter_mut().enumerate() {
        *slot = if i < 8 { bytes[i] } else { fill };
    }
    if !little {
        buf.reverse();
    }
    out.extend_from_slice(&buf);
}

fn range_check(v: i64, size: usize, signed: bool) -> bool {
    if size >= 8 {
        return true;
    }
    let bits = size as u32 * 8;
    if signed {
        let min = -(1i64 << (bits - 1));
        let max = (1i64 << (bits - 1)) - 1;
        v >= min && v <= max
    } else {
        (v as u64) < (1u64 << bits)
    }
}

pub fn str_pack(vm: &mut LuaVM) -> LuaResult<usize> {
    let fmt = check_str(vm, 1, "pack")?;
    let fmt_bytes = fmt.as_bytes().to_vec();
    let mut parser = FormatParser::new(&fmt_bytes);
    let mut out: Vec<u8> = Vec::new();
    let mut ctx = ContextBuilder::new();
    let mut argn = 1usize;

    loop {
        let step = parser.next().map_err(|e| pack_error(vm, e))?;
        let Some((opt, align)) = step else { break };
        for _ in 0..parser.padding(out.len(), align) {
            out.push(0);
        }
        match opt {
            Opt::Int { size, signed } => {
                argn += 1;
                let v = check_integer(vm, argn, "pack")?;
                if !range_check(v, size, signed) {
                    return Err(vm.raise(
                        LuaError::Runtime,
                        format!("bad argument #{} to 'pack' (integer overflow)", argn),
                    ));
                }
                write_int(&mut out, v, size, parser.little);
            }
            Opt::Float32 => {
                argn += 1;
                let v = crate::lib_registry::check_number(vm, argn, "pack")? as f32;
                let b = v.to_le_bytes();
                if parser.little {
                    out.extend_from_slice(&b);
                } else {
                    out.extend(b.iter().rev());
                }
            }
            Opt::Float64 => {
                argn += 1;
                let v = crate::lib_registry::check_number(vm, argn, "pack")?;
                let b = v.to_le_bytes();
                if parser.little {
                    out.extend_from_slice(&b);
                } else {
                    out.extend(b.iter().rev());
                }
            }
            Opt::Str { prefix } => {
                argn += 1;
                let s = check_str(vm, argn, "pack")?;
                ctx.absorb(&s);
                if prefix < 8 && s.len() >= (1usize << (prefix * 8)) {
                    return Err(vm.raise(
                        LuaError::Runtime,
                        format!("bad argument #{} to 'pack' (string longer than given size)", argn),
                    ));
                }
                write_int(&mut out, s.len() as i64, prefix, parser.little);
                out.extend_from_slice(s.as_bytes());
            }
            Opt::ZStr => {
                argn += 1;
                let s = check_str(vm, argn, "pack")?;
                ctx.absorb(&s);
                if s.as_bytes().contains(&0) {
                    return Err(vm.raise(
                        LuaError::Runtime,
                        format!("bad argument #{} to 'pack' (string contains zeros)", argn),
                    ));
                }
                out.extend_from_slice(s.as_bytes());
                out.push(0);
            }
            Opt::PadByte => out.push(0),
            Opt::AlignOnly => align_next(vm, &mut parser, &mut out)?,
            Opt::Nothing => {}
        }
    }

    vm.push_value(LuaValue::String(ctx.build(out)))?;
    Ok(1)
}

/// `X`: consume the following option purely for its alignment.
fn align_next(vm: &mut LuaVM, parser: &mut FormatParser, out: &mut Vec<u8>) -> LuaResult<()> {
    match parser.next().map_err(|e| pack_error(vm, e))? {
        Some((opt, align)) if align > 0 && opt != Opt::ZStr => {
            for _ in 0..parser.padding(out.len(), align) {
                out.push(0);
            }
            Ok(())
        }
        _ => Err(pack_error(vm, "invalid next option for option 'X'")),
    }
}

pub fn str_packsize(vm: &mut LuaVM) -> LuaResult<usize> {
    let fmt = check_str(vm, 1, "packsize")?;
    let fmt_bytes = fmt.as_bytes().to_vec();
    let mut parser = FormatParser::new(&fmt_bytes);
    let mut total = 0usize;
    loop {
        let step = parser.next().map_err(|e| pack_error(vm, e))?;
        let Some((opt, align)) = step else { break };
        total += parser.padding(total, align);
        total += match opt {
            Opt::Int { size, .. } => size,
            Opt::Float32 => 4,
            Opt::Float64 => 8,
            Opt::Str { .. } | Opt::ZStr => {
                return Err(vm.raise(
                    LuaError::Runtime,
                    "variable-size format in packsize".to_string(),
                ));
            }
            Opt::PadByte => 1,
            Opt::AlignOnly => {
                // Alignment of the next option, no data.
                match parser.next().map_err(|e| pack_error(vm, e))? {
                    Some((o2, a2)) if a2 > 0 && o2 != Opt::ZStr => {
                        let pad = parser.padding(total, a2);
                        let size2 = match o2 {
                            Opt::Int { size, .. } => size,
                            Opt::Float32 => 4,
                            Opt::Float64 => 8,
                            Opt::PadByte => 1,
                            _ => 0,
                        };
                        pad + size2
                    }
                    _ => return Err(pack_error(vm, "invalid next option for option 'X'")),
                }
            }
            Opt::Nothing => 0,
        };
    }
    vm.push_value(LuaValue::Integer(total as i64))?;
    Ok(1)
}

fn read_int(data: &[u8], size: usize, signed: bool, little: bool) -> Option<i64> {
    if data.len() < size {
        return None;
    }
    let mut bytes: Vec<u8> = data[..size].to_vec();
    if !little {
        bytes.reverse();
    }
    let mut v: u64 = 0;
    for (i, &b) in bytes.iter().enumerate().take(8) {
        v |= (b as u64) << (8 * i);
    }
    // Bytes past the eighth must be consistent padding/sign-extension.
    if size > 8 {
        let expect = if signed && bytes[7] & 0x80 != 0 { 0xff } else { 0x00 };
        if bytes[8..].iter().any(|&b| b != expect) {
            return None;
        }
    }
    if signed && size < 8 {
        let bits = size as u32 * 8;
        let shift = 64 - bits;
        v = (((v << shift) as i64) >> shift) as u64;
    }
    Some(v as i64)
}

pub fn str_unpack(vm: &mut LuaVM) -> LuaResult<usize> {
    let fmt = check_str(vm, 1, "unpack")?;
    let data = check_str(vm, 2, "unpack")?;
    let init = match vm.arg(3) {
        None | Some(LuaValue::Nil) => 1,
        Some(_) => check_integer(vm, 3, "unpack")?,
    };
    if arg_or_nil(vm, 2).is_nil() {
        return Err(type_error(vm, 2, "unpack", "string"));
    }
    let bytes = data.as_bytes();
    let mut pos = if init > 0 {
        (init - 1) as usize
    } else {
        let back = (-init) as usize;
        bytes.len().saturating_sub(back)
    };
    if pos > bytes.len() {
        return Err(vm.error_runtime("initial position out of string"));
    }

    let fmt_bytes = fmt.as_bytes().to_vec();
    let mut parser = FormatParser::new(&fmt_bytes);
    let mut pushed = 0usize;

    loop {
        let step = parser.next().map_err(|e| pack_error(vm, e))?;
        let Some((opt, align)) = step else { break };
        pos += parser.padding(pos, align);
        match opt {
            Opt::Int { size, signed } => {
                let Some(v) = read_int(&bytes[pos.min(bytes.len())..], size, signed, parser.little)
                else {
                    return Err(vm.error_runtime("data string too short"));
                };
                pos += size;
                vm.push_value(LuaValue::Integer(v))?;
                pushed += 1;
            }
            Opt::Float32 => {
                if pos + 4 > bytes.len() {
                    return Err(vm.error_runtime("data string too short"));
                }
                let mut b = [0u8; 4];
                b.copy_from_slice(&bytes[pos..pos + 4]);
                if !parser.little {
                    b.reverse();
                }
                pos += 4;
                vm.push_value(LuaValue::Float(f32::from_le_bytes(b) as f64))?;
                pushed += 1;
            }
            Opt::Float64 => {
                if pos + 8 > bytes.len() {
                    return Err(vm.error_runtime("data string too short"));
                }
                let mut b = [0u8; 8];
                b.copy_from_slice(&bytes[pos..pos + 8]);
                if !parser.little {
                    b.reverse();
                }
                pos += 8;
                vm.push_value(LuaValue::Float(f64::from_le_bytes(b)))?;
                pushed += 1;
            }
            Opt::Str { prefix } => {
                let Some(len) =
                    read_int(&bytes[pos.min(bytes.len())..], prefix, false, parser.little)
                else {
                    return Err(vm.error_runtime("data string too short"));
                };
                pos += prefix;
                let len = len as usize;
                if pos + len > bytes.len() {
                    return Err(vm.error_runtime("data string too short"));
                }
                let piece = bytes[pos..pos + len].to_vec();
                pos += len;
                let mut ctx = ContextBuilder::new();
                ctx.absorb(&data);
                vm.push_value(LuaValue::String(ctx.build(piece)))?;
                pushed += 1;
            }
            Opt::ZStr => {
                let rest = &bytes[pos..];
                let Some(end) = rest.iter().position(|&b| b == 0) else {
                    return Err(vm.error_runtime("unfinished string for format 'z'"));
                };
                let piece = rest[..end].to_vec();
                pos += end + 1;
                let mut ctx = ContextBuilder::new();
                ctx.absorb(&data);
                vm.push_value(LuaValue::String(ctx.build(piece)))?;
                pushed += 1;
            }
            Opt::PadByte => {
                if pos + 1 > bytes.len() {
                    return Err(vm.error_runtime("data string too short"));
                }
                pos += 1;
            }
            Opt::AlignOnly => {
                match parser.next().map_err(|e| pack_error(vm, e))? {
                    Some((o2, a2)) if a2 > 0 && o2 != Opt::ZStr => {
                        pos += parser.padding(pos, a2);
                        // Rewind: the consumed option still reads its data.
                        match o2 {
                            Opt::Int { size, signed } => {
                                let Some(v) = read_int(
                                    &bytes[pos.min(bytes.len())..],
                                    size,
                                    signed,
                                    parser.little,
                                ) else {
                                    return Err(vm.error_runtime("data string too short"));
                                };
                                pos += size;
                                vm.push_value(LuaValue::Integer(v))?;
                                pushed += 1;
                            }
                            Opt::PadByte => pos += 1,
                            _ => {}
                        }
                    }
                    _ => return Err(pack_error(vm, "invalid next option for option 'X'")),
                }
            }
            Opt::Nothing => {}
        }
    }

    vm.push_value(LuaValue::Integer(pos as i64 + 1))?;
    Ok(pushed + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua_vm::VmOptions;

    fn run(vm: &mut LuaVM, src: &str) -> Vec<LuaValue> {
        vm.execute_string(src).expect("pack program")
    }

    #[test]
    fn integer_round_trip() {
        let mut vm = LuaVM::new(VmOptions::default());
        vm.open_libs().unwrap();
        let r = run(
            &mut vm,
            r#"return string.unpack("<i4", string.pack("<i4", -123456))"#,
        );
        assert_eq!(r[0].as_integer_strict(), Some(-123456));
        assert_eq!(r[1].as_integer_strict(), Some(5)); // next position
    }

    #[test]
    fn endianness() {
        let mut vm = LuaVM::new(VmOptions::default());
        vm.open_libs().unwrap();
        let r = run(&mut vm, r#"return string.pack(">I2", 0x0102)"#);
        assert_eq!(r[0].as_lua_str().unwrap().as_bytes(), &[1, 2]);
        let r = run(&mut vm, r#"return string.pack("<I2", 0x0102)"#);
        assert_eq!(r[0].as_lua_str().unwrap().as_bytes(), &[2, 1]);
    }

    #[test]
    fn strings_and_sizes() {
        let mut vm = LuaVM::new(VmOptions::default());
        vm.open_libs().unwrap();
        let r = run(
            &mut vm,
            r#"return string.unpack("s1z", string.pack("s1z", "ab", "cd"))"#,
        );
        assert_eq!(r[0].as_str(), Some("ab"));
        assert_eq!(r[1].as_str(), Some("cd"));
        let r = run(&mut vm, r#"return string.packsize("i4i8")"#);
        assert_eq!(r[0].as_integer_strict(), Some(12));
        let r = run(&mut vm, r#"return string.packsize("!8i1i8")"#);
        assert_eq!(r[0].as_integer_strict(), Some(16)); // aligned
    }

    #[test]
    fn overflow_rejected() {
        let mut vm = LuaVM::new(VmOptions::default());
        vm.open_libs().unwrap();
        let r = run(
            &mut vm,
            r#"local ok = pcall(string.pack, "b", 300) return ok"#,
        );
        assert_eq!(r[0].as_boolean(), Some(false));
    }
}
