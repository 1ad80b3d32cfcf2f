// Byte stream -> prototype, with full header verification up front.

use std::rc::Rc;

use super::*;
use crate::lua_value::{LocVar, LuaValue, Proto, UpvalueDesc};
use crate::lua_vm::{LuaError, LuaResult, LuaVM};
use smol_str::SmolStr;

struct Undumper<'a, 'v> {
    data: &'a [u8],
    pos: usize,
    vm: &'v mut LuaVM,
}

/// Loads a precompiled chunk. Every header field is verified before any
/// prototype data is read.
pub fn undump(vm: &mut LuaVM, bytes: &[u8]) -> LuaResult<Proto> {
    let mut u = Undumper {
        data: bytes,
        pos: 0,
        vm,
    };
    u.check_header()?;
    let _main_upvals = u.byte()?;
    let proto = u.function(None)?;
    log::debug!(
        "loaded binary chunk: {} instructions, {} constants",
        proto.code.len(),
        proto.constants.len()
    );
    Ok(proto)
}

impl<'a, 'v> Undumper<'a, 'v> {
    fn fail<T>(&mut self, what: &str) -> LuaResult<T> {
        Err(self
            .vm
            .raise(LuaError::Syntax, format!("bad binary format ({})", what)))
    }

    fn byte(&mut self) -> LuaResult<u8> {
        match self.data.get(self.pos) {
            Some(&b) => {
                self.pos += 1;
                Ok(b)
            }
            None => self.fail("truncated chunk"),
        }
    }

    fn bytes(&mut self, n: usize) -> LuaResult<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return self.fail("truncated chunk");
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn check_header(&mut self) -> LuaResult<()> {
        if self.bytes(4)? != &SIGNATURE[..] {
            return self.fail("not a precompiled chunk");
        }
        if self.byte()? != VERSION {
            return self.fail("version mismatch");
        }
        if self.byte()? != FORMAT {
            return self.fail("format mismatch");
        }
        if self.bytes(6)? != &DATA[..] {
            return self.fail("corrupted chunk");
        }
        if self.byte()? != SIZE_INSTRUCTION {
            return self.fail("instruction size mismatch");
        }
        if self.byte()? != SIZE_INTEGER {
            return self.fail("integer size mismatch");
        }
        if self.byte()? != SIZE_NUMBER {
            return self.fail("number size mismatch");
        }
        let int_check = i64::from_le_bytes(self.bytes(8)?.try_into().unwrap_or([0; 8]));
        if int_check != CHECK_INT {
            return self.fail("integer format mismatch");
        }
        let num_check = f64::from_le_bytes(self.bytes(8)?.try_into().unwrap_or([0; 8]));
        if num_check != CHECK_NUM {
            return self.fail("float format mismatch");
        }
        Ok(())
    }

    /// Unsigned varint; overflow past 64 bits is a format error.
    fn size(&mut self) -> LuaResult<u64> {
        let mut x: u64 = 0;
        loop {
            let b = self.byte()?;
            if x >= (1u64 << 57) {
                return self.fail("integer overflow");
            }
            x = (x << 7) | (b & 0x7f) as u64;
            if b & 0x80 != 0 {
                return Ok(x);
            }
        }
    }

    fn int(&mut self) -> LuaResult<u32> {
        let v = self.size()?;
        if v > u32::MAX as u64 {
            return self.fail("integer overflow");
        }
        Ok(v as u32)
    }

    /// A count that still has to fit in the remaining input (each element is
    /// at least one byte), so hostile sizes cannot force huge allocations.
    fn count(&mut self, min_elem_size: usize) -> LuaResult<usize> {
        let n = self.int()? as usize;
        let remaining = self.data.len() - self.pos;
        if n.saturating_mul(min_elem_size.max(1)) > remaining {
            return self.fail("element count exceeds chunk size");
        }
        Ok(n)
    }

    fn integer(&mut self) -> LuaResult<i64> {
        Ok(i64::from_le_bytes(
            self.bytes(8)?.try_into().unwrap_or([0; 8]),
        ))
    }

    fn number(&mut self) -> LuaResult<f64> {
        Ok(f64::from_le_bytes(
            self.bytes(8)?.try_into().unwrap_or([0; 8]),
        ))
    }

    fn string(&mut self) -> LuaResult<Option<Vec<u8>>> {
        let n = self.size()? as usize;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.bytes(n - 1)?.to_vec()))
    }

    fn function(&mut self, parent_source: Option<String>) -> LuaResult<Proto> {
        let mut f = Proto::new();
        f.source = match self.string()? {
            Some(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            None => parent_source,
        };
        f.line_defined = self.int()?;
        f.last_line_defined = self.int()?;
        f.num_params = self.byte()?;
        f.is_vararg = self.byte()? != 0;
        f.max_stack_size = self.byte()?;

        // Code.
        let ncode = self.count(4)?;
        f.code.reserve(ncode);
        for _ in 0..ncode {
            let raw = self.bytes(4)?;
            f.code.push(u32::from_le_bytes(raw.try_into().unwrap_or([0; 4])));
        }

        // Constants.
        let nconst = self.count(1)?;
        f.constants.reserve(nconst);
        for _ in 0..nconst {
            let tag = self.byte()?;
            let k = match tag {
                TAG_NIL => LuaValue::Nil,
                TAG_FALSE => LuaValue::Boolean(false),
                TAG_TRUE => LuaValue::Boolean(true),
                TAG_INT => LuaValue::Integer(self.integer()?),
                TAG_FLOAT => LuaValue::Float(self.number()?),
                TAG_SHORT_STR | TAG_LONG_STR => match self.string()? {
                    Some(bytes) => LuaValue::String(self.vm.strings.intern(&bytes)),
                    None => return self.fail("missing string constant"),
                },
                _ => return self.fail("unknown constant tag"),
            };
            f.constants.push(k);
        }

        // Upvalue descriptors.
        let nup = self.count(3)?;
        f.upvalues.reserve(nup);
        for _ in 0..nup {
            let in_stack = self.byte()? != 0;
            let index = self.byte()?;
            let kind = self.byte()?;
            f.upvalues.push(UpvalueDesc {
                name: SmolStr::default(),
                in_stack,
                index,
                kind,
            });
        }

        // Nested prototypes.
        let nprotos = self.count(1)?;
        f.protos.reserve(nprotos);
        for _ in 0..nprotos {
            let child = self.function(f.source.clone())?;
            f.protos.push(Rc::new(child));
        }

        // Debug info.
        self.debug_info(&mut f)?;
        self.verify(&f)?;
        Ok(f)
    }

    fn debug_info(&mut self, f: &mut Proto) -> LuaResult<()> {
        let ndelta = self.count(1)?;
        let mut deltas = Vec::with_capacity(ndelta);
        for _ in 0..ndelta {
            deltas.push(self.byte()? as i8);
        }
        let nabs = self.count(2)?;
        let mut abs = Vec::with_capacity(nabs);
        for _ in 0..nabs {
            let pc = self.int()?;
            let line = self.int()?;
            abs.push((pc, line));
        }
        f.line_info = decode_lines(f.line_defined, &deltas, &abs);

        let nloc = self.count(3)?;
        for _ in 0..nloc {
            let name = match self.string()? {
                Some(b) => SmolStr::new(String::from_utf8_lossy(&b)),
                None => SmolStr::default(),
            };
            let start_pc = self.int()?;
            let end_pc = self.int()?;
            f.loc_vars.push(LocVar {
                name,
                start_pc,
                end_pc,
            });
        }

        let nupnames = self.count(1)?;
        if nupnames > f.upvalues.len() {
            return self.fail("too many upvalue names");
        }
        for i in 0..nupnames {
            if let Some(bytes) = self.string()? {
                f.upvalues[i].name = SmolStr::new(String::from_utf8_lossy(&bytes));
            }
        }
        Ok(())
    }

    /// Structural sanity of a loaded prototype: register and constant
    /// references must stay in bounds. Not a full verifier, but it keeps the
    /// interpreter's indexing assumptions intact.
    fn verify(&mut self, f: &Proto) -> LuaResult<()> {
        use crate::lua_vm::{Instruction, OpCode};
        let maxreg = f.max_stack_size as u32;
        for &i in &f.code {
            let op = Instruction::opcode(i);
            // A is not a register in these layouts (jump offset, extra
            // payload, upvalue index).
            if matches!(op, OpCode::ExtraArg | OpCode::Jmp | OpCode::SetTabUp) {
                continue;
            }
            if Instruction::a(i) >= maxreg.max(1) {
                return self.fail("register out of range");
            }
            match op {
                OpCode::LoadK => {
                    if Instruction::bx(i) as usize >= f.constants.len() {
                        return self.fail("constant out of range");
                    }
                }
                OpCode::Closure => {
                    if Instruction::bx(i) as usize >= f.protos.len() {
                        return self.fail("prototype out of range");
                    }
                }
                OpCode::GetUpval | OpCode::SetUpval => {
                    if Instruction::b(i) as usize >= f.upvalues.len() {
                        return self.fail("upvalue out of range");
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Rebuilds absolute lines from deltas plus the absolute side table.
fn decode_lines(line_defined: u32, deltas: &[i8], abs: &[(u32, u32)]) -> Vec<u32> {
    let mut out = Vec::with_capacity(deltas.len());
    let mut prev = line_defined as i64;
    let mut abs_iter = abs.iter().peekable();
    for (pc, &d) in deltas.iter().enumerate() {
        if d == ABS_LINE_MARKER {
            let line = match abs_iter.peek() {
                Some(&&(apc, aline)) if apc as usize == pc => {
                    abs_iter.next();
                    aline as i64
                }
                _ => prev,
            };
            out.push(line.max(0) as u32);
            prev = line;
        } else {
            let line = prev + d as i64;
            out.push(line.max(0) as u32);
            prev = line;
        }
    }
    out
}
