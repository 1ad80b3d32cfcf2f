// Prototype -> byte stream.

use super::*;
use crate::lua_value::{LuaValue, Proto};

struct Dumper {
    out: Vec<u8>,
    strip: bool,
}

/// Serializes a prototype, header included. `strip` drops debug info.
pub fn dump(proto: &Proto, strip: bool) -> Vec<u8> {
    let mut d = Dumper {
        out: Vec::with_capacity(256),
        strip,
    };
    d.header();
    d.byte(proto.upvalues.len() as u8);
    d.function(proto, None);
    d.out
}

impl Dumper {
    fn header(&mut self) {
        self.out.extend_from_slice(SIGNATURE);
        self.byte(VERSION);
        self.byte(FORMAT);
        self.out.extend_from_slice(DATA);
        self.byte(SIZE_INSTRUCTION);
        self.byte(SIZE_INTEGER);
        self.byte(SIZE_NUMBER);
        self.out.extend_from_slice(&CHECK_INT.to_le_bytes());
        self.out.extend_from_slice(&CHECK_NUM.to_le_bytes());
    }

    #[inline]
    fn byte(&mut self, b: u8) {
        self.out.push(b);
    }

    /// Unsigned varint: 7-bit groups, most significant first, the final byte
    /// marked with the high bit.
    fn size(&mut self, mut x: u64) {
        let mut buf = [0u8; 10];
        let mut n = 0;
        loop {
            buf[n] = (x & 0x7f) as u8;
            n += 1;
            x >>= 7;
            if x == 0 {
                break;
            }
        }
        buf[0] |= 0x80; // last byte emitted last, so mark before reversing
        for i in (0..n).rev() {
            self.byte(buf[i]);
        }
    }

    fn int(&mut self, x: u32) {
        self.size(x as u64);
    }

    fn integer(&mut self, x: i64) {
        self.out.extend_from_slice(&x.to_le_bytes());
    }

    fn number(&mut self, x: f64) {
        self.out.extend_from_slice(&x.to_le_bytes());
    }

    /// Size-prefixed string; absent strings encode as size 0, present ones
    /// as length + 1.
    fn string(&mut self, s: Option<&[u8]>) {
        match s {
            None => self.size(0),
            Some(bytes) => {
                self.size(bytes.len() as u64 + 1);
                self.out.extend_from_slice(bytes);
            }
        }
    }

    fn function(&mut self, f: &Proto, parent_source: Option<&str>) {
        // A child sharing its parent's source stores nothing.
        let source = if self.strip {
            None
        } else {
            match (&f.source, parent_source) {
                (Some(s), Some(p)) if s == p => None,
                (Some(s), _) => Some(s.as_bytes()),
                (None, _) => None,
            }
        };
        self.string(source);
        self.int(f.line_defined);
        self.int(f.last_line_defined);
        self.byte(f.num_params);
        self.byte(f.is_vararg as u8);
        self.byte(f.max_stack_size);

        // Code.
        self.int(f.code.len() as u32);
        for &i in &f.code {
            self.out.extend_from_slice(&i.to_le_bytes());
        }

        // Constants.
        self.int(f.constants.len() as u32);
        for k in &f.constants {
            match k {
                LuaValue::Nil => self.byte(TAG_NIL),
                LuaValue::Boolean(false) => self.byte(TAG_FALSE),
                LuaValue::Boolean(true) => self.byte(TAG_TRUE),
                LuaValue::Integer(i) => {
                    self.byte(TAG_INT);
                    self.integer(*i);
                }
                LuaValue::Float(x) => {
                    self.byte(TAG_FLOAT);
                    self.number(*x);
                }
                LuaValue::String(s) => {
                    let tag = if s.len() <= SHORT_STR_LIMIT {
                        TAG_SHORT_STR
                    } else {
                        TAG_LONG_STR
                    };
                    self.byte(tag);
                    self.string(Some(s.as_bytes()));
                }
                // Reference values cannot appear in a constant pool.
                other => {
                    debug_assert!(false, "non-constant in pool: {:?}", other);
                    self.byte(TAG_NIL);
                }
            }
        }

        // Upvalue descriptors.
        self.int(f.upvalues.len() as u32);
        for u in &f.upvalues {
            self.byte(u.in_stack as u8);
            self.byte(u.index);
            self.byte(u.kind);
        }

        // Nested prototypes.
        self.int(f.protos.len() as u32);
        for p in &f.protos {
            self.function(p, f.source.as_deref());
        }

        // Debug info.
        self.debug_info(f);
    }

    fn debug_info(&mut self, f: &Proto) {
        if self.strip {
            self.int(0); // line deltas
            self.int(0); // absolute lines
            self.int(0); // locals
            self.int(0); // upvalue names
            return;
        }
        let (deltas, abs) = encode_lines(f);
        self.int(deltas.len() as u32);
        for d in &deltas {
            self.byte(*d as u8);
        }
        self.int(abs.len() as u32);
        for (pc, line) in &abs {
            self.int(*pc);
            self.int(*line);
        }
        self.int(f.loc_vars.len() as u32);
        for lv in &f.loc_vars {
            self.string(Some(lv.name.as_bytes()));
            self.int(lv.start_pc);
            self.int(lv.end_pc);
        }
        self.int(f.upvalues.len() as u32);
        for u in &f.upvalues {
            self.string(Some(u.name.as_bytes()));
        }
    }
}

/// Absolute per-instruction lines -> signed deltas plus an absolute-line
/// side table, forced at least every `MAX_INSTRUCTIONS_WITHOUT_ABS` entries.
pub(super) fn encode_lines(f: &Proto) -> (Vec<i8>, Vec<(u32, u32)>) {
    let mut deltas = Vec::with_capacity(f.line_info.len());
    let mut abs = Vec::new();
    let mut prev = f.line_defined;
    let mut since_abs = 0u32;
    for (pc, &line) in f.line_info.iter().enumerate() {
        let delta = line as i64 - prev as i64;
        if delta.abs() >= ABS_LINE_MARKER.unsigned_abs() as i64
            || since_abs >= MAX_INSTRUCTIONS_WITHOUT_ABS
        {
            abs.push((pc as u32, line));
            deltas.push(ABS_LINE_MARKER);
            since_abs = 0;
        } else {
            deltas.push(delta as i8);
            since_abs += 1;
        }
        prev = line;
    }
    (deltas, abs)
}
