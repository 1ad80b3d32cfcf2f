// Precompiled chunk codec.
//
// The byte layout is the reference 5.4 format: signature, version/format
// bytes, the data sanity block, size bytes, endianness probes, then the root
// prototype recursively. Sizes and ints travel as 7-bit varints whose final
// byte carries the high bit; numbers travel as raw little-endian payloads.
// The dump side emits bit-identical headers so round-trips are exact.

mod dump;
mod undump;

pub use dump::dump;
pub use undump::undump;

/// `ESC L u a`
pub const SIGNATURE: &[u8; 4] = b"\x1bLua";
pub const VERSION: u8 = 0x54;
pub const FORMAT: u8 = 0;
/// Corruption catcher: text-mode mangling breaks this sequence.
pub const DATA: &[u8; 6] = b"\x19\x93\r\n\x1a\n";
pub const SIZE_INSTRUCTION: u8 = 4;
pub const SIZE_INTEGER: u8 = 8;
pub const SIZE_NUMBER: u8 = 8;
/// Endianness probe for integers.
pub const CHECK_INT: i64 = 0x5678;
/// Format probe for floats.
pub const CHECK_NUM: f64 = 370.5;

/// Constant tags (type | variant << 4).
pub const TAG_NIL: u8 = 0x00;
pub const TAG_FALSE: u8 = 0x01;
pub const TAG_TRUE: u8 = 0x11;
pub const TAG_INT: u8 = 0x03;
pub const TAG_FLOAT: u8 = 0x13;
pub const TAG_SHORT_STR: u8 = 0x04;
pub const TAG_LONG_STR: u8 = 0x14;

/// Interning cutoff reused for the short/long string tag split.
pub const SHORT_STR_LIMIT: usize = 40;

/// Marker in the delta line array for "consult the absolute table".
pub const ABS_LINE_MARKER: i8 = -0x80;
/// An absolute line entry is forced at least every this many instructions.
pub const MAX_INSTRUCTIONS_WITHOUT_ABS: u32 = 128;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua_vm::{LuaVM, VmOptions};
    use std::rc::Rc;

    fn compile(vm: &mut LuaVM, src: &str) -> crate::lua_value::Proto {
        vm.compile(src, "@t.lua").expect("compile")
    }

    #[test]
    fn header_is_bit_identical_to_the_reference_layout() {
        let mut vm = LuaVM::new(VmOptions::default());
        let p = compile(&mut vm, "return 1");
        let bytes = dump(&p, false);
        assert_eq!(&bytes[0..4], b"\x1bLua");
        assert_eq!(bytes[4], 0x54);
        assert_eq!(bytes[5], 0);
        assert_eq!(&bytes[6..12], b"\x19\x93\r\n\x1a\n");
        assert_eq!(bytes[12], 4); // instruction size
        assert_eq!(bytes[13], 8); // integer size
        assert_eq!(bytes[14], 8); // number size
        assert_eq!(&bytes[15..23], &0x5678i64.to_le_bytes());
        assert_eq!(&bytes[23..31], &370.5f64.to_le_bytes());
        // Main chunk closes over exactly _ENV.
        assert_eq!(bytes[31], 1);
    }

    #[test]
    fn round_trip_preserves_the_prototype() {
        let mut vm = LuaVM::new(VmOptions::default());
        let p = compile(
            &mut vm,
            r#"
            local t = {}
            for i = 1, 3 do t[i] = i * i end
            local function inner(a, ...) return a, ... end
            return inner(t[1] + t[2] + t[3], "done")
            "#,
        );
        let bytes = dump(&p, false);
        let q = undump(&mut vm, &bytes).expect("undump");
        assert_eq!(p, q);
        // And the re-dump is byte-identical.
        assert_eq!(bytes, dump(&q, false));
    }

    #[test]
    fn stripped_round_trip_drops_debug_info() {
        let mut vm = LuaVM::new(VmOptions::default());
        let p = compile(&mut vm, "local x = 1 return x + 1");
        let bytes = dump(&p, true);
        let q = undump(&mut vm, &bytes).expect("undump");
        assert_eq!(p.code, q.code);
        assert!(q.line_info.is_empty());
        assert!(q.loc_vars.is_empty());
    }

    #[test]
    fn executes_after_round_trip() {
        let mut vm = LuaVM::new(VmOptions::default());
        vm.open_libs().unwrap();
        let p = compile(&mut vm, "return 6 * 7");
        let bytes = dump(&p, false);
        let q = undump(&mut vm, &bytes).expect("undump");
        let r = vm.execute(Rc::new(q)).expect("run");
        assert_eq!(r[0].as_integer_strict(), Some(42));
    }

    #[test]
    fn header_corruption_is_rejected_before_the_body() {
        let mut vm = LuaVM::new(VmOptions::default());
        let p = compile(&mut vm, "return 1");
        let good = dump(&p, false);

        for (pos, desc) in [(0usize, "signature"), (4, "version"), (6, "data block")] {
            let mut bad = good.clone();
            bad[pos] ^= 0xff;
            assert!(undump(&mut vm, &bad).is_err(), "corrupt {} accepted", desc);
        }
        // Truncated input.
        assert!(undump(&mut vm, &good[..10]).is_err());
    }
}
