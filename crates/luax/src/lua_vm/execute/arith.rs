// Arithmetic, bitwise and ordering kernels.
//
// Integer ops wrap; `/` and `^` always produce floats; `//` and `%` follow
// floor semantics and raise on integer zero divisors; bitwise ops demand an
// exact integer representation. Mixed int/float comparisons are exact - no
// lossy casts of large integers.

use crate::lua_value::{LuaValue, number};
use crate::lua_vm::{LuaError, LuaResult, LuaVM, TmKind};

/// Binary events the raw kernels understand; the order mirrors `TmKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
}

impl ArithOp {
    pub fn event(self) -> TmKind {
        match self {
            ArithOp::Add => TmKind::Add,
            ArithOp::Sub => TmKind::Sub,
            ArithOp::Mul => TmKind::Mul,
            ArithOp::Mod => TmKind::Mod,
            ArithOp::Pow => TmKind::Pow,
            ArithOp::Div => TmKind::Div,
            ArithOp::IDiv => TmKind::IDiv,
            ArithOp::BAnd => TmKind::BAnd,
            ArithOp::BOr => TmKind::BOr,
            ArithOp::BXor => TmKind::BXor,
            ArithOp::Shl => TmKind::Shl,
            ArithOp::Shr => TmKind::Shr,
        }
    }

    pub fn from_event(event: TmKind) -> Option<ArithOp> {
        Some(match event {
            TmKind::Add => ArithOp::Add,
            TmKind::Sub => ArithOp::Sub,
            TmKind::Mul => ArithOp::Mul,
            TmKind::Mod => ArithOp::Mod,
            TmKind::Pow => ArithOp::Pow,
            TmKind::Div => ArithOp::Div,
            TmKind::IDiv => ArithOp::IDiv,
            TmKind::BAnd => ArithOp::BAnd,
            TmKind::BOr => ArithOp::BOr,
            TmKind::BXor => ArithOp::BXor,
            TmKind::Shl => ArithOp::Shl,
            TmKind::Shr => ArithOp::Shr,
            _ => return None,
        })
    }

    fn is_bitwise(self) -> bool {
        matches!(
            self,
            ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr
        )
    }
}

/// Outcome of the no-metamethod fast path.
pub enum RawArith {
    Done(LuaValue),
    /// Operands are not numeric (or not integral for bitwise ops).
    NotNumeric,
    /// Numeric, but the operation itself is invalid (zero divisor, etc.).
    Fail(&'static str),
}

/// Integer floor division.
#[inline]
pub fn ifloordiv(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    if (a.wrapping_rem(b) != 0) && ((a < 0) != (b < 0)) {
        q.wrapping_sub(1)
    } else {
        q
    }
}

/// Integer floor modulus.
#[inline]
pub fn ifloormod(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r }
}

/// Float modulus with the sign of the divisor.
#[inline]
pub fn ffloormod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && ((r < 0.0) != (b < 0.0)) { r + b } else { r }
}

/// Shift left by `n` (negative shifts right); shifts of 64+ flush to zero.
#[inline]
pub fn shift_left(a: i64, n: i64) -> i64 {
    if n >= 0 {
        if n >= 64 { 0 } else { ((a as u64) << n) as i64 }
    } else if n <= -64 {
        0
    } else {
        ((a as u64) >> -n) as i64
    }
}

/// Exact integer view of a value for bitwise ops (floats must be integral).
fn to_bit_operand(v: &LuaValue) -> Option<i64> {
    match v {
        LuaValue::Integer(i) => Some(*i),
        LuaValue::Float(f) => number::float_to_integer(*f),
        _ => None,
    }
}

/// Numeric fast path on two number operands (no strings, no metamethods).
pub fn raw_arith(op: ArithOp, a: &LuaValue, b: &LuaValue) -> RawArith {
    if op.is_bitwise() {
        // Strings never reach here; the coercing path handles them.
        let (Some(x), Some(y)) = (to_bit_operand(a), to_bit_operand(b)) else {
            if a.is_number() && b.is_number() {
                return RawArith::Fail("number has no integer representation");
            }
            return RawArith::NotNumeric;
        };
        let r = match op {
            ArithOp::BAnd => x & y,
            ArithOp::BOr => x | y,
            ArithOp::BXor => x ^ y,
            ArithOp::Shl => shift_left(x, y),
            ArithOp::Shr => shift_left(x, y.wrapping_neg()),
            _ => unreachable!(),
        };
        return RawArith::Done(LuaValue::Integer(r));
    }

    match (a, b) {
        (LuaValue::Integer(x), LuaValue::Integer(y)) => {
            let (x, y) = (*x, *y);
            let r = match op {
                ArithOp::Add => LuaValue::Integer(x.wrapping_add(y)),
                ArithOp::Sub => LuaValue::Integer(x.wrapping_sub(y)),
                ArithOp::Mul => LuaValue::Integer(x.wrapping_mul(y)),
                ArithOp::Mod => {
                    if y == 0 {
                        return RawArith::Fail("attempt to perform 'n%%0'");
                    }
                    LuaValue::Integer(ifloormod(x, y))
                }
                ArithOp::IDiv => {
                    if y == 0 {
                        return RawArith::Fail("attempt to perform 'n//0'");
                    }
                    LuaValue::Integer(ifloordiv(x, y))
                }
                ArithOp::Div => LuaValue::Float(x as f64 / y as f64),
                ArithOp::Pow => LuaValue::Float((x as f64).powf(y as f64)),
                _ => unreachable!(),
            };
            RawArith::Done(r)
        }
        _ => {
            let (Some(x), Some(y)) = (a.as_number(), b.as_number()) else {
                return RawArith::NotNumeric;
            };
            let r = match op {
                ArithOp::Add => x + y,
                ArithOp::Sub => x - y,
                ArithOp::Mul => x * y,
                ArithOp::Div => x / y,
                ArithOp::Pow => x.powf(y),
                ArithOp::Mod => ffloormod(x, y),
                ArithOp::IDiv => (x / y).floor(),
                _ => unreachable!(),
            };
            RawArith::Done(LuaValue::Float(r))
        }
    }
}

/// Full binary operation: numeric fast path, string coercion, then the
/// metamethod of either operand.
pub fn arith_with_meta(
    vm: &mut LuaVM,
    op: ArithOp,
    a: LuaValue,
    b: LuaValue,
) -> LuaResult<LuaValue> {
    match raw_arith(op, &a, &b) {
        RawArith::Done(v) => return Ok(v),
        RawArith::Fail(msg) => return Err(vm.error_runtime(msg)),
        RawArith::NotNumeric => {}
    }
    // Strings that read as numbers participate in arithmetic.
    if let (Some(ca), Some(cb)) = (vm.coerce_number(&a), vm.coerce_number(&b)) {
        match raw_arith(op, &ca, &cb) {
            RawArith::Done(v) => return Ok(v),
            RawArith::Fail(msg) => return Err(vm.error_runtime(msg)),
            RawArith::NotNumeric => {}
        }
    }
    let event = op.event();
    let mm = vm
        .get_metamethod(&a, event)
        .or_else(|| vm.get_metamethod(&b, event));
    match mm {
        Some(f) => {
            let results = super::call_function(vm, f, vec![a, b], 1)?;
            Ok(results.into_iter().next().unwrap_or(LuaValue::Nil))
        }
        None => {
            let bad = if a.is_number() || (op.is_bitwise() && a.as_integer().is_some()) {
                &b
            } else {
                &a
            };
            let tn = bad.type_name();
            Err(vm.error_runtime(format!("attempt to {} a {} value", event.describe(), tn)))
        }
    }
}

/// Unary minus with `__unm`.
pub fn unm_with_meta(vm: &mut LuaVM, a: LuaValue) -> LuaResult<LuaValue> {
    match &a {
        LuaValue::Integer(i) => return Ok(LuaValue::Integer(i.wrapping_neg())),
        LuaValue::Float(f) => return Ok(LuaValue::Float(-f)),
        _ => {}
    }
    if let Some(n) = vm.coerce_number(&a) {
        return unm_with_meta(vm, n);
    }
    match vm.get_metamethod(&a, TmKind::Unm) {
        Some(f) => {
            let results = super::call_function(vm, f, vec![a.clone(), a], 1)?;
            Ok(results.into_iter().next().unwrap_or(LuaValue::Nil))
        }
        None => {
            let tn = a.type_name();
            Err(vm.error_runtime(format!("attempt to perform arithmetic on a {} value", tn)))
        }
    }
}

/// Bitwise not with `__bnot`.
pub fn bnot_with_meta(vm: &mut LuaVM, a: LuaValue) -> LuaResult<LuaValue> {
    if let Some(i) = to_bit_operand(&a) {
        return Ok(LuaValue::Integer(!i));
    }
    if a.is_number() {
        return Err(vm.error_runtime("number has no integer representation"));
    }
    match vm.get_metamethod(&a, TmKind::BNot) {
        Some(f) => {
            let results = super::call_function(vm, f, vec![a.clone(), a], 1)?;
            Ok(results.into_iter().next().unwrap_or(LuaValue::Nil))
        }
        None => {
            let tn = a.type_name();
            Err(vm.error_runtime(format!(
                "attempt to perform bitwise operation on a {} value",
                tn
            )))
        }
    }
}

// ----- exact mixed-subkind ordering -----

const TWO_POW_63: f64 = 9.223372036854776e18;

/// i < f, exactly.
pub fn lt_int_float(i: i64, f: f64) -> bool {
    if f.is_nan() {
        return false;
    }
    if f >= TWO_POW_63 {
        return true;
    }
    if f < -TWO_POW_63 {
        return false;
    }
    let fl = f.floor();
    let fi = fl as i64;
    i < fi || (i == fi && f > fl)
}

/// f < i, exactly.
pub fn lt_float_int(f: f64, i: i64) -> bool {
    if f.is_nan() {
        return false;
    }
    if f >= TWO_POW_63 {
        return false;
    }
    if f < -TWO_POW_63 {
        return true;
    }
    (f.floor() as i64) < i
}

/// i <= f, exactly.
pub fn le_int_float(i: i64, f: f64) -> bool {
    if f.is_nan() {
        return false;
    }
    !lt_float_int(f, i)
}

/// f <= i, exactly.
pub fn le_float_int(f: f64, i: i64) -> bool {
    if f.is_nan() {
        return false;
    }
    !lt_int_float(i, f)
}

/// Numeric `<` over any two numbers.
pub fn num_lt(a: &LuaValue, b: &LuaValue) -> Option<bool> {
    Some(match (a, b) {
        (LuaValue::Integer(x), LuaValue::Integer(y)) => x < y,
        (LuaValue::Float(x), LuaValue::Float(y)) => x < y,
        (LuaValue::Integer(x), LuaValue::Float(y)) => lt_int_float(*x, *y),
        (LuaValue::Float(x), LuaValue::Integer(y)) => lt_float_int(*x, *y),
        _ => return None,
    })
}

/// Numeric `<=` over any two numbers.
pub fn num_le(a: &LuaValue, b: &LuaValue) -> Option<bool> {
    Some(match (a, b) {
        (LuaValue::Integer(x), LuaValue::Integer(y)) => x <= y,
        (LuaValue::Float(x), LuaValue::Float(y)) => x <= y,
        (LuaValue::Integer(x), LuaValue::Float(y)) => le_int_float(*x, *y),
        (LuaValue::Float(x), LuaValue::Integer(y)) => le_float_int(*x, *y),
        _ => return None,
    })
}

/// `a < b` with string ordering and `__lt`.
pub fn less_than(vm: &mut LuaVM, a: LuaValue, b: LuaValue) -> LuaResult<bool> {
    if let Some(r) = num_lt(&a, &b) {
        return Ok(r);
    }
    if let (LuaValue::String(x), LuaValue::String(y)) = (&a, &b) {
        return Ok(x.as_bytes() < y.as_bytes());
    }
    order_meta(vm, a, b, TmKind::Lt)
}

/// `a <= b` with string ordering and `__le` (no `__lt` derivation in 5.4).
pub fn less_equal(vm: &mut LuaVM, a: LuaValue, b: LuaValue) -> LuaResult<bool> {
    if let Some(r) = num_le(&a, &b) {
        return Ok(r);
    }
    if let (LuaValue::String(x), LuaValue::String(y)) = (&a, &b) {
        return Ok(x.as_bytes() <= y.as_bytes());
    }
    order_meta(vm, a, b, TmKind::Le)
}

fn order_meta(vm: &mut LuaVM, a: LuaValue, b: LuaValue, event: TmKind) -> LuaResult<bool> {
    let mm = vm
        .get_metamethod(&a, event)
        .or_else(|| vm.get_metamethod(&b, event));
    match mm {
        Some(f) => {
            let results = super::call_function(vm, f, vec![a, b], 1)?;
            Ok(results.into_iter().next().unwrap_or(LuaValue::Nil).is_truthy())
        }
        None => {
            let (ta, tb) = (a.type_name(), b.type_name());
            let msg = if ta == tb {
                format!("attempt to compare two {} values", ta)
            } else {
                format!("attempt to compare {} with {}", ta, tb)
            };
            Err(vm.error_runtime(msg))
        }
    }
}

/// `a == b` with `__eq` (consulted only when both are tables or both are
/// userdata and raw equality failed).
pub fn equals(vm: &mut LuaVM, a: &LuaValue, b: &LuaValue) -> LuaResult<bool> {
    if a.raw_equal(b) {
        return Ok(true);
    }
    let comparable = matches!(
        (a, b),
        (LuaValue::Table(_), LuaValue::Table(_)) | (LuaValue::Userdata(_), LuaValue::Userdata(_))
    );
    if !comparable {
        return Ok(false);
    }
    let mm = vm
        .get_metamethod(a, TmKind::Eq)
        .or_else(|| vm.get_metamethod(b, TmKind::Eq));
    match mm {
        Some(f) => {
            let results = super::call_function(vm, f, vec![a.clone(), b.clone()], 1)?;
            Ok(results.into_iter().next().unwrap_or(LuaValue::Nil).is_truthy())
        }
        None => Ok(false),
    }
}

/// Shared by Unm's error path so the raiser is in one place.
pub fn arith_type_error(vm: &mut LuaVM, op: ArithOp, bad: &LuaValue) -> LuaError {
    let tn = bad.type_name();
    vm.error_runtime(format!("attempt to {} a {} value", op.event().describe(), tn))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_wrap_and_floor_semantics() {
        assert_eq!(ifloordiv(7, 2), 3);
        assert_eq!(ifloordiv(-7, 2), -4);
        assert_eq!(ifloormod(-7, 2), 1);
        assert_eq!(ifloormod(7, -2), -1);
        assert_eq!(shift_left(1, 63), i64::MIN);
        assert_eq!(shift_left(1, 64), 0);
        assert_eq!(shift_left(-1, -1), i64::MAX);
    }

    #[test]
    fn division_always_float() {
        match raw_arith(ArithOp::Div, &LuaValue::Integer(1), &LuaValue::Integer(2)) {
            RawArith::Done(LuaValue::Float(f)) => assert_eq!(f, 0.5),
            _ => panic!("expected float"),
        }
    }

    #[test]
    fn zero_divisors() {
        assert!(matches!(
            raw_arith(ArithOp::IDiv, &LuaValue::Integer(1), &LuaValue::Integer(0)),
            RawArith::Fail(_)
        ));
        assert!(matches!(
            raw_arith(ArithOp::Mod, &LuaValue::Integer(1), &LuaValue::Integer(0)),
            RawArith::Fail(_)
        ));
        // Float division by zero is inf, not an error.
        match raw_arith(ArithOp::Div, &LuaValue::Float(1.0), &LuaValue::Float(0.0)) {
            RawArith::Done(LuaValue::Float(f)) => assert!(f.is_infinite()),
            _ => panic!("expected inf"),
        }
    }

    #[test]
    fn bitwise_requires_integral() {
        assert!(matches!(
            raw_arith(ArithOp::BAnd, &LuaValue::Float(1.5), &LuaValue::Integer(1)),
            RawArith::Fail(_)
        ));
        assert!(matches!(
            raw_arith(ArithOp::BAnd, &LuaValue::Float(3.0), &LuaValue::Integer(1)),
            RawArith::Done(LuaValue::Integer(1))
        ));
    }

    #[test]
    fn exact_mixed_ordering() {
        // 2^63 as a float is strictly above every i64.
        assert!(lt_int_float(i64::MAX, TWO_POW_63));
        assert!(!lt_float_int(TWO_POW_63, i64::MAX));
        assert!(lt_float_int(3.5, 4));
        assert!(!lt_int_float(4, 3.5));
        assert!(le_int_float(4, 4.0));
        assert!(!le_int_float(4, f64::NAN));
    }
}
