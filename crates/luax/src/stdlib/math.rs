// The math library.
//
// The random generator sits behind an injected `RandomSource`; the default
// is a 128-bit PCG (XSL-RR output) seeded from host entropy on demand, and
// embedders can swap in their own source through VM app data.

use crate::lib_registry::{LibraryModule, arg_or_nil, check_integer, check_number, type_error};
use crate::lua_value::{LuaValue, number};
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

/// Pluggable randomness for `math.random`.
pub trait RandomSource {
    /// Uniform 64-bit value.
    fn next_u64(&mut self) -> u64;

    /// Reseeds; both words participate.
    fn seed(&mut self, a: u64, b: u64);
}

/// 128-bit permuted congruential generator, XSL-RR variant.
pub struct Pcg128 {
    state: u128,
    inc: u128,
}

const PCG_MULT: u128 = 0x2360_ed05_1fc6_5da4_4385_df64_9fcc_f645;

impl Pcg128 {
    pub fn new(seed_a: u64, seed_b: u64) -> Self {
        let mut g = Pcg128 { state: 0, inc: 0 };
        g.seed(seed_a, seed_b);
        g
    }

    fn step(&mut self) {
        self.state = self.state.wrapping_mul(PCG_MULT).wrapping_add(self.inc);
    }
}

impl RandomSource for Pcg128 {
    fn next_u64(&mut self) -> u64 {
        self.step();
        let s = self.state;
        let xored = ((s >> 64) as u64) ^ (s as u64);
        let rot = (s >> 122) as u32;
        xored.rotate_right(rot)
    }

    fn seed(&mut self, a: u64, b: u64) {
        // The increment must be odd.
        self.inc = (((a as u128) << 64) | b as u128) | 1;
        self.state = (b as u128) << 64 | a as u128;
        self.step();
        self.state = self.state.wrapping_add((a as u128) ^ ((b as u128) << 1));
        self.step();
    }
}

const RNG_KEY: &str = "math.random.source";

struct RngSlot(Box<dyn RandomSource>);

fn with_rng<T>(vm: &mut LuaVM, f: impl FnOnce(&mut dyn RandomSource) -> T) -> T {
    if vm.app_data_mut::<RngSlot>(RNG_KEY).is_none() {
        // First use: seed from host entropy.
        let a: u64 = rand::random();
        let b: u64 = rand::random();
        vm.set_app_data(RNG_KEY, RngSlot(Box::new(Pcg128::new(a, b))));
    }
    let slot = vm
        .app_data_mut::<RngSlot>(RNG_KEY)
        .expect("rng installed above");
    f(slot.0.as_mut())
}

/// Replaces the generator behind `math.random`.
pub fn set_random_source(vm: &mut LuaVM, source: Box<dyn RandomSource>) {
    vm.set_app_data(RNG_KEY, RngSlot(source));
}

pub fn create_math_lib() -> LibraryModule {
    let mut module = crate::lib_module!("math", {
        "abs" => math_abs,
        "acos" => math_acos,
        "asin" => math_asin,
        "atan" => math_atan,
        "ceil" => math_ceil,
        "cos" => math_cos,
        "deg" => math_deg,
        "exp" => math_exp,
        "floor" => math_floor,
        "fmod" => math_fmod,
        "log" => math_log,
        "max" => math_max,
        "min" => math_min,
        "modf" => math_modf,
        "rad" => math_rad,
        "sin" => math_sin,
        "sqrt" => math_sqrt,
        "tan" => math_tan,
        "tointeger" => math_tointeger,
        "type" => math_type,
        "ult" => math_ult,
    });
    module = module
        .with_impure_function("random", math_random)
        .with_impure_function("randomseed", math_randomseed);
    module = module.with_value("pi", |_vm| LuaValue::Float(std::f64::consts::PI));
    module = module.with_value("huge", |_vm| LuaValue::Float(f64::INFINITY));
    module = module.with_value("maxinteger", |_vm| LuaValue::Integer(i64::MAX));
    module = module.with_value("mininteger", |_vm| LuaValue::Integer(i64::MIN));
    module
}

fn math_abs(vm: &mut LuaVM) -> LuaResult<usize> {
    match arg_or_nil(vm, 1) {
        LuaValue::Integer(i) => vm.push_value(LuaValue::Integer(i.wrapping_abs()))?,
        LuaValue::Float(f) => vm.push_value(LuaValue::Float(f.abs()))?,
        _ => {
            let x = check_number(vm, 1, "abs")?;
            vm.push_value(LuaValue::Float(x.abs()))?;
        }
    }
    Ok(1)
}

fn unary_float(vm: &mut LuaVM, fname: &str, f: impl Fn(f64) -> f64) -> LuaResult<usize> {
    let x = check_number(vm, 1, fname)?;
    vm.push_value(LuaValue::Float(f(x)))?;
    Ok(1)
}

fn math_acos(vm: &mut LuaVM) -> LuaResult<usize> {
    unary_float(vm, "acos", f64::acos)
}

fn math_asin(vm: &mut LuaVM) -> LuaResult<usize> {
    unary_float(vm, "asin", f64::asin)
}

fn math_atan(vm: &mut LuaVM) -> LuaResult<usize> {
    let y = check_number(vm, 1, "atan")?;
    let x = match vm.arg(2) {
        None | Some(LuaValue::Nil) => 1.0,
        Some(_) => check_number(vm, 2, "atan")?,
    };
    vm.push_value(LuaValue::Float(y.atan2(x)))?;
    Ok(1)
}

fn math_cos(vm: &mut LuaVM) -> LuaResult<usize> {
    unary_float(vm, "cos", f64::cos)
}

fn math_sin(vm: &mut LuaVM) -> LuaResult<usize> {
    unary_float(vm, "sin", f64::sin)
}

fn math_tan(vm: &mut LuaVM) -> LuaResult<usize> {
    unary_float(vm, "tan", f64::tan)
}

fn math_deg(vm: &mut LuaVM) -> LuaResult<usize> {
    unary_float(vm, "deg", f64::to_degrees)
}

fn math_rad(vm: &mut LuaVM) -> LuaResult<usize> {
    unary_float(vm, "rad", f64::to_radians)
}

fn math_exp(vm: &mut LuaVM) -> LuaResult<usize> {
    unary_float(vm, "exp", f64::exp)
}

fn math_sqrt(vm: &mut LuaVM) -> LuaResult<usize> {
    unary_float(vm, "sqrt", f64::sqrt)
}

/// floor/ceil return integers whenever the result fits.
fn round_to_integer(vm: &mut LuaVM, fname: &str, f: impl Fn(f64) -> f64) -> LuaResult<usize> {
    match arg_or_nil(vm, 1) {
        LuaValue::Integer(i) => vm.push_value(LuaValue::Integer(i))?,
        _ => {
            let x = check_number(vm, 1, fname)?;
            let r = f(x);
            match number::float_to_integer(r) {
                Some(i) => vm.push_value(LuaValue::Integer(i))?,
                None => vm.push_value(LuaValue::Float(r))?,
            }
        }
    }
    Ok(1)
}

fn math_floor(vm: &mut LuaVM) -> LuaResult<usize> {
    round_to_integer(vm, "floor", f64::floor)
}

fn math_ceil(vm: &mut LuaVM) -> LuaResult<usize> {
    round_to_integer(vm, "ceil", f64::ceil)
}

fn math_fmod(vm: &mut LuaVM) -> LuaResult<usize> {
    let a = arg_or_nil(vm, 1);
    let b = arg_or_nil(vm, 2);
    if let (LuaValue::Integer(x), LuaValue::Integer(y)) = (&a, &b) {
        if *y == 0 {
            return Err(vm.raise(
                LuaError::Type,
                "bad argument #2 to 'fmod' (zero)".to_string(),
            ));
        }
        vm.push_value(LuaValue::Integer(x.wrapping_rem(*y)))?;
        return Ok(1);
    }
    let x = check_number(vm, 1, "fmod")?;
    let y = check_number(vm, 2, "fmod")?;
    vm.push_value(LuaValue::Float(x % y))?;
    Ok(1)
}

fn math_log(vm: &mut LuaVM) -> LuaResult<usize> {
    let x = check_number(vm, 1, "log")?;
    let r = match vm.arg(2) {
        None | Some(LuaValue::Nil) => x.ln(),
        Some(_) => {
            let base = check_number(vm, 2, "log")?;
            if base == 2.0 {
                x.log2()
            } else if base == 10.0 {
                x.log10()
            } else {
                x.ln() / base.ln()
            }
        }
    };
    vm.push_value(LuaValue::Float(r))?;
    Ok(1)
}

fn minmax(vm: &mut LuaVM, fname: &str, want_greater: bool) -> LuaResult<usize> {
    let n = vm.arg_count();
    if n == 0 {
        return Err(type_error(vm, 1, fname, "number"));
    }
    let mut best = arg_or_nil(vm, 1);
    if !best.is_number() {
        return Err(type_error(vm, 1, fname, "number"));
    }
    for i in 2..=n {
        let v = arg_or_nil(vm, i);
        if !v.is_number() {
            return Err(type_error(vm, i, fname, "number"));
        }
        let replace = if want_greater {
            crate::lua_vm::execute::arith::num_lt(&best, &v).unwrap_or(false)
        } else {
            crate::lua_vm::execute::arith::num_lt(&v, &best).unwrap_or(false)
        };
        if replace {
            best = v;
        }
    }
    vm.push_value(best)?;
    Ok(1)
}

fn math_max(vm: &mut LuaVM) -> LuaResult<usize> {
    minmax(vm, "max", true)
}

fn math_min(vm: &mut LuaVM) -> LuaResult<usize> {
    minmax(vm, "min", false)
}

fn math_modf(vm: &mut LuaVM) -> LuaResult<usize> {
    let x = check_number(vm, 1, "modf")?;
    let int_part = if x >= 0.0 { x.floor() } else { x.ceil() };
    match number::float_to_integer(int_part) {
        Some(i) => vm.push_value(LuaValue::Integer(i))?,
        None => vm.push_value(LuaValue::Float(int_part))?,
    }
    let frac = if x.is_infinite() { 0.0 } else { x - int_part };
    vm.push_value(LuaValue::Float(frac))?;
    Ok(2)
}

fn math_tointeger(vm: &mut LuaVM) -> LuaResult<usize> {
    let v = arg_or_nil(vm, 1);
    match v.as_integer() {
        Some(i) => vm.push_value(LuaValue::Integer(i))?,
        None => vm.push_value(LuaValue::Nil)?,
    }
    Ok(1)
}

fn math_type(vm: &mut LuaVM) -> LuaResult<usize> {
    let v = match vm.arg(1) {
        Some(v) => v,
        None => return Err(type_error(vm, 1, "type", "value")),
    };
    match v {
        LuaValue::Integer(_) => {
            let s = vm.new_string("integer");
            vm.push_value(s)?;
        }
        LuaValue::Float(_) => {
            let s = vm.new_string("float");
            vm.push_value(s)?;
        }
        _ => vm.push_value(LuaValue::Nil)?,
    }
    Ok(1)
}

fn math_ult(vm: &mut LuaVM) -> LuaResult<usize> {
    let a = check_integer(vm, 1, "ult")? as u64;
    let b = check_integer(vm, 2, "ult")? as u64;
    vm.push_value(LuaValue::Boolean(a < b))?;
    Ok(1)
}

fn math_random(vm: &mut LuaVM) -> LuaResult<usize> {
    let nargs = vm.arg_count();
    let raw = with_rng(vm, |rng| rng.next_u64());
    match nargs {
        0 => {
            // Uniform float in [0, 1): 53 mantissa bits.
            let f = (raw >> 11) as f64 * (1.0 / (1u64 << 53) as f64);
            vm.push_value(LuaValue::Float(f))?;
        }
        _ => {
            let (lo, hi, hi_arg) = if nargs == 1 {
                let m = check_integer(vm, 1, "random")?;
                if m == 0 {
                    // random(0): an integer with all bits (pseudo)random.
                    vm.push_value(LuaValue::Integer(raw as i64))?;
                    return Ok(1);
                }
                (1, m, 1)
            } else {
                let lo = check_integer(vm, 1, "random")?;
                let hi = check_integer(vm, 2, "random")?;
                (lo, hi, 2)
            };
            if lo > hi {
                return Err(vm.raise(
                    LuaError::Type,
                    format!("bad argument #{} to 'random' (interval is empty)", hi_arg),
                ));
            }
            let span = (hi as u64).wrapping_sub(lo as u64).wrapping_add(1);
            let v = if span == 0 {
                raw // the full 2^64 range
            } else {
                raw % span
            };
            vm.push_value(LuaValue::Integer((lo as u64).wrapping_add(v) as i64))?;
        }
    }
    Ok(1)
}

fn math_randomseed(vm: &mut LuaVM) -> LuaResult<usize> {
    let nargs = vm.arg_count();
    let (a, b) = if nargs == 0 {
        (rand::random::<u64>(), rand::random::<u64>())
    } else {
        let x = check_number(vm, 1, "randomseed")?;
        let y = match vm.arg(2) {
            None | Some(LuaValue::Nil) => 0,
            Some(_) => check_integer(vm, 2, "randomseed")?,
        };
        (x.to_bits(), y as u64)
    };
    with_rng(vm, |rng| rng.seed(a, b));
    vm.push_value(LuaValue::Integer(a as i64))?;
    vm.push_value(LuaValue::Integer(b as i64))?;
    Ok(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcg_is_deterministic_for_a_seed() {
        let mut a = Pcg128::new(42, 54);
        let mut b = Pcg128::new(42, 54);
        for _ in 0..16 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
        let mut c = Pcg128::new(42, 55);
        assert_ne!(a.next_u64(), c.next_u64());
    }

    #[test]
    fn pcg_output_varies() {
        let mut g = Pcg128::new(1, 2);
        let first = g.next_u64();
        let mut all_same = true;
        for _ in 0..32 {
            if g.next_u64() != first {
                all_same = false;
                break;
            }
        }
        assert!(!all_same);
    }
}
