// The math library.

use super::{run, run_bool, run_int, run_str};

#[test]
fn abs_preserves_subkind() {
    assert_eq!(run_int("return math.abs(-7)"), 7);
    assert_eq!(run_str("return math.type(math.abs(-7))"), "integer");
    assert!(run_bool("return math.abs(-2.5) == 2.5"));
}

#[test]
fn floor_ceil_return_integers_when_possible() {
    assert_eq!(run_int("return math.floor(3.7)"), 3);
    assert_eq!(run_int("return math.ceil(3.2)"), 4);
    assert_eq!(run_int("return math.floor(-3.5)"), -4);
    assert_eq!(run_str("return math.type(math.floor(3.7))"), "integer");
    assert_eq!(run_int("return math.floor(5)"), 5);
    // Out of integer range stays float.
    assert_eq!(run_str("return math.type(math.floor(1e300))"), "float");
}

#[test]
fn sqrt_exp_log() {
    assert!(run_bool("return math.sqrt(16) == 4.0"));
    assert!(run_bool("return math.exp(0) == 1.0"));
    assert!(run_bool("return math.log(1) == 0.0"));
    assert!(run_bool("return math.log(8, 2) == 3.0"));
    assert!(run_bool("return math.log(100, 10) == 2.0"));
}

#[test]
fn fmod_and_modf() {
    assert_eq!(run_int("return math.fmod(7, 3)"), 1);
    assert_eq!(run_int("return math.fmod(-7, 3)"), -1); // truncated, not floored
    let r = run("return math.modf(3.7)");
    assert_eq!(r[0].as_integer_strict(), Some(3));
    assert!((r[1].as_number().unwrap() - 0.7).abs() < 1e-9);
    assert!(!run_bool("return (pcall(math.fmod, 1, 0))"));
}

#[test]
fn min_max() {
    assert_eq!(run_int("return math.max(3, 9, 5)"), 9);
    assert_eq!(run_int("return math.min(3, 9, 5)"), 3);
    assert!(run_bool("return math.max(1, 2.5) == 2.5"));
}

#[test]
fn tointeger_and_type() {
    assert_eq!(run_int("return math.tointeger(3.0)"), 3);
    assert!(run("return math.tointeger(3.5)")[0].is_nil());
    assert!(run("return math.tointeger('x')")[0].is_nil());
    assert!(run("return math.type('3')")[0].is_nil());
}

#[test]
fn ult_is_unsigned() {
    assert!(run_bool("return math.ult(1, 2)"));
    // -1 as unsigned is the largest value.
    assert!(run_bool("return math.ult(2, -1)"));
    assert!(!run_bool("return math.ult(-1, 2)"));
}

#[test]
fn constants() {
    assert!(run_bool("return math.pi > 3.14 and math.pi < 3.15"));
    assert!(run_bool("return math.huge > 1e308"));
    assert_eq!(run_int("return math.maxinteger"), i64::MAX);
    assert_eq!(run_int("return math.mininteger"), i64::MIN);
    assert!(run_bool("return math.maxinteger + 1 == math.mininteger"));
}

#[test]
fn random_ranges_and_seeding() {
    assert!(run_bool(
        "math.randomseed(7, 9) \
         for i = 1, 50 do \
           local v = math.random(10) \
           if v < 1 or v > 10 then return false end \
         end \
         return true"
    ));
    assert!(run_bool(
        "for i = 1, 50 do \
           local v = math.random() \
           if v < 0 or v >= 1 then return false end \
         end \
         return true"
    ));
    assert!(run_bool(
        "local v = math.random(5, 5) return v == 5"
    ));
    // random(0) yields an integer with all bits (pseudo)random.
    assert_eq!(run_str("return math.type(math.random(0))"), "integer");
    assert!(!run_bool("return (pcall(math.random, 5, 1))"));
    // Empty intervals name the argument that produced them.
    let r = run("local ok, e = pcall(math.random, -3) return e");
    assert!(
        r[0].as_str().unwrap_or("").contains("#1"),
        "got {:?}",
        r[0]
    );
    let r = run("local ok, e = pcall(math.random, 5, 1) return e");
    assert!(
        r[0].as_str().unwrap_or("").contains("#2"),
        "got {:?}",
        r[0]
    );
    // Same seed, same sequence.
    assert!(run_bool(
        "math.randomseed(42, 0) \
         local a = {math.random(1000), math.random(1000), math.random(1000)} \
         math.randomseed(42, 0) \
         local b = {math.random(1000), math.random(1000), math.random(1000)} \
         return a[1] == b[1] and a[2] == b[2] and a[3] == b[3]"
    ));
}

#[test]
fn injected_random_source() {
    // A stub source makes math.random fully deterministic.
    struct Fixed(u64);
    impl crate::stdlib::math::RandomSource for Fixed {
        fn next_u64(&mut self) -> u64 {
            self.0
        }
        fn seed(&mut self, a: u64, _b: u64) {
            self.0 = a;
        }
    }
    let mut vm = super::new_vm();
    crate::stdlib::math::set_random_source(&mut vm, Box::new(Fixed(5)));
    let r = vm.execute_string("return math.random(10)").expect("run");
    assert_eq!(r[0].as_integer_strict(), Some(6)); // 1 + 5 % 10
}
