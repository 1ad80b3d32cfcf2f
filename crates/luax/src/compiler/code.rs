// Code emission.
//
// The discharge/patch machinery: expressions become registers or constant
// operands on demand, conditions are jump lists threaded through the sJ
// fields of their own instructions, and literal arithmetic folds at compile
// time with the same kernels the VM runs.

use crate::compiler::expdesc::{BinOp, ExpDesc, ExpKind, UnOp};
use crate::compiler::func_state::{ConstKey, FuncState, MAX_REGS};
use crate::lua_value::{LuaStr, LuaValue, number};
use crate::lua_vm::execute::arith::{ArithOp, RawArith, raw_arith};
use crate::lua_vm::opcode::instruction::{self as ifields, NO_JUMP};
use crate::lua_vm::{Instruction, OpCode, TmKind};

/// Placeholder register in an unpatched TESTSET.
pub const NO_REG: u32 = ifields::MAX_A;

pub type CodeResult<T> = Result<T, String>;

// ----- raw emission -----

pub fn emit(fs: &mut FuncState, i: u32) -> i32 {
    fs.proto.code.push(i);
    fs.proto.line_info.push(fs.line);
    (fs.proto.code.len() - 1) as i32
}

pub fn emit_abck(fs: &mut FuncState, op: OpCode, a: u32, b: u32, c: u32, k: bool) -> i32 {
    emit(fs, Instruction::abck(op, a, b, c, k))
}

pub fn emit_abc(fs: &mut FuncState, op: OpCode, a: u32, b: u32, c: u32) -> i32 {
    emit(fs, Instruction::abc(op, a, b, c))
}

pub fn emit_abx(fs: &mut FuncState, op: OpCode, a: u32, bx: u32) -> i32 {
    emit(fs, Instruction::abx(op, a, bx))
}

pub fn emit_asbx(fs: &mut FuncState, op: OpCode, a: u32, sbx: i32) -> i32 {
    emit(fs, Instruction::asbx(op, a, sbx))
}

// ----- registers -----

pub fn check_stack(fs: &mut FuncState, n: u32) -> CodeResult<()> {
    let needed = fs.free_reg + n;
    if needed > MAX_REGS {
        return Err("function or expression needs too many registers".to_string());
    }
    if needed > fs.proto.max_stack_size as u32 {
        fs.proto.max_stack_size = needed as u8;
    }
    Ok(())
}

pub fn reserve_regs(fs: &mut FuncState, n: u32) -> CodeResult<()> {
    check_stack(fs, n)?;
    fs.free_reg += n;
    Ok(())
}

pub fn free_reg(fs: &mut FuncState, reg: u32) {
    if reg >= fs.nvar_regs() && reg + 1 == fs.free_reg {
        fs.free_reg -= 1;
    }
}

pub fn free_exp(fs: &mut FuncState, e: &ExpDesc) {
    if let ExpKind::Nonreloc(r) = e.kind {
        free_reg(fs, r);
    }
}

/// Frees both operand registers, higher one first.
pub fn free_exps(fs: &mut FuncState, e1: &ExpDesc, e2: &ExpDesc) {
    let r1 = match e1.kind {
        ExpKind::Nonreloc(r) => Some(r),
        _ => None,
    };
    let r2 = match e2.kind {
        ExpKind::Nonreloc(r) => Some(r),
        _ => None,
    };
    match (r1, r2) {
        (Some(a), Some(b)) if a > b => {
            free_reg(fs, a);
            free_reg(fs, b);
        }
        (Some(a), Some(b)) => {
            free_reg(fs, b);
            free_reg(fs, a);
        }
        (Some(a), None) => free_reg(fs, a),
        (None, Some(b)) => free_reg(fs, b),
        (None, None) => {}
    }
}

// ----- constants -----

pub fn add_constant(fs: &mut FuncState, key: ConstKey, value: LuaValue) -> u32 {
    if let Some(&idx) = fs.constants.get(&key) {
        return idx;
    }
    let idx = fs.proto.constants.len() as u32;
    fs.proto.constants.push(value);
    fs.constants.insert(key, idx);
    idx
}

pub fn string_k(fs: &mut FuncState, s: LuaStr) -> u32 {
    let key = ConstKey::Str(s.as_bytes().to_vec());
    add_constant(fs, key, LuaValue::String(s))
}

pub fn int_k(fs: &mut FuncState, i: i64) -> u32 {
    add_constant(fs, ConstKey::Int(i), LuaValue::Integer(i))
}

pub fn float_k(fs: &mut FuncState, f: f64) -> u32 {
    add_constant(fs, ConstKey::Flt(f.to_bits()), LuaValue::Float(f))
}

// ----- jumps -----

pub fn jump(fs: &mut FuncState) -> i32 {
    emit(fs, Instruction::sj_op(OpCode::Jmp, NO_JUMP))
}

pub fn get_label(fs: &mut FuncState) -> i32 {
    let pc = fs.proto.code.len() as i32;
    fs.last_target = pc;
    pc
}

fn get_jump(fs: &FuncState, pc: i32) -> i32 {
    let offset = Instruction::sj(fs.proto.code[pc as usize]);
    if offset == NO_JUMP {
        NO_JUMP
    } else {
        pc + 1 + offset
    }
}

fn fix_jump(fs: &mut FuncState, pc: i32, dest: i32) -> CodeResult<()> {
    let offset = dest - (pc + 1);
    if offset.abs() > ifields::OFFSET_SJ {
        return Err("control structure too long".to_string());
    }
    Instruction::set_sj(&mut fs.proto.code[pc as usize], offset);
    Ok(())
}

/// Appends list `l2` to list `l1`.
pub fn concat_list(fs: &mut FuncState, l1: &mut i32, l2: i32) -> CodeResult<()> {
    if l2 == NO_JUMP {
        return Ok(());
    }
    if *l1 == NO_JUMP {
        *l1 = l2;
        return Ok(());
    }
    let mut list = *l1;
    loop {
        let next = get_jump(fs, list);
        if next == NO_JUMP {
            break;
        }
        list = next;
    }
    fix_jump(fs, list, l2)
}

/// The instruction controlling a jump: the test immediately before it, when
/// there is one.
fn jump_control_pc(fs: &FuncState, pc: i32) -> i32 {
    if pc >= 1 {
        let prev = fs.proto.code[(pc - 1) as usize];
        let op = Instruction::opcode(prev);
        if is_test_op(op) {
            return pc - 1;
        }
    }
    pc
}

fn is_test_op(op: OpCode) -> bool {
    matches!(
        op,
        OpCode::Eq
            | OpCode::Lt
            | OpCode::Le
            | OpCode::EqK
            | OpCode::EqI
            | OpCode::LtI
            | OpCode::LeI
            | OpCode::GtI
            | OpCode::GeI
            | OpCode::Test
            | OpCode::TestSet
    )
}

/// Patches a TESTSET controlling the jump at `node` to produce its value in
/// `reg` (or downgrades it to TEST). Returns true when a TESTSET was found.
fn patch_test_reg(fs: &mut FuncState, node: i32, reg: Option<u32>) -> bool {
    let ctl = jump_control_pc(fs, node);
    let i = fs.proto.code[ctl as usize];
    if Instruction::opcode(i) != OpCode::TestSet {
        return false;
    }
    let b = Instruction::b(i);
    match reg {
        Some(r) if r != b => {
            let mut patched = i;
            Instruction::set_a(&mut patched, r);
            fs.proto.code[ctl as usize] = patched;
        }
        _ => {
            // No target register, or it already holds the value.
            fs.proto.code[ctl as usize] =
                Instruction::abck(OpCode::Test, b, 0, 0, Instruction::k(i));
        }
    }
    true
}

/// True when some jump in the list does not come from a value-producing
/// test, so materialized booleans are needed.
fn need_value(fs: &FuncState, mut list: i32) -> bool {
    while list != NO_JUMP {
        let ctl = jump_control_pc(fs, list);
        if Instruction::opcode(fs.proto.code[ctl as usize]) != OpCode::TestSet {
            return true;
        }
        list = get_jump(fs, list);
    }
    false
}

fn patch_list_aux(
    fs: &mut FuncState,
    mut list: i32,
    vtarget: i32,
    reg: Option<u32>,
    dtarget: i32,
) -> CodeResult<()> {
    while list != NO_JUMP {
        let next = get_jump(fs, list);
        if patch_test_reg(fs, list, reg) {
            fix_jump(fs, list, vtarget)?;
        } else {
            fix_jump(fs, list, dtarget)?;
        }
        list = next;
    }
    Ok(())
}

pub fn patch_list(fs: &mut FuncState, list: i32, target: i32) -> CodeResult<()> {
    patch_list_aux(fs, list, target, None, target)
}

pub fn patch_to_here(fs: &mut FuncState, list: i32) -> CodeResult<()> {
    let here = get_label(fs);
    patch_list(fs, list, here)
}

/// Downgrades every TESTSET in the list to TEST (logical results whose value
/// is discarded).
fn remove_values(fs: &mut FuncState, mut list: i32) {
    while list != NO_JUMP {
        patch_test_reg(fs, list, None);
        list = get_jump(fs, list);
    }
}

// ----- discharge -----

/// Resolves variable kinds into value-producing instructions or registers.
pub fn discharge_vars(fs: &mut FuncState, e: &mut ExpDesc) {
    match e.kind {
        ExpKind::Local(reg) => {
            e.kind = ExpKind::Nonreloc(reg);
        }
        ExpKind::Upval(u) => {
            let pc = emit_abc(fs, OpCode::GetUpval, 0, u, 0);
            e.kind = ExpKind::Reloc(pc);
        }
        ExpKind::IndexUp { table, key } => {
            let pc = emit_abc(fs, OpCode::GetTabUp, 0, table, key);
            e.kind = ExpKind::Reloc(pc);
        }
        ExpKind::IndexI { table, idx } => {
            free_reg(fs, table);
            let pc = emit_abc(fs, OpCode::GetI, 0, table, idx);
            e.kind = ExpKind::Reloc(pc);
        }
        ExpKind::IndexStr { table, key } => {
            free_reg(fs, table);
            let pc = emit_abc(fs, OpCode::GetField, 0, table, key);
            e.kind = ExpKind::Reloc(pc);
        }
        ExpKind::Indexed { table, key } => {
            // Free in reverse allocation order.
            if key > table {
                free_reg(fs, key);
                free_reg(fs, table);
            } else {
                free_reg(fs, table);
                free_reg(fs, key);
            }
            let pc = emit_abc(fs, OpCode::GetTable, 0, table, key);
            e.kind = ExpKind::Reloc(pc);
        }
        ExpKind::Call(pc) => {
            // One result: the value lands at the call's A.
            let a = Instruction::a(fs.proto.code[pc as usize]);
            e.kind = ExpKind::Nonreloc(a);
        }
        ExpKind::Vararg(pc) => {
            let i = &mut fs.proto.code[pc as usize];
            Instruction::set_c(i, 2);
            e.kind = ExpKind::Reloc(pc);
        }
        _ => {}
    }
}

fn discharge2reg(fs: &mut FuncState, e: &mut ExpDesc, reg: u32) -> CodeResult<()> {
    discharge_vars(fs, e);
    match &e.kind {
        ExpKind::Nil => {
            emit_abc(fs, OpCode::LoadNil, reg, 0, 0);
        }
        ExpKind::True => {
            emit_abc(fs, OpCode::LoadTrue, reg, 0, 0);
        }
        ExpKind::False => {
            emit_abc(fs, OpCode::LoadFalse, reg, 0, 0);
        }
        ExpKind::KInt(i) => {
            let i = *i;
            if fits_sbx(i) {
                emit_asbx(fs, OpCode::LoadI, reg, i as i32);
            } else {
                let k = int_k(fs, i);
                load_k(fs, reg, k);
            }
        }
        ExpKind::KFlt(f) => {
            let f = *f;
            match number::float_to_integer(f) {
                Some(i) if fits_sbx(i) => {
                    emit_asbx(fs, OpCode::LoadF, reg, i as i32);
                }
                _ => {
                    let k = float_k(fs, f);
                    load_k(fs, reg, k);
                }
            }
        }
        ExpKind::KStr(s) => {
            let k = string_k(fs, s.clone());
            load_k(fs, reg, k);
        }
        ExpKind::Konst(k) => {
            let k = *k;
            load_k(fs, reg, k);
        }
        ExpKind::Reloc(pc) => {
            let pc = *pc;
            Instruction::set_a(&mut fs.proto.code[pc as usize], reg);
        }
        ExpKind::Nonreloc(r) => {
            let r = *r;
            if r != reg {
                emit_abc(fs, OpCode::Move, reg, r, 0);
            }
        }
        ExpKind::Jump(_) => return Ok(()), // handled by exp2reg
        ExpKind::Void | ExpKind::Call(_) | ExpKind::Vararg(_) => {
            return Err("cannot use this expression as a value".to_string());
        }
        _ => return Err("expression not discharged".to_string()),
    }
    e.kind = ExpKind::Nonreloc(reg);
    Ok(())
}

fn fits_sbx(i: i64) -> bool {
    i >= -(ifields::OFFSET_SBX as i64) && i <= (ifields::MAX_BX as i64 - ifields::OFFSET_SBX as i64)
}

fn load_k(fs: &mut FuncState, reg: u32, k: u32) {
    if k <= ifields::MAX_BX {
        emit_abx(fs, OpCode::LoadK, reg, k);
    } else {
        emit_abx(fs, OpCode::LoadKX, reg, 0);
        emit(fs, Instruction::ax_op(OpCode::ExtraArg, k));
    }
}

fn discharge2anyreg(fs: &mut FuncState, e: &mut ExpDesc) -> CodeResult<()> {
    if !matches!(e.kind, ExpKind::Nonreloc(_)) {
        reserve_regs(fs, 1)?;
        discharge2reg(fs, e, fs.free_reg - 1)?;
    }
    Ok(())
}

fn code_loadbool(fs: &mut FuncState, reg: u32, op: OpCode) -> i32 {
    get_label(fs); // these instructions may be jump targets
    emit_abc(fs, op, reg, 0, 0)
}

/// Puts the expression (jumps included) into `reg`.
pub fn exp2reg(fs: &mut FuncState, e: &mut ExpDesc, reg: u32) -> CodeResult<()> {
    discharge2reg(fs, e, reg)?;
    if let ExpKind::Jump(pc) = e.kind {
        concat_list(fs, &mut e.t, pc)?;
    }
    if e.has_jumps() {
        let mut p_f = NO_JUMP;
        let mut p_t = NO_JUMP;
        if need_value(fs, e.t) || need_value(fs, e.f) {
            let fj = if matches!(e.kind, ExpKind::Jump(_)) {
                NO_JUMP
            } else {
                jump(fs)
            };
            p_f = code_loadbool(fs, reg, OpCode::LFalseSkip);
            p_t = code_loadbool(fs, reg, OpCode::LoadTrue);
            patch_to_here(fs, fj)?;
        }
        let end = get_label(fs);
        patch_list_aux(fs, e.f, end, Some(reg), p_f)?;
        patch_list_aux(fs, e.t, end, Some(reg), p_t)?;
    }
    e.t = NO_JUMP;
    e.f = NO_JUMP;
    e.kind = ExpKind::Nonreloc(reg);
    Ok(())
}

pub fn exp2nextreg(fs: &mut FuncState, e: &mut ExpDesc) -> CodeResult<()> {
    discharge_vars(fs, e);
    free_exp(fs, e);
    reserve_regs(fs, 1)?;
    exp2reg(fs, e, fs.free_reg - 1)
}

pub fn exp2anyreg(fs: &mut FuncState, e: &mut ExpDesc) -> CodeResult<u32> {
    discharge_vars(fs, e);
    if let ExpKind::Nonreloc(r) = e.kind {
        if !e.has_jumps() {
            return Ok(r);
        }
        if r >= fs.nvar_regs() {
            // Not a local: reuse its register for the boolean epilogue.
            exp2reg(fs, e, r)?;
            return Ok(r);
        }
    }
    exp2nextreg(fs, e)?;
    match e.kind {
        ExpKind::Nonreloc(r) => Ok(r),
        _ => Err("expression did not land in a register".to_string()),
    }
}

/// Leaves upvalues in place; everything else goes to a register.
pub fn exp2anyregup(fs: &mut FuncState, e: &mut ExpDesc) -> CodeResult<()> {
    if !matches!(e.kind, ExpKind::Upval(_)) || e.has_jumps() {
        exp2anyreg(fs, e)?;
    }
    Ok(())
}

/// Value anywhere (register or constant), jumps resolved.
pub fn exp2val(fs: &mut FuncState, e: &mut ExpDesc) -> CodeResult<()> {
    if e.has_jumps() {
        exp2anyreg(fs, e)?;
    } else {
        discharge_vars(fs, e);
    }
    Ok(())
}

/// Tries to turn the expression into a constant-pool operand whose index
/// fits the C field.
fn exp2k(fs: &mut FuncState, e: &mut ExpDesc) -> bool {
    if e.has_jumps() {
        return false;
    }
    let k = match &e.kind {
        ExpKind::Nil => add_constant(fs, ConstKey::Nil, LuaValue::Nil),
        ExpKind::True => add_constant(fs, ConstKey::True, LuaValue::Boolean(true)),
        ExpKind::False => add_constant(fs, ConstKey::False, LuaValue::Boolean(false)),
        ExpKind::KInt(i) => int_k(fs, *i),
        ExpKind::KFlt(f) => float_k(fs, *f),
        ExpKind::KStr(s) => string_k(fs, s.clone()),
        ExpKind::Konst(k) => *k,
        _ => return false,
    };
    if k <= ifields::MAX_C {
        e.kind = ExpKind::Konst(k);
        true
    } else {
        false
    }
}

/// RK operand: `(index, is_constant)`.
pub fn exp2rk(fs: &mut FuncState, e: &mut ExpDesc) -> CodeResult<(u32, bool)> {
    if exp2k(fs, e) {
        if let ExpKind::Konst(k) = e.kind {
            return Ok((k, true));
        }
    }
    Ok((exp2anyreg(fs, e)?, false))
}

// ----- stores -----

pub fn store_var(fs: &mut FuncState, var: &ExpDesc, e: &mut ExpDesc) -> CodeResult<()> {
    match var.kind {
        ExpKind::Local(reg) => {
            free_exp(fs, e);
            return exp2reg(fs, e, reg);
        }
        ExpKind::Upval(u) => {
            let r = exp2anyreg(fs, e)?;
            emit_abc(fs, OpCode::SetUpval, r, u, 0);
        }
        ExpKind::IndexUp { table, key } => {
            let (rk, k) = exp2rk(fs, e)?;
            emit_abck(fs, OpCode::SetTabUp, table, key, rk, k);
        }
        ExpKind::IndexI { table, idx } => {
            let (rk, k) = exp2rk(fs, e)?;
            emit_abck(fs, OpCode::SetI, table, idx, rk, k);
        }
        ExpKind::IndexStr { table, key } => {
            let (rk, k) = exp2rk(fs, e)?;
            emit_abck(fs, OpCode::SetField, table, key, rk, k);
        }
        ExpKind::Indexed { table, key } => {
            let (rk, k) = exp2rk(fs, e)?;
            emit_abck(fs, OpCode::SetTable, table, key, rk, k);
        }
        _ => return Err("cannot assign to this expression".to_string()),
    }
    free_exp(fs, e);
    Ok(())
}

/// `e:key` - emits SELF, leaving object and method in two fresh registers.
pub fn code_self(fs: &mut FuncState, e: &mut ExpDesc, key: &mut ExpDesc) -> CodeResult<()> {
    let obj = exp2anyreg(fs, e)?;
    free_exp(fs, e);
    let base = fs.free_reg;
    reserve_regs(fs, 2)?;
    let (rk, k) = exp2rk(fs, key)?;
    free_exp(fs, key);
    emit_abck(fs, OpCode::SelfOp, base, obj, rk, k);
    e.kind = ExpKind::Nonreloc(base);
    Ok(())
}

/// Builds an indexing descriptor `t[k]`.
pub fn indexed(fs: &mut FuncState, t: &mut ExpDesc, k: &mut ExpDesc) -> CodeResult<()> {
    if t.has_jumps() {
        exp2anyreg(fs, t)?;
    }
    if let ExpKind::Upval(u) = t.kind {
        if let ExpKind::KStr(s) = &k.kind {
            let kidx = string_k(fs, s.clone());
            if kidx <= ifields::MAX_C {
                t.kind = ExpKind::IndexUp { table: u, key: kidx };
                return Ok(());
            }
        }
        // Not a short string constant: the upvalue table must move to a
        // register first.
        exp2anyreg(fs, t)?;
    }
    let treg = match t.kind {
        ExpKind::Nonreloc(r) => r,
        _ => exp2anyreg(fs, t)?,
    };
    match &k.kind {
        ExpKind::KInt(i) if *i >= 0 && *i <= ifields::MAX_C as i64 => {
            t.kind = ExpKind::IndexI {
                table: treg,
                idx: *i as u32,
            };
        }
        ExpKind::KStr(s) => {
            let kidx = string_k(fs, s.clone());
            if kidx <= ifields::MAX_C {
                t.kind = ExpKind::IndexStr {
                    table: treg,
                    key: kidx,
                };
            } else {
                let kreg = exp2anyreg(fs, k)?;
                t.kind = ExpKind::Indexed {
                    table: treg,
                    key: kreg,
                };
            }
        }
        _ => {
            let kreg = exp2anyreg(fs, k)?;
            t.kind = ExpKind::Indexed {
                table: treg,
                key: kreg,
            };
        }
    }
    Ok(())
}

// ----- conditions -----

fn negate_condition(fs: &mut FuncState, e: &ExpDesc) {
    if let ExpKind::Jump(pc) = e.kind {
        let ctl = jump_control_pc(fs, pc);
        let mut i = fs.proto.code[ctl as usize];
        let new_k = !Instruction::k(i);
        Instruction::set_k(&mut i, new_k);
        fs.proto.code[ctl as usize] = i;
    }
}

fn cond_jump(fs: &mut FuncState, op: OpCode, a: u32, b: u32, c: u32, k: bool) -> i32 {
    emit_abck(fs, op, a, b, c, k);
    jump(fs)
}

fn jump_on_cond(fs: &mut FuncState, e: &mut ExpDesc, cond: bool) -> CodeResult<i32> {
    if let ExpKind::Reloc(pc) = e.kind {
        let i = fs.proto.code[pc as usize];
        if Instruction::opcode(i) == OpCode::Not {
            // Fold `not x` into the test itself.
            fs.proto.code.pop();
            fs.proto.line_info.pop();
            return Ok(cond_jump(fs, OpCode::Test, Instruction::b(i), 0, 0, !cond));
        }
    }
    discharge2anyreg(fs, e)?;
    free_exp(fs, e);
    let r = match e.kind {
        ExpKind::Nonreloc(r) => r,
        _ => return Err("condition not in a register".to_string()),
    };
    Ok(cond_jump(fs, OpCode::TestSet, NO_REG, r, 0, cond))
}

/// Emits code so execution falls through when `e` is true; false exits join
/// `e.f`.
pub fn go_if_true(fs: &mut FuncState, e: &mut ExpDesc) -> CodeResult<()> {
    discharge_vars(fs, e);
    let pc = match e.kind {
        ExpKind::Konst(_) | ExpKind::KInt(_) | ExpKind::KFlt(_) | ExpKind::KStr(_)
        | ExpKind::True => NO_JUMP,
        ExpKind::Jump(j) => {
            negate_condition(fs, e);
            j
        }
        _ => jump_on_cond(fs, e, false)?,
    };
    concat_list(fs, &mut e.f, pc)?;
    patch_to_here(fs, e.t)?;
    e.t = NO_JUMP;
    Ok(())
}

/// Falls through when `e` is false; true exits join `e.t`.
pub fn go_if_false(fs: &mut FuncState, e: &mut ExpDesc) -> CodeResult<()> {
    discharge_vars(fs, e);
    let pc = match e.kind {
        ExpKind::Nil | ExpKind::False => NO_JUMP,
        ExpKind::Jump(j) => j,
        _ => jump_on_cond(fs, e, true)?,
    };
    concat_list(fs, &mut e.t, pc)?;
    patch_to_here(fs, e.f)?;
    e.f = NO_JUMP;
    Ok(())
}

fn code_not(fs: &mut FuncState, e: &mut ExpDesc) -> CodeResult<()> {
    discharge_vars(fs, e);
    match &e.kind {
        ExpKind::Nil | ExpKind::False => e.kind = ExpKind::True,
        ExpKind::Konst(_) | ExpKind::KInt(_) | ExpKind::KFlt(_) | ExpKind::KStr(_)
        | ExpKind::True => e.kind = ExpKind::False,
        ExpKind::Jump(_) => negate_condition(fs, e),
        ExpKind::Reloc(_) | ExpKind::Nonreloc(_) => {
            discharge2anyreg(fs, e)?;
            free_exp(fs, e);
            let r = match e.kind {
                ExpKind::Nonreloc(r) => r,
                _ => 0,
            };
            let pc = emit_abc(fs, OpCode::Not, 0, r, 0);
            e.kind = ExpKind::Reloc(pc);
        }
        _ => return Err("cannot apply 'not' here".to_string()),
    }
    std::mem::swap(&mut e.t, &mut e.f);
    remove_values(fs, e.f);
    remove_values(fs, e.t);
    Ok(())
}

// ----- operators -----

fn binop_arith(op: BinOp) -> Option<ArithOp> {
    Some(match op {
        BinOp::Add => ArithOp::Add,
        BinOp::Sub => ArithOp::Sub,
        BinOp::Mul => ArithOp::Mul,
        BinOp::Mod => ArithOp::Mod,
        BinOp::Pow => ArithOp::Pow,
        BinOp::Div => ArithOp::Div,
        BinOp::IDiv => ArithOp::IDiv,
        BinOp::BAnd => ArithOp::BAnd,
        BinOp::BOr => ArithOp::BOr,
        BinOp::BXor => ArithOp::BXor,
        BinOp::Shl => ArithOp::Shl,
        BinOp::Shr => ArithOp::Shr,
        _ => return None,
    })
}

fn arith_event(op: ArithOp) -> TmKind {
    op.event()
}

fn exp_to_value(e: &ExpDesc) -> Option<LuaValue> {
    if e.has_jumps() {
        return None;
    }
    match &e.kind {
        ExpKind::KInt(i) => Some(LuaValue::Integer(*i)),
        ExpKind::KFlt(f) => Some(LuaValue::Float(*f)),
        _ => None,
    }
}

/// Compile-time folding of literal arithmetic, sharing the VM's kernels so
/// promotion rules cannot drift. NaN results and failed operations are left
/// to run time.
fn fold_binary(op: ArithOp, e1: &ExpDesc, e2: &ExpDesc) -> Option<ExpKind> {
    let a = exp_to_value(e1)?;
    let b = exp_to_value(e2)?;
    match raw_arith(op, &a, &b) {
        RawArith::Done(LuaValue::Integer(i)) => Some(ExpKind::KInt(i)),
        RawArith::Done(LuaValue::Float(f)) if !f.is_nan() => Some(ExpKind::KFlt(f)),
        _ => None,
    }
}

fn fold_unary(op: UnOp, e: &ExpDesc) -> Option<ExpKind> {
    let v = exp_to_value(e)?;
    match op {
        UnOp::Minus => match v {
            LuaValue::Integer(i) => Some(ExpKind::KInt(i.wrapping_neg())),
            LuaValue::Float(f) => Some(ExpKind::KFlt(-f)),
            _ => None,
        },
        UnOp::BNot => v.as_integer().map(|i| ExpKind::KInt(!i)),
        _ => None,
    }
}

/// Prepares the left operand before the right side is parsed.
pub fn infix(fs: &mut FuncState, op: BinOp, e: &mut ExpDesc) -> CodeResult<()> {
    match op {
        BinOp::And => go_if_true(fs, e),
        BinOp::Or => go_if_false(fs, e),
        BinOp::Concat => {
            exp2nextreg(fs, e)?;
            Ok(())
        }
        BinOp::Eq | BinOp::Ne => {
            if !e.is_constant() {
                exp2anyreg(fs, e)?;
            }
            Ok(())
        }
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            exp2anyreg(fs, e)?;
            Ok(())
        }
        _ => {
            if !e.is_numeral() {
                exp2anyreg(fs, e)?;
            }
            Ok(())
        }
    }
}

/// Completes a binary operator once both operands are parsed.
pub fn posfix(fs: &mut FuncState, op: BinOp, e1: &mut ExpDesc, e2: &mut ExpDesc) -> CodeResult<()> {
    match op {
        BinOp::And => {
            discharge_vars(fs, e2);
            concat_list(fs, &mut e2.f, e1.f)?;
            *e1 = e2.clone();
            Ok(())
        }
        BinOp::Or => {
            discharge_vars(fs, e2);
            concat_list(fs, &mut e2.t, e1.t)?;
            *e1 = e2.clone();
            Ok(())
        }
        BinOp::Concat => code_concat(fs, e1, e2),
        BinOp::Eq | BinOp::Ne => code_eq(fs, op == BinOp::Eq, e1, e2),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => code_order(fs, op, e1, e2),
        _ => {
            let aop = match binop_arith(op) {
                Some(a) => a,
                None => return Err("bad binary operator".to_string()),
            };
            if let Some(folded) = fold_binary(aop, e1, e2) {
                e1.kind = folded;
                return Ok(());
            }
            code_arith(fs, aop, e1, e2)
        }
    }
}

fn code_concat(fs: &mut FuncState, e1: &mut ExpDesc, e2: &mut ExpDesc) -> CodeResult<()> {
    exp2val(fs, e2)?;
    let e1reg = match e1.kind {
        ExpKind::Nonreloc(r) => r,
        _ => return Err("concat operand not in a register".to_string()),
    };
    // Merge into an immediately preceding CONCAT when the operands line up.
    if let ExpKind::Reloc(pc2) = e2.kind {
        let i2 = fs.proto.code[pc2 as usize];
        if Instruction::opcode(i2) == OpCode::Concat && Instruction::a(i2) == e1reg + 1 {
            free_exp(fs, e2);
            let mut patched = i2;
            Instruction::set_a(&mut patched, e1reg);
            Instruction::set_b(&mut patched, Instruction::b(i2) + 1);
            fs.proto.code[pc2 as usize] = patched;
            e1.kind = ExpKind::Nonreloc(e1reg);
            return Ok(());
        }
    }
    exp2nextreg(fs, e2)?;
    free_exp(fs, e2);
    // The result materializes in the first operand's register.
    emit_abc(fs, OpCode::Concat, e1reg, 2, 0);
    e1.kind = ExpKind::Nonreloc(e1reg);
    Ok(())
}

fn code_arith(fs: &mut FuncState, op: ArithOp, e1: &mut ExpDesc, e2: &mut ExpDesc) -> CodeResult<()> {
    // Small-integer immediates for + and -, constant-pool operands for the
    // rest when the right side is a number constant.
    let event = arith_event(op);
    // (encoded immediate for ADDI, original operand for the metamethod)
    let imm = match (&op, &e2.kind) {
        (ArithOp::Add, ExpKind::KInt(i)) if fits_sc(*i) && !e2.has_jumps() => Some((*i, *i)),
        (ArithOp::Sub, ExpKind::KInt(i))
            if i.checked_neg().map(fits_sc).unwrap_or(false)
                && fits_sb(*i)
                && !e2.has_jumps() =>
        {
            Some((-*i, *i))
        }
        _ => None,
    };
    if let Some((enc, orig)) = imm {
        let r1 = exp2anyreg(fs, e1)?;
        free_exp(fs, e1);
        let pc = emit_abc(
            fs,
            OpCode::AddI,
            0,
            r1,
            (enc + ifields::OFFSET_SC as i64) as u32,
        );
        emit_abck(
            fs,
            OpCode::MmBinI,
            r1,
            (orig + ifields::OFFSET_SB as i64) as u32,
            event.code(),
            false,
        );
        e1.kind = ExpKind::Reloc(pc);
        return Ok(());
    }

    let kop = match &e2.kind {
        ExpKind::KInt(i) if !e2.has_jumps() => {
            let k = int_k(fs, *i);
            if k <= ifields::MAX_C { Some(k) } else { None }
        }
        ExpKind::KFlt(f) if !e2.has_jumps() => {
            let k = float_k(fs, *f);
            if k <= ifields::MAX_C { Some(k) } else { None }
        }
        _ => None,
    };
    if let (Some(k), Some(opk)) = (kop, k_variant(op)) {
        let r1 = exp2anyreg(fs, e1)?;
        free_exp(fs, e1);
        let pc = emit_abc(fs, opk, 0, r1, k);
        emit_abck(fs, OpCode::MmBinK, r1, k, event.code(), false);
        e1.kind = ExpKind::Reloc(pc);
        return Ok(());
    }

    let r2 = exp2anyreg(fs, e2)?;
    let r1 = exp2anyreg(fs, e1)?;
    free_exps(fs, e1, e2);
    let pc = emit_abc(fs, reg_variant(op), 0, r1, r2);
    emit_abck(fs, OpCode::MmBin, r1, r2, event.code(), false);
    e1.kind = ExpKind::Reloc(pc);
    Ok(())
}

fn fits_sc(i: i64) -> bool {
    i >= -(ifields::OFFSET_SC as i64) && i <= (ifields::MAX_C as i64 - ifields::OFFSET_SC as i64)
}

fn k_variant(op: ArithOp) -> Option<OpCode> {
    Some(match op {
        ArithOp::Add => OpCode::AddK,
        ArithOp::Sub => OpCode::SubK,
        ArithOp::Mul => OpCode::MulK,
        ArithOp::Mod => OpCode::ModK,
        ArithOp::Pow => OpCode::PowK,
        ArithOp::Div => OpCode::DivK,
        ArithOp::IDiv => OpCode::IDivK,
        ArithOp::BAnd => OpCode::BAndK,
        ArithOp::BOr => OpCode::BOrK,
        ArithOp::BXor => OpCode::BXorK,
        ArithOp::Shl | ArithOp::Shr => return None,
    })
}

fn reg_variant(op: ArithOp) -> OpCode {
    match op {
        ArithOp::Add => OpCode::Add,
        ArithOp::Sub => OpCode::Sub,
        ArithOp::Mul => OpCode::Mul,
        ArithOp::Mod => OpCode::Mod,
        ArithOp::Pow => OpCode::Pow,
        ArithOp::Div => OpCode::Div,
        ArithOp::IDiv => OpCode::IDiv,
        ArithOp::BAnd => OpCode::BAnd,
        ArithOp::BOr => OpCode::BOr,
        ArithOp::BXor => OpCode::BXor,
        ArithOp::Shl => OpCode::Shl,
        ArithOp::Shr => OpCode::Shr,
    }
}

fn code_eq(fs: &mut FuncState, eq: bool, e1: &mut ExpDesc, e2: &mut ExpDesc) -> CodeResult<()> {
    // A constant left operand swaps to the right.
    if e1.is_constant() && !e2.is_constant() {
        std::mem::swap(e1, e2);
    }
    let r1 = exp2anyreg(fs, e1)?;
    let pc = match &e2.kind {
        ExpKind::KInt(i) if fits_sb(*i) && !e2.has_jumps() => {
            let b = (*i + ifields::OFFSET_SB as i64) as u32;
            free_exp(fs, e1);
            cond_jump(fs, OpCode::EqI, r1, b, 0, eq)
        }
        _ => {
            let (rk, isk) = exp2rk(fs, e2)?;
            free_exps(fs, e1, e2);
            if isk {
                cond_jump(fs, OpCode::EqK, r1, rk, 0, eq)
            } else {
                cond_jump(fs, OpCode::Eq, r1, rk, 0, eq)
            }
        }
    };
    e1.kind = ExpKind::Jump(pc);
    e1.t = NO_JUMP;
    e1.f = NO_JUMP;
    Ok(())
}

fn fits_sb(i: i64) -> bool {
    i >= -(ifields::OFFSET_SB as i64) && i <= (ifields::MAX_B as i64 - ifields::OFFSET_SB as i64)
}

fn code_order(fs: &mut FuncState, op: BinOp, e1: &mut ExpDesc, e2: &mut ExpDesc) -> CodeResult<()> {
    // `a > b` is compiled as `b < a` (operands already evaluated in order).
    let (first, second, opcode) = match op {
        BinOp::Lt => (&mut *e1, &mut *e2, OpCode::Lt),
        BinOp::Le => (&mut *e1, &mut *e2, OpCode::Le),
        BinOp::Gt => (&mut *e2, &mut *e1, OpCode::Lt),
        _ => (&mut *e2, &mut *e1, OpCode::Le),
    };
    let r1 = exp2anyreg(fs, first)?;
    let r2 = exp2anyreg(fs, second)?;
    free_exps(fs, e1, e2);
    let pc = cond_jump(fs, opcode, r1, r2, 0, true);
    e1.kind = ExpKind::Jump(pc);
    e1.t = NO_JUMP;
    e1.f = NO_JUMP;
    Ok(())
}

/// Unary operators; `-` and `~` fold on literals.
pub fn code_unary(fs: &mut FuncState, op: UnOp, e: &mut ExpDesc) -> CodeResult<()> {
    if op == UnOp::Not {
        return code_not(fs, e);
    }
    if let Some(folded) = fold_unary(op, e) {
        e.kind = folded;
        return Ok(());
    }
    let r = exp2anyreg(fs, e)?;
    free_exp(fs, e);
    let opcode = match op {
        UnOp::Minus => OpCode::Unm,
        UnOp::BNot => OpCode::BNot,
        UnOp::Len => OpCode::Len,
        UnOp::Not => unreachable!(),
    };
    let pc = emit_abc(fs, opcode, 0, r, 0);
    e.kind = ExpKind::Reloc(pc);
    Ok(())
}

// ----- calls, returns, multiple values -----

/// Fixes an open call/vararg to produce `nresults` values (-1 for all).
pub fn set_returns(fs: &mut FuncState, e: &mut ExpDesc, nresults: i32) -> CodeResult<()> {
    let c = (nresults + 1) as u32;
    match e.kind {
        ExpKind::Call(pc) => {
            Instruction::set_c(&mut fs.proto.code[pc as usize], c);
        }
        ExpKind::Vararg(pc) => {
            let free = fs.free_reg;
            let i = &mut fs.proto.code[pc as usize];
            Instruction::set_c(i, c);
            Instruction::set_a(i, free);
            reserve_regs(fs, 1)?;
        }
        _ => return Err("expression has no open result count".to_string()),
    }
    Ok(())
}

pub fn set_one_ret(fs: &mut FuncState, e: &mut ExpDesc) {
    match e.kind {
        ExpKind::Call(pc) => {
            let a = Instruction::a(fs.proto.code[pc as usize]);
            e.kind = ExpKind::Nonreloc(a);
        }
        ExpKind::Vararg(pc) => {
            Instruction::set_c(&mut fs.proto.code[pc as usize], 2);
            e.kind = ExpKind::Reloc(pc);
        }
        _ => {}
    }
}

pub fn code_return(fs: &mut FuncState, first: u32, nret: i32) {
    let op = match nret {
        0 => OpCode::Return0,
        1 => OpCode::Return1,
        _ => OpCode::Return,
    };
    emit_abck(fs, op, first, (nret + 1) as u32, 0, false);
}

/// Final pass: widen RETURN0/RETURN1 and set close/vararg info on returns
/// once the function's needs are known.
pub fn finish_function(fs: &mut FuncState) {
    let needs_close = fs.needs_close;
    let is_vararg = fs.proto.is_vararg;
    let nparams = fs.proto.num_params as u32;
    for i in fs.proto.code.iter_mut() {
        match Instruction::opcode(*i) {
            OpCode::Return0 | OpCode::Return1 => {
                if needs_close || is_vararg {
                    let a = Instruction::a(*i);
                    let op_b = if Instruction::opcode(*i) == OpCode::Return0 { 1 } else { 2 };
                    *i = Instruction::abck(OpCode::Return, a, op_b, 0, false);
                    if needs_close {
                        Instruction::set_k(i, true);
                    }
                    if is_vararg {
                        Instruction::set_c(i, nparams + 1);
                    }
                }
            }
            OpCode::Return | OpCode::TailCall => {
                if needs_close {
                    Instruction::set_k(i, true);
                }
                if is_vararg {
                    Instruction::set_c(i, nparams + 1);
                }
            }
            _ => {}
        }
    }
}
