// The bytecode dispatch loop.
//
// One tight loop over the current frame's code. Calls push a frame and jump
// back to the reentry point; returns pop one and resume the caller from its
// stored pc. The cancellation token is observed at every backward branch and
// at every call entry.

pub mod arith;
mod call;

pub(crate) use call::{
    Precalled, Protected, adjust_varargs, close_level, do_return, mark_tbc, precall,
    protected_call,
};

use std::rc::Rc;

use crate::gc::UpvalueId;
use crate::lua_value::{LuaValue, Proto};
use crate::lua_vm::opcode::instruction as ifields;
use crate::lua_vm::{Instruction, LuaResult, LuaVM, OpCode, TmKind};
use arith::{ArithOp, RawArith};

/// Public entry: calls `f` with `args`; used by the API, the stdlib and
/// metamethod dispatch.
pub(crate) fn call_function(
    vm: &mut LuaVM,
    f: LuaValue,
    args: Vec<LuaValue>,
    nresults: i32,
) -> LuaResult<Vec<LuaValue>> {
    call::call_function(vm, f, args, nresults)
}

/// Upvalue cell `idx` of the closure running in `frame_idx`.
fn frame_upvalue(vm: &LuaVM, frame_idx: usize, idx: usize) -> Option<UpvalueId> {
    let frame = &vm.frames[frame_idx];
    let id = frame.func.as_function_id()?;
    vm.pool.function(id).upvalues().get(idx).copied()
}

/// Executes frames until the frame stack drops back to `stop_depth`.
pub(crate) fn lua_execute(vm: &mut LuaVM, stop_depth: usize) -> LuaResult<()> {
    'reentry: loop {
        if vm.frames.len() <= stop_depth {
            return Ok(());
        }
        let frame_idx = vm.frames.len() - 1;
        let (base, mut pc, frame_top) = {
            let f = &vm.frames[frame_idx];
            (f.base, f.pc, f.top)
        };
        let proto: Rc<Proto> = {
            let f = &vm.frames[frame_idx];
            let Some(id) = f.func.as_function_id() else {
                return Err(vm.error_runtime("cannot execute a non-function frame"));
            };
            match vm.pool.function(id).proto() {
                Some(p) => p.clone(),
                None => return Err(vm.error_runtime("cannot execute a host frame")),
            }
        };

        loop {
            let instr = proto.code[pc];
            pc += 1;
            vm.frames[frame_idx].pc = pc;
            let op = Instruction::opcode(instr);
            if !op.uses_top() {
                // Multi-value flows manage top themselves; everything else
                // runs with the frame's full register window.
                vm.set_top(frame_top)?;
            }
            let a = Instruction::a(instr) as usize;

            match op {
                OpCode::Move => {
                    let v = vm.stack_get(base + Instruction::b(instr) as usize);
                    vm.stack_set(base + a, v)?;
                }
                OpCode::LoadI => {
                    vm.stack_set(base + a, LuaValue::Integer(Instruction::sbx(instr) as i64))?;
                }
                OpCode::LoadF => {
                    vm.stack_set(base + a, LuaValue::Float(Instruction::sbx(instr) as f64))?;
                }
                OpCode::LoadK => {
                    let k = proto.constants[Instruction::bx(instr) as usize].clone();
                    vm.stack_set(base + a, k)?;
                }
                OpCode::LoadKX => {
                    let kidx = Instruction::ax(proto.code[pc]) as usize;
                    pc += 1;
                    let k = proto.constants[kidx].clone();
                    vm.stack_set(base + a, k)?;
                }
                OpCode::LoadFalse => {
                    vm.stack_set(base + a, LuaValue::Boolean(false))?;
                }
                OpCode::LFalseSkip => {
                    vm.stack_set(base + a, LuaValue::Boolean(false))?;
                    pc += 1;
                }
                OpCode::LoadTrue => {
                    vm.stack_set(base + a, LuaValue::Boolean(true))?;
                }
                OpCode::LoadNil => {
                    let b = Instruction::b(instr) as usize;
                    for i in 0..=b {
                        vm.stack_set(base + a + i, LuaValue::Nil)?;
                    }
                }

                OpCode::GetUpval => {
                    let b = Instruction::b(instr) as usize;
                    let v = match frame_upvalue(vm, frame_idx, b) {
                        Some(id) => vm.read_upvalue(id),
                        None => LuaValue::Nil,
                    };
                    vm.stack_set(base + a, v)?;
                }
                OpCode::SetUpval => {
                    let b = Instruction::b(instr) as usize;
                    let v = vm.stack_get(base + a);
                    if let Some(id) = frame_upvalue(vm, frame_idx, b) {
                        vm.write_upvalue(id, v)?;
                    }
                }

                OpCode::GetTabUp => {
                    let b = Instruction::b(instr) as usize;
                    let key = proto.constants[Instruction::c(instr) as usize].clone();
                    let t = match frame_upvalue(vm, frame_idx, b) {
                        Some(id) => vm.read_upvalue(id),
                        None => LuaValue::Nil,
                    };
                    let v = vm.table_get(&t, &key)?;
                    vm.stack_set(base + a, v)?;
                }
                OpCode::GetTable => {
                    let t = vm.stack_get(base + Instruction::b(instr) as usize);
                    let key = vm.stack_get(base + Instruction::c(instr) as usize);
                    let v = vm.table_get(&t, &key)?;
                    vm.stack_set(base + a, v)?;
                }
                OpCode::GetI => {
                    let t = vm.stack_get(base + Instruction::b(instr) as usize);
                    let key = LuaValue::Integer(Instruction::c(instr) as i64);
                    let v = vm.table_get(&t, &key)?;
                    vm.stack_set(base + a, v)?;
                }
                OpCode::GetField => {
                    let t = vm.stack_get(base + Instruction::b(instr) as usize);
                    let key = proto.constants[Instruction::c(instr) as usize].clone();
                    let v = vm.table_get(&t, &key)?;
                    vm.stack_set(base + a, v)?;
                }

                OpCode::SetTabUp => {
                    let key = proto.constants[Instruction::b(instr) as usize].clone();
                    let c = Instruction::c(instr) as usize;
                    let value = if Instruction::k(instr) {
                        proto.constants[c].clone()
                    } else {
                        vm.stack_get(base + c)
                    };
                    let t = match frame_upvalue(vm, frame_idx, a) {
                        Some(id) => vm.read_upvalue(id),
                        None => LuaValue::Nil,
                    };
                    vm.table_set(&t, key, value)?;
                }
                OpCode::SetTable => {
                    let t = vm.stack_get(base + a);
                    let key = vm.stack_get(base + Instruction::b(instr) as usize);
                    let c = Instruction::c(instr) as usize;
                    let value = if Instruction::k(instr) {
                        proto.constants[c].clone()
                    } else {
                        vm.stack_get(base + c)
                    };
                    vm.table_set(&t, key, value)?;
                }
                OpCode::SetI => {
                    let t = vm.stack_get(base + a);
                    let key = LuaValue::Integer(Instruction::b(instr) as i64);
                    let c = Instruction::c(instr) as usize;
                    let value = if Instruction::k(instr) {
                        proto.constants[c].clone()
                    } else {
                        vm.stack_get(base + c)
                    };
                    vm.table_set(&t, key, value)?;
                }
                OpCode::SetField => {
                    let t = vm.stack_get(base + a);
                    let key = proto.constants[Instruction::b(instr) as usize].clone();
                    let c = Instruction::c(instr) as usize;
                    let value = if Instruction::k(instr) {
                        proto.constants[c].clone()
                    } else {
                        vm.stack_get(base + c)
                    };
                    vm.table_set(&t, key, value)?;
                }

                OpCode::NewTable => {
                    // Always followed by ExtraArg carrying the array hint.
                    let hash_hint = {
                        let b = Instruction::b(instr);
                        // The field is log2(size)+1; clamp so loaded chunks
                        // cannot force absurd preallocations.
                        if b == 0 { 0 } else { 1usize << (b - 1).min(16) }
                    };
                    let mut arr_hint = Instruction::c(instr) as usize;
                    if Instruction::k(instr) {
                        arr_hint += Instruction::ax(proto.code[pc]) as usize * (ifields::MAX_C as usize + 1);
                    }
                    pc += 1;
                    let t = vm.new_table_with_capacity(arr_hint.min(1 << 16), hash_hint);
                    vm.stack_set(base + a, t)?;
                }

                OpCode::SelfOp => {
                    let obj = vm.stack_get(base + Instruction::b(instr) as usize);
                    vm.stack_set(base + a + 1, obj.clone())?;
                    let c = Instruction::c(instr) as usize;
                    let key = if Instruction::k(instr) {
                        proto.constants[c].clone()
                    } else {
                        vm.stack_get(base + c)
                    };
                    let v = vm.table_get(&obj, &key)?;
                    vm.stack_set(base + a, v)?;
                }

                // Arithmetic fast paths; on success the trailing MMBIN* is
                // skipped, on a non-numeric operand it runs next.
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Mod | OpCode::Pow
                | OpCode::Div | OpCode::IDiv | OpCode::BAnd | OpCode::BOr | OpCode::BXor
                | OpCode::Shl | OpCode::Shr => {
                    let x = vm.stack_get(base + Instruction::b(instr) as usize);
                    let y = vm.stack_get(base + Instruction::c(instr) as usize);
                    let op2 = reg_arith_op(op);
                    match arith::raw_arith(op2, &x, &y) {
                        RawArith::Done(v) => {
                            vm.stack_set(base + a, v)?;
                            pc += 1;
                        }
                        RawArith::Fail(msg) => return fail(vm, frame_idx, pc, msg),
                        RawArith::NotNumeric => {}
                    }
                }
                OpCode::AddK | OpCode::SubK | OpCode::MulK | OpCode::ModK | OpCode::PowK
                | OpCode::DivK | OpCode::IDivK | OpCode::BAndK | OpCode::BOrK
                | OpCode::BXorK => {
                    let x = vm.stack_get(base + Instruction::b(instr) as usize);
                    let y = proto.constants[Instruction::c(instr) as usize].clone();
                    let op2 = const_arith_op(op);
                    match arith::raw_arith(op2, &x, &y) {
                        RawArith::Done(v) => {
                            vm.stack_set(base + a, v)?;
                            pc += 1;
                        }
                        RawArith::Fail(msg) => return fail(vm, frame_idx, pc, msg),
                        RawArith::NotNumeric => {}
                    }
                }
                OpCode::AddI => {
                    let x = vm.stack_get(base + Instruction::b(instr) as usize);
                    let y = LuaValue::Integer(Instruction::sc(instr) as i64);
                    match arith::raw_arith(ArithOp::Add, &x, &y) {
                        RawArith::Done(v) => {
                            vm.stack_set(base + a, v)?;
                            pc += 1;
                        }
                        RawArith::Fail(msg) => return fail(vm, frame_idx, pc, msg),
                        RawArith::NotNumeric => {}
                    }
                }
                OpCode::ShrI => {
                    let x = vm.stack_get(base + Instruction::b(instr) as usize);
                    let y = LuaValue::Integer(Instruction::sc(instr) as i64);
                    match arith::raw_arith(ArithOp::Shr, &x, &y) {
                        RawArith::Done(v) => {
                            vm.stack_set(base + a, v)?;
                            pc += 1;
                        }
                        RawArith::Fail(msg) => return fail(vm, frame_idx, pc, msg),
                        RawArith::NotNumeric => {}
                    }
                }
                OpCode::ShlI => {
                    // R[A] := sC << R[B]
                    let y = vm.stack_get(base + Instruction::b(instr) as usize);
                    let x = LuaValue::Integer(Instruction::sc(instr) as i64);
                    match arith::raw_arith(ArithOp::Shl, &x, &y) {
                        RawArith::Done(v) => {
                            vm.stack_set(base + a, v)?;
                            pc += 1;
                        }
                        RawArith::Fail(msg) => return fail(vm, frame_idx, pc, msg),
                        RawArith::NotNumeric => {}
                    }
                }

                OpCode::MmBin => {
                    let x = vm.stack_get(base + a);
                    let y = vm.stack_get(base + Instruction::b(instr) as usize);
                    let dest = base + Instruction::a(proto.code[pc - 2]) as usize;
                    let v = dispatch_mmbin(vm, Instruction::c(instr), x, y)?;
                    vm.stack_set(dest, v)?;
                }
                OpCode::MmBinI => {
                    let reg = vm.stack_get(base + a);
                    let imm = LuaValue::Integer(Instruction::sb(instr) as i64);
                    let dest = base + Instruction::a(proto.code[pc - 2]) as usize;
                    let (x, y) = if Instruction::k(instr) { (imm, reg) } else { (reg, imm) };
                    let v = dispatch_mmbin(vm, Instruction::c(instr), x, y)?;
                    vm.stack_set(dest, v)?;
                }
                OpCode::MmBinK => {
                    let reg = vm.stack_get(base + a);
                    let kval = proto.constants[Instruction::b(instr) as usize].clone();
                    let dest = base + Instruction::a(proto.code[pc - 2]) as usize;
                    let (x, y) = if Instruction::k(instr) { (kval, reg) } else { (reg, kval) };
                    let v = dispatch_mmbin(vm, Instruction::c(instr), x, y)?;
                    vm.stack_set(dest, v)?;
                }

                OpCode::Unm => {
                    let x = vm.stack_get(base + Instruction::b(instr) as usize);
                    let v = arith::unm_with_meta(vm, x)?;
                    vm.stack_set(base + a, v)?;
                }
                OpCode::BNot => {
                    let x = vm.stack_get(base + Instruction::b(instr) as usize);
                    let v = arith::bnot_with_meta(vm, x)?;
                    vm.stack_set(base + a, v)?;
                }
                OpCode::Not => {
                    let x = vm.stack_get(base + Instruction::b(instr) as usize);
                    vm.stack_set(base + a, LuaValue::Boolean(x.is_falsy()))?;
                }
                OpCode::Len => {
                    let x = vm.stack_get(base + Instruction::b(instr) as usize);
                    let v = vm.length_of(&x)?;
                    vm.stack_set(base + a, v)?;
                }

                OpCode::Concat => {
                    let b = Instruction::b(instr) as usize;
                    // Right-associative fold over R[A] .. R[A+B-1].
                    let mut acc = vm.stack_get(base + a + b - 1);
                    for i in (0..b - 1).rev() {
                        let lhs = vm.stack_get(base + a + i);
                        acc = vm.concat_values(lhs, acc)?;
                    }
                    vm.stack_set(base + a, acc)?;
                }

                OpCode::Close => {
                    close_level(vm, base + a, None)?;
                }
                OpCode::Tbc => {
                    mark_tbc(vm, base + a)?;
                }

                OpCode::Jmp => {
                    let sj = Instruction::sj(instr);
                    if sj < 0 {
                        vm.check_cancelled()?;
                    }
                    pc = offset_pc(pc, sj);
                }

                OpCode::Eq => {
                    let x = vm.stack_get(base + a);
                    let y = vm.stack_get(base + Instruction::b(instr) as usize);
                    let cond = arith::equals(vm, &x, &y)?;
                    pc = cond_jump(vm, &proto, pc, cond, Instruction::k(instr))?;
                }
                OpCode::Lt => {
                    let x = vm.stack_get(base + a);
                    let y = vm.stack_get(base + Instruction::b(instr) as usize);
                    let cond = arith::less_than(vm, x, y)?;
                    pc = cond_jump(vm, &proto, pc, cond, Instruction::k(instr))?;
                }
                OpCode::Le => {
                    let x = vm.stack_get(base + a);
                    let y = vm.stack_get(base + Instruction::b(instr) as usize);
                    let cond = arith::less_equal(vm, x, y)?;
                    pc = cond_jump(vm, &proto, pc, cond, Instruction::k(instr))?;
                }
                OpCode::EqK => {
                    let x = vm.stack_get(base + a);
                    let k = &proto.constants[Instruction::b(instr) as usize];
                    let cond = x.raw_equal(k);
                    pc = cond_jump(vm, &proto, pc, cond, Instruction::k(instr))?;
                }
                OpCode::EqI => {
                    let x = vm.stack_get(base + a);
                    let im = Instruction::sb(instr) as i64;
                    let cond = x.raw_equal(&LuaValue::Integer(im));
                    pc = cond_jump(vm, &proto, pc, cond, Instruction::k(instr))?;
                }
                OpCode::LtI | OpCode::LeI | OpCode::GtI | OpCode::GeI => {
                    let x = vm.stack_get(base + a);
                    let im = LuaValue::Integer(Instruction::sb(instr) as i64);
                    let cond = match op {
                        OpCode::LtI => match arith::num_lt(&x, &im) {
                            Some(c) => c,
                            None => arith::less_than(vm, x, im)?,
                        },
                        OpCode::LeI => match arith::num_le(&x, &im) {
                            Some(c) => c,
                            None => arith::less_equal(vm, x, im)?,
                        },
                        OpCode::GtI => match arith::num_lt(&im, &x) {
                            Some(c) => c,
                            None => arith::less_than(vm, im, x)?,
                        },
                        _ => match arith::num_le(&im, &x) {
                            Some(c) => c,
                            None => arith::less_equal(vm, im, x)?,
                        },
                    };
                    pc = cond_jump(vm, &proto, pc, cond, Instruction::k(instr))?;
                }

                OpCode::Test => {
                    let cond = vm.stack_get(base + a).is_truthy();
                    pc = cond_jump(vm, &proto, pc, cond, Instruction::k(instr))?;
                }
                OpCode::TestSet => {
                    let v = vm.stack_get(base + Instruction::b(instr) as usize);
                    let cond = v.is_truthy();
                    if cond != Instruction::k(instr) {
                        pc += 1;
                    } else {
                        vm.stack_set(base + a, v)?;
                        let ni = proto.code[pc];
                        let sj = Instruction::sj(ni);
                        if sj < 0 {
                            vm.check_cancelled()?;
                        }
                        pc = offset_pc(pc + 1, sj);
                    }
                }

                OpCode::Call => {
                    let b = Instruction::b(instr) as usize;
                    let c = Instruction::c(instr) as i32;
                    let func_slot = base + a;
                    let nargs = if b > 0 {
                        b - 1
                    } else {
                        vm.top.saturating_sub(func_slot + 1)
                    };
                    let nresults = c - 1;
                    vm.frames[frame_idx].pc = pc;
                    match precall(vm, func_slot, nargs, nresults)? {
                        Precalled::Lua => continue 'reentry,
                        Precalled::Done => {}
                    }
                }

                OpCode::TailCall => {
                    let b = Instruction::b(instr) as usize;
                    let func_slot = base + a;
                    let nargs = if b > 0 {
                        b - 1
                    } else {
                        vm.top.saturating_sub(func_slot + 1)
                    };
                    vm.frames[frame_idx].pc = pc;
                    close_level(vm, base, None)?;
                    let dest = call::original_func_slot(vm, frame_idx);
                    let expected = vm.frames[frame_idx].nresults;
                    for i in 0..=nargs {
                        let v = vm.stack_get(func_slot + i);
                        vm.stack_set(dest + i, v)?;
                    }
                    vm.frames.pop();
                    vm.set_top(dest + 1 + nargs)?;
                    match precall(vm, dest, nargs, expected)? {
                        Precalled::Lua => {
                            if let Some(frame) = vm.current_frame_mut() {
                                frame.is_tail_call = true;
                            }
                            continue 'reentry;
                        }
                        // Host tail call: results already adjusted for the
                        // caller; resume it.
                        Precalled::Done => continue 'reentry,
                    }
                }

                OpCode::Return => {
                    let b = Instruction::b(instr) as usize;
                    let first = base + a;
                    let n = if b > 0 { b - 1 } else { vm.top.saturating_sub(first) };
                    vm.frames[frame_idx].pc = pc;
                    do_return(vm, n, first)?;
                    continue 'reentry;
                }
                OpCode::Return0 => {
                    vm.frames[frame_idx].pc = pc;
                    do_return(vm, 0, base + a)?;
                    continue 'reentry;
                }
                OpCode::Return1 => {
                    vm.frames[frame_idx].pc = pc;
                    do_return(vm, 1, base + a)?;
                    continue 'reentry;
                }

                OpCode::ForPrep => {
                    let bx = Instruction::bx(instr) as usize;
                    if !for_prep(vm, base + a)? {
                        pc += bx + 1;
                    }
                }
                OpCode::ForLoop => {
                    let bx = Instruction::bx(instr) as usize;
                    if for_loop(vm, base + a)? {
                        vm.check_cancelled()?;
                        pc -= bx;
                    }
                }

                OpCode::TForPrep => {
                    let bx = Instruction::bx(instr) as usize;
                    mark_tbc(vm, base + a + 3)?;
                    pc += bx;
                }
                OpCode::TForCall => {
                    let c = Instruction::c(instr) as i32;
                    let slot = base + a;
                    for i in 0..3 {
                        let v = vm.stack_get(slot + i);
                        vm.stack_set(slot + 4 + i, v)?;
                    }
                    vm.set_top(slot + 7)?;
                    vm.frames[frame_idx].pc = pc;
                    match precall(vm, slot + 4, 2, c)? {
                        Precalled::Lua => continue 'reentry,
                        Precalled::Done => {}
                    }
                }
                OpCode::TForLoop => {
                    // A is the control slot; first result sits two above.
                    let bx = Instruction::bx(instr) as usize;
                    let first = vm.stack_get(base + a + 2);
                    if !first.is_nil() {
                        vm.stack_set(base + a, first)?;
                        vm.check_cancelled()?;
                        pc -= bx;
                    }
                }

                OpCode::SetList => {
                    let b = Instruction::b(instr) as usize;
                    let mut start = Instruction::c(instr) as i64;
                    if Instruction::k(instr) {
                        start += Instruction::ax(proto.code[pc]) as i64 * (ifields::MAX_C as i64 + 1);
                        pc += 1;
                    }
                    let n = if b > 0 {
                        b
                    } else {
                        vm.top.saturating_sub(base + a + 1)
                    };
                    let t = vm.stack_get(base + a);
                    let Some(tid) = t.as_table_id() else {
                        return Err(vm.error_runtime("internal: SETLIST target is not a table"));
                    };
                    for i in 1..=n {
                        let v = vm.stack_get(base + a + i);
                        if let Err(e) = vm.pool.table_mut(tid).raw_set_int(start + i as i64, v) {
                            return Err(vm.table_set_error(e));
                        }
                    }
                }

                OpCode::Closure => {
                    let bx = Instruction::bx(instr) as usize;
                    let child = proto.protos[bx].clone();
                    let mut cells = Vec::with_capacity(child.upvalues.len());
                    for desc in &child.upvalues {
                        let cell = if desc.in_stack {
                            vm.find_or_create_upvalue(base + desc.index as usize)
                        } else {
                            match frame_upvalue(vm, frame_idx, desc.index as usize) {
                                Some(id) => id,
                                None => {
                                    return Err(
                                        vm.error_runtime("internal: missing parent upvalue")
                                    );
                                }
                            }
                        };
                        cells.push(cell);
                    }
                    let f = vm.new_lua_closure(child, cells);
                    vm.stack_set(base + a, f)?;
                }

                OpCode::Vararg => {
                    let c = Instruction::c(instr) as usize;
                    let frame = &vm.frames[frame_idx];
                    let nextra = frame.n_extra_args;
                    let src = frame.func_slot - nextra;
                    let wanted = if c > 0 { c - 1 } else { nextra };
                    vm.ensure_stack(base + a + wanted)?;
                    for i in 0..wanted {
                        let v = if i < nextra {
                            vm.stack_get(src + i)
                        } else {
                            LuaValue::Nil
                        };
                        vm.stack_set(base + a + i, v)?;
                    }
                    if c == 0 {
                        vm.set_top(base + a + wanted)?;
                    }
                }

                OpCode::VarargPrep => {
                    if proto.is_vararg {
                        vm.frames[frame_idx].pc = pc;
                        adjust_varargs(
                            vm,
                            proto.num_params as usize,
                            proto.max_stack_size as usize,
                        )?;
                        continue 'reentry;
                    }
                }

                OpCode::ExtraArg => {
                    // Consumed by the preceding instruction; standalone it is
                    // a no-op.
                }
            }
        }
    }
}

/// Stores `pc` back (so error positions point at the failing instruction)
/// and raises a runtime error.
fn fail(vm: &mut LuaVM, frame_idx: usize, pc: usize, msg: &str) -> LuaResult<()> {
    vm.frames[frame_idx].pc = pc;
    Err(vm.error_runtime(msg))
}

#[inline(always)]
fn offset_pc(pc: usize, sj: i32) -> usize {
    (pc as i64 + sj as i64) as usize
}

/// Comparison epilogue: when the condition disagrees with k, skip the
/// following jump; otherwise take it.
fn cond_jump(vm: &mut LuaVM, proto: &Proto, pc: usize, cond: bool, k: bool) -> LuaResult<usize> {
    if cond != k {
        return Ok(pc + 1);
    }
    let ni = proto.code[pc];
    let sj = Instruction::sj(ni);
    if sj < 0 {
        vm.check_cancelled()?;
    }
    Ok(offset_pc(pc + 1, sj))
}

fn reg_arith_op(op: OpCode) -> ArithOp {
    match op {
        OpCode::Add => ArithOp::Add,
        OpCode::Sub => ArithOp::Sub,
        OpCode::Mul => ArithOp::Mul,
        OpCode::Mod => ArithOp::Mod,
        OpCode::Pow => ArithOp::Pow,
        OpCode::Div => ArithOp::Div,
        OpCode::IDiv => ArithOp::IDiv,
        OpCode::BAnd => ArithOp::BAnd,
        OpCode::BOr => ArithOp::BOr,
        OpCode::BXor => ArithOp::BXor,
        OpCode::Shl => ArithOp::Shl,
        _ => ArithOp::Shr,
    }
}

fn const_arith_op(op: OpCode) -> ArithOp {
    match op {
        OpCode::AddK => ArithOp::Add,
        OpCode::SubK => ArithOp::Sub,
        OpCode::MulK => ArithOp::Mul,
        OpCode::ModK => ArithOp::Mod,
        OpCode::PowK => ArithOp::Pow,
        OpCode::DivK => ArithOp::Div,
        OpCode::IDivK => ArithOp::IDiv,
        OpCode::BAndK => ArithOp::BAnd,
        OpCode::BOrK => ArithOp::BOr,
        _ => ArithOp::BXor,
    }
}

/// MMBIN event dispatch; also covers `..` which shares the scheme.
fn dispatch_mmbin(vm: &mut LuaVM, code: u32, x: LuaValue, y: LuaValue) -> LuaResult<LuaValue> {
    match TmKind::from_code(code) {
        Some(TmKind::Concat) => vm.concat_values(x, y),
        Some(event) => match ArithOp::from_event(event) {
            Some(op) => arith::arith_with_meta(vm, op, x, y),
            None => Err(vm.error_runtime("internal: bad metamethod event")),
        },
        None => Err(vm.error_runtime("internal: bad metamethod event")),
    }
}

/// Numeric-for preparation. Returns false when the loop body is skipped.
/// Register layout: R[A]=init/counter, R[A+1]=limit/count, R[A+2]=step,
/// R[A+3]=visible control variable.
fn for_prep(vm: &mut LuaVM, ra: usize) -> LuaResult<bool> {
    let init = vm.stack_get(ra);
    let limit = vm.stack_get(ra + 1);
    let step = vm.stack_get(ra + 2);

    if let (LuaValue::Integer(i0), LuaValue::Integer(st)) = (&init, &step) {
        let (i0, st) = (*i0, *st);
        if st == 0 {
            return Err(vm.error_runtime("'for' step is zero"));
        }
        // Integer loop; the limit may still be a float, clamped toward the
        // loop direction.
        let lim = match &limit {
            LuaValue::Integer(l) => Some(*l),
            LuaValue::Float(f) => clamp_float_limit(*f, st > 0),
            _ => {
                return Err(vm.error_runtime("'for' limit must be a number"));
            }
        };
        let Some(lim) = lim else {
            return Ok(false); // limit beyond any i64 in the wrong direction
        };
        let runs = if st > 0 { i0 <= lim } else { i0 >= lim };
        if !runs {
            return Ok(false);
        }
        // Trip count in unsigned space; immune to overflow.
        let count = if st > 0 {
            let span = (lim as u64).wrapping_sub(i0 as u64);
            if st == 1 { span } else { span / (st as u64) }
        } else {
            let span = (i0 as u64).wrapping_sub(lim as u64);
            let abs_step = ((-(st + 1)) as u64).wrapping_add(1);
            span / abs_step
        };
        vm.stack_set(ra + 1, LuaValue::Integer(count as i64))?;
        vm.stack_set(ra + 3, LuaValue::Integer(i0))?;
        return Ok(true);
    }

    // Float loop: all three values coerce to float or the loop is an error.
    let (Some(i0), Some(lim), Some(st)) = (init.as_number(), limit.as_number(), step.as_number())
    else {
        let which = if init.as_number().is_none() {
            "initial value"
        } else if limit.as_number().is_none() {
            "limit"
        } else {
            "step"
        };
        return Err(vm.error_runtime(format!("'for' {} must be a number", which)));
    };
    if st == 0.0 {
        return Err(vm.error_runtime("'for' step is zero"));
    }
    let runs = if st > 0.0 { i0 <= lim } else { i0 >= lim };
    if !runs {
        return Ok(false);
    }
    vm.stack_set(ra, LuaValue::Float(i0))?;
    vm.stack_set(ra + 1, LuaValue::Float(lim))?;
    vm.stack_set(ra + 2, LuaValue::Float(st))?;
    vm.stack_set(ra + 3, LuaValue::Float(i0))?;
    Ok(true)
}

/// Float limit of an integer loop, rounded toward the loop interior.
/// None when the loop cannot run at all.
fn clamp_float_limit(f: f64, ascending: bool) -> Option<i64> {
    if f.is_nan() {
        return None;
    }
    if ascending {
        if f < i64::MIN as f64 {
            return None;
        }
        if f >= -(i64::MIN as f64) {
            return Some(i64::MAX);
        }
        Some(f.floor() as i64)
    } else {
        if f >= -(i64::MIN as f64) {
            return None;
        }
        if f < i64::MIN as f64 {
            return Some(i64::MIN);
        }
        Some(f.ceil() as i64)
    }
}

/// One numeric-for iteration; true when the loop continues.
fn for_loop(vm: &mut LuaVM, ra: usize) -> LuaResult<bool> {
    match vm.stack_get(ra) {
        LuaValue::Integer(value) => {
            let count = match vm.stack_get(ra + 1) {
                LuaValue::Integer(c) => c as u64,
                _ => 0,
            };
            if count == 0 {
                return Ok(false);
            }
            let step = match vm.stack_get(ra + 2) {
                LuaValue::Integer(s) => s,
                _ => 0,
            };
            let next = value.wrapping_add(step);
            vm.stack_set(ra, LuaValue::Integer(next))?;
            vm.stack_set(ra + 1, LuaValue::Integer((count - 1) as i64))?;
            vm.stack_set(ra + 3, LuaValue::Integer(next))?;
            Ok(true)
        }
        LuaValue::Float(value) => {
            let limit = match vm.stack_get(ra + 1) {
                LuaValue::Float(l) => l,
                other => other.as_number().unwrap_or(f64::NAN),
            };
            let step = match vm.stack_get(ra + 2) {
                LuaValue::Float(s) => s,
                other => other.as_number().unwrap_or(0.0),
            };
            let next = value + step;
            let cont = if step > 0.0 { next <= limit } else { next >= limit };
            if cont {
                vm.stack_set(ra, LuaValue::Float(next))?;
                vm.stack_set(ra + 3, LuaValue::Float(next))?;
            }
            Ok(cont)
        }
        _ => Ok(false),
    }
}
