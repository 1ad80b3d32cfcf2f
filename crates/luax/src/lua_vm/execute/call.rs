// Call machinery: frame setup, `__call` resolution, host dispatch, returns,
// protected calls and unwinding.

use crate::branch::unlikely;
use crate::lua_value::LuaValue;
use crate::lua_vm::{CallFrame, LuaError, LuaResult, LuaVM, TmKind};

/// What `precall` did with the callable at `func_slot`.
pub(crate) enum Precalled {
    /// A Lua frame was pushed; the dispatch loop must (re)enter it.
    Lua,
    /// A host function ran to completion; its results are in place.
    Done,
}

/// Outcome of a protected call.
pub(crate) enum Protected {
    Ok(Vec<LuaValue>),
    Caught { kind: LuaError, error: LuaValue },
}

/// Resolves `__call` chains until the slot holds a real closure. Each step
/// inserts the callable itself as the first argument.
fn resolve_callable(vm: &mut LuaVM, func_slot: usize, nargs: usize) -> LuaResult<usize> {
    let mut nargs = nargs;
    for _ in 0..vm.options().max_meta_depth {
        let v = vm.stack_get(func_slot);
        if v.is_function() {
            return Ok(nargs);
        }
        let Some(mm) = vm.get_metamethod(&v, TmKind::Call) else {
            let tn = v.type_name();
            return Err(vm.error_runtime(format!("attempt to call a {} value", tn)));
        };
        // Shift the callable and arguments up one slot; the metamethod goes
        // in front and the old callable becomes argument 1.
        let end = func_slot + 1 + nargs;
        vm.ensure_stack(end + 1)?;
        let mut i = end;
        while i > func_slot {
            let v = vm.stack_get(i - 1);
            vm.stack_set(i, v)?;
            i -= 1;
        }
        vm.stack_set(func_slot, mm)?;
        nargs += 1;
        vm.set_top(end + 1)?;
    }
    Err(vm.error_runtime("'__call' chain too long"))
}

/// Sets up a call to the value at `func_slot` with `nargs` arguments above
/// it. Lua callees get a frame and return `Precalled::Lua`; host callees run
/// to completion here.
pub(crate) fn precall(
    vm: &mut LuaVM,
    func_slot: usize,
    nargs: usize,
    nresults: i32,
) -> LuaResult<Precalled> {
    vm.check_cancelled()?;
    let nargs = resolve_callable(vm, func_slot, nargs)?;

    let func = vm.stack_get(func_slot);
    let id = match func.as_function_id() {
        Some(id) => id,
        None => {
            let tn = func.type_name();
            return Err(vm.error_runtime(format!("attempt to call a {} value", tn)));
        }
    };

    if unlikely(vm.frames.len() >= vm.options().max_call_depth) {
        return Err(vm.error_runtime(format!(
            "stack overflow (call depth {})",
            vm.frames.len()
        )));
    }

    match vm.pool.function(id).proto().cloned() {
        Some(proto) => {
            let base = func_slot + 1;
            let nfix = proto.num_params as usize;
            let maxstack = proto.max_stack_size as usize;
            vm.ensure_stack(base + nargs.max(nfix) + maxstack)?;
            if proto.is_vararg {
                // The prologue's VarargPrep relocates the frame; until then
                // the frame window is exactly the passed arguments.
                let top = base + nargs;
                vm.set_top(top)?;
                vm.frames
                    .push(CallFrame::new_lua(func, func_slot, base, top, nresults));
            } else {
                for i in nargs..nfix {
                    vm.stack_set(base + i, LuaValue::Nil)?;
                }
                let filled = nargs.max(nfix);
                vm.set_top(base + filled)?;
                let top = base + maxstack;
                vm.frames
                    .push(CallFrame::new_lua(func, func_slot, base, top, nresults));
            }
            Ok(Precalled::Lua)
        }
        None => {
            // Host function.
            if unlikely(vm.host_depth >= vm.options().max_host_depth) {
                return Err(vm.error_runtime(format!(
                    "host stack overflow (depth {})",
                    vm.host_depth
                )));
            }
            let base = func_slot + 1;
            let top = base + nargs;
            vm.set_top(top)?;
            vm.frames
                .push(CallFrame::new_host(func.clone(), func_slot, base, top, nresults));
            vm.host_depth += 1;

            let host_fn = match vm.pool.function(id).as_host() {
                Some(h) => h.func,
                None => return Err(vm.error_runtime("attempt to call a non-host function")),
            };
            let n = host_fn(vm)?;

            // Results are the last n pushed values; move them over the
            // function slot and adjust to the requested arity.
            let res_start = vm.top.saturating_sub(n);
            for i in 0..n {
                let v = vm.stack_get(res_start + i);
                vm.stack_set(func_slot + i, v)?;
            }
            let placed = if nresults < 0 { n } else { nresults as usize };
            for i in n..placed {
                vm.stack_set(func_slot + i, LuaValue::Nil)?;
            }
            vm.set_top(func_slot + placed)?;
            vm.frames.pop();
            vm.host_depth -= 1;
            Ok(Precalled::Done)
        }
    }
}

/// Vararg frames park the original function slot below the relocated one.
pub(crate) fn original_func_slot(vm: &LuaVM, frame_idx: usize) -> usize {
    let frame = &vm.frames[frame_idx];
    if frame.n_extra_args == 0 {
        return frame.func_slot;
    }
    let nfix = frame
        .func
        .as_function_id()
        .and_then(|id| vm.pool.function(id).proto().map(|p| p.num_params as usize))
        .unwrap_or(0);
    frame.func_slot - frame.n_extra_args - nfix - 1
}

/// Closes upvalues and to-be-closed variables of the current frame at or
/// above `level`. `errobj` is the propagating error (nil for normal exits);
/// an error raised by a `__close` handler replaces it, last one wins.
pub(crate) fn close_level(
    vm: &mut LuaVM,
    level: usize,
    errobj: Option<&LuaValue>,
) -> LuaResult<()> {
    vm.close_upvalues_from(level);

    let slots: Vec<usize> = match vm.current_frame_mut() {
        Some(frame) => {
            let keep: Vec<usize> = frame.tbc.iter().copied().filter(|&s| s < level).collect();
            let close: Vec<usize> = frame.tbc.iter().copied().filter(|&s| s >= level).collect();
            frame.tbc = keep;
            close
        }
        None => Vec::new(),
    };

    let mut pending: Option<LuaError> = None;
    // Reverse declaration order.
    for &slot in slots.iter().rev() {
        let v = vm.stack_get(slot);
        if v.is_falsy() {
            continue;
        }
        let Some(mm) = vm.get_metamethod(&v, TmKind::Close) else {
            continue;
        };
        let arg = errobj.cloned().unwrap_or(LuaValue::Nil);
        match call_function(vm, mm, vec![v, arg], 0) {
            Ok(_) => {}
            Err(kind) => pending = Some(kind),
        }
    }
    match pending {
        Some(kind) => Err(kind),
        None => Ok(()),
    }
}

/// Pops frames down to `depth`, closing each frame's upvalues and running its
/// `__close` handlers with the propagating error object. Returns the error
/// kind that should continue propagating (a `__close` failure replaces it).
pub(crate) fn unwind_to(
    vm: &mut LuaVM,
    depth: usize,
    kind: LuaError,
    errobj: &LuaValue,
) -> LuaError {
    let mut kind = kind;
    while vm.frames.len() > depth {
        let (base, is_host) = {
            let frame = &vm.frames[vm.frames.len() - 1];
            (frame.base, frame.is_host)
        };
        if let Err(newkind) = close_level(vm, base, Some(errobj)) {
            kind = newkind;
        }
        vm.frames.pop();
        if is_host {
            vm.host_depth = vm.host_depth.saturating_sub(1);
        }
    }
    kind
}

/// Calls `f` with `args`, leaving error unwinding to the caller. Used by
/// `protected_call` so the message handler can run before frames settle.
fn raw_call(
    vm: &mut LuaVM,
    f: LuaValue,
    args: Vec<LuaValue>,
    nresults: i32,
) -> LuaResult<Vec<LuaValue>> {
    let entry_depth = vm.frames.len();
    let func_slot = vm.top;
    let nargs = args.len();
    vm.ensure_stack(func_slot + 1 + nargs)?;
    vm.push_value(f)?;
    for a in args {
        vm.push_value(a)?;
    }
    match precall(vm, func_slot, nargs, nresults)? {
        Precalled::Lua => super::lua_execute(vm, entry_depth)?,
        Precalled::Done => {}
    }
    let end = vm.top.max(func_slot);
    let mut results = Vec::with_capacity(end - func_slot);
    for i in func_slot..end {
        results.push(vm.stack_get(i));
    }
    vm.set_top(func_slot)?;
    if nresults >= 0 {
        results.resize(nresults as usize, LuaValue::Nil);
    }
    Ok(results)
}

/// Unprotected call. Errors unwind the frames this call created (running
/// `__close` handlers along the way) and then propagate to the caller with
/// the error object still pending in the VM.
pub(crate) fn call_function(
    vm: &mut LuaVM,
    f: LuaValue,
    args: Vec<LuaValue>,
    nresults: i32,
) -> LuaResult<Vec<LuaValue>> {
    let entry_depth = vm.frames.len();
    let entry_top = vm.top;
    match raw_call(vm, f, args, nresults) {
        Ok(r) => Ok(r),
        Err(kind) => {
            let errobj = vm.take_error_value();
            let kind = unwind_to(vm, entry_depth, kind, &errobj);
            // unwind_to may have replaced the error object via a __close
            // failure; keep whichever is now pending, else restore.
            if vm.error_value.is_nil() {
                vm.error_value = errobj;
            }
            let _ = vm.set_top(entry_top);
            Err(kind)
        }
    }
}

/// Protected call with an optional message handler (spec'd recovery point).
///
/// The handler runs in the caller's context with the error object as its
/// single argument, before the failed frames are unwound; its return value
/// replaces the error. A failing handler replaces the outcome with the
/// distinct `Handler` kind.
pub(crate) fn protected_call(
    vm: &mut LuaVM,
    f: LuaValue,
    args: Vec<LuaValue>,
    handler: Option<LuaValue>,
) -> Protected {
    let entry_depth = vm.frames.len();
    let entry_top = vm.top;
    match raw_call(vm, f, args, -1) {
        Ok(results) => Protected::Ok(results),
        Err(kind) => {
            let original = vm.take_error_value();
            let (kind, error) = match handler {
                Some(h) => match call_function(vm, h, vec![original.clone()], 1) {
                    Ok(replaced) => (
                        kind,
                        replaced.into_iter().next().unwrap_or(LuaValue::Nil),
                    ),
                    Err(_) => {
                        let _ = vm.take_error_value();
                        let msg = vm.new_string("error in error handling");
                        (LuaError::Handler, msg)
                    }
                },
                None => (kind, original.clone()),
            };
            let kind = unwind_to(vm, entry_depth, kind, &original);
            let _ = vm.take_error_value();
            let _ = vm.set_top(entry_top);
            Protected::Caught { kind, error }
        }
    }
}

/// Marks `slot` to-be-closed in the current frame (the `Tbc` opcode and
/// `TForPrep`'s closing slot). Nil and false are ignored; anything else must
/// have a `__close` metamethod.
pub(crate) fn mark_tbc(vm: &mut LuaVM, slot: usize) -> LuaResult<()> {
    let v = vm.stack_get(slot);
    if v.is_falsy() {
        return Ok(());
    }
    if vm.get_metamethod(&v, TmKind::Close).is_none() {
        let tn = v.type_name();
        return Err(vm.error_runtime(format!(
            "variable of type {} got a non-closable value",
            tn
        )));
    }
    if let Some(frame) = vm.current_frame_mut() {
        frame.tbc.push(slot);
    }
    Ok(())
}

/// Copies `n` return values from `first` down over the frame's (original)
/// function slot and pops the frame. Returns nothing; the dispatch loop
/// resumes the caller.
pub(crate) fn do_return(vm: &mut LuaVM, n: usize, first: usize) -> LuaResult<()> {
    let frame_idx = vm.frames.len() - 1;
    let (base, frame_top, wanted) = {
        let f = &vm.frames[frame_idx];
        (f.base, f.top, f.nresults)
    };
    // Keep live registers below the working top while __close handlers run.
    let protect = frame_top.max(first + n);
    vm.set_top(protect)?;
    close_level(vm, base, None)?;

    let dest = original_func_slot(vm, frame_idx);
    for i in 0..n {
        let v = vm.stack_get(first + i);
        vm.stack_set(dest + i, v)?;
    }
    let placed = if wanted < 0 { n } else { wanted as usize };
    for i in n..placed {
        vm.stack_set(dest + i, LuaValue::Nil)?;
    }
    vm.set_top(dest + placed)?;
    vm.frames.pop();
    Ok(())
}

/// Relocates a vararg frame: the function value and fixed parameters move
/// above the supplied arguments, which stay parked as the vararg window.
pub(crate) fn adjust_varargs(vm: &mut LuaVM, nfix: usize, maxstack: usize) -> LuaResult<()> {
    let frame_idx = vm.frames.len() - 1;
    let (old_func, old_base) = {
        let f = &vm.frames[frame_idx];
        (f.func_slot, f.base)
    };
    let nargs = vm.top.saturating_sub(old_base);
    let nextra = nargs.saturating_sub(nfix);

    let new_func = old_func + 1 + nargs;
    let new_base = new_func + 1;
    vm.ensure_stack(new_base + maxstack)?;

    let func_value = vm.frames[frame_idx].func.clone();
    vm.stack_set(new_func, func_value)?;
    for i in 0..nfix {
        let v = if i < nargs {
            let v = vm.stack_get(old_base + i);
            // Erase the original so the vararg window holds only extras.
            vm.stack_set(old_base + i, LuaValue::Nil)?;
            v
        } else {
            LuaValue::Nil
        };
        vm.stack_set(new_base + i, v)?;
    }

    let frame = &mut vm.frames[frame_idx];
    frame.func_slot = new_func;
    frame.base = new_base;
    frame.n_extra_args = nextra;
    frame.top = new_base + maxstack;
    vm.set_top(new_base + nfix)?;
    Ok(())
}
