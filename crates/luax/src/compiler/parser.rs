// Recursive-descent parser and statement compiler.
//
// One `FuncState` per function being compiled, stacked for nesting; name
// resolution walks the stack creating upvalue descriptors on the way in.
// Statements reset the register allocator to the active-local level, so
// temporaries never leak across statements.

use smol_str::SmolStr;

use super::code;
use super::expdesc::{BinOp, ExpDesc, ExpKind, UNARY_PRIORITY, UnOp};
use super::func_state::{ActiveVar, BlockCnt, FuncState, GotoDesc, LabelDesc, VarAttrib, attrib_code};
use super::lexer::Lexer;
use super::token::Token;
use crate::lua_value::{LocVar, LuaValue, Proto, UpvalueDesc};
use crate::lua_vm::opcode::instruction::{self as ifields, NO_JUMP};
use crate::lua_vm::{Instruction, LuaVM, OpCode};
use std::rc::Rc;

/// Array-part flush threshold in table constructors.
const FIELDS_PER_FLUSH: usize = 50;

pub fn parse_chunk(vm: &mut LuaVM, source: &[u8], chunk_name: &str) -> Result<Proto, String> {
    let mut p = Parser::new(vm, source, chunk_name)?;
    p.main_chunk()
}

struct Parser<'a, 'v> {
    lexer: Lexer<'a>,
    vm: &'v mut LuaVM,
    chunk_name: String,
    tok: Token,
    tok_line: u32,
    ahead: Option<(Token, u32)>,
    fstack: Vec<FuncState>,
}

impl<'a, 'v> Parser<'a, 'v> {
    fn new(vm: &'v mut LuaVM, source: &'a [u8], chunk_name: &str) -> Result<Self, String> {
        let mut lexer = Lexer::new(source);
        let (tok, tok_line) = lexer.next_token().map_err(|e| {
            format!("{}:{}: {}", chunk_name, e.line, e.msg)
        })?;
        Ok(Parser {
            lexer,
            vm,
            chunk_name: chunk_name.to_string(),
            tok,
            tok_line,
            ahead: None,
            fstack: Vec::new(),
        })
    }

    // ----- token plumbing -----

    fn error(&self, msg: impl Into<String>) -> String {
        format!("{}:{}: {}", self.chunk_name, self.tok_line, msg.into())
    }

    fn error_near(&self, msg: impl Into<String>) -> String {
        format!(
            "{}:{}: {} near {}",
            self.chunk_name,
            self.tok_line,
            msg.into(),
            self.tok.describe()
        )
    }

    fn next(&mut self) -> Result<(), String> {
        let (tok, line) = match self.ahead.take() {
            Some(pair) => pair,
            None => self
                .lexer
                .next_token()
                .map_err(|e| format!("{}:{}: {}", self.chunk_name, e.line, e.msg))?,
        };
        self.tok = tok;
        self.tok_line = line;
        Ok(())
    }

    fn peek_ahead(&mut self) -> Result<Token, String> {
        if self.ahead.is_none() {
            let pair = self
                .lexer
                .next_token()
                .map_err(|e| format!("{}:{}: {}", self.chunk_name, e.line, e.msg))?;
            self.ahead = Some(pair);
        }
        Ok(self
            .ahead
            .as_ref()
            .map(|(t, _)| t.clone())
            .unwrap_or(Token::Eof))
    }

    fn check(&mut self, t: Token) -> Result<(), String> {
        if self.tok == t {
            self.next()
        } else {
            Err(self.error_near(format!("{} expected", t.describe())))
        }
    }

    fn test_next(&mut self, t: Token) -> Result<bool, String> {
        if self.tok == t {
            self.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn check_match(&mut self, what: Token, who: Token, line: u32) -> Result<(), String> {
        if self.tok == what {
            self.next()
        } else if line == self.tok_line {
            Err(self.error_near(format!("{} expected", what.describe())))
        } else {
            Err(self.error_near(format!(
                "{} expected (to close {} at line {})",
                what.describe(),
                who.describe(),
                line
            )))
        }
    }

    fn check_name(&mut self) -> Result<SmolStr, String> {
        match &self.tok {
            Token::Name(n) => {
                let n = n.clone();
                self.next()?;
                Ok(n)
            }
            _ => Err(self.error_near("<name> expected")),
        }
    }

    fn fs(&mut self) -> &mut FuncState {
        self.fstack.last_mut().expect("no active function state")
    }

    fn fs_ref(&self) -> &FuncState {
        self.fstack.last().expect("no active function state")
    }

    fn sync_line(&mut self) {
        let line = self.tok_line;
        self.fs().line = line;
    }

    // ----- entry -----

    fn main_chunk(&mut self) -> Result<Proto, String> {
        let mut fs = FuncState::new(Some(self.chunk_name.clone()), 0);
        fs.proto.is_vararg = true;
        // The main chunk closes over _ENV as its only upvalue.
        fs.proto.upvalues.push(UpvalueDesc {
            name: SmolStr::new("_ENV"),
            in_stack: true,
            index: 0,
            kind: 0,
        });
        self.fstack.push(fs);
        self.enter_block(false);
        code::emit_abc(self.fs(), OpCode::VarargPrep, 0, 0, 0);

        self.stat_list()?;
        if self.tok != Token::Eof {
            return Err(self.error_near("'<eof>' expected"));
        }
        let proto = self.close_function()?;
        log::debug!(
            "compiled chunk '{}': {} instructions, {} constants",
            self.chunk_name,
            proto.code.len(),
            proto.constants.len()
        );
        Ok(proto)
    }

    /// Finishes the current function: implicit return, gotos check, final
    /// return fixups.
    fn close_function(&mut self) -> Result<Proto, String> {
        let nvar = self.fs_ref().nvar_regs();
        let line = self.tok_line;
        self.fs().line = line;
        code::code_return(self.fs(), nvar, 0);
        self.leave_block()?;
        if let Some(g) = self.fs_ref().gotos.first() {
            return Err(format!(
                "{}:{}: no visible label '{}' for goto",
                self.chunk_name, g.line, g.name
            ));
        }
        code::finish_function(self.fs());
        let mut fs = self.fstack.pop().expect("function stack underflow");
        fs.proto.last_line_defined = line;
        Ok(fs.proto)
    }

    // ----- blocks, scopes, locals -----

    fn enter_block(&mut self, is_loop: bool) {
        let fs = self.fs();
        let prev = fs.block.take();
        let inside_tbc = prev.as_ref().map(|b| b.inside_tbc).unwrap_or(false);
        let bl = BlockCnt {
            first_label: fs.labels.len(),
            first_goto: fs.gotos.len(),
            nactvar: fs.nactive,
            free_reg: fs.free_reg,
            upval: false,
            is_loop,
            inside_tbc,
            prev,
        };
        fs.block = Some(Box::new(bl));
    }

    fn leave_block(&mut self) -> Result<(), String> {
        let (first_label, first_goto, nactvar, free_reg, upval, is_loop) = {
            let fs = self.fs_ref();
            let bl = fs.block.as_ref().expect("no block to leave");
            (
                bl.first_label,
                bl.first_goto,
                bl.nactvar,
                bl.free_reg,
                bl.upval,
                bl.is_loop,
            )
        };

        self.remove_vars(nactvar);
        let stklevel = free_reg;

        let mut has_close = false;
        if is_loop {
            has_close = self.create_label(SmolStr::new("break"), false)?;
        }

        let is_nested = {
            let fs = self.fs_ref();
            fs.block.as_ref().and_then(|b| b.prev.as_ref()).is_some()
        };
        if !has_close && is_nested && upval {
            code::emit_abc(self.fs(), OpCode::Close, stklevel, 0, 0);
        }

        let fs = self.fs();
        fs.free_reg = stklevel;
        fs.labels.truncate(first_label);
        let prev = fs.block.take().expect("no block to leave").prev;
        fs.block = prev;

        // Pending gotos move out to the enclosing block, remembering whether
        // they crossed a scope with captured locals.
        if upval {
            let fs = self.fs();
            for g in fs.gotos.iter_mut().skip(first_goto) {
                g.close = true;
            }
        }
        // Cap goto levels at the block boundary: their locals are gone.
        let level = stklevel;
        let fs = self.fs();
        for g in fs.gotos.iter_mut().skip(first_goto) {
            if g.nact_regs > level {
                g.nact_regs = level;
            }
        }
        Ok(())
    }

    fn remove_vars(&mut self, to_level: usize) {
        let pc = self.fs_ref().proto.code.len() as u32;
        let fs = self.fs();
        while fs.actvar.len() > to_level {
            if let Some(var) = fs.actvar.pop() {
                if var.in_register() {
                    fs.proto.loc_vars.push(LocVar {
                        name: var.name,
                        start_pc: var.start_pc,
                        end_pc: pc,
                    });
                }
            }
        }
        fs.nactive = fs.nactive.min(to_level);
    }

    fn new_local(&mut self, name: SmolStr, attrib: VarAttrib) {
        let fs = self.fs();
        fs.actvar.push(ActiveVar {
            name,
            attrib,
            reg: 0,
            k_value: None,
            start_pc: 0,
        });
    }

    /// Brings the next `n` pending locals into scope, binding them to the
    /// registers after the current variable level.
    fn adjust_local_vars(&mut self, n: usize) {
        let pc = self.fs_ref().proto.code.len() as u32;
        let base = self.fs_ref().nvar_regs();
        let fs = self.fs();
        let start = fs.nactive;
        let mut reg = base;
        for var in fs.actvar[start..start + n].iter_mut() {
            var.reg = reg;
            var.start_pc = pc;
            reg += 1;
        }
        fs.nactive += n;
    }

    // ----- name resolution -----

    fn const_kind(v: &LuaValue) -> ExpKind {
        match v {
            LuaValue::Nil => ExpKind::Nil,
            LuaValue::Boolean(true) => ExpKind::True,
            LuaValue::Boolean(false) => ExpKind::False,
            LuaValue::Integer(i) => ExpKind::KInt(*i),
            LuaValue::Float(f) => ExpKind::KFlt(*f),
            LuaValue::String(s) => ExpKind::KStr(s.clone()),
            _ => ExpKind::Nil,
        }
    }

    /// Resolves `name` at function nesting `level`, creating upvalues along
    /// the chain. Returns `None` for a global.
    fn resolve_name(&mut self, level: usize, name: &str) -> Option<ExpKind> {
        if let Some(vidx) = self.fstack[level].search_var(name) {
            let var = &self.fstack[level].actvar[vidx];
            if let Some(kv) = &var.k_value {
                return Some(Self::const_kind(kv));
            }
            return Some(ExpKind::Local(var.reg));
        }
        if let Some(uidx) = self.fstack[level]
            .proto
            .upvalues
            .iter()
            .position(|u| u.name.as_str() == name)
        {
            return Some(ExpKind::Upval(uidx as u32));
        }
        if level == 0 {
            return None;
        }
        let outer = self.resolve_name(level - 1, name)?;
        let desc = match outer {
            ExpKind::Local(reg) => {
                // Captured parent local: its declaring block must close it.
                let attrib = self.fstack[level - 1]
                    .actvar
                    .iter()
                    .rev()
                    .find(|v| v.in_register() && v.reg == reg)
                    .map(|v| v.attrib)
                    .unwrap_or(VarAttrib::Regular);
                self.fstack[level - 1].mark_upval_block(reg);
                UpvalueDesc {
                    name: SmolStr::new(name),
                    in_stack: true,
                    index: reg as u8,
                    kind: attrib_code(attrib),
                }
            }
            ExpKind::Upval(idx) => UpvalueDesc {
                name: SmolStr::new(name),
                in_stack: false,
                index: idx as u8,
                kind: 0,
            },
            // Compile-time constants cross function boundaries freely.
            k => return Some(k),
        };
        let uidx = self.fstack[level].proto.upvalues.len() as u32;
        self.fstack[level].proto.upvalues.push(desc);
        Some(ExpKind::Upval(uidx))
    }

    fn single_var(&mut self, name: &str) -> Result<ExpDesc, String> {
        let level = self.fstack.len() - 1;
        if let Some(kind) = self.resolve_name(level, name) {
            return Ok(ExpDesc::new(kind));
        }
        // Global: _ENV[name]. _ENV always resolves (upvalue 0 of the chunk).
        let env_kind = self
            .resolve_name(level, "_ENV")
            .ok_or_else(|| self.error("'_ENV' is not visible"))?;
        let mut env = ExpDesc::new(env_kind);
        let s = self.vm.strings.intern(name.as_bytes());
        let mut key = ExpDesc::new(ExpKind::KStr(s));
        code::indexed(self.fs(), &mut env, &mut key).map_err(|e| self.error(e))?;
        Ok(env)
    }

    // ----- gotos and labels -----

    /// Declares a label here; resolves pending gotos of the current block.
    /// Returns true when it emitted a CLOSE.
    fn create_label(&mut self, name: SmolStr, is_last: bool) -> Result<bool, String> {
        let nact = if is_last {
            // A label at the end of a block ignores the block's dying locals.
            let fs = self.fs_ref();
            fs.block
                .as_ref()
                .map(|b| b.free_reg)
                .unwrap_or_else(|| fs.nvar_regs())
        } else {
            self.fs_ref().nvar_regs()
        };
        let pc = code::get_label(self.fs());
        let first_goto = self
            .fs_ref()
            .block
            .as_ref()
            .map(|b| b.first_goto)
            .unwrap_or(0);

        let mut needs_close = false;
        let mut solved = Vec::new();
        {
            let fs = self.fs_ref();
            for (i, g) in fs.gotos.iter().enumerate().skip(first_goto) {
                if g.name == name {
                    if nact > g.nact_regs {
                        return Err(format!(
                            "{}:{}: <goto {}> jumps into the scope of a local",
                            self.chunk_name, g.line, g.name
                        ));
                    }
                    needs_close = needs_close || g.close;
                    solved.push(i);
                }
            }
        }
        for &i in solved.iter().rev() {
            let g = self.fs().gotos.remove(i);
            code::patch_list(self.fs(), g.pc, pc).map_err(|e| self.error(e))?;
        }

        let block_upval = self
            .fs_ref()
            .block
            .as_ref()
            .map(|b| b.upval)
            .unwrap_or(false);
        let emitted = if needs_close || (name.as_str() == "break" && block_upval) {
            let level = nact;
            code::emit_abc(self.fs(), OpCode::Close, level, 0, 0);
            true
        } else {
            false
        };

        if name.as_str() != "break" {
            let fs = self.fs();
            fs.labels.push(LabelDesc {
                name,
                pc,
                nact_regs: nact,
            });
        }
        Ok(emitted)
    }

    fn goto_stat(&mut self, name: SmolStr, line: u32) -> Result<(), String> {
        // Backward goto: the label is already visible.
        let target = self
            .fs_ref()
            .labels
            .iter()
            .rev()
            .find(|l| l.name == name)
            .map(|l| (l.pc, l.nact_regs));
        let nact = self.fs_ref().nvar_regs();
        if let Some((pc, label_level)) = target {
            if self.fs_ref().needs_close && label_level < nact {
                code::emit_abc(self.fs(), OpCode::Close, label_level, 0, 0);
            }
            let j = code::jump(self.fs());
            code::patch_list(self.fs(), j, pc).map_err(|e| self.error(e))?;
            return Ok(());
        }
        // Forward goto: pending until its label (or an enclosing block) shows
        // up.
        let j = code::jump(self.fs());
        self.fs().gotos.push(GotoDesc {
            name,
            pc: j,
            line,
            nact_regs: nact,
            close: false,
        });
        Ok(())
    }

    // ----- statements -----

    fn stat_list(&mut self) -> Result<(), String> {
        while !self.block_follow(true) {
            if self.tok == Token::Return {
                self.ret_stat()?;
                return Ok(());
            }
            self.statement()?;
        }
        Ok(())
    }

    fn block_follow(&self, with_until: bool) -> bool {
        matches!(
            self.tok,
            Token::Else | Token::Elseif | Token::End | Token::Eof
        ) || (with_until && self.tok == Token::Until)
    }

    fn statement(&mut self) -> Result<(), String> {
        self.sync_line();
        let line = self.tok_line;
        match &self.tok {
            Token::Semi => self.next()?,
            Token::If => self.if_stat(line)?,
            Token::While => self.while_stat(line)?,
            Token::Do => {
                self.next()?;
                self.block()?;
                self.check_match(Token::End, Token::Do, line)?;
            }
            Token::For => self.for_stat(line)?,
            Token::Repeat => self.repeat_stat(line)?,
            Token::Function => self.func_stat(line)?,
            Token::Local => {
                self.next()?;
                if self.test_next(Token::Function)? {
                    self.local_func_stat()?;
                } else {
                    self.local_stat()?;
                }
            }
            Token::DColon => {
                self.next()?;
                let name = self.check_name()?;
                self.check(Token::DColon)?;
                // Trailing labels bind at the block level.
                let is_last = self.block_follow(false) || self.tok == Token::Until;
                self.check_label_unique(&name)?;
                self.create_label(name, is_last)?;
            }
            Token::Break => {
                self.next()?;
                self.goto_stat(SmolStr::new("break"), line)?;
            }
            Token::Goto => {
                self.next()?;
                let name = self.check_name()?;
                self.goto_stat(name, line)?;
            }
            _ => self.expr_stat()?,
        }
        // Temporaries die with the statement.
        let nvar = self.fs_ref().nvar_regs();
        self.fs().free_reg = nvar;
        Ok(())
    }

    fn check_label_unique(&self, name: &str) -> Result<(), String> {
        let fs = self.fs_ref();
        let first = fs.block.as_ref().map(|b| b.first_label).unwrap_or(0);
        if fs.labels[first..].iter().any(|l| l.name.as_str() == name) {
            return Err(self.error(format!("label '{}' already defined", name)));
        }
        Ok(())
    }

    fn block(&mut self) -> Result<(), String> {
        self.enter_block(false);
        self.stat_list()?;
        self.leave_block()
    }

    /// `exp` as a condition; returns the false-exit jump list.
    fn cond(&mut self) -> Result<i32, String> {
        let mut v = self.expression()?;
        if matches!(v.kind, ExpKind::Nil) {
            v.kind = ExpKind::False;
        }
        code::go_if_true(self.fs(), &mut v).map_err(|e| self.error(e))?;
        Ok(v.f)
    }

    fn if_stat(&mut self, line: u32) -> Result<(), String> {
        let mut escape = NO_JUMP;
        self.test_then_block(&mut escape)?;
        while self.tok == Token::Elseif {
            self.test_then_block(&mut escape)?;
        }
        if self.test_next(Token::Else)? {
            self.block()?;
        }
        self.check_match(Token::End, Token::If, line)?;
        code::patch_to_here(self.fs(), escape).map_err(|e| self.error(e))?;
        Ok(())
    }

    fn test_then_block(&mut self, escape: &mut i32) -> Result<(), String> {
        self.next()?; // skip 'if' or 'elseif'
        let false_exit = self.cond()?;
        self.check(Token::Then)?;
        self.block()?;
        if matches!(self.tok, Token::Else | Token::Elseif) {
            let j = code::jump(self.fs());
            code::concat_list(self.fs(), escape, j).map_err(|e| self.error(e))?;
        }
        code::patch_to_here(self.fs(), false_exit).map_err(|e| self.error(e))?;
        Ok(())
    }

    fn while_stat(&mut self, line: u32) -> Result<(), String> {
        self.next()?;
        let start = code::get_label(self.fs());
        let exit = self.cond()?;
        self.enter_block(true);
        self.check(Token::Do)?;
        self.block()?;
        let back = code::jump(self.fs());
        code::patch_list(self.fs(), back, start).map_err(|e| self.error(e))?;
        self.check_match(Token::End, Token::While, line)?;
        self.leave_block()?;
        code::patch_to_here(self.fs(), exit).map_err(|e| self.error(e))?;
        Ok(())
    }

    fn repeat_stat(&mut self, line: u32) -> Result<(), String> {
        self.next()?;
        let start = code::get_label(self.fs());
        self.enter_block(true); // loop block
        self.enter_block(false); // scope block: locals reach the condition
        self.stat_list()?;
        self.check_match(Token::Until, Token::Repeat, line)?;
        let mut condexit = self.cond()?;
        let (scope_upval, scope_level) = {
            let bl = self.fs_ref().block.as_ref().expect("repeat scope block");
            (bl.upval, bl.free_reg)
        };
        self.leave_block()?; // scope (emits CLOSE on the fallthrough path)
        if scope_upval {
            // Looping back re-enters the scope: close this iteration's
            // upvalues on the way around.
            let exit = code::jump(self.fs());
            code::patch_to_here(self.fs(), condexit).map_err(|e| self.error(e))?;
            code::emit_abc(self.fs(), OpCode::Close, scope_level, 0, 0);
            condexit = code::jump(self.fs());
            code::patch_to_here(self.fs(), exit).map_err(|e| self.error(e))?;
        }
        code::patch_list(self.fs(), condexit, start).map_err(|e| self.error(e))?;
        self.leave_block()?; // loop
        Ok(())
    }

    fn for_stat(&mut self, line: u32) -> Result<(), String> {
        self.next()?;
        self.enter_block(true);
        let name = self.check_name()?;
        match &self.tok {
            Token::Assign => self.for_num(name, line)?,
            Token::Comma | Token::In => self.for_list(name, line)?,
            _ => return Err(self.error_near("'=' or 'in' expected")),
        }
        self.leave_block()?;
        Ok(())
    }

    fn for_num(&mut self, varname: SmolStr, line: u32) -> Result<(), String> {
        let base = self.fs_ref().free_reg;
        self.new_local(SmolStr::new("(for state)"), VarAttrib::Regular);
        self.new_local(SmolStr::new("(for state)"), VarAttrib::Regular);
        self.new_local(SmolStr::new("(for state)"), VarAttrib::Regular);
        self.new_local(varname, VarAttrib::Regular);

        self.next()?; // skip '='
        let mut e = self.expression()?;
        code::exp2nextreg(self.fs(), &mut e).map_err(|er| self.error(er))?;
        self.check(Token::Comma)?;
        let mut e = self.expression()?;
        code::exp2nextreg(self.fs(), &mut e).map_err(|er| self.error(er))?;
        if self.test_next(Token::Comma)? {
            let mut e = self.expression()?;
            code::exp2nextreg(self.fs(), &mut e).map_err(|er| self.error(er))?;
        } else {
            let mut one = ExpDesc::new(ExpKind::KInt(1));
            code::exp2nextreg(self.fs(), &mut one).map_err(|er| self.error(er))?;
        }
        self.adjust_local_vars(3);
        self.for_body(base, line, 1, false)
    }

    fn for_list(&mut self, first_name: SmolStr, line: u32) -> Result<(), String> {
        let base = self.fs_ref().free_reg;
        self.new_local(SmolStr::new("(for state)"), VarAttrib::Regular);
        self.new_local(SmolStr::new("(for state)"), VarAttrib::Regular);
        self.new_local(SmolStr::new("(for state)"), VarAttrib::Regular);
        self.new_local(SmolStr::new("(for state)"), VarAttrib::Regular);
        let mut nvars = 1usize;
        self.new_local(first_name, VarAttrib::Regular);
        while self.test_next(Token::Comma)? {
            let name = self.check_name()?;
            self.new_local(name, VarAttrib::Regular);
            nvars += 1;
        }
        self.check(Token::In)?;
        let (nexps, mut e) = self.exp_list()?;
        self.adjust_assign(4, nexps, &mut e)?;
        self.adjust_local_vars(4);
        // The closing state value must be closed when the loop exits.
        self.mark_to_be_closed();
        // Extra stack for the call frame the iterator needs.
        code::check_stack(self.fs(), 3).map_err(|er| self.error(er))?;
        self.for_body(base, line, nvars, true)
    }

    fn for_body(&mut self, base: u32, line: u32, nvars: usize, is_gen: bool) -> Result<(), String> {
        self.check(Token::Do)?;
        let prep = if is_gen {
            code::emit_abx(self.fs(), OpCode::TForPrep, base, 0)
        } else {
            code::emit_abx(self.fs(), OpCode::ForPrep, base, 0)
        };
        self.enter_block(false);
        self.adjust_local_vars(nvars);
        code::reserve_regs(self.fs(), nvars as u32).map_err(|er| self.error(er))?;
        self.block()?;
        self.leave_block()?;

        // Patch the prep jump to land just past the body.
        let here = code::get_label(self.fs());
        let bx_prep = (here - prep - 1) as u32;
        Instruction::set_bx(&mut self.fs().proto.code[prep as usize], bx_prep);

        let endfor = if is_gen {
            self.fs().line = line;
            code::emit_abc(self.fs(), OpCode::TForCall, base, 0, nvars as u32);
            let endfor = code::emit_abx(self.fs(), OpCode::TForLoop, base + 2, 0);
            let bx = (endfor + 1 - (prep + 1)) as u32;
            Instruction::set_bx(&mut self.fs().proto.code[endfor as usize], bx);
            endfor
        } else {
            let endfor = code::emit_abx(self.fs(), OpCode::ForLoop, base, 0);
            let bx = (endfor - prep) as u32;
            Instruction::set_bx(&mut self.fs().proto.code[endfor as usize], bx);
            endfor
        };
        let _ = endfor;
        self.check_match(Token::End, Token::For, line)?;
        Ok(())
    }

    fn local_func_stat(&mut self) -> Result<(), String> {
        let name = self.check_name()?;
        self.new_local(name, VarAttrib::Regular);
        // The local is active inside its own body (recursion).
        code::reserve_regs(self.fs(), 1).map_err(|e| self.error(e))?;
        self.adjust_local_vars(1);
        let mut body = self.func_body(false, self.tok_line)?;
        // Store the closure into the local's register.
        let reg = {
            let fs = self.fs_ref();
            fs.actvar.last().map(|v| v.reg).unwrap_or(0)
        };
        code::exp2reg(self.fs(), &mut body, reg).map_err(|e| self.error(e))?;
        Ok(())
    }

    fn local_stat(&mut self) -> Result<(), String> {
        let mut nvars = 0usize;
        let mut to_close: Option<usize> = None;
        loop {
            let name = self.check_name()?;
            let attrib = self.local_attrib()?;
            if attrib == VarAttrib::Close {
                if to_close.is_some() {
                    return Err(self.error("multiple to-be-closed variables in local list"));
                }
                to_close = Some(nvars);
            }
            self.new_local(name, attrib);
            nvars += 1;
            if !self.test_next(Token::Comma)? {
                break;
            }
        }
        let (nexps, mut e) = if self.test_next(Token::Assign)? {
            self.exp_list()?
        } else {
            (0, ExpDesc::void())
        };

        // A single <const> with a constant initializer never touches a
        // register.
        let last_is_const = {
            let fs = self.fs_ref();
            fs.actvar.last().map(|v| v.attrib == VarAttrib::Const).unwrap_or(false)
        };
        if nvars == nexps && last_is_const && e.is_constant() {
            let value = match &e.kind {
                ExpKind::Nil => LuaValue::Nil,
                ExpKind::True => LuaValue::Boolean(true),
                ExpKind::False => LuaValue::Boolean(false),
                ExpKind::KInt(i) => LuaValue::Integer(*i),
                ExpKind::KFlt(f) => LuaValue::Float(*f),
                ExpKind::KStr(s) => LuaValue::String(s.clone()),
                _ => LuaValue::Nil,
            };
            let fs = self.fs();
            if let Some(var) = fs.actvar.last_mut() {
                var.k_value = Some(value);
            }
            self.adjust_local_vars(nvars - 1);
            // The constant itself enters scope without a register.
            self.fs().nactive += 1;
            return Ok(());
        }

        self.adjust_assign(nvars, nexps, &mut e)?;
        self.adjust_local_vars(nvars);

        if let Some(idx) = to_close {
            let fs = self.fs_ref();
            let reg = fs.actvar[fs.actvar.len() - nvars + idx].reg;
            self.mark_to_be_closed();
            code::emit_abc(self.fs(), OpCode::Tbc, reg, 0, 0);
        }
        Ok(())
    }

    /// A to-be-closed variable lives here: the block must emit CLOSE on
    /// every exit, and returns must carry the close flag.
    fn mark_to_be_closed(&mut self) {
        let fs = self.fs();
        fs.needs_close = true;
        if let Some(b) = fs.block.as_mut() {
            b.inside_tbc = true;
            b.upval = true;
        }
    }

    fn local_attrib(&mut self) -> Result<VarAttrib, String> {
        if !self.test_next(Token::Lt)? {
            return Ok(VarAttrib::Regular);
        }
        let name = self.check_name()?;
        let attrib = match name.as_str() {
            "const" => VarAttrib::Const,
            "close" => VarAttrib::Close,
            other => return Err(self.error(format!("unknown attribute '{}'", other))),
        };
        self.check(Token::Gt)?;
        Ok(attrib)
    }

    fn func_stat(&mut self, line: u32) -> Result<(), String> {
        self.next()?;
        // funcname: Name {'.' Name} [':' Name]
        let name = self.check_name()?;
        let mut var = self.single_var(name.as_str())?;
        let mut is_method = false;
        loop {
            match &self.tok {
                Token::Dot => {
                    self.next()?;
                    let field = self.check_name()?;
                    let s = self.vm.strings.intern(field.as_bytes());
                    let mut key = ExpDesc::new(ExpKind::KStr(s));
                    code::indexed(self.fs(), &mut var, &mut key).map_err(|e| self.error(e))?;
                }
                Token::Colon => {
                    self.next()?;
                    let field = self.check_name()?;
                    let s = self.vm.strings.intern(field.as_bytes());
                    let mut key = ExpDesc::new(ExpKind::KStr(s));
                    code::indexed(self.fs(), &mut var, &mut key).map_err(|e| self.error(e))?;
                    is_method = true;
                    break;
                }
                _ => break,
            }
        }
        let mut body = self.func_body(is_method, line)?;
        code::store_var(self.fs(), &var, &mut body).map_err(|e| self.error(e))?;
        Ok(())
    }

    fn func_body(&mut self, is_method: bool, line: u32) -> Result<ExpDesc, String> {
        let fs = FuncState::new(Some(self.chunk_name.clone()), line);
        self.fstack.push(fs);
        self.enter_block(false);

        self.check(Token::LParen)?;
        if is_method {
            self.new_local(SmolStr::new("self"), VarAttrib::Regular);
            code::reserve_regs(self.fs(), 1).map_err(|e| self.error(e))?;
            self.adjust_local_vars(1);
        }
        let mut nparams = if is_method { 1u8 } else { 0u8 };
        let mut is_vararg = false;
        if self.tok != Token::RParen {
            loop {
                match &self.tok {
                    Token::Name(n) => {
                        let n = n.clone();
                        self.next()?;
                        self.new_local(n, VarAttrib::Regular);
                        code::reserve_regs(self.fs(), 1).map_err(|e| self.error(e))?;
                        self.adjust_local_vars(1);
                        nparams += 1;
                    }
                    Token::Dots => {
                        self.next()?;
                        is_vararg = true;
                    }
                    _ => return Err(self.error_near("<name> or '...' expected")),
                }
                if is_vararg || !self.test_next(Token::Comma)? {
                    break;
                }
            }
        }
        self.check(Token::RParen)?;
        {
            let fs = self.fs();
            fs.proto.num_params = nparams;
            fs.proto.is_vararg = is_vararg;
        }
        if is_vararg {
            code::emit_abc(self.fs(), OpCode::VarargPrep, nparams as u32, 0, 0);
        }

        self.stat_list()?;
        let child = self.close_function()?;
        self.check_match(Token::End, Token::Function, line)?;

        // Register the child prototype and emit CLOSURE in the parent.
        let fs = self.fs();
        let idx = fs.proto.protos.len() as u32;
        fs.proto.protos.push(Rc::new(child));
        code::reserve_regs(fs, 1).map_err(|e| self.error(e))?;
        let reg = self.fs_ref().free_reg - 1;
        let pc = code::emit_abx(self.fs(), OpCode::Closure, reg, idx);
        let _ = pc;
        Ok(ExpDesc::new(ExpKind::Nonreloc(reg)))
    }

    fn ret_stat(&mut self) -> Result<(), String> {
        self.next()?; // skip 'return'
        let first = self.fs_ref().nvar_regs();
        let mut nret: i32;
        if self.block_follow(true) || self.tok == Token::Semi {
            nret = 0;
        } else {
            let (n, mut e) = self.exp_list()?;
            nret = n as i32;
            if e.is_multiret() {
                code::set_returns(self.fs(), &mut e, -1).map_err(|er| self.error(er))?;
                // A bare `return f()` becomes a tail call unless a
                // to-be-closed variable is in scope.
                let inside_tbc = self
                    .fs_ref()
                    .block
                    .as_ref()
                    .map(|b| b.inside_tbc)
                    .unwrap_or(false);
                if let ExpKind::Call(pc) = e.kind {
                    if n == 1 && !inside_tbc {
                        let i = &mut self.fs().proto.code[pc as usize];
                        let a = Instruction::a(*i);
                        let b = Instruction::b(*i);
                        *i = Instruction::abck(OpCode::TailCall, a, b, 0, false);
                    }
                }
                nret = -1;
            } else if n == 1 {
                // A single value returns from wherever it lives.
                let r = code::exp2anyreg(self.fs(), &mut e).map_err(|er| self.error(er))?;
                code::code_return(self.fs(), r, 1);
                self.test_next(Token::Semi)?;
                return Ok(());
            } else {
                code::exp2nextreg(self.fs(), &mut e).map_err(|er| self.error(er))?;
            }
        }
        code::code_return(self.fs(), first, nret);
        self.test_next(Token::Semi)?;
        Ok(())
    }

    // ----- assignments and calls -----

    fn expr_stat(&mut self) -> Result<(), String> {
        let e = self.suffixed_exp()?;
        if self.tok == Token::Assign || self.tok == Token::Comma {
            let mut lhs = vec![e];
            while self.test_next(Token::Comma)? {
                let next = self.suffixed_exp()?;
                self.check_assign_conflict(&mut lhs, &next)?;
                lhs.push(next);
            }
            self.check(Token::Assign)?;
            let (nexps, mut rhs) = self.exp_list()?;
            if nexps != lhs.len() {
                self.adjust_assign(lhs.len(), nexps, &mut rhs)?;
            } else {
                code::set_one_ret(self.fs(), &mut rhs);
                let last = lhs.last().ok_or_else(|| self.error("empty assignment"))?;
                self.check_writable(last)?;
                code::store_var(self.fs(), last, &mut rhs).map_err(|er| self.error(er))?;
                for var in lhs[..lhs.len() - 1].iter().rev() {
                    self.check_writable(var)?;
                    let mut top = ExpDesc::new(ExpKind::Nonreloc(self.fs_ref().free_reg - 1));
                    code::store_var(self.fs(), var, &mut top).map_err(|er| self.error(er))?;
                }
                return Ok(());
            }
            // Values were spread over registers: assign right-to-left from
            // the value block.
            let base = self.fs_ref().free_reg - lhs.len() as u32;
            for (i, var) in lhs.iter().enumerate().rev() {
                self.check_writable(var)?;
                let mut v = ExpDesc::new(ExpKind::Nonreloc(base + i as u32));
                code::store_var(self.fs(), var, &mut v).map_err(|er| self.error(er))?;
            }
            Ok(())
        } else {
            // A bare expression statement must be a call.
            match e.kind {
                ExpKind::Call(_) => Ok(()),
                _ => Err(self.error_near("syntax error")),
            }
        }
    }

    /// Read-only locals reject assignment.
    fn check_writable(&self, var: &ExpDesc) -> Result<(), String> {
        if let ExpKind::Local(reg) = var.kind {
            let fs = self.fs_ref();
            if let Some(v) = fs
                .actvar
                .iter()
                .rev()
                .find(|v| v.in_register() && v.reg == reg)
            {
                if v.attrib != VarAttrib::Regular {
                    return Err(self.error(format!(
                        "attempt to assign to const variable '{}'",
                        v.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// In a multiple assignment, an earlier target's table or key register
    /// may alias a local that a later target assigns; copy the local to a
    /// temporary and repoint the earlier descriptors.
    fn check_assign_conflict(
        &mut self,
        lhs: &mut [ExpDesc],
        new_var: &ExpDesc,
    ) -> Result<(), String> {
        let temp = self.fs_ref().free_reg;
        match new_var.kind {
            ExpKind::Local(vreg) => {
                let mut conflict = false;
                for var in lhs.iter_mut() {
                    match &mut var.kind {
                        ExpKind::Indexed { table, key } => {
                            if *table == vreg {
                                *table = temp;
                                conflict = true;
                            }
                            if *key == vreg {
                                *key = temp;
                                conflict = true;
                            }
                        }
                        ExpKind::IndexI { table, .. } | ExpKind::IndexStr { table, .. } => {
                            if *table == vreg {
                                *table = temp;
                                conflict = true;
                            }
                        }
                        _ => {}
                    }
                }
                if conflict {
                    code::emit_abc(self.fs(), OpCode::Move, temp, vreg, 0);
                    code::reserve_regs(self.fs(), 1).map_err(|e| self.error(e))?;
                }
            }
            ExpKind::Upval(uidx) => {
                // An earlier target indexes through the upvalue being
                // assigned: copy the table into a register first.
                let mut conflict = false;
                for var in lhs.iter_mut() {
                    if let ExpKind::IndexUp { table, key } = var.kind {
                        if table == uidx {
                            var.kind = ExpKind::IndexStr { table: temp, key };
                            conflict = true;
                        }
                    }
                }
                if conflict {
                    code::emit_abc(self.fs(), OpCode::GetUpval, temp, uidx, 0);
                    code::reserve_regs(self.fs(), 1).map_err(|e| self.error(e))?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// explist: all but the last value land in consecutive registers.
    fn exp_list(&mut self) -> Result<(usize, ExpDesc), String> {
        let mut n = 1;
        let mut e = self.expression()?;
        while self.test_next(Token::Comma)? {
            code::exp2nextreg(self.fs(), &mut e).map_err(|er| self.error(er))?;
            e = self.expression()?;
            n += 1;
        }
        Ok((n, e))
    }

    fn adjust_assign(&mut self, nvars: usize, nexps: usize, e: &mut ExpDesc) -> Result<(), String> {
        let needed = nvars as i32 - nexps as i32;
        if e.is_multiret() {
            // The last expression supplies itself plus the shortfall.
            let extra = (needed + 1).max(0);
            code::set_returns(self.fs(), e, extra).map_err(|er| self.error(er))?;
        } else {
            if !matches!(e.kind, ExpKind::Void) {
                code::exp2nextreg(self.fs(), e).map_err(|er| self.error(er))?;
            }
            if needed > 0 {
                let free = self.fs_ref().free_reg;
                code::emit_abc(self.fs(), OpCode::LoadNil, free, needed as u32 - 1, 0);
            }
        }
        if needed > 0 {
            code::reserve_regs(self.fs(), needed as u32).map_err(|er| self.error(er))?;
        } else {
            // Extra values are dropped.
            self.fs().free_reg = (self.fs_ref().free_reg as i32 + needed) as u32;
        }
        Ok(())
    }

    // ----- expressions -----

    fn expression(&mut self) -> Result<ExpDesc, String> {
        self.sub_expression(0)
    }

    fn sub_expression(&mut self, limit: u8) -> Result<ExpDesc, String> {
        self.sync_line();
        let mut e = if let Some(uop) = self.unary_op() {
            self.next()?;
            let mut operand = self.sub_expression(UNARY_PRIORITY)?;
            code::code_unary(self.fs(), uop, &mut operand).map_err(|er| self.error(er))?;
            operand
        } else {
            self.simple_exp()?
        };

        while let Some(bop) = self.binary_op() {
            let (left, right) = bop.priority();
            if left <= limit {
                break;
            }
            self.next()?;
            code::infix(self.fs(), bop, &mut e).map_err(|er| self.error(er))?;
            let mut rhs = self.sub_expression(right)?;
            code::posfix(self.fs(), bop, &mut e, &mut rhs).map_err(|er| self.error(er))?;
        }
        Ok(e)
    }

    fn unary_op(&self) -> Option<UnOp> {
        match self.tok {
            Token::Not => Some(UnOp::Not),
            Token::Minus => Some(UnOp::Minus),
            Token::Hash => Some(UnOp::Len),
            Token::Tilde => Some(UnOp::BNot),
            _ => None,
        }
    }

    fn binary_op(&self) -> Option<BinOp> {
        Some(match self.tok {
            Token::Plus => BinOp::Add,
            Token::Minus => BinOp::Sub,
            Token::Star => BinOp::Mul,
            Token::Slash => BinOp::Div,
            Token::DSlash => BinOp::IDiv,
            Token::Percent => BinOp::Mod,
            Token::Caret => BinOp::Pow,
            Token::Concat => BinOp::Concat,
            Token::Amp => BinOp::BAnd,
            Token::Pipe => BinOp::BOr,
            Token::Tilde => BinOp::BXor,
            Token::Shl => BinOp::Shl,
            Token::Shr => BinOp::Shr,
            Token::Eq => BinOp::Eq,
            Token::Ne => BinOp::Ne,
            Token::Lt => BinOp::Lt,
            Token::Le => BinOp::Le,
            Token::Gt => BinOp::Gt,
            Token::Ge => BinOp::Ge,
            Token::And => BinOp::And,
            Token::Or => BinOp::Or,
            _ => return None,
        })
    }

    fn simple_exp(&mut self) -> Result<ExpDesc, String> {
        let e = match &self.tok {
            Token::Int(i) => ExpDesc::new(ExpKind::KInt(*i)),
            Token::Float(f) => ExpDesc::new(ExpKind::KFlt(*f)),
            Token::Str(bytes) => {
                let s = self.vm.strings.intern(bytes);
                ExpDesc::new(ExpKind::KStr(s))
            }
            Token::Nil => ExpDesc::new(ExpKind::Nil),
            Token::True => ExpDesc::new(ExpKind::True),
            Token::False => ExpDesc::new(ExpKind::False),
            Token::Dots => {
                if !self.fs_ref().proto.is_vararg {
                    return Err(self.error("cannot use '...' outside a vararg function"));
                }
                let pc = code::emit_abc(self.fs(), OpCode::Vararg, 0, 0, 1);
                ExpDesc::new(ExpKind::Vararg(pc))
            }
            Token::LBrace => return self.table_constructor(),
            Token::Function => {
                let line = self.tok_line;
                self.next()?;
                return self.func_body(false, line);
            }
            _ => return self.suffixed_exp(),
        };
        self.next()?;
        Ok(e)
    }

    fn primary_exp(&mut self) -> Result<ExpDesc, String> {
        match &self.tok {
            Token::Name(n) => {
                let n = n.clone();
                self.next()?;
                self.single_var(n.as_str())
            }
            Token::LParen => {
                let line = self.tok_line;
                self.next()?;
                let mut e = self.expression()?;
                self.check_match(Token::RParen, Token::LParen, line)?;
                // Parentheses truncate to one value.
                code::discharge_vars(self.fs(), &mut e);
                Ok(e)
            }
            _ => Err(self.error_near("unexpected symbol")),
        }
    }

    fn suffixed_exp(&mut self) -> Result<ExpDesc, String> {
        let mut e = self.primary_exp()?;
        loop {
            match &self.tok {
                Token::Dot => {
                    self.next()?;
                    let name = self.check_name()?;
                    let s = self.vm.strings.intern(name.as_bytes());
                    let mut key = ExpDesc::new(ExpKind::KStr(s));
                    code::indexed(self.fs(), &mut e, &mut key).map_err(|er| self.error(er))?;
                }
                Token::LBracket => {
                    self.next()?;
                    let mut key = self.expression()?;
                    code::exp2val(self.fs(), &mut key).map_err(|er| self.error(er))?;
                    self.check(Token::RBracket)?;
                    code::indexed(self.fs(), &mut e, &mut key).map_err(|er| self.error(er))?;
                }
                Token::Colon => {
                    self.next()?;
                    let name = self.check_name()?;
                    let s = self.vm.strings.intern(name.as_bytes());
                    let mut key = ExpDesc::new(ExpKind::KStr(s));
                    code::code_self(self.fs(), &mut e, &mut key).map_err(|er| self.error(er))?;
                    e = self.call_args(e)?;
                }
                Token::LParen | Token::Str(_) | Token::LBrace => {
                    code::exp2nextreg(self.fs(), &mut e).map_err(|er| self.error(er))?;
                    e = self.call_args(e)?;
                }
                _ => return Ok(e),
            }
        }
    }

    fn call_args(&mut self, func: ExpDesc) -> Result<ExpDesc, String> {
        let line = self.tok_line;
        let base = match func.kind {
            ExpKind::Nonreloc(r) => r,
            _ => return Err(self.error("function expression not in a register")),
        };
        let mut multiret = false;
        match &self.tok {
            Token::LParen => {
                self.next()?;
                if self.tok == Token::RParen {
                    self.next()?;
                } else {
                    let (_, mut last) = self.exp_list()?;
                    if last.is_multiret() {
                        code::set_returns(self.fs(), &mut last, -1)
                            .map_err(|er| self.error(er))?;
                        multiret = true;
                    } else {
                        code::exp2nextreg(self.fs(), &mut last).map_err(|er| self.error(er))?;
                    }
                    self.check_match(Token::RParen, Token::LParen, line)?;
                }
            }
            Token::Str(bytes) => {
                let s = self.vm.strings.intern(bytes);
                let mut arg = ExpDesc::new(ExpKind::KStr(s));
                self.next()?;
                code::exp2nextreg(self.fs(), &mut arg).map_err(|er| self.error(er))?;
            }
            Token::LBrace => {
                let mut arg = self.table_constructor()?;
                code::exp2nextreg(self.fs(), &mut arg).map_err(|er| self.error(er))?;
            }
            _ => return Err(self.error_near("function arguments expected")),
        }
        // B counts the whole argument window (a method's self included).
        let b = if multiret {
            0
        } else {
            self.fs_ref().free_reg - base
        };
        self.fs().line = line;
        let pc = code::emit_abc(self.fs(), OpCode::Call, base, b, 2);
        // The call collapses the argument window.
        self.fs().free_reg = base + 1;
        Ok(ExpDesc::new(ExpKind::Call(pc)))
    }

    fn table_constructor(&mut self) -> Result<ExpDesc, String> {
        let line = self.tok_line;
        self.check(Token::LBrace)?;
        let treg = self.fs_ref().free_reg;
        code::reserve_regs(self.fs(), 1).map_err(|e| self.error(e))?;
        code::emit_abck(self.fs(), OpCode::NewTable, treg, 0, 0, false);
        code::emit(self.fs(), Instruction::ax_op(OpCode::ExtraArg, 0));

        let mut array_pending = 0usize; // values on the stack awaiting a flush
        let mut array_stored = 0usize; // values already flushed
        let mut last_multiret = false;

        loop {
            if self.tok == Token::RBrace {
                break;
            }
            let is_record_name =
                matches!(self.tok, Token::Name(_)) && self.peek_ahead()? == Token::Assign;
            match &self.tok {
                Token::Name(_) if is_record_name => {
                    let name = self.check_name()?;
                    self.check(Token::Assign)?;
                    let s = self.vm.strings.intern(name.as_bytes());
                    self.record_field(treg, ExpDesc::new(ExpKind::KStr(s)))?;
                }
                Token::LBracket => {
                    self.next()?;
                    let mut key = self.expression()?;
                    code::exp2val(self.fs(), &mut key).map_err(|er| self.error(er))?;
                    self.check(Token::RBracket)?;
                    self.check(Token::Assign)?;
                    self.record_field(treg, key)?;
                }
                _ => {
                    let mut item = self.expression()?;
                    if self.tok == Token::RBrace && item.is_multiret() {
                        // Trailing call or vararg spreads into the array part.
                        code::set_returns(self.fs(), &mut item, -1)
                            .map_err(|er| self.error(er))?;
                        last_multiret = true;
                        array_pending += 1;
                    } else {
                        code::exp2nextreg(self.fs(), &mut item).map_err(|er| self.error(er))?;
                        array_pending += 1;
                        if array_pending >= FIELDS_PER_FLUSH {
                            self.flush_array(treg, array_pending, array_stored, false)?;
                            array_stored += array_pending;
                            array_pending = 0;
                        }
                    }
                }
            }
            if !self.test_next(Token::Comma)? && !self.test_next(Token::Semi)? {
                break;
            }
        }
        self.check_match(Token::RBrace, Token::LBrace, line)?;

        if array_pending > 0 || last_multiret {
            self.flush_array(treg, array_pending, array_stored, last_multiret)?;
        }
        Ok(ExpDesc::new(ExpKind::Nonreloc(treg)))
    }

    fn flush_array(
        &mut self,
        treg: u32,
        pending: usize,
        stored: usize,
        multiret: bool,
    ) -> Result<(), String> {
        let b = if multiret { 0 } else { pending as u32 };
        if stored <= ifields::MAX_C as usize {
            code::emit_abck(self.fs(), OpCode::SetList, treg, b, stored as u32, false);
        } else {
            let c = (stored % (ifields::MAX_C as usize + 1)) as u32;
            let extra = (stored / (ifields::MAX_C as usize + 1)) as u32;
            code::emit_abck(self.fs(), OpCode::SetList, treg, b, c, true);
            code::emit(self.fs(), Instruction::ax_op(OpCode::ExtraArg, extra));
        }
        self.fs().free_reg = treg + 1;
        Ok(())
    }

    fn record_field(&mut self, treg: u32, key: ExpDesc) -> Result<(), String> {
        let saved_free = self.fs_ref().free_reg;
        let mut tab = ExpDesc::new(ExpKind::Nonreloc(treg));
        let mut key = key;
        code::indexed(self.fs(), &mut tab, &mut key).map_err(|e| self.error(e))?;
        let mut value = self.expression()?;
        code::store_var(self.fs(), &tab, &mut value).map_err(|e| self.error(e))?;
        self.fs().free_reg = saved_free;
        Ok(())
    }
}
