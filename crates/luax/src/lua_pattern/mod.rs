// Lua patterns compiled to a nondeterministic automaton.
//
// A pattern becomes a small program of NFA states; quantifiers become split
// states with priority-ordered edges (greedy takes the loop edge first, lazy
// the exit edge). Matching is a Thompson-style multi-state simulation -
// never backtracking - so pathological patterns cannot blow the call stack;
// a hard cap on split states bounds automaton size instead.
//
// Backreferences (%1-%9, %0) and balanced matches (%b) have no place in an
// automaton and are rejected at compile time with a distinct error.

mod machine;

pub use machine::{CapVal, Captures};

/// Why a pattern failed to compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    /// `%b` or a backreference: expressible only by a backtracker.
    Unsupported(&'static str),
    Malformed(String),
    /// Split-state cap exceeded.
    TooComplex,
}

impl std::fmt::Display for PatternError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatternError::Unsupported(what) => {
                write!(f, "pattern feature not supported: {}", what)
            }
            PatternError::Malformed(msg) => write!(f, "malformed pattern ({})", msg),
            PatternError::TooComplex => write!(f, "pattern too complex"),
        }
    }
}

/// 256-bit byte set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSet {
    bits: [u64; 4],
}

impl ByteSet {
    pub const fn empty() -> Self {
        ByteSet { bits: [0; 4] }
    }

    #[inline]
    pub fn insert(&mut self, b: u8) {
        self.bits[(b >> 6) as usize] |= 1u64 << (b & 63);
    }

    #[inline]
    pub fn contains(self, b: u8) -> bool {
        self.bits[(b >> 6) as usize] & (1u64 << (b & 63)) != 0
    }

    pub fn insert_range(&mut self, lo: u8, hi: u8) {
        let mut b = lo;
        loop {
            self.insert(b);
            if b == hi {
                break;
            }
            b += 1;
        }
    }

    pub fn insert_class(&mut self, class: u8) {
        for b in 0..=255u8 {
            if match_class(class, b) {
                self.insert(b);
            }
        }
    }

    pub fn negate(&mut self) {
        for w in &mut self.bits {
            *w = !*w;
        }
    }
}

/// One NFA state. `Split` edges are priority-ordered: `primary` first.
#[derive(Debug, Clone, Copy)]
pub enum NfaState {
    /// Consume one byte equal to the literal.
    Byte(u8),
    /// Consume one byte of a class escape (`%a` ... `%X`).
    Class(u8),
    /// Consume one byte in (or out of) a bracket set.
    Set(usize),
    /// Consume any byte (`.`).
    Any,
    /// Zero-width: open capture `i`.
    CaptureOpen(u8),
    /// Zero-width: close capture `i`.
    CaptureClose(u8),
    /// Zero-width: `%f[set]` frontier test.
    Frontier(usize),
    /// Zero-width: `$` - only passes at end of subject.
    EndAnchor,
    /// Priority-ordered fork.
    Split { primary: u32, secondary: u32 },
    /// Unconditional transfer (loop plumbing).
    Jump(u32),
    /// Accept.
    Accept,
}

/// A compiled pattern.
pub struct LuaPattern {
    pub(crate) prog: Vec<NfaState>,
    pub(crate) sets: Vec<ByteSet>,
    /// `^` prefix: match only at the starting position.
    pub anchored: bool,
    pub n_captures: u8,
    /// Bit `i` set: capture `i` is a position capture `()` and yields an
    /// integer instead of a substring.
    pub position_caps: u32,
}

/// Single-byte class escapes, byte-oriented like the reference matcher.
/// An uppercase letter matches the complement of its lowercase class.
pub fn match_class(class: u8, c: u8) -> bool {
    let res = match class.to_ascii_lowercase() {
        b'a' => c.is_ascii_alphabetic(),
        b'c' => c.is_ascii_control(),
        b'd' => c.is_ascii_digit(),
        b'g' => c.is_ascii_graphic(),
        b'l' => c.is_ascii_lowercase(),
        b'p' => c.is_ascii_punctuation(),
        b's' => c == b' ' || (0x09..=0x0d).contains(&c),
        b'u' => c.is_ascii_uppercase(),
        b'w' => c.is_ascii_alphanumeric(),
        b'x' => c.is_ascii_hexdigit(),
        _ => return class == c, // escaped literal (%%, %., ...)
    };
    if class.is_ascii_uppercase() { !res } else { res }
}

struct Compiler<'a> {
    pat: &'a [u8],
    pos: usize,
    prog: Vec<NfaState>,
    sets: Vec<ByteSet>,
    n_captures: u8,
    position_caps: u32,
    open_captures: Vec<u8>,
    splits: usize,
    max_splits: usize,
}

/// Compiles `pattern`; `max_splits` caps the number of split states.
pub fn compile(pattern: &[u8], max_splits: usize) -> Result<LuaPattern, PatternError> {
    let (anchored, start) = if pattern.first() == Some(&b'^') {
        (true, 1)
    } else {
        (false, 0)
    };
    let mut c = Compiler {
        pat: pattern,
        pos: start,
        prog: Vec::with_capacity(pattern.len() + 2),
        sets: Vec::new(),
        n_captures: 0,
        position_caps: 0,
        open_captures: Vec::new(),
        splits: 0,
        max_splits,
    };
    c.sequence()?;
    if !c.open_captures.is_empty() {
        return Err(PatternError::Malformed("unfinished capture".to_string()));
    }
    c.prog.push(NfaState::Accept);
    Ok(LuaPattern {
        prog: c.prog,
        sets: c.sets,
        anchored,
        n_captures: c.n_captures,
        position_caps: c.position_caps,
    })
}

impl<'a> Compiler<'a> {
    fn sequence(&mut self) -> Result<(), PatternError> {
        while self.pos < self.pat.len() {
            self.item()?;
        }
        Ok(())
    }

    fn split_state(&mut self, primary: u32, secondary: u32) -> Result<usize, PatternError> {
        self.splits += 1;
        if self.splits > self.max_splits {
            return Err(PatternError::TooComplex);
        }
        self.prog.push(NfaState::Split { primary, secondary });
        Ok(self.prog.len() - 1)
    }

    fn item(&mut self) -> Result<(), PatternError> {
        let c = self.pat[self.pos];
        match c {
            b'(' => {
                self.pos += 1;
                if self.n_captures as usize >= 32 {
                    return Err(PatternError::Malformed("too many captures".to_string()));
                }
                let idx = self.n_captures;
                self.n_captures += 1;
                if self.pat.get(self.pos) == Some(&b')') {
                    // Position capture: yields the current offset.
                    self.pos += 1;
                    self.position_caps |= 1 << idx;
                    self.prog.push(NfaState::CaptureOpen(idx));
                    self.prog.push(NfaState::CaptureClose(idx));
                } else {
                    self.open_captures.push(idx);
                    self.prog.push(NfaState::CaptureOpen(idx));
                }
                Ok(())
            }
            b')' => {
                self.pos += 1;
                match self.open_captures.pop() {
                    Some(idx) => {
                        self.prog.push(NfaState::CaptureClose(idx));
                        Ok(())
                    }
                    None => Err(PatternError::Malformed(
                        "invalid pattern capture".to_string(),
                    )),
                }
            }
            b'$' if self.pos + 1 == self.pat.len() => {
                // Only the final '$' anchors; elsewhere it is a literal.
                self.pos += 1;
                self.prog.push(NfaState::EndAnchor);
                Ok(())
            }
            b'%' => {
                let next = self
                    .pat
                    .get(self.pos + 1)
                    .copied()
                    .ok_or_else(|| {
                        PatternError::Malformed("malformed pattern (ends with '%')".to_string())
                    })?;
                match next {
                    b'b' => Err(PatternError::Unsupported("balanced match '%b'")),
                    b'0'..=b'9' => Err(PatternError::Unsupported("backreference '%n'")),
                    b'f' => {
                        self.pos += 2;
                        if self.pat.get(self.pos) != Some(&b'[') {
                            return Err(PatternError::Malformed(
                                "missing '[' after '%f' in pattern".to_string(),
                            ));
                        }
                        let set = self.bracket_set()?;
                        self.prog.push(NfaState::Frontier(set));
                        Ok(())
                    }
                    _ => {
                        self.pos += 2;
                        self.quantified(NfaState::Class(next))
                    }
                }
            }
            b'[' => {
                let set = self.bracket_set()?;
                self.quantified(NfaState::Set(set))
            }
            b'.' => {
                self.pos += 1;
                self.quantified(NfaState::Any)
            }
            other => {
                self.pos += 1;
                self.quantified(NfaState::Byte(other))
            }
        }
    }

    /// Emits a single consuming state, wrapped by a quantifier when one
    /// follows.
    fn quantified(&mut self, state: NfaState) -> Result<(), PatternError> {
        let quant = self.pat.get(self.pos).copied();
        match quant {
            Some(b'*') => {
                self.pos += 1;
                // split -> [state, back] with greedy priority on the loop.
                let split = self.split_state(0, 0)?;
                self.prog.push(state);
                self.prog.push(NfaState::Jump(split as u32));
                let next = self.prog.len() as u32;
                self.prog[split] = NfaState::Split {
                    primary: split as u32 + 1,
                    secondary: next,
                };
            }
            Some(b'+') => {
                self.pos += 1;
                let body = self.prog.len();
                self.prog.push(state);
                let split = self.split_state(0, 0)?;
                let next = self.prog.len() as u32;
                self.prog[split] = NfaState::Split {
                    primary: body as u32,
                    secondary: next,
                };
            }
            Some(b'-') => {
                self.pos += 1;
                // Lazy repetition: prefer the exit edge.
                let split = self.split_state(0, 0)?;
                self.prog.push(state);
                self.prog.push(NfaState::Jump(split as u32));
                let next = self.prog.len() as u32;
                self.prog[split] = NfaState::Split {
                    primary: next,
                    secondary: split as u32 + 1,
                };
            }
            Some(b'?') => {
                self.pos += 1;
                let split = self.split_state(0, 0)?;
                self.prog.push(state);
                let next = self.prog.len() as u32;
                self.prog[split] = NfaState::Split {
                    primary: split as u32 + 1,
                    secondary: next,
                };
            }
            _ => self.prog.push(state),
        }
        Ok(())
    }

    /// `[...]` (cursor on the opening bracket). Returns a set index.
    fn bracket_set(&mut self) -> Result<usize, PatternError> {
        debug_assert_eq!(self.pat[self.pos], b'[');
        self.pos += 1;
        let mut set = ByteSet::empty();
        let negated = if self.pat.get(self.pos) == Some(&b'^') {
            self.pos += 1;
            true
        } else {
            false
        };
        // A leading ']' is a literal member.
        let mut first = true;
        loop {
            let Some(&c) = self.pat.get(self.pos) else {
                return Err(PatternError::Malformed(
                    "malformed pattern (missing ']')".to_string(),
                ));
            };
            if c == b']' && !first {
                self.pos += 1;
                break;
            }
            first = false;
            if c == b'%' {
                let class = self.pat.get(self.pos + 1).copied().ok_or_else(|| {
                    PatternError::Malformed("malformed pattern (ends with '%')".to_string())
                })?;
                set.insert_class(class);
                self.pos += 2;
                continue;
            }
            // Range a-z (a trailing '-' is a literal).
            if self.pat.get(self.pos + 1) == Some(&b'-')
                && self.pat.get(self.pos + 2).map(|&e| e != b']').unwrap_or(false)
            {
                let hi = self.pat[self.pos + 2];
                if c <= hi {
                    set.insert_range(c, hi);
                }
                self.pos += 3;
                continue;
            }
            set.insert(c);
            self.pos += 1;
        }
        if negated {
            set.negate();
        }
        self.sets.push(set);
        Ok(self.sets.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_balanced_and_backreferences_distinctly() {
        assert!(matches!(
            compile(b"%bxy", 200),
            Err(PatternError::Unsupported(_))
        ));
        assert!(matches!(
            compile(b"(a)%1", 200),
            Err(PatternError::Unsupported(_))
        ));
        assert!(matches!(
            compile(b"%0", 200),
            Err(PatternError::Unsupported(_))
        ));
    }

    #[test]
    fn split_cap_bounds_automaton_size() {
        let pattern: Vec<u8> = std::iter::repeat(*b"a*")
            .take(300)
            .flatten()
            .collect();
        assert!(matches!(
            compile(&pattern, 200),
            Err(PatternError::TooComplex)
        ));
        assert!(compile(b"a*b*c*", 200).is_ok());
    }

    #[test]
    fn malformed_patterns() {
        assert!(matches!(compile(b"(a", 200), Err(PatternError::Malformed(_))));
        assert!(matches!(compile(b"a)", 200), Err(PatternError::Malformed(_))));
        assert!(matches!(compile(b"[ab", 200), Err(PatternError::Malformed(_))));
        assert!(matches!(compile(b"abc%", 200), Err(PatternError::Malformed(_))));
    }

    #[test]
    fn position_capture_bitset() {
        let p = compile(b"()(%a+)()", 200).expect("compile");
        assert_eq!(p.n_captures, 3);
        assert_eq!(p.position_caps, 0b101);
    }

    #[test]
    fn class_escapes() {
        assert!(match_class(b'a', b'x'));
        assert!(!match_class(b'a', b'1'));
        assert!(match_class(b'A', b'1'));
        assert!(match_class(b'd', b'7'));
        assert!(match_class(b's', b' '));
        assert!(match_class(b'%', b'%')); // escaped literal
    }
}
