// Thompson-style simulation of a compiled pattern.
//
// The live-thread list is kept in priority order; zero-width states resolve
// during closure (which sees the current position, so frontiers and anchors
// need no lookahead machinery). When a thread reaches Accept, every
// lower-priority thread dies - the recorded match can only be replaced by a
// higher-priority survivor, which reproduces the backtracker's greedy
// semantics without backtracking.

use super::{ByteSet, LuaPattern, NfaState, match_class};

const UNSET: usize = usize::MAX;

/// A capture value: a byte span or, for `()`, a position (1-based, Lua
/// convention applied by the caller).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapVal {
    Span(usize, usize),
    Pos(usize),
}

/// A successful match.
#[derive(Debug, Clone)]
pub struct Captures {
    /// Whole-match span (byte offsets, end exclusive).
    pub start: usize,
    pub end: usize,
    caps: Vec<CapVal>,
}

impl Captures {
    pub fn n(&self) -> usize {
        self.caps.len()
    }

    pub fn get(&self, i: usize) -> Option<CapVal> {
        self.caps.get(i).copied()
    }

    /// Captures, or the whole match when the pattern has none.
    pub fn effective(&self) -> Vec<CapVal> {
        if self.caps.is_empty() {
            vec![CapVal::Span(self.start, self.end)]
        } else {
            self.caps.clone()
        }
    }
}

#[derive(Clone)]
struct Thread {
    pc: u32,
    saves: Box<[usize]>,
}

struct ThreadList {
    threads: Vec<Thread>,
    seen: Vec<bool>,
}

impl ThreadList {
    fn new(nstates: usize) -> Self {
        ThreadList {
            threads: Vec::with_capacity(8),
            seen: vec![false; nstates],
        }
    }

    fn clear(&mut self) {
        self.threads.clear();
        self.seen.iter_mut().for_each(|s| *s = false);
    }
}

impl LuaPattern {
    /// Matches only at `init`. Returns captures on success.
    pub fn match_at(&self, subject: &[u8], init: usize) -> Option<Captures> {
        self.simulate(subject, init)
    }

    /// Scans forward from `init` for the first position that matches
    /// (respecting `^`).
    pub fn find_from(&self, subject: &[u8], init: usize) -> Option<Captures> {
        if self.anchored {
            return self.simulate(subject, init);
        }
        let mut start = init;
        while start <= subject.len() {
            if let Some(m) = self.simulate(subject, start) {
                return Some(m);
            }
            start += 1;
        }
        None
    }

    fn simulate(&self, subject: &[u8], start: usize) -> Option<Captures> {
        if start > subject.len() {
            return None;
        }
        let nsaves = self.n_captures as usize * 2;
        let mut current = ThreadList::new(self.prog.len());
        let mut next = ThreadList::new(self.prog.len());
        let mut best: Option<(usize, Box<[usize]>)> = None;

        let initial = Thread {
            pc: 0,
            saves: vec![UNSET; nsaves].into_boxed_slice(),
        };
        self.add_thread(&mut current, initial, subject, start);

        let mut pos = start;
        loop {
            // Process threads in priority order; Accept kills the rest.
            let mut i = 0;
            while i < current.threads.len() {
                let t = &current.threads[i];
                if matches!(self.prog[t.pc as usize], NfaState::Accept) {
                    best = Some((pos, t.saves.clone()));
                    current.threads.truncate(i);
                    break;
                }
                i += 1;
            }
            if current.threads.is_empty() || pos >= subject.len() {
                break;
            }

            let byte = subject[pos];
            next.clear();
            for t in std::mem::take(&mut current.threads) {
                let consumed = match self.prog[t.pc as usize] {
                    NfaState::Byte(b) => b == byte,
                    NfaState::Class(c) => match_class(c, byte),
                    NfaState::Set(idx) => self.sets[idx].contains(byte),
                    NfaState::Any => true,
                    _ => false, // zero-width states were resolved in closure
                };
                if consumed {
                    let nt = Thread {
                        pc: t.pc + 1,
                        saves: t.saves,
                    };
                    self.add_thread(&mut next, nt, subject, pos + 1);
                }
            }
            pos += 1;
            std::mem::swap(&mut current, &mut next);
        }

        best.map(|(end, saves)| self.build_captures(start, end, &saves))
    }

    /// Epsilon closure: follows splits, jumps, capture marks and zero-width
    /// tests, appending consuming (or Accept) states in priority order.
    fn add_thread(&self, list: &mut ThreadList, t: Thread, subject: &[u8], pos: usize) {
        let idx = t.pc as usize;
        if list.seen[idx] {
            return;
        }
        list.seen[idx] = true;
        match self.prog[idx] {
            NfaState::Split { primary, secondary } => {
                self.add_thread(
                    list,
                    Thread {
                        pc: primary,
                        saves: t.saves.clone(),
                    },
                    subject,
                    pos,
                );
                self.add_thread(
                    list,
                    Thread {
                        pc: secondary,
                        saves: t.saves,
                    },
                    subject,
                    pos,
                );
            }
            NfaState::Jump(target) => {
                self.add_thread(
                    list,
                    Thread {
                        pc: target,
                        saves: t.saves,
                    },
                    subject,
                    pos,
                );
            }
            NfaState::CaptureOpen(i) => {
                let mut saves = t.saves;
                saves[i as usize * 2] = pos;
                self.add_thread(
                    list,
                    Thread {
                        pc: t.pc + 1,
                        saves,
                    },
                    subject,
                    pos,
                );
            }
            NfaState::CaptureClose(i) => {
                let mut saves = t.saves;
                saves[i as usize * 2 + 1] = pos;
                self.add_thread(
                    list,
                    Thread {
                        pc: t.pc + 1,
                        saves,
                    },
                    subject,
                    pos,
                );
            }
            NfaState::Frontier(set) => {
                if frontier_holds(self.sets[set], subject, pos) {
                    self.add_thread(
                        list,
                        Thread {
                            pc: t.pc + 1,
                            saves: t.saves,
                        },
                        subject,
                        pos,
                    );
                }
            }
            NfaState::EndAnchor => {
                if pos == subject.len() {
                    self.add_thread(
                        list,
                        Thread {
                            pc: t.pc + 1,
                            saves: t.saves,
                        },
                        subject,
                        pos,
                    );
                }
            }
            // Consuming states and Accept park in the list.
            _ => list.threads.push(t),
        }
    }

    fn build_captures(&self, start: usize, end: usize, saves: &[usize]) -> Captures {
        let mut caps = Vec::with_capacity(self.n_captures as usize);
        for i in 0..self.n_captures as usize {
            let s = saves[i * 2];
            let e = saves[i * 2 + 1];
            if self.position_caps & (1 << i) != 0 {
                caps.push(CapVal::Pos(if s == UNSET { start } else { s }));
            } else if s == UNSET || e == UNSET {
                // Unreached capture group: empty at the match start.
                caps.push(CapVal::Span(start, start));
            } else {
                caps.push(CapVal::Span(s, e));
            }
        }
        Captures { start, end, caps }
    }
}

/// `%f[set]`: the previous byte is outside the set and the current one is
/// inside. Both ends of the subject read as `\0`.
fn frontier_holds(set: ByteSet, subject: &[u8], pos: usize) -> bool {
    let prev = if pos == 0 { 0 } else { subject[pos - 1] };
    let cur = subject.get(pos).copied().unwrap_or(0);
    !set.contains(prev) && set.contains(cur)
}

#[cfg(test)]
mod tests {
    use super::super::compile;
    use super::*;

    fn find(pat: &str, s: &str) -> Option<(usize, usize)> {
        compile(pat.as_bytes(), 200)
            .expect("compile")
            .find_from(s.as_bytes(), 0)
            .map(|m| (m.start, m.end))
    }

    #[test]
    fn literals_and_classes() {
        assert_eq!(find("world", "hello world"), Some((6, 11)));
        assert_eq!(find("%d+", "abc123def"), Some((3, 6)));
        assert_eq!(find("%a+", "123abc"), Some((3, 6)));
        assert_eq!(find("xyz", "hello"), None);
    }

    #[test]
    fn greedy_vs_lazy() {
        assert_eq!(find("a.*b", "axbxb"), Some((0, 5))); // greedy to the last b
        assert_eq!(find("a.-b", "axbxb"), Some((0, 3))); // lazy stops early
        assert_eq!(find("ab?c", "ac"), Some((0, 2)));
        assert_eq!(find("ab?c", "abc"), Some((0, 3)));
        assert_eq!(find("a+", "aaab"), Some((0, 3)));
    }

    #[test]
    fn anchors() {
        assert_eq!(find("^ab", "abc"), Some((0, 2)));
        assert_eq!(find("^bc", "abc"), None);
        assert_eq!(find("bc$", "abc"), Some((1, 3)));
        assert_eq!(find("ab$", "abc"), None);
    }

    #[test]
    fn bracket_sets() {
        assert_eq!(find("[abc]+", "xxbcax"), Some((2, 5)));
        assert_eq!(find("[^%s]+", "  word  "), Some((2, 6)));
        assert_eq!(find("[a-m]+", "nopabc"), Some((3, 6)));
    }

    #[test]
    fn captures() {
        let p = compile(b"(%a+)%s+(%d+)", 200).unwrap();
        let m = p.find_from(b"item 42", 0).expect("match");
        assert_eq!(m.get(0), Some(CapVal::Span(0, 4)));
        assert_eq!(m.get(1), Some(CapVal::Span(5, 7)));
    }

    #[test]
    fn position_captures_yield_offsets() {
        let p = compile(b"()%d+()", 200).unwrap();
        let m = p.find_from(b"ab123cd", 0).expect("match");
        assert_eq!(m.get(0), Some(CapVal::Pos(2)));
        assert_eq!(m.get(1), Some(CapVal::Pos(5)));
    }

    #[test]
    fn frontier() {
        // Word boundary via frontier.
        assert_eq!(find("%f[%a]%a+", "  the"), Some((2, 5)));
        assert_eq!(find("%f[%w]%w+%f[%W]", "go!"), Some((0, 2)));
    }

    #[test]
    fn empty_match_is_possible() {
        assert_eq!(find("a*", "bbb"), Some((0, 0)));
    }

    #[test]
    fn pathological_pattern_stays_linear() {
        // A backtracker would take exponential time here.
        let subject = "a".repeat(64);
        let pattern = format!("{}b", "a*".repeat(30));
        assert_eq!(find(&pattern, &subject), None);
    }
}
