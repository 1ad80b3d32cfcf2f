// Hybrid array/hash table.
//
// Positive integer keys forming a dense prefix live in the array part; every
// other key lives in an insertion-ordered hash part (index map over an entry
// vector with tombstones), which keeps `next` O(1) and deterministic for an
// unmutated table. Removals leave a traversable dead entry so clearing the
// control key during iteration stays valid; dead entries are dropped on the
// next insert-triggered rebuild, mirroring rehash-on-insert.

use ahash::AHashMap;

use crate::gc::TableId;
use crate::lua_value::LuaValue;

/// Why a raw write was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableSetError {
    /// The table's frozen flag is set.
    Frozen,
    /// The key is nil.
    NilKey,
    /// The key is a float NaN.
    NanKey,
}

pub struct LuaTable {
    array: Vec<LuaValue>,
    hmap: AHashMap<LuaValue, usize>,
    entries: Vec<Option<(LuaValue, LuaValue)>>,
    dead: usize,
    meta: Option<TableId>,
    frozen: bool,
}

impl LuaTable {
    pub fn new(narr: usize, nrec: usize) -> Self {
        LuaTable {
            array: Vec::with_capacity(narr),
            hmap: AHashMap::with_capacity(nrec),
            entries: Vec::with_capacity(nrec),
            dead: 0,
            meta: None,
            frozen: false,
        }
    }

    #[inline(always)]
    pub fn metatable(&self) -> Option<TableId> {
        self.meta
    }

    pub fn set_metatable(&mut self, meta: Option<TableId>) {
        self.meta = meta;
    }

    #[inline(always)]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// One-way: freezing is permanent for the lifetime of the table.
    pub fn set_frozen(&mut self) {
        self.frozen = true;
    }

    // ----- reads -----

    #[inline]
    pub fn raw_get_int(&self, i: i64) -> LuaValue {
        if i >= 1 && (i as usize) <= self.array.len() {
            return self.array[(i - 1) as usize].clone();
        }
        self.hash_get(&LuaValue::Integer(i))
    }

    pub fn raw_get(&self, key: &LuaValue) -> LuaValue {
        match key {
            LuaValue::Integer(i) => self.raw_get_int(*i),
            LuaValue::Float(f) => {
                if let Some(i) = super::number::float_to_integer(*f) {
                    self.raw_get_int(i)
                } else {
                    self.hash_get(key)
                }
            }
            LuaValue::Nil => LuaValue::Nil,
            _ => self.hash_get(key),
        }
    }

    fn hash_get(&self, key: &LuaValue) -> LuaValue {
        match self.hmap.get(key) {
            Some(&idx) => match &self.entries[idx] {
                Some((_, v)) => v.clone(),
                None => LuaValue::Nil,
            },
            None => LuaValue::Nil,
        }
    }

    pub fn contains_key(&self, key: &LuaValue) -> bool {
        !self.raw_get(key).is_nil()
    }

    // ----- writes -----

    pub fn raw_set(&mut self, key: LuaValue, value: LuaValue) -> Result<(), TableSetError> {
        if key.is_nil() {
            return Err(TableSetError::NilKey);
        }
        if key.is_nan() {
            return Err(TableSetError::NanKey);
        }
        let key = key.normalize_key();
        if self.frozen {
            // The only write a frozen table absorbs: erasing a key that was
            // never there.
            if value.is_nil() && !self.contains_key(&key) {
                return Ok(());
            }
            return Err(TableSetError::Frozen);
        }
        if let LuaValue::Integer(i) = key {
            self.set_int_unchecked(i, value);
        } else {
            self.hash_set(key, value);
        }
        Ok(())
    }

    pub fn raw_set_int(&mut self, i: i64, value: LuaValue) -> Result<(), TableSetError> {
        self.raw_set(LuaValue::Integer(i), value)
    }

    fn set_int_unchecked(&mut self, i: i64, value: LuaValue) {
        let len = self.array.len() as i64;
        if i >= 1 && i <= len {
            self.array[(i - 1) as usize] = value;
            return;
        }
        if i == len + 1 && !value.is_nil() {
            self.array.push(value);
            self.absorb_dense_suffix();
            return;
        }
        self.hash_set(LuaValue::Integer(i), value);
    }

    /// After extending the array part, pull any now-contiguous integer keys
    /// out of the hash part.
    fn absorb_dense_suffix(&mut self) {
        loop {
            let next_key = LuaValue::Integer(self.array.len() as i64 + 1);
            let Some(&idx) = self.hmap.get(&next_key) else {
                break;
            };
            let Some((_, v)) = self.entries[idx].take() else {
                break;
            };
            self.hmap.remove(&next_key);
            if v.is_nil() {
                self.dead -= 1;
                break;
            }
            self.array.push(v);
        }
    }

    fn hash_set(&mut self, key: LuaValue, value: LuaValue) {
        if let Some(&idx) = self.hmap.get(&key) {
            match &mut self.entries[idx] {
                Some(entry) => {
                    let was_dead = entry.1.is_nil();
                    let now_dead = value.is_nil();
                    entry.1 = value;
                    match (was_dead, now_dead) {
                        (false, true) => self.dead += 1,
                        (true, false) => self.dead -= 1,
                        _ => {}
                    }
                }
                None => {
                    if !value.is_nil() {
                        self.entries[idx] = Some((key, value));
                    }
                }
            }
            return;
        }
        if value.is_nil() {
            // Removing an absent key is a no-op.
            return;
        }
        if self.dead > 8 && self.dead * 2 > self.entries.len() {
            self.rebuild_hash();
        }
        self.hmap.insert(key.clone(), self.entries.len());
        self.entries.push(Some((key, value)));
    }

    /// Atomic rebuild of the hash part, dropping dead entries.
    fn rebuild_hash(&mut self) {
        let old = std::mem::take(&mut self.entries);
        self.hmap.clear();
        self.dead = 0;
        for slot in old {
            if let Some((k, v)) = slot {
                if !v.is_nil() {
                    self.hmap.insert(k.clone(), self.entries.len());
                    self.entries.push(Some((k, v)));
                }
            }
        }
    }

    // ----- length / border -----

    /// Returns a border: an `n` with `t[n] ~= nil` and `t[n+1] == nil`
    /// (0 when `t[1]` is nil).
    pub fn border(&self) -> i64 {
        let n = self.array.len();
        if n > 0 && self.array[n - 1].is_nil() {
            // A hole at the end: binary search the array part.
            let mut i = 0usize;
            let mut j = n;
            while j - i > 1 {
                let m = (i + j) / 2;
                if self.array[m - 1].is_nil() {
                    j = m;
                } else {
                    i = m;
                }
            }
            return i as i64;
        }
        if self.hmap.is_empty() {
            return n as i64;
        }
        // Array part is full and the hash part may extend it.
        let mut i = n as i64;
        while !self.hash_get(&LuaValue::Integer(i + 1)).is_nil() {
            i += 1;
        }
        i
    }

    /// Total number of present entries (not a Lua-visible notion; used by
    /// diagnostics and rehash heuristics).
    pub fn count(&self) -> usize {
        let live_array = self.array.iter().filter(|v| !v.is_nil()).count();
        let live_hash = self
            .entries
            .iter()
            .filter(|slot| matches!(slot, Some((_, v)) if !v.is_nil()))
            .count();
        live_array + live_hash
    }

    // ----- traversal -----

    /// `next` protocol: `None` control starts, each present key is yielded
    /// exactly once, `Ok(None)` ends. `Err(())` means the control key is not
    /// a valid traversal position.
    pub fn next(&self, control: &LuaValue) -> Result<Option<(LuaValue, LuaValue)>, ()> {
        let start = match control {
            LuaValue::Nil => 0,
            LuaValue::Integer(i) if *i >= 1 && (*i as usize) <= self.array.len() => *i as usize,
            other => {
                let key = other.clone().normalize_key();
                if let LuaValue::Integer(i) = key {
                    if i >= 1 && (i as usize) <= self.array.len() {
                        return self.next(&LuaValue::Integer(i));
                    }
                }
                let Some(&idx) = self.hmap.get(&key) else {
                    return Err(());
                };
                return Ok(self.next_hash(idx + 1));
            }
        };
        for i in start..self.array.len() {
            if !self.array[i].is_nil() {
                return Ok(Some((
                    LuaValue::Integer((i + 1) as i64),
                    self.array[i].clone(),
                )));
            }
        }
        Ok(self.next_hash(0))
    }

    fn next_hash(&self, from: usize) -> Option<(LuaValue, LuaValue)> {
        for slot in self.entries.iter().skip(from) {
            if let Some((k, v)) = slot {
                if !v.is_nil() {
                    return Some((k.clone(), v.clone()));
                }
            }
        }
        None
    }

    // ----- internal views (GC, freeze, sort) -----

    pub(crate) fn array_part(&self) -> &[LuaValue] {
        &self.array
    }

    pub(crate) fn hash_entries(&self) -> impl Iterator<Item = (&LuaValue, &LuaValue)> {
        self.entries
            .iter()
            .filter_map(|slot| slot.as_ref())
            .filter(|(_, v)| !v.is_nil())
            .map(|(k, v)| (k, v))
    }

    /// Every reachable value (keys and values), for freeze traversal.
    pub(crate) fn all_values(&self) -> Vec<LuaValue> {
        let mut out = Vec::with_capacity(self.count() * 2);
        for v in &self.array {
            if !v.is_nil() {
                out.push(v.clone());
            }
        }
        for (k, v) in self.hash_entries() {
            out.push(k.clone());
            out.push(v.clone());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_insert_and_border() {
        let mut t = LuaTable::new(0, 0);
        for i in 1..=5 {
            t.raw_set_int(i, LuaValue::Integer(i * i)).unwrap();
        }
        assert_eq!(t.border(), 5);
        assert_eq!(t.raw_get_int(3), LuaValue::Integer(9));
        t.raw_set_int(5, LuaValue::Nil).unwrap();
        assert!(t.border() < 5);
    }

    #[test]
    fn hash_keys_and_float_normalization() {
        let mut t = LuaTable::new(0, 0);
        t.raw_set(LuaValue::Float(1.0), LuaValue::Integer(10)).unwrap();
        assert_eq!(t.raw_get_int(1), LuaValue::Integer(10));
        assert_eq!(t.border(), 1);
        t.raw_set(LuaValue::Float(2.5), LuaValue::Integer(25)).unwrap();
        assert_eq!(t.raw_get(&LuaValue::Float(2.5)), LuaValue::Integer(25));
    }

    #[test]
    fn nil_and_nan_keys_fail() {
        let mut t = LuaTable::new(0, 0);
        assert_eq!(
            t.raw_set(LuaValue::Nil, LuaValue::Integer(1)),
            Err(TableSetError::NilKey)
        );
        assert_eq!(
            t.raw_set(LuaValue::Float(f64::NAN), LuaValue::Integer(1)),
            Err(TableSetError::NanKey)
        );
    }

    #[test]
    fn hash_extends_array_part() {
        let mut t = LuaTable::new(0, 0);
        t.raw_set_int(2, LuaValue::Integer(2)).unwrap();
        t.raw_set_int(3, LuaValue::Integer(3)).unwrap();
        assert_eq!(t.border(), 0);
        t.raw_set_int(1, LuaValue::Integer(1)).unwrap();
        // 2 and 3 migrate into the array part behind 1.
        assert_eq!(t.border(), 3);
        assert_eq!(t.array_part().len(), 3);
    }

    #[test]
    fn frozen_rejects_all_mutation() {
        let mut t = LuaTable::new(0, 0);
        t.raw_set_int(1, LuaValue::Integer(7)).unwrap();
        t.set_frozen();
        // Even rewriting the current value is refused.
        assert_eq!(
            t.raw_set_int(1, LuaValue::Integer(7)),
            Err(TableSetError::Frozen)
        );
        // Erasing an absent key is the lone permitted no-op.
        assert!(t.raw_set_int(9, LuaValue::Nil).is_ok());
        assert_eq!(t.raw_get_int(1), LuaValue::Integer(7));
    }

    #[test]
    fn next_enumerates_each_key_once() {
        let mut t = LuaTable::new(0, 0);
        t.raw_set_int(1, LuaValue::Integer(10)).unwrap();
        t.raw_set_int(2, LuaValue::Integer(20)).unwrap();
        let s = crate::lua_value::LuaStrData::new(b"k".to_vec());
        t.raw_set(LuaValue::String(s), LuaValue::Integer(30)).unwrap();

        let mut seen = Vec::new();
        let mut control = LuaValue::Nil;
        while let Ok(Some((k, v))) = t.next(&control) {
            seen.push(v.clone());
            control = k;
            if seen.len() > 10 {
                break;
            }
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn next_survives_clearing_the_control_key() {
        let mut t = LuaTable::new(0, 0);
        let a = crate::lua_value::LuaStrData::new(b"a".to_vec());
        let b = crate::lua_value::LuaStrData::new(b"b".to_vec());
        t.raw_set(LuaValue::String(a.clone()), LuaValue::Integer(1)).unwrap();
        t.raw_set(LuaValue::String(b), LuaValue::Integer(2)).unwrap();

        let (k1, _) = t.next(&LuaValue::Nil).unwrap().unwrap();
        t.raw_set(k1.clone(), LuaValue::Nil).unwrap();
        // The cleared key must still be a valid control value.
        let rest = t.next(&k1).unwrap();
        assert!(rest.is_some());
    }

    #[test]
    fn invalid_next_control_errors() {
        let t = LuaTable::new(0, 0);
        let ghost = crate::lua_value::LuaStrData::new(b"ghost".to_vec());
        assert!(t.next(&LuaValue::String(ghost)).is_err());
    }
}
