// Full userdata: an opaque host value with associated user values, an
// optional metatable and a frozen flag.

use std::any::Any;

use crate::gc::TableId;
use crate::lua_value::LuaValue;

/// The host side of a userdata. Implementations opt in to freezing by
/// overriding `freeze`; the default rejects it, so mutable host objects are
/// not silently marked immutable.
pub trait HostValue: Any {
    fn type_name(&self) -> &'static str {
        "userdata"
    }

    /// Called when the freeze subsystem reaches this value. Return `true`
    /// once the host object is (now) immutable; `false` rejects the freeze.
    fn freeze(&mut self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub struct LuaUserdata {
    pub data: Box<dyn HostValue>,
    pub user_values: Vec<LuaValue>,
    pub meta: Option<TableId>,
    pub frozen: bool,
}

impl LuaUserdata {
    pub fn new(data: Box<dyn HostValue>, n_user_values: usize) -> Self {
        LuaUserdata {
            data,
            user_values: vec![LuaValue::Nil; n_user_values],
            meta: None,
            frozen: false,
        }
    }

    pub fn user_value(&self, n: usize) -> Option<&LuaValue> {
        self.user_values.get(n)
    }

    pub fn set_user_value(&mut self, n: usize, v: LuaValue) -> bool {
        match self.user_values.get_mut(n) {
            Some(slot) => {
                *slot = v;
                true
            }
            None => false,
        }
    }
}
