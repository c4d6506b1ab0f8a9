use std::fmt;

use serde::Serialize;

/// Id range a script lives in.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptScope {
    /// Shared pool, `0x0000..=0x0FFF`.
    Global,
    /// Private to one object, `0x1000..=0x1FFF`.
    Local,
    /// Shared within an object group, `0x2000..=0xFFFF`.
    SemiGlobal,
}

pub const LOCAL_BASE: u16 = 0x1000;
pub const SEMI_GLOBAL_BASE: u16 = 0x2000;

impl ScriptScope {
    pub fn of(id: u16) -> Self {
        match id {
            0..LOCAL_BASE => ScriptScope::Global,
            LOCAL_BASE..SEMI_GLOBAL_BASE => ScriptScope::Local,
            SEMI_GLOBAL_BASE..=u16::MAX => ScriptScope::SemiGlobal,
        }
    }

    /// Fill colour used by the graph export.
    pub fn color(self) -> &'static str {
        match self {
            ScriptScope::Global => "lightblue",
            ScriptScope::Local => "lightgreen",
            ScriptScope::SemiGlobal => "khaki",
        }
    }
}

impl fmt::Display for ScriptScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScriptScope::Global => "global",
            ScriptScope::Local => "local",
            ScriptScope::SemiGlobal => "semi-global",
        })
    }
}
