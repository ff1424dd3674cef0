use crate::{IntWidth, TypeSig};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Primitives of the runtime support library, called by name from translated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeEntry {
    Alloc,
    ReAlloc,
    Free,
    /// In-place resize; always declines and returns null.
    Expand,
    MemCopy,
    MemMove,
    MemSet,
    VaCopy,
    PutString,
    /// Recoverable failure: raises an exception carrying message and location.
    AssertFailure,
    /// Non-recoverable: stops the run.
    Terminate,
}

impl RuntimeEntry {
    pub const ALL: [RuntimeEntry; 11] = [
        RuntimeEntry::Alloc,
        RuntimeEntry::ReAlloc,
        RuntimeEntry::Free,
        RuntimeEntry::Expand,
        RuntimeEntry::MemCopy,
        RuntimeEntry::MemMove,
        RuntimeEntry::MemSet,
        RuntimeEntry::VaCopy,
        RuntimeEntry::PutString,
        RuntimeEntry::AssertFailure,
        RuntimeEntry::Terminate,
    ];

    pub fn symbol(self) -> &'static str {
        match self {
            RuntimeEntry::Alloc => "Runtime.Alloc",
            RuntimeEntry::ReAlloc => "Runtime.ReAlloc",
            RuntimeEntry::Free => "Runtime.Free",
            RuntimeEntry::Expand => "Runtime.Expand",
            RuntimeEntry::MemCopy => "Runtime.MemCopy",
            RuntimeEntry::MemMove => "Runtime.MemMove",
            RuntimeEntry::MemSet => "Runtime.MemSet",
            RuntimeEntry::VaCopy => "Runtime.VaCopy",
            RuntimeEntry::PutString => "Runtime.PutString",
            RuntimeEntry::AssertFailure => "Runtime.AssertFailure",
            RuntimeEntry::Terminate => "Runtime.Terminate",
        }
    }

    pub fn arity(self) -> u32 {
        match self {
            RuntimeEntry::Terminate => 0,
            RuntimeEntry::Alloc | RuntimeEntry::Free | RuntimeEntry::PutString => 1,
            RuntimeEntry::ReAlloc | RuntimeEntry::Expand | RuntimeEntry::VaCopy => 2,
            RuntimeEntry::MemCopy
            | RuntimeEntry::MemMove
            | RuntimeEntry::MemSet
            | RuntimeEntry::AssertFailure => 3,
        }
    }

    pub fn returns(self) -> TypeSig {
        match self {
            RuntimeEntry::Alloc | RuntimeEntry::ReAlloc | RuntimeEntry::Expand => {
                TypeSig::opaque_pointer()
            }
            RuntimeEntry::PutString => TypeSig::Int(IntWidth::I32),
            _ => TypeSig::Void,
        }
    }
}

impl Display for RuntimeEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}
