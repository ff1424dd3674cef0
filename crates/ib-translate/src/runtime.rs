use ib_bytecode::RuntimeEntry;

/// How a call to a body-less function is lowered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeRoute {
    Entry(RuntimeEntry),
    /// Stores the variadic cursor into the va-list.
    VaStart,
    /// No-op.
    VaEnd,
}

impl RuntimeRoute {
    /// Whether a call through this route can raise a catchable exception.
    pub fn may_throw(self) -> bool {
        matches!(self, RuntimeRoute::Entry(RuntimeEntry::AssertFailure))
    }
}

/// Maps a declared symbol to its runtime primitive. `None` means the symbol is unmapped.
pub fn route_symbol(name: &str) -> Option<RuntimeRoute> {
    let route = match name {
        "malloc" | "??2@YAPEAX_K@Z" => RuntimeRoute::Entry(RuntimeEntry::Alloc),
        "realloc" => RuntimeRoute::Entry(RuntimeEntry::ReAlloc),
        "free" | "??3@YAXPEAX_K@Z" => RuntimeRoute::Entry(RuntimeEntry::Free),
        "_expand" | "expand" => RuntimeRoute::Entry(RuntimeEntry::Expand),
        "memcpy" => RuntimeRoute::Entry(RuntimeEntry::MemCopy),
        "memmove" => RuntimeRoute::Entry(RuntimeEntry::MemMove),
        "memset" => RuntimeRoute::Entry(RuntimeEntry::MemSet),
        "puts" => RuntimeRoute::Entry(RuntimeEntry::PutString),
        "_wassert" => RuntimeRoute::Entry(RuntimeEntry::AssertFailure),
        "_invoke_watson" | "__std_terminate" | "abort" => {
            RuntimeRoute::Entry(RuntimeEntry::Terminate)
        }
        _ => return route_intrinsic(name),
    };
    Some(route)
}

fn route_intrinsic(name: &str) -> Option<RuntimeRoute> {
    let rest = name.strip_prefix("llvm.")?;
    // overloaded intrinsics carry a type suffix: llvm.memcpy.p0.p0.i64
    let base = rest.split('.').next()?;
    let route = match base {
        "memcpy" => RuntimeRoute::Entry(RuntimeEntry::MemCopy),
        "memmove" => RuntimeRoute::Entry(RuntimeEntry::MemMove),
        "memset" => RuntimeRoute::Entry(RuntimeEntry::MemSet),
        "va_start" => RuntimeRoute::VaStart,
        "va_end" => RuntimeRoute::VaEnd,
        "va_copy" => RuntimeRoute::Entry(RuntimeEntry::VaCopy),
        "va" if rest.starts_with("va.copy") => RuntimeRoute::Entry(RuntimeEntry::VaCopy),
        _ => return None,
    };
    Some(route)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_symbol_routes_to_exactly_one_entry() {
        let cases = [
            ("malloc", RuntimeEntry::Alloc),
            ("??2@YAPEAX_K@Z", RuntimeEntry::Alloc),
            ("realloc", RuntimeEntry::ReAlloc),
            ("free", RuntimeEntry::Free),
            ("??3@YAXPEAX_K@Z", RuntimeEntry::Free),
            ("_expand", RuntimeEntry::Expand),
            ("llvm.memcpy.p0.p0.i64", RuntimeEntry::MemCopy),
            ("llvm.memcpy.p0i8.p0i8.i32", RuntimeEntry::MemCopy),
            ("llvm.memmove.p0.p0.i64", RuntimeEntry::MemMove),
            ("llvm.memset.p0.i64", RuntimeEntry::MemSet),
            ("llvm.va_copy", RuntimeEntry::VaCopy),
            ("llvm.va.copy", RuntimeEntry::VaCopy),
            ("puts", RuntimeEntry::PutString),
            ("_wassert", RuntimeEntry::AssertFailure),
            ("_invoke_watson", RuntimeEntry::Terminate),
            ("__std_terminate", RuntimeEntry::Terminate),
        ];
        for (symbol, entry) in cases {
            assert_eq!(route_symbol(symbol), Some(RuntimeRoute::Entry(entry)), "{}", symbol);
        }
    }

    #[test]
    fn va_start_and_end_are_engine_handled() {
        assert_eq!(route_symbol("llvm.va_start"), Some(RuntimeRoute::VaStart));
        assert_eq!(route_symbol("llvm.va_start.p0"), Some(RuntimeRoute::VaStart));
        assert_eq!(route_symbol("llvm.va_end"), Some(RuntimeRoute::VaEnd));
    }

    #[test]
    fn unknown_symbols_are_unmapped() {
        assert_eq!(route_symbol("printf"), None);
        assert_eq!(route_symbol("llvm.sqrt.f64"), None);
    }
}
