// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::warn;

#[cfg(target_os = "linux")]
use std::fs::File;
#[cfg(target_os = "linux")]
use std::io::{BufRead, BufReader};
#[cfg(target_os = "linux")]
use std::path::PathBuf;
#[cfg(target_os = "linux")]
use std::sync::OnceLock;

/// Source of host function addresses, looked up by symbol name.
pub trait SymbolTable {
    fn lookup_function_address(
        &self,
        name: &str) -> Option<u64>;
}

/// On architectures where the callable entry point differs from the
/// symbol address, apply the fixed transformation so the resolved
/// address can be called indirectly. ARM Thumb2 encodes the
/// instruction set in bit 0.
fn callable_address(address: u64) -> u64 {
    if cfg!(all(target_arch = "arm", target_feature = "thumb-mode")) {
        address | 1
    } else {
        address
    }
}

/// `SymbolResolver` memoizes lookups against a backing symbol table.
/// Resolution happens at configuration time only; once a name has been
/// looked up, the cached result (present or absent) is returned
/// without consulting the table again.
pub struct SymbolResolver {
    table: Box<dyn SymbolTable + Send + Sync>,
    cache: Mutex<HashMap<String, Option<u64>>>,
}

impl SymbolResolver {
    pub fn new(
        table: Box<dyn SymbolTable + Send + Sync>) -> Self {
        Self {
            table,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves a function symbol to a directly-callable address.
    ///
    /// # Returns
    /// - `None` when the name is absent from the host's symbol table.
    ///   Callers must treat this as a configuration error; it is never
    ///   retried per event.
    pub fn resolve(
        &self,
        name: &str) -> Option<u64> {
        let mut cache = self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(cached) = cache.get(name) {
            return *cached;
        }

        let resolved = self.table
            .lookup_function_address(name)
            .map(callable_address);

        if resolved.is_none() {
            warn!("Symbol lookup failed: {}", name);
        }

        cache.insert(name.into(), resolved);
        resolved
    }
}

/// Symbol table backed by `/proc/kallsyms`. Lines have the form
/// `address type name [module]`; only function symbols (t/T and their
/// weak variants) are considered.
#[cfg(target_os = "linux")]
pub struct KallsymsTable {
    path: PathBuf,
}

#[cfg(target_os = "linux")]
impl KallsymsTable {
    pub fn new() -> Self {
        Self::with_path("/proc/kallsyms".into())
    }

    pub fn with_path(
        path: PathBuf) -> Self {
        Self {
            path,
        }
    }
}

#[cfg(target_os = "linux")]
impl Default for KallsymsTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
impl SymbolTable for KallsymsTable {
    fn lookup_function_address(
        &self,
        name: &str) -> Option<u64> {
        let file = File::open(&self.path).ok()?;
        let reader = BufReader::new(file);

        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => { return None; },
            };

            let mut parts = line.split_whitespace();

            let address = parts.next();
            let kind = parts.next();
            let symbol = parts.next();

            if let (Some(address), Some(kind), Some(symbol)) =
                (address, kind, symbol) {
                if symbol != name {
                    continue;
                }

                match kind {
                    "t" | "T" | "w" | "W" => {
                        return u64::from_str_radix(address, 16).ok();
                    },
                    _ => { },
                }
            }
        }

        None
    }
}

/// Process-wide resolver bound to the host's kallsyms, initialized on
/// first use and stable afterwards.
#[cfg(target_os = "linux")]
pub fn host_resolver() -> &'static SymbolResolver {
    static RESOLVER: OnceLock<SymbolResolver> = OnceLock::new();

    RESOLVER.get_or_init(|| {
        SymbolResolver::new(Box::new(KallsymsTable::new()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingTable {
        symbols: HashMap<String, u64>,
        lookups: Arc<AtomicUsize>,
    }

    impl CountingTable {
        fn new(
            symbols: &[(&str, u64)]) -> (Self, Arc<AtomicUsize>) {
            let lookups = Arc::new(AtomicUsize::new(0));

            let table = Self {
                symbols: symbols
                    .iter()
                    .map(|(name, address)| (name.to_string(), *address))
                    .collect(),
                lookups: lookups.clone(),
            };

            (table, lookups)
        }
    }

    impl SymbolTable for CountingTable {
        fn lookup_function_address(
            &self,
            name: &str) -> Option<u64> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.symbols.get(name).copied()
        }
    }

    #[test]
    fn resolve_memoizes_present_symbols() {
        let (table, lookups) = CountingTable::new(
            &[("stack_trace_save", 0xffff8000)]);

        let resolver = SymbolResolver::new(Box::new(table));

        assert_eq!(Some(0xffff8000), resolver.resolve("stack_trace_save"));
        assert_eq!(Some(0xffff8000), resolver.resolve("stack_trace_save"));

        /* One underlying lookup for two resolves */
        assert_eq!(1, lookups.load(Ordering::SeqCst));
    }

    #[test]
    fn resolve_memoizes_absent_symbols() {
        let (table, lookups) = CountingTable::new(&[]);

        let resolver = SymbolResolver::new(Box::new(table));

        assert_eq!(None, resolver.resolve("stack_trace_save_user"));
        assert_eq!(None, resolver.resolve("stack_trace_save_user"));

        assert_eq!(1, lookups.load(Ordering::SeqCst));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn kallsyms_parses_function_symbols() {
        use std::io::Write;

        let mut path = std::env::temp_dir();
        path.push(format!(
            "trace-context-kallsyms-{}",
            std::process::id()));

        {
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "ffffffff81000000 A fixed_percpu_data").unwrap();
            writeln!(file, "ffffffff81234560 T stack_trace_save").unwrap();
            writeln!(file, "ffffffff81234990 t stack_trace_consume_entry").unwrap();
            writeln!(file, "ffffffff8125aa10 D stack_trace_save_user").unwrap();
        }

        let table = KallsymsTable::with_path(path.clone());

        assert_eq!(
            Some(0xffffffff81234560),
            table.lookup_function_address("stack_trace_save"));
        assert_eq!(
            Some(0xffffffff81234990),
            table.lookup_function_address("stack_trace_consume_entry"));

        /* Data symbols do not resolve as functions */
        assert_eq!(
            None,
            table.lookup_function_address("stack_trace_save_user"));
        assert_eq!(
            None,
            table.lookup_function_address("missing_symbol"));

        let _ = std::fs::remove_file(&path);
    }
}
