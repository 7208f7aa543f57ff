use addr2line::gimli;
use object::{Object, ObjectSegment, ObjectSymbol};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Debug data for one loaded module, opened on first use.
pub(crate) struct ModuleSymbolizer {
    loader: Option<Box<addr2line::Loader>>,
    linked_image_base: u64,
    /// Defined symbols sorted by linked address.
    symbols: Vec<(u64, String)>,
}

enum ModuleState {
    Ready(ModuleSymbolizer),
    Failed,
}

thread_local! {
    static MODULES: RefCell<HashMap<String, ModuleState>> = RefCell::new(HashMap::new());
}

/// Runs `f` against the symbolizer for `module_path`, opening it if needed.
/// Modules that fail to open are remembered and skipped afterwards.
pub(crate) fn with_module(module_path: &str, f: impl FnOnce(&ModuleSymbolizer)) {
    MODULES.with(|modules| {
        let mut modules = modules.borrow_mut();
        let state = modules
            .entry(module_path.to_owned())
            .or_insert_with(|| match ModuleSymbolizer::open(Path::new(module_path)) {
                Ok(symbolizer) => ModuleState::Ready(symbolizer),
                Err(reason) => {
                    debug!(module_path, %reason, "module symbolizer unavailable");
                    ModuleState::Failed
                }
            });
        if let ModuleState::Ready(symbolizer) = state {
            f(symbolizer);
        }
    });
}

impl ModuleSymbolizer {
    fn open(path: &Path) -> Result<Self, String> {
        if !path.is_file() {
            return Err(format!("module path is not a file: {}", path.display()));
        }
        let data = std::fs::read(path)
            .map_err(|error| format!("read module '{}': {error}", path.display()))?;
        let object = object::File::parse(&*data)
            .map_err(|error| format!("parse module '{}': {error}", path.display()))?;

        let linked_image_base = object
            .segments()
            .filter_map(|segment| {
                let (_, file_size) = segment.file_range();
                if file_size == 0 {
                    return None;
                }
                Some(segment.address())
            })
            .min()
            .ok_or_else(|| format!("no file-backed segments in '{}'", path.display()))?;

        let mut symbols: Vec<(u64, String)> = object
            .symbol_map()
            .symbols()
            .iter()
            .map(|symbol| (symbol.address(), symbol.name().to_owned()))
            .collect();
        if symbols.is_empty() {
            // Stripped binaries still carry the dynamic table.
            symbols = object
                .dynamic_symbols()
                .filter(|symbol| symbol.is_definition() && symbol.address() != 0)
                .filter_map(|symbol| {
                    let name = symbol.name().ok()?;
                    (!name.is_empty()).then(|| (symbol.address(), name.to_owned()))
                })
                .collect();
            symbols.sort_by_key(|(address, _)| *address);
        }

        let loader = match addr2line::Loader::new(path) {
            Ok(loader) => Some(Box::new(loader)),
            Err(error) => {
                debug!(module_path = %path.display(), %error, "no debug info for module");
                None
            }
        };

        Ok(Self {
            loader,
            linked_image_base,
            symbols,
        })
    }

    /// Maps a runtime address into this module's linked address space.
    pub(crate) fn probe_for(&self, ip: u64, runtime_base: u64) -> Option<u64> {
        let module_offset = ip.checked_sub(runtime_base)?;
        self.linked_image_base.checked_add(module_offset)
    }

    /// Nearest symbol starting at or before `probe`, as (start, name).
    pub(crate) fn symbol_for(&self, probe: u64) -> Option<(u64, &str)> {
        let index = self.symbols.partition_point(|(address, _)| *address <= probe);
        let (start, name) = self.symbols.get(index.checked_sub(1)?)?;
        Some((*start, name.as_str()))
    }

    /// Source file and line for the call instruction preceding `probe`.
    pub(crate) fn location_for(&self, probe: u64) -> Option<(String, Option<u32>)> {
        let loader = self.loader.as_ref()?;
        // `probe` is a return address; step back into the call itself.
        let call_site = probe.checked_sub(1)?;
        let location = loader.find_location(call_site).ok()??;
        let file = location.file?;
        Some((file.to_owned(), location.line))
    }
}

/// Demangles Rust and C++ symbol names. Plain names yield `None`.
pub(crate) fn demangle(raw: &str) -> Option<String> {
    addr2line::demangle(raw, gimli::DW_LANG_Rust)
        .or_else(|| addr2line::demangle(raw, gimli::DW_LANG_C_plus_plus))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbolizer(symbols: &[(u64, &str)]) -> ModuleSymbolizer {
        ModuleSymbolizer {
            loader: None,
            linked_image_base: 0x40_0000,
            symbols: symbols
                .iter()
                .map(|(address, name)| (*address, (*name).to_owned()))
                .collect(),
        }
    }

    #[test]
    fn symbol_lookup_picks_nearest_preceding_start() {
        let module = symbolizer(&[(0x1000, "alpha"), (0x1100, "beta"), (0x1200, "gamma")]);
        assert_eq!(module.symbol_for(0x0fff), None);
        assert_eq!(module.symbol_for(0x1000), Some((0x1000, "alpha")));
        assert_eq!(module.symbol_for(0x10ff), Some((0x1000, "alpha")));
        assert_eq!(module.symbol_for(0x1234), Some((0x1200, "gamma")));
    }

    #[test]
    fn probe_rebases_into_linked_space() {
        let module = symbolizer(&[]);
        assert_eq!(module.probe_for(0x7f00_0000_1234, 0x7f00_0000_0000), Some(0x40_1234));
        assert_eq!(module.probe_for(0x10, 0x20), None);
        assert_eq!(module.location_for(0x40_1234), None);
    }

    #[test]
    fn demangles_rust_and_cpp_names() {
        assert_eq!(
            demangle("_ZN4demo10create_foo17h0123456789abcdefE").as_deref(),
            Some("demo::create_foo")
        );
        assert_eq!(demangle("_Z10create_foov").as_deref(), Some("create_foo()"));
        assert_eq!(demangle("main"), None);
    }
}
