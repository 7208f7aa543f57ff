use std::error::Error;
use std::fmt;

/// Rendered in place of any frame field that could not be resolved.
pub const PLACEHOLDER: &str = "??";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantError {
    ZeroAddress(&'static str),
    EmptyField(&'static str),
}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroAddress(field) => write!(f, "{field} must be non-zero"),
            Self::EmptyField(field) => write!(f, "{field} must be non-empty"),
        }
    }
}

impl Error for InvariantError {}

/// A raw return address read off the stack.
///
/// The null address is representable: resolving it yields a cleared frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameAddress(u64);

impl FrameAddress {
    pub const NULL: Self = Self(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn non_null(value: u64) -> Result<Self, InvariantError> {
        if value == 0 {
            return Err(InvariantError::ZeroAddress("frame_address"));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FrameAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModulePath(String);

impl ModulePath {
    pub fn new(value: impl Into<String>) -> Result<Self, InvariantError> {
        let value = value.into();
        if value.is_empty() {
            return Err(InvariantError::EmptyField("module_path"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum OffsetSign {
    #[default]
    Plus,
    Minus,
}

impl OffsetSign {
    pub fn as_char(self) -> char {
        match self {
            Self::Plus => '+',
            Self::Minus => '-',
        }
    }
}

/// Signed distance between a frame address and the start of the symbol it
/// was attributed to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SymbolOffset {
    pub sign: OffsetSign,
    pub magnitude: u64,
}

impl SymbolOffset {
    pub fn between(address: u64, symbol_start: u64) -> Self {
        if address >= symbol_start {
            Self {
                sign: OffsetSign::Plus,
                magnitude: address - symbol_start,
            }
        } else {
            Self {
                sign: OffsetSign::Minus,
                magnitude: symbol_start - address,
            }
        }
    }
}

impl fmt::Display for SymbolOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}0x{:x}", self.sign.as_char(), self.magnitude)
    }
}

/// One stack location, resolved as far as the loaded modules allow.
///
/// Every field other than `address` is optional. A frame built from the null
/// address has every field unset, which is how a frame's resolved state is
/// released.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub address: FrameAddress,
    pub module: Option<ModulePath>,
    pub raw_symbol: Option<String>,
    pub demangled_symbol: Option<String>,
    /// Relative to the symbol start, or to the module base when no symbol
    /// covers the address.
    pub offset: Option<SymbolOffset>,
    pub source_file: Option<String>,
    pub line: Option<u32>,
}

impl Frame {
    pub fn unresolved(address: FrameAddress) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.module.is_some()
    }

    pub fn binary_file(&self) -> &str {
        or_placeholder(self.module.as_ref().map(ModulePath::as_str))
    }

    pub fn function(&self) -> &str {
        or_placeholder(self.raw_symbol.as_deref())
    }

    pub fn demangled_function(&self) -> &str {
        or_placeholder(self.demangled_symbol.as_deref())
    }

    /// Best name to print: demangled, then raw, then the placeholder.
    pub fn display_name(&self) -> &str {
        or_placeholder(
            self.demangled_symbol
                .as_deref()
                .or(self.raw_symbol.as_deref()),
        )
    }

    pub fn source_file(&self) -> &str {
        or_placeholder(self.source_file.as_deref())
    }

    pub fn line_number(&self) -> Option<u32> {
        self.line
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let offset = self.offset.unwrap_or_default();
        write!(
            f,
            "[{}] {} ({}{}) in {}:",
            self.address,
            self.display_name(),
            self.binary_file(),
            offset,
            self.source_file(),
        )?;
        match self.line {
            Some(line) => write!(f, "{line}"),
            None => f.write_str(PLACEHOLDER),
        }
    }
}

fn or_placeholder(value: Option<&str>) -> &str {
    match value {
        Some(value) if !value.is_empty() => value,
        _ => PLACEHOLDER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved_frame() -> Frame {
        Frame {
            address: FrameAddress::new(0x5555_0000_1a2b),
            module: Some(ModulePath::new("/usr/bin/demo").expect("module path should be valid")),
            raw_symbol: Some("_ZN4demo10create_foo17h0123456789abcdefE".to_owned()),
            demangled_symbol: Some("demo::create_foo".to_owned()),
            offset: Some(SymbolOffset::between(0x5555_0000_1a2b, 0x5555_0000_1a00)),
            source_file: Some("src/main.rs".to_owned()),
            line: Some(42),
        }
    }

    #[test]
    fn resolved_frame_line_shape() {
        insta::assert_snapshot!(
            resolved_frame().to_string(),
            @"[0x555500001a2b] demo::create_foo (/usr/bin/demo+0x2b) in src/main.rs:42"
        );
    }

    #[test]
    fn unresolved_frame_renders_placeholders() {
        let frame = Frame::unresolved(FrameAddress::new(0x10));
        assert!(!frame.is_resolved());
        assert_eq!(frame.binary_file(), PLACEHOLDER);
        assert_eq!(frame.function(), PLACEHOLDER);
        assert_eq!(frame.demangled_function(), PLACEHOLDER);
        assert_eq!(frame.source_file(), PLACEHOLDER);
        assert_eq!(frame.line_number(), None);
        insta::assert_snapshot!(frame.to_string(), @"[0x10] ?? (??+0x0) in ??:??");
    }

    #[test]
    fn display_name_falls_back_to_raw_symbol() {
        let frame = Frame {
            demangled_symbol: None,
            raw_symbol: Some("main".to_owned()),
            ..resolved_frame()
        };
        assert_eq!(frame.display_name(), "main");
        assert_eq!(frame.demangled_function(), PLACEHOLDER);
    }

    #[test]
    fn offset_before_symbol_start_is_negative() {
        let offset = SymbolOffset::between(0x100, 0x180);
        assert_eq!(offset.sign, OffsetSign::Minus);
        assert_eq!(offset.magnitude, 0x80);
        assert_eq!(offset.to_string(), "-0x80");
    }

    #[test]
    fn empty_module_path_is_rejected() {
        assert_eq!(
            ModulePath::new(""),
            Err(InvariantError::EmptyField("module_path"))
        );
    }

    #[test]
    fn null_address_is_rejected_where_required() {
        assert!(FrameAddress::NULL.is_null());
        assert_eq!(
            FrameAddress::non_null(0),
            Err(InvariantError::ZeroAddress("frame_address"))
        );
        assert_eq!(
            FrameAddress::non_null(0x42).map(FrameAddress::get),
            Ok(0x42)
        );
    }
}
