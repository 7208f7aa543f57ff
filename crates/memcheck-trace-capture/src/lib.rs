use memcheck_trace_types::{Frame, FrameAddress};
use std::fmt;
use std::iter::FusedIterator;
use std::num::NonZeroUsize;
use std::sync::OnceLock;

mod symbolizer;

pub const DEFAULT_MAX_FRAMES: usize = 40;
/// Deepest capture honored. Larger configured depths are clamped to this.
pub const MAX_SUPPORTED_FRAMES: usize = 4096;
pub const STACK_DEPTH_ENV: &str = "MEMCHECK_STACK_DEPTH";
pub const SKIP_FRAMES_ENV: &str = "MEMCHECK_SKIP_FRAMES";
pub const RESOLVE_SOURCE_ENV: &str = "MEMCHECK_RESOLVE_SOURCE";

/// Frames walked past the requested bound so the capture machinery's own
/// frames can be dropped without shortening the trace.
const MACHINERY_SLACK: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
    pub max_frames: NonZeroUsize,
    pub skip_frames: usize,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            max_frames: NonZeroUsize::new(DEFAULT_MAX_FRAMES)
                .expect("invariant violated: default max_frames must be non-zero"),
            skip_frames: 0,
        }
    }
}

impl CaptureOptions {
    /// Reads `MEMCHECK_STACK_DEPTH` and `MEMCHECK_SKIP_FRAMES`, keeping the
    /// default for anything missing, zero, or unparsable. Both values are
    /// clamped to [`MAX_SUPPORTED_FRAMES`].
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let max_frames = lookup(STACK_DEPTH_ENV)
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .map(|depth| depth.min(MAX_SUPPORTED_FRAMES))
            .and_then(NonZeroUsize::new)
            .unwrap_or(defaults.max_frames);
        let skip_frames = lookup(SKIP_FRAMES_ENV)
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .map(|skip| skip.min(MAX_SUPPORTED_FRAMES))
            .unwrap_or(defaults.skip_frames);
        Self {
            max_frames,
            skip_frames,
        }
    }
}

/// Whether resolution should consult debug-line tables for file/line.
/// Read once from `MEMCHECK_RESOLVE_SOURCE`; anything but `0` enables it.
pub fn source_lookup_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        std::env::var(RESOLVE_SOURCE_ENV)
            .map(|raw| raw.trim() != "0")
            .unwrap_or(true)
    })
}

/// Return addresses captured at one instant, innermost call first.
///
/// Capturing only reads addresses. Symbol lookup happens when frames are
/// iterated or the stack is formatted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStack {
    addresses: Vec<FrameAddress>,
    max_frames: NonZeroUsize,
}

impl CallStack {
    pub fn capture() -> Self {
        capture_current(CaptureOptions::default())
    }

    pub fn capture_with(options: CaptureOptions) -> Self {
        capture_current(options)
    }

    /// Builds a stack from already-known addresses, keeping at most
    /// `options.max_frames` of them.
    pub fn from_addresses(
        addresses: impl IntoIterator<Item = FrameAddress>,
        options: CaptureOptions,
    ) -> Self {
        Self {
            addresses: addresses
                .into_iter()
                .take(options.max_frames.get())
                .collect(),
            max_frames: options.max_frames,
        }
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Capacity this stack was captured with.
    pub fn max_frames(&self) -> NonZeroUsize {
        self.max_frames
    }

    pub fn addresses(&self) -> &[FrameAddress] {
        &self.addresses
    }

    /// Lazily resolved frames. Each call starts a fresh traversal.
    pub fn frames(&self) -> Frames<'_> {
        Frames {
            addresses: self.addresses.iter(),
        }
    }
}

impl fmt::Display for CallStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in self.frames() {
            writeln!(f, "{frame}")?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a CallStack {
    type Item = Frame;
    type IntoIter = Frames<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames()
    }
}

#[derive(Debug, Clone)]
pub struct Frames<'a> {
    addresses: std::slice::Iter<'a, FrameAddress>,
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        self.addresses.next().copied().map(resolve_frame)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.addresses.size_hint()
    }
}

impl DoubleEndedIterator for Frames<'_> {
    fn next_back(&mut self) -> Option<Frame> {
        self.addresses.next_back().copied().map(resolve_frame)
    }
}

impl ExactSizeIterator for Frames<'_> {}

impl FusedIterator for Frames<'_> {}

/// Snapshots the calling thread's stack.
///
/// Frames belonging to the capture machinery are dropped, so the first
/// address is inside the function that called `capture_current`. Never
/// records more than `options.max_frames` addresses.
#[inline(never)]
pub fn capture_current(options: CaptureOptions) -> CallStack {
    capture_bounded(&[capture_current as *const ()], options)
}

/// Snapshots the calling thread's stack starting at the caller of `entry`.
///
/// `entry` is a function currently on this thread's stack, usually the
/// public entry point of whatever is recording the trace. Every frame up to
/// and including its innermost activation is dropped. When `entry` cannot be
/// found on the stack this behaves like [`capture_current`].
#[inline(never)]
pub fn capture_below(entry: *const (), options: CaptureOptions) -> CallStack {
    capture_bounded(&[entry, capture_below as *const ()], options)
}

/// Walks the stack and cuts it after the first boundary function found,
/// trying `boundaries` in order.
fn capture_bounded(boundaries: &[*const ()], options: CaptureOptions) -> CallStack {
    let depth = options.max_frames.get().min(MAX_SUPPORTED_FRAMES);
    let skip = options.skip_frames.min(MAX_SUPPORTED_FRAMES);
    let limit = depth + skip + MACHINERY_SLACK;

    // Deep limits are rarely reached; grow on demand past the default.
    let mut raw: Vec<(u64, u64)> =
        Vec::with_capacity(limit.min(DEFAULT_MAX_FRAMES + MACHINERY_SLACK));
    backtrace::trace(|frame| {
        let ip = frame.ip() as usize as u64;
        if ip != 0 {
            raw.push((ip, frame.symbol_address() as usize as u64));
        }
        raw.len() < limit
    });

    let start = boundaries
        .iter()
        .filter_map(|entry| FrameAddress::non_null(*entry as usize as u64).ok())
        .find_map(|entry| raw.iter().position(|&(_, symbol)| symbol == entry.get()))
        .map_or(0, |index| index + 1);

    CallStack::from_addresses(
        raw[start..]
            .iter()
            .skip(skip)
            .map(|&(ip, _)| FrameAddress::new(ip)),
        options,
    )
}

/// Resolves one address against the modules currently loaded.
///
/// The null address yields a frame with every field unset. Anything that
/// cannot be matched stays unset and renders as `??`; this never fails.
pub fn resolve_frame(address: FrameAddress) -> Frame {
    if address.is_null() {
        return Frame::default();
    }
    platform::resolve_impl(address)
}

#[cfg(unix)]
mod platform {
    use crate::symbolizer;
    use memcheck_trace_types::{Frame, FrameAddress, ModulePath, SymbolOffset};
    use std::ffi::{CStr, c_void};

    struct DynamicSymbolInfo {
        module_path: String,
        runtime_base: u64,
        symbol: Option<(String, u64)>,
    }

    pub fn resolve_impl(address: FrameAddress) -> Frame {
        let ip = address.get();
        let Some(info) = dynamic_symbol_info(ip) else {
            return Frame::unresolved(address);
        };
        let Ok(module) = ModulePath::new(info.module_path) else {
            return Frame::unresolved(address);
        };

        let mut frame = Frame {
            module: Some(module),
            ..Frame::unresolved(address)
        };

        if let Some((name, start)) = info.symbol {
            frame.offset = Some(SymbolOffset::between(ip, start));
            frame.raw_symbol = Some(name);
        }

        if let Some(module) = frame.module.clone() {
            symbolizer::with_module(module.as_str(), |symbolizer| {
                let Some(probe) = symbolizer.probe_for(ip, info.runtime_base) else {
                    return;
                };
                if frame.raw_symbol.is_none()
                    && let Some((start, name)) = symbolizer.symbol_for(probe)
                {
                    frame.offset = Some(SymbolOffset::between(probe, start));
                    frame.raw_symbol = Some(name.to_owned());
                }
                if crate::source_lookup_enabled()
                    && let Some((file, line)) = symbolizer.location_for(probe)
                {
                    frame.source_file = Some(file);
                    frame.line = line;
                }
            });
        }

        if frame.offset.is_none() {
            frame.offset = Some(SymbolOffset::between(ip, info.runtime_base));
        }
        frame.demangled_symbol = frame.raw_symbol.as_deref().and_then(symbolizer::demangle);
        frame
    }

    fn dynamic_symbol_info(ip: u64) -> Option<DynamicSymbolInfo> {
        let mut info = std::mem::MaybeUninit::<libc::Dl_info>::zeroed();
        let ok = unsafe { libc::dladdr(ip as usize as *const c_void, info.as_mut_ptr()) };
        if ok == 0 {
            return None;
        }

        let info = unsafe { info.assume_init() };
        if info.dli_fbase.is_null() {
            return None;
        }
        let runtime_base = info.dli_fbase as usize as u64;

        let mut module_path = if info.dli_fname.is_null() {
            String::new()
        } else {
            unsafe { CStr::from_ptr(info.dli_fname) }
                .to_string_lossy()
                .into_owned()
        };
        // glibc reports the main executable with an empty name.
        if module_path.is_empty() {
            module_path = std::env::current_exe()
                .ok()?
                .to_string_lossy()
                .into_owned();
        }

        let symbol = if info.dli_sname.is_null() || info.dli_saddr.is_null() {
            None
        } else {
            let name = unsafe { CStr::from_ptr(info.dli_sname) }
                .to_string_lossy()
                .into_owned();
            (!name.is_empty()).then(|| (name, info.dli_saddr as usize as u64))
        };

        Some(DynamicSymbolInfo {
            module_path,
            runtime_base,
            symbol,
        })
    }
}

#[cfg(not(unix))]
mod platform {
    use memcheck_trace_types::{Frame, FrameAddress};

    pub fn resolve_impl(address: FrameAddress) -> Frame {
        Frame::unresolved(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memcheck_trace_types::PLACEHOLDER;
    use std::hint::black_box;

    fn options(max_frames: usize) -> CaptureOptions {
        CaptureOptions {
            max_frames: NonZeroUsize::new(max_frames).expect("max_frames should be non-zero"),
            skip_frames: 0,
        }
    }

    #[inline(never)]
    fn capture_at_depth(depth: usize, options: CaptureOptions) -> CallStack {
        if depth == 0 {
            return capture_current(options);
        }
        black_box(capture_at_depth(black_box(depth - 1), options))
    }

    #[inline(never)]
    fn resolvable_marker() -> u64 {
        black_box(0x5eed)
    }

    #[inline(never)]
    fn record_below_self(entry: *const ()) -> CallStack {
        black_box(capture_below(entry, CaptureOptions::default()))
    }

    #[inline(never)]
    fn calls_recorder() -> CallStack {
        black_box(record_below_self(record_below_self as *const ()))
    }

    #[inline(never)]
    fn calls_recorder_with(entry: *const ()) -> CallStack {
        black_box(record_below_self(entry))
    }

    #[test]
    fn default_depth_is_forty() {
        assert_eq!(CaptureOptions::default().max_frames.get(), 40);
        assert_eq!(CaptureOptions::default().skip_frames, 0);
    }

    #[test]
    fn options_from_lookup_parse_and_fall_back() {
        let parsed = CaptureOptions::from_lookup(|key| match key {
            STACK_DEPTH_ENV => Some("12".to_owned()),
            SKIP_FRAMES_ENV => Some(" 2 ".to_owned()),
            _ => None,
        });
        assert_eq!(parsed.max_frames.get(), 12);
        assert_eq!(parsed.skip_frames, 2);

        let garbage = CaptureOptions::from_lookup(|key| match key {
            STACK_DEPTH_ENV => Some("0".to_owned()),
            SKIP_FRAMES_ENV => Some("lots".to_owned()),
            _ => None,
        });
        assert_eq!(garbage, CaptureOptions::default());
    }

    #[test]
    fn huge_configured_depth_is_clamped() {
        let clamped = CaptureOptions::from_lookup(|key| match key {
            STACK_DEPTH_ENV => Some("1000000000000".to_owned()),
            SKIP_FRAMES_ENV => Some(usize::MAX.to_string()),
            _ => None,
        });
        assert_eq!(clamped.max_frames.get(), MAX_SUPPORTED_FRAMES);
        assert_eq!(clamped.skip_frames, MAX_SUPPORTED_FRAMES);
    }

    #[test]
    fn huge_depth_captures_without_reserving_it() {
        let stack = capture_current(CaptureOptions {
            max_frames: NonZeroUsize::MAX,
            skip_frames: 0,
        });
        assert!(!stack.is_empty());
        assert!(stack.len() <= MAX_SUPPORTED_FRAMES);
        assert_eq!(stack.max_frames(), NonZeroUsize::MAX);

        let stack = capture_current(CaptureOptions {
            max_frames: NonZeroUsize::MAX,
            skip_frames: usize::MAX,
        });
        assert!(stack.is_empty());
    }

    #[test]
    fn capture_never_exceeds_max_frames() {
        let stack = capture_at_depth(100, options(5));
        assert!(stack.len() <= 5, "captured {} frames", stack.len());
        assert!(!stack.is_empty());

        let stack = capture_at_depth(100, CaptureOptions::default());
        assert!(stack.len() <= DEFAULT_MAX_FRAMES);
        assert_eq!(stack.max_frames().get(), DEFAULT_MAX_FRAMES);
    }

    #[test]
    fn from_addresses_truncates_to_capacity() {
        let stack = CallStack::from_addresses((1..=10).map(FrameAddress::new), options(3));
        assert_eq!(
            stack.addresses(),
            &[
                FrameAddress::new(1),
                FrameAddress::new(2),
                FrameAddress::new(3)
            ]
        );
    }

    #[test]
    fn resolving_null_clears_every_field() {
        assert_eq!(resolve_frame(FrameAddress::NULL), Frame::default());
    }

    #[test]
    fn unmapped_address_degrades_to_placeholders() {
        let heap = vec![0u8; 1 << 20];
        let frame = resolve_frame(FrameAddress::new(heap.as_ptr() as usize as u64));
        assert!(!frame.is_resolved());
        assert_eq!(frame.binary_file(), PLACEHOLDER);
        assert_eq!(frame.function(), PLACEHOLDER);
        assert_eq!(frame.demangled_function(), PLACEHOLDER);
        assert_eq!(frame.source_file(), PLACEHOLDER);
        assert_eq!(frame.line_number(), None);
    }

    #[test]
    fn resolution_is_stable_per_address() {
        let stack = capture_at_depth(3, CaptureOptions::default());
        for address in stack.addresses() {
            assert_eq!(resolve_frame(*address), resolve_frame(*address));
        }
    }

    #[test]
    fn function_address_resolves_to_its_module() {
        let address = resolvable_marker as *const () as usize as u64;
        let frame = resolve_frame(FrameAddress::new(address));
        assert!(frame.is_resolved());
        assert_ne!(frame.binary_file(), PLACEHOLDER);
        assert!(
            frame.display_name().contains("resolvable_marker"),
            "unexpected symbol {}",
            frame.display_name()
        );
    }

    #[test]
    fn capture_reaches_test_body() {
        let stack = capture_at_depth(2, CaptureOptions::default());
        assert!(
            stack
                .frames()
                .any(|frame| frame.display_name().contains("capture_reaches_test_body")),
            "trace did not include the test function:\n{stack}"
        );
    }

    #[test]
    fn capture_below_starts_at_the_entry_caller() {
        let stack = calls_recorder();
        let first = stack.frames().next().expect("stack should not be empty");
        assert!(
            first.display_name().contains("calls_recorder"),
            "unexpected first frame:\n{stack}"
        );
    }

    #[test]
    fn capture_below_falls_back_when_entry_is_not_on_the_stack() {
        for entry in [resolvable_marker as *const (), std::ptr::null()] {
            let stack = calls_recorder_with(entry);
            let first = stack.frames().next().expect("stack should not be empty");
            assert!(
                first.display_name().contains("record_below_self"),
                "unexpected first frame:\n{stack}"
            );
        }
    }

    #[test]
    fn traversal_runs_both_ways() {
        let stack = capture_at_depth(4, CaptureOptions::default());
        let forward: Vec<FrameAddress> = stack.frames().map(|frame| frame.address).collect();
        let mut backward: Vec<FrameAddress> =
            stack.frames().rev().map(|frame| frame.address).collect();
        backward.reverse();
        assert_eq!(forward, backward);
        assert_eq!(forward.as_slice(), stack.addresses());
        assert_eq!(stack.frames().len(), stack.len());
    }

    #[test]
    fn display_has_one_line_per_frame() {
        let stack = capture_at_depth(2, CaptureOptions::default());
        let text = stack.to_string();
        assert_eq!(text.lines().count(), stack.len());
        for (line, address) in text.lines().zip(stack.addresses()) {
            assert!(line.starts_with(&format!("[{address}] ")), "bad line {line}");
        }
    }
}
