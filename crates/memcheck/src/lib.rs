//! Debug-build tracking of object construction and destruction.
//!
//! A tracked type reports its own address from its constructor and its
//! `Drop` impl. The registry for that type keeps the call stack of the most
//! recent creation and destruction at each address, so a developer can ask
//! whether an object is still alive and where it was created or destroyed.
//!
//! ```no_run
//! use memcheck::registry;
//!
//! struct Foo {
//!     value: u64,
//! }
//!
//! impl Foo {
//!     fn new(value: u64) -> Box<Foo> {
//!         let foo = Box::new(Foo { value });
//!         registry::<Foo>().track_created(&*foo);
//!         foo
//!     }
//! }
//!
//! impl Drop for Foo {
//!     fn drop(&mut self) {
//!         registry::<Foo>().track_destroyed(self);
//!     }
//! }
//!
//! let foo = Foo::new(7);
//! registry::<Foo>().show_create(memcheck::ObjectId::of(&*foo));
//! registry::<Foo>().show_objs(false);
//! ```
//!
//! Capturing a stack is cheap; symbol lookup only happens when a trace is
//! printed.

use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::LazyLock;

pub(crate) mod entry;
pub(crate) mod error;
pub(crate) mod id;
pub(crate) mod registry;
pub(crate) mod report;

pub use self::entry::*;
pub use self::error::*;
pub use self::id::*;
pub use self::registry::*;
pub use self::report::*;

pub use memcheck_trace_capture::{CallStack, CaptureOptions};
pub use memcheck_trace_types::Frame;

static REGISTRIES: LazyLock<Mutex<HashMap<TypeId, &'static (dyn Any + Send + Sync)>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// The process-wide registry for `T`.
///
/// Created on first access with [`CaptureOptions::from_env`] and never torn
/// down, so anything still alive at exit can be reported as a leak.
pub fn registry<T: ?Sized + 'static>() -> &'static Registry<T> {
    let mut registries = REGISTRIES.lock();
    let slot = *registries.entry(TypeId::of::<T>()).or_insert_with(|| {
        let registry: &'static Registry<T> =
            Box::leak(Box::new(Registry::with_options(CaptureOptions::from_env())));
        registry as &'static (dyn Any + Send + Sync)
    });
    slot.downcast_ref::<Registry<T>>()
        .expect("invariant violated: registry slot must hold the registry for its type id")
}
