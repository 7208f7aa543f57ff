use memcheck_trace_capture::{CallStack, CaptureOptions, capture_below};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::marker::PhantomData;
use tracing::{debug, error};

use crate::{IntegrityViolation, LeakReport, Lifecycle, LifecycleEntry, ObjectId, Operation};

/// Lifecycle records for every observed instance of `T`, keyed by address.
///
/// Iteration follows address order. Addresses come from the allocator, so
/// that order is not stable across runs.
pub struct Registry<T: ?Sized> {
    entries: Mutex<BTreeMap<ObjectId, LifecycleEntry>>,
    options: CaptureOptions,
    _tracked: PhantomData<fn(*const T)>,
}

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized + 'static> Registry<T> {
    /// Same as [`crate::registry`].
    pub fn get() -> &'static Self {
        crate::registry::<T>()
    }
}

impl<T: ?Sized> Registry<T> {
    pub fn new() -> Self {
        Self::with_options(CaptureOptions::default())
    }

    pub fn with_options(options: CaptureOptions) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            options,
            _tracked: PhantomData,
        }
    }

    pub fn options(&self) -> CaptureOptions {
        self.options
    }

    /// Records a construction at `id`.
    ///
    /// Valid for an identity never seen before or one whose previous object
    /// was destroyed (address reuse). The previous traces are dropped. The
    /// stored trace starts at the code that called this method.
    #[inline(never)]
    pub fn created(&self, id: ObjectId) -> Result<(), IntegrityViolation> {
        self.record_created(id, Self::created as *const ())
    }

    /// Records a destruction at `id`, which must currently be alive.
    #[inline(never)]
    pub fn destroyed(&self, id: ObjectId) -> Result<(), IntegrityViolation> {
        self.record_destroyed(id, Self::destroyed as *const ())
    }

    /// Panicking form of [`Registry::created`] for constructors, where a
    /// violation means tracking can no longer be trusted.
    #[inline(never)]
    pub fn track_created(&self, object: &T) {
        let recorded = self.record_created(ObjectId::of(object), Self::track_created as *const ());
        if let Err(violation) = recorded {
            panic!("{violation}");
        }
    }

    /// Panicking form of [`Registry::destroyed`] for `Drop` impls.
    #[inline(never)]
    pub fn track_destroyed(&self, object: &T) {
        let recorded =
            self.record_destroyed(ObjectId::of(object), Self::track_destroyed as *const ());
        if let Err(violation) = recorded {
            panic!("{violation}");
        }
    }

    // `boundary` is the public method the caller went through. The trace is
    // cut just below it.
    fn record_created(
        &self,
        id: ObjectId,
        boundary: *const (),
    ) -> Result<(), IntegrityViolation> {
        if id.is_null() {
            return Err(self.violation(IntegrityViolation::NullIdentity {
                operation: Operation::Created,
            }));
        }

        let trace = capture_below(boundary, self.options);
        let mut entries = self.entries.lock();
        let entry = entries.entry(id).or_default();
        if entry.state() == Lifecycle::Alive {
            drop(entries);
            return Err(self.violation(IntegrityViolation::AlreadyAlive { id }));
        }

        debug!(
            tracked_type = std::any::type_name::<T>(),
            object_id = %id,
            frames = trace.len(),
            "object created"
        );
        entry.begin(trace);
        Ok(())
    }

    fn record_destroyed(
        &self,
        id: ObjectId,
        boundary: *const (),
    ) -> Result<(), IntegrityViolation> {
        if id.is_null() {
            return Err(self.violation(IntegrityViolation::NullIdentity {
                operation: Operation::Destroyed,
            }));
        }

        let trace = capture_below(boundary, self.options);
        let mut entries = self.entries.lock();
        let state = entries
            .get(&id)
            .map_or(Lifecycle::Unknown, LifecycleEntry::state);
        let Some(entry) = entries.get_mut(&id).filter(|_| state == Lifecycle::Alive) else {
            drop(entries);
            return Err(self.violation(IntegrityViolation::NotAlive { id, state }));
        };

        debug!(
            tracked_type = std::any::type_name::<T>(),
            object_id = %id,
            frames = trace.len(),
            "object destroyed"
        );
        entry.end(trace);
        Ok(())
    }

    fn violation(&self, violation: IntegrityViolation) -> IntegrityViolation {
        error!(
            tracked_type = std::any::type_name::<T>(),
            %violation,
            "lifecycle integrity check failed"
        );
        violation
    }

    /// True iff `id` was created and not destroyed since.
    pub fn exists(&self, id: ObjectId) -> bool {
        self.state(id) == Lifecycle::Alive
    }

    pub fn state(&self, id: ObjectId) -> Lifecycle {
        self.entries
            .lock()
            .get(&id)
            .map_or(Lifecycle::Unknown, LifecycleEntry::state)
    }

    pub fn entry(&self, id: ObjectId) -> Option<LifecycleEntry> {
        self.entries.lock().get(&id).cloned()
    }

    pub fn alive_ids(&self) -> Vec<ObjectId> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.state() == Lifecycle::Alive)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn alive_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.state() == Lifecycle::Alive)
            .count()
    }

    // Traces are cloned out so symbol resolution runs without the lock held.
    fn create_stack(&self, id: ObjectId) -> Option<CallStack> {
        self.entries
            .lock()
            .get(&id)
            .and_then(|entry| entry.create_trace().cloned())
    }

    fn destroy_stack(&self, id: ObjectId) -> Option<CallStack> {
        self.entries
            .lock()
            .get(&id)
            .and_then(|entry| entry.destroy_trace().cloned())
    }

    /// Resolved creation trace, one frame per line.
    pub fn creation_trace(&self, id: ObjectId) -> Option<String> {
        self.create_stack(id).map(|stack| stack.to_string())
    }

    pub fn destruction_trace(&self, id: ObjectId) -> Option<String> {
        self.destroy_stack(id).map(|stack| stack.to_string())
    }

    /// Writes the creation trace for `id`, returning `false` without
    /// writing anything if there was none.
    pub fn write_create(&self, id: ObjectId, out: &mut dyn Write) -> io::Result<bool> {
        let Some(stack) = self.create_stack(id) else {
            return Ok(false);
        };
        writeln!(out, "construction stack trace for {id}")?;
        write!(out, "{stack}")?;
        Ok(true)
    }

    pub fn write_destroy(&self, id: ObjectId, out: &mut dyn Write) -> io::Result<bool> {
        let Some(stack) = self.destroy_stack(id) else {
            return Ok(false);
        };
        writeln!(out, "destruction stack trace for {id}")?;
        write!(out, "{stack}")?;
        Ok(true)
    }

    /// Writes the creation trace for `id` to `out`, or the
    /// `"<id> has not been created"` notice to `notices` if there is none.
    pub fn report_create(
        &self,
        id: ObjectId,
        out: &mut dyn Write,
        notices: &mut dyn Write,
    ) -> io::Result<()> {
        if !self.write_create(id, out)? {
            writeln!(notices, "{id} has not been {}", Operation::Created)?;
        }
        Ok(())
    }

    pub fn report_destroy(
        &self,
        id: ObjectId,
        out: &mut dyn Write,
        notices: &mut dyn Write,
    ) -> io::Result<()> {
        if !self.write_destroy(id, out)? {
            writeln!(notices, "{id} has not been {}", Operation::Destroyed)?;
        }
        Ok(())
    }

    /// Prints where `id` was created to stdout, or a notice to stderr.
    pub fn show_create(&self, id: ObjectId) {
        let result = self.report_create(id, &mut io::stdout().lock(), &mut io::stderr().lock());
        if let Err(error) = result {
            eprintln!("failed to write construction trace for {id}: {error}");
        }
    }

    /// Prints where `id` was destroyed to stdout, or a notice to stderr.
    pub fn show_destroy(&self, id: ObjectId) {
        let result = self.report_destroy(id, &mut io::stdout().lock(), &mut io::stderr().lock());
        if let Err(error) = result {
            eprintln!("failed to write destruction trace for {id}: {error}");
        }
    }

    /// Lists every live identity, optionally with its creation trace.
    pub fn write_objs(&self, out: &mut dyn Write, show_stack: bool) -> io::Result<()> {
        writeln!(out, "existing objects:")?;
        for id in self.alive_ids() {
            writeln!(out, "{id}")?;
            if show_stack {
                self.write_create(id, out)?;
            }
        }
        Ok(())
    }

    pub fn show_objs(&self, show_stack: bool) {
        if let Err(error) = self.write_objs(&mut io::stdout().lock(), show_stack) {
            eprintln!("failed to write existing objects: {error}");
        }
    }

    /// Snapshot of everything still alive, with creation traces.
    pub fn leak_report(&self) -> LeakReport {
        let leaked = self
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.state() == Lifecycle::Alive)
            .filter_map(|(id, entry)| Some((*id, entry.create_trace()?.clone())))
            .collect();
        LeakReport::new(std::any::type_name::<T>(), leaked)
    }

    /// Releases an explicitly constructed registry after a final leak check.
    pub fn finish(self) -> LeakReport {
        let report = self.leak_report();
        if !report.is_empty() {
            debug!(
                tracked_type = std::any::type_name::<T>(),
                leaked = report.len(),
                "registry finished with live objects"
            );
        }
        report
    }
}
