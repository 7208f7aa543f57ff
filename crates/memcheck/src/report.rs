use memcheck_trace_capture::CallStack;
use std::fmt;

use crate::ObjectId;

/// Objects still alive when a registry was inspected for the last time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakReport {
    tracked_type: &'static str,
    leaked: Vec<(ObjectId, CallStack)>,
}

impl LeakReport {
    pub(crate) fn new(tracked_type: &'static str, leaked: Vec<(ObjectId, CallStack)>) -> Self {
        Self {
            tracked_type,
            leaked,
        }
    }

    pub fn tracked_type(&self) -> &'static str {
        self.tracked_type
    }

    pub fn is_empty(&self) -> bool {
        self.leaked.is_empty()
    }

    pub fn len(&self) -> usize {
        self.leaked.len()
    }

    pub fn ids(&self) -> Vec<ObjectId> {
        self.leaked.iter().map(|(id, _)| *id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &CallStack)> {
        self.leaked.iter().map(|(id, stack)| (*id, stack))
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.leaked.is_empty() {
            return writeln!(f, "no leaked {} objects", self.tracked_type);
        }
        writeln!(f, "{} leaked {} objects:", self.leaked.len(), self.tracked_type)?;
        for (id, stack) in &self.leaked {
            writeln!(f, "{id} created at:")?;
            write!(f, "{stack}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memcheck_trace_capture::CaptureOptions;

    #[test]
    fn empty_report_says_so() {
        let report = LeakReport::new("demo::Foo", Vec::new());
        assert!(report.is_empty());
        assert_eq!(report.to_string(), "no leaked demo::Foo objects\n");
    }

    #[test]
    fn report_lists_each_leak_with_its_trace() {
        let stack = CallStack::from_addresses(std::iter::empty(), CaptureOptions::default());
        let report = LeakReport::new(
            "demo::Foo",
            vec![
                (ObjectId::from_raw(0x10), stack.clone()),
                (ObjectId::from_raw(0x20), stack),
            ],
        );
        assert_eq!(report.len(), 2);
        assert_eq!(
            report.to_string(),
            "2 leaked demo::Foo objects:\n0x10 created at:\n0x20 created at:\n"
        );
        assert_eq!(
            report.iter().map(|(id, _)| id).collect::<Vec<_>>(),
            report.ids()
        );
    }
}
