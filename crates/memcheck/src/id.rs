use std::fmt;

/// Identity of a tracked object: its address, used purely as a key.
///
/// The address is never dereferenced, so an id stays valid to query after
/// the object it named has been freed or the memory reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(usize);

impl ObjectId {
    pub const NULL: Self = Self(0);

    pub fn of<T: ?Sized>(object: &T) -> Self {
        Self::from_ptr(object as *const T)
    }

    pub fn from_ptr<T: ?Sized>(ptr: *const T) -> Self {
        Self(ptr.cast::<()>() as usize)
    }

    pub fn from_raw(value: usize) -> Self {
        Self(value)
    }

    pub fn get(self) -> usize {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
