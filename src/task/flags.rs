use bitflags::bitflags;

/// Scheduling priority of a job, from least to most urgent.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Background = 0,
    Utility = 1,
    #[default]
    Default = 2,
    High = 3,
}

impl Priority {
    pub(crate) fn from_raw(raw: u8) -> Priority {
        match raw {
            0 => Priority::Background,
            1 => Priority::Utility,
            3 => Priority::High,
            _ => Priority::Default,
        }
    }
}

bitflags! {
    /// Packed descriptor word of a [`Job`](crate::task::Job).
    ///
    /// The low bits describe the job's shape; the high byte carries the
    /// [`Priority`]. The fragment bits decide which trailing fragments an
    /// async task was allocated with, so they are fixed for the lifetime of
    /// the job.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct JobFlags: u32 {
        /// The job is a full [`AsyncTask`](crate::task::AsyncTask), resumed
        /// through its task entrypoint.
        const IS_ASYNC_TASK = 1 << 0;
        /// The task carries a child fragment linking it to a parent.
        const IS_CHILD_TASK = 1 << 1;
        /// The task carries a group-child fragment and offers its completion
        /// to a task group.
        const IS_GROUP_CHILD = 1 << 2;
        /// The task carries a future fragment and can be waited on.
        const IS_FUTURE = 1 << 3;
    }
}

const PRIORITY_SHIFT: u32 = 24;
const PRIORITY_MASK: u32 = 0xff << PRIORITY_SHIFT;

impl JobFlags {
    pub fn with_priority(self, priority: Priority) -> JobFlags {
        let bits = (self.bits() & !PRIORITY_MASK) | ((priority as u32) << PRIORITY_SHIFT);
        JobFlags::from_bits_retain(bits)
    }

    pub fn priority(self) -> Priority {
        Priority::from_raw((self.bits() >> PRIORITY_SHIFT) as u8)
    }

    pub fn is_async_task(self) -> bool {
        self.contains(JobFlags::IS_ASYNC_TASK)
    }

    pub fn is_child_task(self) -> bool {
        self.contains(JobFlags::IS_CHILD_TASK)
    }

    pub fn is_group_child(self) -> bool {
        self.contains(JobFlags::IS_GROUP_CHILD)
    }

    pub fn is_future(self) -> bool {
        self.contains(JobFlags::IS_FUTURE)
    }
}

impl Default for JobFlags {
    fn default() -> Self {
        JobFlags::empty().with_priority(Priority::default())
    }
}

/// The kind of an activation record, stored in its [`ContextFlags`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContextKind {
    /// A plain context: resumes into its parent and nothing else.
    #[default]
    Ordinary = 0,
    /// A context that can also yield to its parent without returning.
    Yielding = 1,
    /// The root context of a future task, carrying result/error slots.
    FutureRoot = 2,
    /// A future root that additionally captures a closure object.
    FutureClosure = 3,
}

/// Packed descriptor word of an [`AsyncContext`](crate::task::AsyncContext).
///
/// The low byte holds the [`ContextKind`]; the remaining bits are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextFlags(u32);

impl ContextFlags {
    pub fn new(kind: ContextKind) -> ContextFlags {
        ContextFlags(kind as u32)
    }

    pub fn kind(self) -> ContextKind {
        match self.0 & 0xff {
            1 => ContextKind::Yielding,
            2 => ContextKind::FutureRoot,
            3 => ContextKind::FutureClosure,
            _ => ContextKind::Ordinary,
        }
    }
}

impl Default for ContextFlags {
    fn default() -> Self {
        ContextFlags::new(ContextKind::Ordinary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_priority_round_trips() {
        let flags = JobFlags::default();
        assert_eq!(flags.priority(), Priority::Default);
        assert!(!flags.is_async_task());
    }

    #[rstest]
    #[case::background(Priority::Background)]
    #[case::utility(Priority::Utility)]
    #[case::default(Priority::Default)]
    #[case::high(Priority::High)]
    fn priority_survives_flag_updates(#[case] priority: Priority) {
        let flags = JobFlags::IS_ASYNC_TASK.with_priority(priority) | JobFlags::IS_FUTURE;

        assert_eq!(flags.priority(), priority);
        assert!(flags.is_async_task());
        assert!(flags.is_future());
        assert!(!flags.is_child_task());
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::Background < Priority::Utility);
        assert!(Priority::Utility < Priority::Default);
        assert!(Priority::Default < Priority::High);
    }

    #[rstest]
    #[case::ordinary(ContextKind::Ordinary)]
    #[case::yielding(ContextKind::Yielding)]
    #[case::future(ContextKind::FutureRoot)]
    #[case::future_closure(ContextKind::FutureClosure)]
    fn context_kind_round_trips(#[case] kind: ContextKind) {
        assert_eq!(ContextFlags::new(kind).kind(), kind);
    }
}
