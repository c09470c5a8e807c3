use crate::models::entry::QueueEntry;

/// Position of the first entry the scheduler may start, in queue order.
pub fn next_eligible(entries: &[QueueEntry]) -> Option<usize> {
    entries.iter().position(QueueEntry::is_eligible)
}

/// Outcome of asking the scheduler to advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunNext {
    Started(crate::models::entry::EntryId),
    Exhausted,
}
