use super::entry::EntryId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryField {
    Name,
    Status,
    Output,
    Working,
    Finished,
    Error,
}

/// State changes published to subscribers of the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    WorkingChanged(bool),
    CurrentEntryChanged(Option<EntryId>),
    EntryAdded(EntryId),
    EntryRemoved(EntryId),
    EntryChanged(EntryId, EntryField),
    EntryFinished(EntryId),
    QueueReordered,
}
