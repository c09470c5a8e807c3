use super::entry::EntryId;

/// Identifies one run of one entry. Process events carry it so the
/// manager can route them without relying on process identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunToken {
    pub entry: EntryId,
    pub run: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub success: bool,
}

#[derive(Debug)]
pub enum QueueMessage {
    Output(RunToken, String),
    Exited(RunToken, ExitOutcome),
    Shutdown,
}
