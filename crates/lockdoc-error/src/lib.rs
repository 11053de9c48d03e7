/// Defines all process exit codes used throughout LockDoc
pub mod exit {
    /// The trace was converted without a fatal error
    ///
    /// **Note:** Recoverable trace inconsistencies are logged and counted,
    /// but they never change the exit code.
    pub const SUCCESS: i32 = 0;

    /// Generic failure: invalid arguments, unreadable files, or any
    /// error that does not fall into one of the categories below.
    pub const FAILURE: i32 = 1;

    /// Input error: the trace could not be decoded
    ///
    /// Emitted if a line of the trace has the wrong number of columns
    /// or one of its fields cannot be parsed.
    pub const INPUT: i32 = 2;

    /// Model error: the trace references an unknown lock type
    ///
    /// The semantics of a lock (reader-only, writer-only or reader-writer)
    /// are derived from its type label. An unknown label cannot be
    /// classified, so the conversion stops instead of guessing.
    pub const UNKNOWN_LOCK_TYPE: i32 = 3;

    /// Model error: a lock was observed held by readers and writers at once
    ///
    /// No transition of the lock model can produce this state, so it signals
    /// a bug in the model rather than an artifact of the trace.
    ///
    /// **Note:** This error is most likely a library bug.
    pub const CONTRADICTORY_STATE: i32 = 4;

    /// Output error: one of the output tables could not be written
    pub const OUTPUT: i32 = 5;
}

/// Returns a string describing the exit code `code`
pub fn exit_description(code: i32) -> String {
    match code {
        0 => "Success".into(),
        1 => "Failure".into(),
        2 => "Input Error: Trace could not be decoded".into(),
        3 => "Model Error: Unknown lock type".into(),
        4 => "Model Error: Lock held by readers and writers at the same time".into(),
        5 => "Output Error: Could not write output tables".into(),
        _ => "Unknown exit code!".into(),
    }
}
