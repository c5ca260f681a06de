//! Per-surface buffer lifecycle: submission, latching and release.

mod counter;
mod listener;
mod state;

pub use counter::{CounterSample, CounterTrace, PendingBufferCounter};
pub use listener::{
    ChannelListener, DropNotice, DropReason, ListenerEvent, ListenerSet, ReleaseNotice,
    ReleaseReason, TransactionListener, listener_channel,
};
pub use state::{
    BufferState, BufferStateConfig, BufferSubmission, CurrentBuffer, DEFAULT_COUNTER_TRACE_CAPACITY,
    DisplayableBuffer, LatchOutcome, SubmitOutcome, TeardownReport,
};
