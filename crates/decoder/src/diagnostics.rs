//! Snapshot of a finder's state, attached to timeout errors.

use std::fmt;

use mc_common::{CodecState, Micros};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinderDiagnostics {
    /// Index of the next sample to submit.
    pub cursor: usize,
    pub samples: usize,
    pub requested: Option<Micros>,
    /// Decoded units waiting to be handed out.
    pub queued: usize,
    /// Units the decoder accepted but has not emitted.
    pub decode_queue: usize,
    pub pending_flushes: usize,
    pub decoder_state: Option<CodecState>,
    pub outputs: usize,
    pub software: bool,
}

impl fmt::Display for FinderDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cursor {}/{}, requested {:?}, queued {}, decode queue {}, pending flushes {}, decoder {:?}, outputs {}, software {}",
            self.cursor,
            self.samples,
            self.requested,
            self.queued,
            self.decode_queue,
            self.pending_flushes,
            self.decoder_state,
            self.outputs,
            self.software
        )
    }
}
