//! Accumulation of link-time diagnostics from parallel passes.
//!
//! Passes that can detect multiple independent problems (duplicate symbols,
//! undefined relocation targets, unknown symbol versions) don't fail fast.
//! They push one rendered line per occurrence into the sink and the driver
//! checkpoints between passes, aborting the link if anything accumulated.

use crate::error::Result;
use anyhow::bail;
use crossbeam_queue::SegQueue;
use itertools::Itertools;

#[derive(Default)]
pub struct DiagnosticSink {
    errors: SegQueue<String>,
}

impl DiagnosticSink {
    pub(crate) fn report(&self, message: String) {
        self.errors.push(message);
    }

    /// Fails the link if any errors have been reported since the last
    /// checkpoint. The lines are sorted so the rendered output doesn't
    /// depend on which worker reported first.
    pub(crate) fn checkpoint(&self) -> Result {
        if self.errors.is_empty() {
            return Ok(());
        }
        let mut lines = Vec::new();
        while let Some(line) = self.errors.pop() {
            lines.push(line);
        }
        lines.sort();
        bail!("{}", lines.iter().join("\n"));
    }
}
