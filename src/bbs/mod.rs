//! The session runtime.
//!
//! [`server::BbsServer`] owns the pipe plane, the line table, and every
//! per-line [`crate::session::Session`]; a single cooperative scheduler
//! drives all 32 lines plus their file transfers. Transports run as their
//! own tasks and meet the scheduler only through the pipe plane and the
//! transport event channel.

pub mod server;

pub use server::{BbsServer, UiHandle};

use crate::pipe::PipePlane;
use crate::transfer::BytePipe;

/// A transfer machine's view of one line's pipe pair.
pub struct LinePipe<'a> {
    pub plane: &'a PipePlane,
    pub line: usize,
}

impl BytePipe for LinePipe<'_> {
    fn recv(&mut self) -> Option<u8> {
        self.plane.dequeue_input(self.line)
    }

    fn send(&mut self, data: &[u8]) -> usize {
        self.plane.enqueue_output(self.line, data)
    }

    fn send_free(&self) -> usize {
        self.plane.output_free(self.line)
    }
}
