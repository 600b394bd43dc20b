use std::io::{self, IsTerminal, Stdout, Write};
use std::sync::{Arc, Mutex};

use crossterm::queue;
use crossterm::terminal::{Clear, ClearType};

use crate::ssh::ssh_session::Endpoint;

/// One chunk's worth of progress on a single file.
#[derive(Debug, Clone, Copy)]
pub struct Progress<'a> {
    pub file: &'a str,
    pub total: u64,
    pub sent: u64,
    pub peer: &'a Endpoint,
}

impl Progress<'_> {
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        100.0 * (self.sent as f64 / self.total as f64)
    }

    pub fn is_complete(&self) -> bool {
        self.sent >= self.total
    }
}

pub trait ProgressSink: Send {
    fn on_progress(&mut self, progress: &Progress<'_>);
}

impl<F> ProgressSink for F
where
    F: FnMut(&Progress<'_>) + Send,
{
    fn on_progress(&mut self, progress: &Progress<'_>) {
        self(progress)
    }
}

/// The sink bound to an accelerated-copy handle. The session keeps a clone so
/// the sink can be swapped after the handle exists.
pub type SharedProgress = Arc<Mutex<Box<dyn ProgressSink>>>;

pub fn shared(sink: impl ProgressSink + 'static) -> SharedProgress {
    Arc::new(Mutex::new(Box::new(sink)))
}

pub(crate) fn report(progress: &SharedProgress, event: &Progress<'_>) {
    let mut sink = progress.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    sink.on_progress(event);
}

pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&mut self, _progress: &Progress<'_>) {}
}

/// Renders `host:port | file | 42.00%` on a single line, rewritten in place
/// until the file completes.
pub struct ConsoleProgress<W: Write + Send> {
    out: W,
    clear_line: bool,
}

impl ConsoleProgress<Stdout> {
    pub fn stdout() -> Self {
        let out = io::stdout();
        let clear_line = out.is_terminal();
        Self { out, clear_line }
    }
}

impl<W: Write + Send> ConsoleProgress<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            clear_line: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> ProgressSink for ConsoleProgress<W> {
    fn on_progress(&mut self, progress: &Progress<'_>) {
        if self.clear_line {
            queue!(self.out, Clear(ClearType::CurrentLine)).ok();
        }
        let end = if progress.is_complete() { '\n' } else { '\r' };
        write!(
            self.out,
            "{} | {} | {:.2}%{}",
            progress.peer,
            progress.file,
            progress.percentage(),
            end
        )
        .ok();
        self.out.flush().ok();
    }
}
