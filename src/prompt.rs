// ============================================
// virtio-inject - prompt.rs
// ============================================
// Deciding whether to keep the changes.
//
// When --commit isn't given, the controller asks a CommitDecider.
// Tests hand it a fixed answer or a closure; the real program asks on
// the console. Anything other than "y"/"yes" means discard - losing an
// injection run is cheap, overwriting an image by accident is not.
// ============================================

use std::io::{self, BufRead, Write};

use tracing::warn;

use crate::image::MountHandle;

/// Decides whether a finished injection gets committed.
pub trait CommitDecider {
    fn decide(&mut self, image: &MountHandle) -> bool;
}

/// Always gives the same answer.
#[derive(Debug, Clone, Copy)]
pub struct FixedDecision(pub bool);

impl CommitDecider for FixedDecision {
    fn decide(&mut self, _image: &MountHandle) -> bool {
        self.0
    }
}

impl<F> CommitDecider for F
where
    F: FnMut(&MountHandle) -> bool,
{
    fn decide(&mut self, image: &MountHandle) -> bool {
        self(image)
    }
}

/// Asks on the console.
pub struct ConsolePrompt<R, W> {
    input: R,
    output: W,
}

impl ConsolePrompt<io::StdinLock<'static>, io::Stderr> {
    /// Read from stdin, ask on stderr (stdout may carry --json output)
    pub fn stdio() -> Self {
        ConsolePrompt::new(io::stdin().lock(), io::stderr())
    }
}

impl<R: BufRead, W: Write> ConsolePrompt<R, W> {
    pub fn new(input: R, output: W) -> Self {
        ConsolePrompt { input, output }
    }
}

impl<R: BufRead, W: Write> CommitDecider for ConsolePrompt<R, W> {
    fn decide(&mut self, image: &MountHandle) -> bool {
        let question = format!(
            "Commit changes to {}? [y/N] ",
            image.original_file().display()
        );
        if let Err(e) = self.output.write_all(question.as_bytes()).and_then(|_| self.output.flush()) {
            warn!("Could not show commit prompt: {}", e);
        }

        let mut answer = String::new();
        match self.input.read_line(&mut answer) {
            Ok(_) => is_yes(&answer),
            Err(e) => {
                warn!("Could not read answer ({}), discarding changes", e);
                false
            }
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}
