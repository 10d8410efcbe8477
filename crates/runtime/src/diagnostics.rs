//! SIGQUIT diagnostics: dump VM stats to stderr without stopping the
//! process. A one-shot script interpreter rarely needs this, but an
//! embedder running a long-lived script (a server loop written in Lumen)
//! wants a way to ask "what is this VM doing" in production.
//!
//! A signal handler cannot safely touch the VM directly, so the handler
//! only flips an [`std::sync::atomic::AtomicBool`]; the dispatch loop polls
//! it between instructions and does the actual reporting.

#[cfg(all(unix, feature = "diagnostics"))]
mod imp {
    use signal_hook::consts::SIGQUIT;
    use signal_hook::flag;
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    pub struct SigquitWatch {
        flag: Arc<AtomicBool>,
    }

    impl SigquitWatch {
        pub fn install() -> io::Result<Self> {
            let flag = Arc::new(AtomicBool::new(false));
            flag::register(SIGQUIT, Arc::clone(&flag))?;
            Ok(SigquitWatch { flag })
        }

        pub fn requested(&self) -> bool {
            self.flag.swap(false, Ordering::Relaxed)
        }
    }
}

#[cfg(not(all(unix, feature = "diagnostics")))]
mod imp {
    use std::io;

    pub struct SigquitWatch;

    impl SigquitWatch {
        pub fn install() -> io::Result<Self> {
            Ok(SigquitWatch)
        }

        pub fn requested(&self) -> bool {
            false
        }
    }
}

pub use imp::SigquitWatch;

/// A snapshot of VM state worth printing on SIGQUIT.
pub struct Snapshot {
    pub frame_depth: usize,
    pub stack_depth: usize,
    pub bytes_allocated: usize,
    pub next_gc: usize,
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "-- lumen vm diagnostics --")?;
        writeln!(f, "call depth:      {}", self.frame_depth)?;
        writeln!(f, "value stack:     {}", self.stack_depth)?;
        writeln!(f, "bytes allocated: {}", self.bytes_allocated)?;
        write!(f, "next gc at:      {}", self.next_gc)
    }
}
