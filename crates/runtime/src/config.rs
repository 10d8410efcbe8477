//! Runtime-wide tunables, loadable from a `lumen.toml` alongside the
//! compiler's own config.

use serde::Deserialize;

pub const DEFAULT_STACK_MAX: usize = 16_384;
pub const DEFAULT_FRAMES_MAX: usize = 64;

/// Options that affect how the VM executes, independent of what it runs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VmOptions {
    /// Value stack capacity, fixed at construction time; the stack is a
    /// fixed-capacity array, never reallocated.
    pub stack_size: usize,

    /// Call-frame stack capacity. Exceeding it is the "Stack overflow"
    /// runtime error.
    pub frame_max: usize,

    /// `nextGC = live_bytes * growth_factor` after each collection.
    pub gc_growth_factor: usize,

    /// Force a collection before every single allocation, to surface
    /// missing roots. Equivalent to the reference's `DEBUG_STRESS_GC`.
    pub stress_gc: bool,

    /// Print every dispatched instruction to stderr before executing it.
    /// Equivalent to the reference's `DEBUG_TRACE_EXECUTION`.
    pub trace_exec: bool,

    /// Install a SIGQUIT handler that dumps VM stats to stderr. Unix-only;
    /// ignored on other platforms. See [`crate::diagnostics`].
    pub diagnostics_on_sigquit: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            stack_size: DEFAULT_STACK_MAX,
            frame_max: DEFAULT_FRAMES_MAX,
            gc_growth_factor: 2,
            stress_gc: false,
            trace_exec: false,
            diagnostics_on_sigquit: true,
        }
    }
}

impl VmOptions {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_release_defaults() {
        let cfg = VmOptions::from_toml("").unwrap();
        assert_eq!(cfg.stack_size, DEFAULT_STACK_MAX);
        assert!(!cfg.stress_gc);
    }

    #[test]
    fn stress_gc_can_be_toggled_without_touching_other_fields() {
        let cfg = VmOptions::from_toml("stress_gc = true\n").unwrap();
        assert!(cfg.stress_gc);
        assert_eq!(cfg.frame_max, DEFAULT_FRAMES_MAX);
    }
}
