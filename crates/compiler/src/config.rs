//! Compiler-wide configuration, loadable from a `lumen.toml` so embedders
//! don't have to recompile to flip a debug knob.

use serde::Deserialize;

/// Options that affect how source is compiled, independent of what it
/// compiles to.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Print each function's disassembled chunk to stderr right after it
    /// finishes compiling. Distinct from the runtime's `--trace`, which
    /// traces executed instructions rather than compiled ones.
    pub trace_bytecode: bool,

    /// Cap on distinct upvalues/locals per function. The bytecode format
    /// fixes this at 256 (one-byte operand); this only lets a caller fail
    /// faster with a clearer message for a shallower limit.
    pub max_locals: u16,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            trace_bytecode: false,
            max_locals: 256,
        }
    }
}

impl CompilerConfig {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_defaults() {
        let cfg = CompilerConfig::from_toml("").unwrap();
        assert_eq!(cfg.max_locals, 256);
        assert!(!cfg.trace_bytecode);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let cfg = CompilerConfig::from_toml("trace_bytecode = true\n").unwrap();
        assert!(cfg.trace_bytecode);
        assert_eq!(cfg.max_locals, 256);
    }
}
