//! Per-call algorithm options.

use serde::Deserialize;
use tessera_compute::Target;

use crate::error::{Result, TileError};

/// Options accepted by every algorithm. Unknown keys in a TOML table are
/// ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Stages whose broadcasts may run ahead of the computation. Clamped to
    /// the number of stages of each sweep.
    pub lookahead: usize,
    pub target: Target,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            lookahead: 1,
            target: Target::HostTask,
        }
    }
}

impl Options {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| TileError::Config(format!("invalid options: {e}")))
    }

    pub fn with_lookahead(mut self, lookahead: usize) -> Self {
        self.lookahead = lookahead;
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = Options::default();
        assert_eq!(opts.lookahead, 1);
        assert_eq!(opts.target, Target::HostTask);
    }

    #[test]
    fn test_toml_ignores_unknown_keys() {
        let opts = Options::from_toml_str(
            "lookahead = 3\ntarget = \"accelerator-batched\"\ninner_blocking = 16\n",
        )
        .unwrap();
        assert_eq!(opts, Options::default().with_lookahead(3).with_target(Target::Devices));
    }

    #[test]
    fn test_bad_target_is_rejected() {
        let err = Options::from_toml_str("target = \"abacus\"").unwrap_err();
        assert!(matches!(err, TileError::Config(_)), "{err}");
        let err = Options::from_toml_str("lookahead = -1").unwrap_err();
        assert!(matches!(err, TileError::Config(_)), "{err}");
    }
}
