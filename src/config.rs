//! In-memory runtime configuration.
//!
//! This crate does not own a configuration *store* — loading a TOML document
//! from disk, watching it for changes, or wiring it to a CLI is an
//! application concern. What lives here is the shape the application's
//! config store eventually produces: a plain, `serde`-deserializable struct
//! with the documented defaults.

use serde::Deserialize;

/// Tunables recognized by the scheduler, reactor, and hook layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Bytes allocated per worker fiber stack.
    pub fiber_stack_size: usize,
    /// Default wait for a hooked `connect()`, in milliseconds.
    pub tcp_connect_timeout_ms: u64,
    /// Maximum number of readiness events drained per reactor wait call.
    pub reactor_max_batch: usize,
    /// Upper bound on the reactor's wait timeout, in milliseconds.
    pub reactor_max_wait_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            fiber_stack_size: 1024 * 1024,
            tcp_connect_timeout_ms: 5000,
            reactor_max_batch: 256,
            reactor_max_wait_ms: 5000,
        }
    }
}

impl RuntimeConfig {
    /// Parses a `RuntimeConfig` from a TOML document, falling back to
    /// [`RuntimeConfig::default`] for any field the document omits.
    pub fn from_toml_str(s: &str) -> crate::error::Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(
            cfg,
            RuntimeConfig {
                fiber_stack_size: 1024 * 1024,
                tcp_connect_timeout_ms: 5000,
                reactor_max_batch: 256,
                reactor_max_wait_ms: 5000,
            }
        );
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let cfg = RuntimeConfig::from_toml_str("tcp_connect_timeout_ms = 250\n").unwrap();
        assert_eq!(
            cfg,
            RuntimeConfig {
                tcp_connect_timeout_ms: 250,
                ..RuntimeConfig::default()
            }
        );
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let err = RuntimeConfig::from_toml_str("not valid = = toml").unwrap_err();
        assert_eq!(err.variant_name(), "Config");
    }
}
