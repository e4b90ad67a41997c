// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    env,
    sync::OnceLock,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Default stack size of a spawned fiber (in bytes).
const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Default connect timeout (in milliseconds). [crate::runtime::timer::NO_TIMEOUT] means "wait forever".
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = crate::runtime::timer::NO_TIMEOUT;

/// Default number of worker threads.
const DEFAULT_WORKERS: usize = 1;

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Process-wide stack size, resolved once from the environment.
static STACK_SIZE: OnceLock<usize> = OnceLock::new();

//======================================================================================================================
// Structures
//======================================================================================================================

/// Runtime configuration. Constructed by the process entry point and threaded
/// through the I/O manager.
#[derive(Clone, Debug)]
pub struct Config {
    /// Stack size of spawned fibers (in bytes).
    pub stack_size: usize,
    /// Timeout applied to hooked `connect()` calls (in milliseconds).
    pub connect_timeout_ms: u64,
    /// Number of worker threads.
    pub workers: usize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for Runtime Configurations
impl Config {
    /// Builds a configuration from the environment, falling back to compiled
    /// defaults for variables that are absent or malformed.
    pub fn from_env() -> Self {
        Self {
            stack_size: env_usize("STRAND_STACK_SIZE", DEFAULT_STACK_SIZE),
            connect_timeout_ms: env_u64("STRAND_CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS),
            workers: env_usize("STRAND_WORKERS", DEFAULT_WORKERS),
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Stack size used for fibers spawned without an explicit one.
pub(crate) fn default_stack_size() -> usize {
    *STACK_SIZE.get_or_init(|| env_usize("STRAND_STACK_SIZE", DEFAULT_STACK_SIZE))
}

fn env_usize(name: &str, default: usize) -> usize {
    match env::var(name) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            warn!("ignoring malformed {}={:?}", name, value);
            default
        }),
        Err(_) => default,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match env::var(name) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            warn!("ignoring malformed {}={:?}", name, value);
            default
        }),
        Err(_) => default,
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Default Trait Implementation for Runtime Configurations
impl Default for Config {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            workers: DEFAULT_WORKERS,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::Config;
    use ::anyhow::Result;

    #[test]
    fn default_config_has_no_connect_timeout() -> Result<()> {
        let config: Config = Config::default();
        crate::ensure_eq!(config.connect_timeout_ms, crate::runtime::timer::NO_TIMEOUT);
        crate::ensure_eq!(config.stack_size, 128 * 1024);
        Ok(())
    }
}
