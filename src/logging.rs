//! Tracing setup for binaries and tests.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a global subscriber logging at `level` for this crate. `RUST_LOG` still
/// applies on top; calling this again is a no-op.
pub fn init_tracing(level: &str) {
    let directive = format!("chiral_swarm={}", level);
    let filter = match directive.parse() {
        Ok(directive) => EnvFilter::from_default_env().add_directive(directive),
        Err(_) => EnvFilter::from_default_env(),
    };
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init_tracing("debug");
        init_tracing("not a level");
        tracing::debug!("still logging");
    }
}
