// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test harness support that routes `tracing` output to the test writer.
//!
//! Annotate tests with `#[test_with_tracing::test]` instead of `#[test]`.
//! Spans and events emitted by the code under test are then captured per test
//! and printed only for failing tests. Set `RUST_LOG` (for example
//! `RUST_LOG=physmem=trace`) to change the filter; the default shows `debug`
//! and above for every target.

#[cfg(test)]
extern crate self as test_with_tracing;

pub use test_with_tracing_macro::test;
use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

const DEFAULT_LEVEL: LevelFilter = LevelFilter::DEBUG;

fn targets_from_env() -> Targets {
    let default = || Targets::new().with_default(DEFAULT_LEVEL);
    match std::env::var("RUST_LOG") {
        Ok(var) => var.parse().unwrap_or_else(|err| {
            eprintln!("ignoring invalid RUST_LOG {var:?}: {err}");
            default()
        }),
        Err(_) => default(),
    }
}

/// Installs the global test subscriber. Called by the generated test wrapper;
/// repeated calls are no-ops.
#[doc(hidden)]
pub fn init() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let subscriber = tracing_subscriber::fmt()
            .pretty()
            .with_ansi(false)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .finish()
            .with(targets_from_env());
        // Another harness may have installed a subscriber first.
        let _ = subscriber.try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::test;

    #[test]
    fn events_are_captured() {
        tracing::debug!(value = 5, "structured event");
        tracing::info!("plain event");
    }

    #[test]
    fn result_returning_test() -> Result<(), std::num::ParseIntError> {
        let n: u32 = "12".parse()?;
        tracing::trace!(n, "parsed");
        assert_eq!(n, 12);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn attributes_are_kept() {
        panic!("boom");
    }
}
