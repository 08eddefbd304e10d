//! Process-wide fallback egress selection.
//!
//! One fallback address is picked uniformly at random from the configured
//! list when the process starts ([`init`]) and reused by every session's
//! retry until the process exits. There is no per-request re-selection.

use std::sync::OnceLock;

use anyhow::{Context, Result};
use rand::seq::IndexedRandom;

static SELECTED: OnceLock<String> = OnceLock::new();

/// Pick one address uniformly at random, or `None` for an empty list.
pub fn choose(addresses: &[String]) -> Option<&String> {
    addresses.choose(&mut rand::rng())
}

/// Select the process-wide fallback egress.
///
/// Only the first call picks; later calls return the address already
/// selected and ignore `addresses`.
///
/// # Errors
///
/// Returns an error if nothing has been selected yet and `addresses` is
/// empty.
pub fn init(addresses: &[String]) -> Result<&'static str> {
    if let Some(selected) = SELECTED.get() {
        return Ok(selected.as_str());
    }
    let picked = choose(addresses)
        .context("fallback egress list is empty")?
        .clone();
    Ok(SELECTED.get_or_init(|| picked).as_str())
}
