//! Queue naming.
//!
//! A queue is known by several names:
//!
//! - the **short** name used in bindings, e.g. `add`
//! - the **physical** name, qualified by deployment environment: `stage-add`
//! - the **local** name used on developer machines, qualified by the caller:
//!   `alice-local-add`
//! - the **dead-letter** name where terminally failed tasks go: `err-stage-add`
//!
//! Every function here is pure.

use crate::error::{DockhandError, DockhandResult};

/// Prefix of every dead-letter queue.
pub const DEAD_LETTER_PREFIX: &str = "err-";

/// Environment in which queue names are further qualified by the caller.
pub const LOCAL_ENV: &str = "local";

/// `"{env}-{short}"`
pub fn to_physical_name(short: &str, env: &str) -> DockhandResult<String> {
    if short.is_empty() {
        return Err(DockhandError::malformed(short, "short queue name is empty"));
    }
    if env.is_empty() {
        return Err(DockhandError::malformed(short, "environment is empty"));
    }
    Ok(format!("{}-{}", env, short))
}

/// `"{caller}-{physical}"`. The caller must be purely alphabetic so the
/// name can be split again by [`from_local_name`].
pub fn to_local_name(physical: &str, caller: &str) -> DockhandResult<String> {
    if caller.is_empty() {
        return Err(DockhandError::malformed(physical, "caller id is empty"));
    }
    if !caller.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(DockhandError::malformed(
            caller,
            "caller id must be alphabetic",
        ));
    }
    if physical.is_empty() {
        return Err(DockhandError::malformed(physical, "physical queue name is empty"));
    }
    Ok(format!("{}-{}", caller, physical))
}

/// `"err-{physical}"`
pub fn to_dead_letter_name(physical: &str) -> String {
    format!("{}{}", DEAD_LETTER_PREFIX, physical)
}

/// Strips exactly one leading `err-`.
pub fn from_dead_letter_name(name: &str) -> DockhandResult<String> {
    name.strip_prefix(DEAD_LETTER_PREFIX)
        .map(str::to_string)
        .ok_or_else(|| DockhandError::malformed(name, "missing dead-letter prefix 'err-'"))
}

/// Strips exactly one leading `"{env}-"`.
pub fn to_short_name(physical: &str, env: &str) -> DockhandResult<String> {
    let prefix = format!("{}-", env);
    match physical.strip_prefix(&prefix) {
        Some(short) if !short.is_empty() && !env.is_empty() => Ok(short.to_string()),
        _ => Err(DockhandError::malformed(
            physical,
            format!("missing environment prefix '{}'", prefix),
        )),
    }
}

/// Strips the leading alphabetic caller segment and its dash.
pub fn from_local_name(local: &str) -> DockhandResult<String> {
    let caller_len = local
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(local.len());

    if caller_len == 0 {
        return Err(DockhandError::malformed(local, "missing caller segment"));
    }

    match local[caller_len..].strip_prefix('-') {
        Some(rest) if !rest.is_empty() => Ok(rest.to_string()),
        _ => Err(DockhandError::malformed(
            local,
            "caller segment must be followed by '-' and a queue name",
        )),
    }
}

/// Legacy job queues use an underscore convention: `"{env}_{queue}"` or,
/// in the local environment, `"{env}_{user}_{queue}"`.
pub fn to_legacy_name(queue: &str, env: &str, user: Option<&str>) -> String {
    match user {
        Some(user) => format!("{}_{}_{}", env, user, queue),
        None => format!("{}_{}", env, queue),
    }
}
