// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module providing utilities for retrying read-modify-write cycles that lose
//! an optimistic-concurrency race.

use slog::{warn, Logger};
use std::future::Future;
use std::time::Duration;

pub use ::backoff::future::{retry, retry_notify};
pub use ::backoff::Error as BackoffError;
pub use ::backoff::{backoff::Backoff, ExponentialBackoff, Notify};

/// Errors that can report an etag mismatch on write.
pub trait ConflictSignal {
    fn is_conflict(&self) -> bool;
}

/// Return a backoff policy for retrying writes against entities that other
/// hosts modify concurrently.
///
/// With `max_elapsed_time` of `None` the policy retries forever.
pub fn conflict_retry_policy(
    initial_interval: Duration,
    max_interval: Duration,
    max_elapsed_time: Option<Duration>,
) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: initial_interval,
        initial_interval,
        multiplier: 2.0,
        max_interval,
        max_elapsed_time,
        ..ExponentialBackoff::default()
    }
}

/// Runs `op` until it succeeds or fails with something other than a conflict.
///
/// Each invocation of `op` must read (or refresh) the entity it mutates
/// before writing it, so that a retry starts from the server's current
/// version.
pub async fn retry_on_conflict<T, E, F, Fut>(
    log: &Logger,
    policy: ExponentialBackoff,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: ConflictSignal + std::fmt::Display,
{
    let attempt = || {
        let fut = op();
        async move {
            fut.await.map_err(|err| {
                if err.is_conflict() {
                    BackoffError::transient(err)
                } else {
                    BackoffError::Permanent(err)
                }
            })
        }
    };

    let log_conflict = |err: E, delay: Duration| {
        warn!(
            log,
            "Entity was modified concurrently. Retrying in {:?}",
            delay;
            "error" => %err,
        );
    };

    retry_notify(policy, attempt, log_conflict).await
}
