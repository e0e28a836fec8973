// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of Kairos.
//
// Kairos is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// Kairos is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with Kairos. If not, see <https://www.gnu.org/licenses/>.

//! Bounded exponential backoff for transient errors.

use crate::error::{ServiceError, ServiceResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Initial backoff duration.
    pub initial_backoff: Duration,
    /// Backoff multiplier per attempt.
    pub backoff_multiplier: f64,
    /// Cap for exponential growth.
    pub max_backoff: Duration,
    /// Random jitter fraction in `[0.0, 1.0]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given zero-based retry attempt.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_secs_f64()
            * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());
        let jitter = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..self.jitter) * capped
        } else {
            0.0
        };
        Duration::from_secs_f64(capped + jitter)
    }
}

/// Retry `op` on retryable service errors until the policy or the caller's
/// deadline is exhausted. Non-retryable errors surface immediately.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> ServiceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ServiceResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < policy.max_attempts => {
                tokio::time::sleep(policy.backoff_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Like [`retry`] but also stops when the deadline elapses, returning
/// `DeadlineExceeded`.
pub async fn retry_with_deadline<T, F, Fut>(
    policy: &RetryPolicy,
    deadline: Duration,
    op: F,
) -> ServiceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ServiceResult<T>>,
{
    match tokio::time::timeout(deadline, retry(policy, op)).await {
        Ok(result) => result,
        Err(_) => Err(ServiceError::DeadlineExceeded),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            backoff_multiplier: 1.0,
            max_backoff: Duration::from_millis(1),
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let attempts = AtomicU32::new(0);
        let result = retry(&fast_policy(), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ServiceError::Unavailable("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_surfaces_immediately() {
        let attempts = AtomicU32::new(0);
        let result: ServiceResult<()> = retry(&fast_policy(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ServiceError::NotFound("gone".into())) }
        })
        .await;
        assert!(matches!(result, Err(ServiceError::NotFound(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_exhausted_returns_last_error() {
        let result: ServiceResult<()> = retry(&fast_policy(), || async {
            Err(ServiceError::Unavailable("still down".into()))
        })
        .await;
        assert!(matches!(result, Err(ServiceError::Unavailable(_))));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_secs(1),
            backoff_multiplier: 10.0,
            max_backoff: Duration::from_secs(5),
            jitter: 0.0,
        };
        assert_eq!(policy.backoff_for_attempt(6), Duration::from_secs(5));
    }
}
