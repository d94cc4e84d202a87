// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Retry policies with capped exponential backoff.
//!
//! A [`Retry`] only describes *when* to try again. Callers own the loop, so
//! that they can re-read state between attempts and decide which failures
//! are worth retrying at all.
//!
//! ```
//! use std::time::Duration;
//! use rds_ore::retry::Retry;
//!
//! let retry = Retry::default()
//!     .initial_backoff(Duration::from_millis(10))
//!     .factor(2.0)
//!     .clamp_backoff(Duration::from_millis(50));
//! assert_eq!(retry.backoff(0), Duration::from_millis(10));
//! assert_eq!(retry.backoff(1), Duration::from_millis(20));
//! assert_eq!(retry.backoff(5), Duration::from_millis(50));
//! ```

use std::time::Duration;

use rand::Rng;

/// Configures a retry operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Retry {
    initial_backoff: Duration,
    factor: f64,
    clamp_backoff: Duration,
    max_tries: usize,
    jitter: f64,
}

impl Default for Retry {
    /// Constructs a retry operation that will retry forever with backoff
    /// defaults that are reasonable for a fallible network operation.
    fn default() -> Self {
        Retry {
            initial_backoff: Duration::from_millis(125),
            factor: 2.0,
            clamp_backoff: Duration::MAX,
            max_tries: usize::MAX,
            jitter: 0.0,
        }
    }
}

impl Retry {
    /// The retry policy used for optimistic-concurrency writes: five
    /// attempts, 10ms apart, with 10% jitter.
    pub fn conflict() -> Self {
        Retry::default()
            .initial_backoff(Duration::from_millis(10))
            .factor(1.0)
            .max_tries(5)
            .jitter(0.1)
    }

    /// Sets the initial backoff for the retry operation.
    pub fn initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    /// Sets the multiplicative factor applied to the backoff after each
    /// failed attempt.
    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Clamps the maximum backoff for the retry operation.
    pub fn clamp_backoff(mut self, clamp_backoff: Duration) -> Self {
        self.clamp_backoff = clamp_backoff;
        self
    }

    /// Sets the maximum number of tries, including the first one.
    ///
    /// Panics if `max_tries` is zero.
    pub fn max_tries(mut self, max_tries: usize) -> Self {
        assert!(max_tries > 0, "max_tries must be greater than zero");
        self.max_tries = max_tries;
        self
    }

    /// Sets the fraction of each backoff that is randomized.
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Returns the maximum number of tries.
    pub fn tries(&self) -> usize {
        self.max_tries
    }

    /// Reports whether another try is allowed after `attempt` tries (counted
    /// from one) have failed.
    pub fn allows(&self, attempt: usize) -> bool {
        attempt < self.max_tries
    }

    /// Returns the backoff to wait after the `attempt`-th failure, counted
    /// from zero, without jitter.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.initial_backoff.as_secs_f64() * self.factor.powi(exponent);
        match Duration::try_from_secs_f64(scaled) {
            Ok(backoff) => backoff.min(self.clamp_backoff),
            Err(_) => self.clamp_backoff,
        }
    }

    /// Like [`Retry::backoff`], with the configured jitter applied.
    pub fn jittered_backoff(&self, attempt: usize) -> Duration {
        let backoff = self.backoff(attempt);
        if self.jitter == 0.0 {
            return backoff;
        }
        let spread = rand::thread_rng().gen_range(0.0..=self.jitter);
        backoff.mul_f64(1.0 + spread)
    }

    /// Sleeps for the jittered backoff of the `attempt`-th failure.
    pub async fn sleep(&self, attempt: usize) {
        tokio::time::sleep(self.jittered_backoff(attempt)).await
    }
}
