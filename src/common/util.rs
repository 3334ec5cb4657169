// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::time::Duration;

const BACKOFF_YIELD_ATTEMPTS: usize = 4;
const BACKOFF_MAX_ATTEMPTS: usize = 20;
const BACKOFF_INITIAL_SLEEP_US: u64 = 1;
const BACKOFF_MAX_SLEEP_US: u64 = 16_384;

/// Retry `op` until it returns true, yielding first and then sleeping with
/// exponentially growing pauses. Returns false once the attempt budget is
/// exhausted with `op` still failing.
pub fn retry_with_backoff<F>(mut op: F) -> bool
where
    F: FnMut() -> bool,
{
    let mut sleep_us = BACKOFF_INITIAL_SLEEP_US;
    for attempt in 0..BACKOFF_MAX_ATTEMPTS {
        if op() {
            return true;
        }
        if attempt < BACKOFF_YIELD_ATTEMPTS {
            std::thread::yield_now();
        } else {
            std::thread::sleep(Duration::from_micros(sleep_us));
            sleep_us = (sleep_us * 2).min(BACKOFF_MAX_SLEEP_US);
        }
    }
    op()
}

#[cfg(test)]
mod tests {
    use super::retry_with_backoff;

    #[test]
    fn retry_returns_immediately_on_success() {
        let mut calls = 0;
        assert!(retry_with_backoff(|| {
            calls += 1;
            true
        }));
        assert_eq!(calls, 1);
    }

    #[test]
    fn retry_succeeds_after_transient_failures() {
        let mut calls = 0;
        assert!(retry_with_backoff(|| {
            calls += 1;
            calls >= 3
        }));
        assert_eq!(calls, 3);
    }

    #[test]
    fn retry_gives_up_when_op_never_succeeds() {
        assert!(!retry_with_backoff(|| false));
    }
}
