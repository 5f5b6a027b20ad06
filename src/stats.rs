// Per-thread event-loop core: I/O dispatch, timers, deferred deletion and
// cross-thread posting.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2023 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2023 UBIDECO Institute, Switzerland
// Copyright 2021 Alexis Sellier <alexis@cloudhead.io>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

/// One histogram series owned by an external stats store.
///
/// Storage, bucketing and flushing are the store's business; the loop only
/// records values.
pub trait Histogram {
    fn record_value(&self, value: u64);
}

/// Factory for histogram series, implemented by an external stats store.
pub trait Scope {
    fn histogram(&self, name: &str) -> Box<dyn Histogram>;
}

/// Per-iteration latency series recorded by the dispatcher loop.
pub(crate) struct DispatcherStats {
    loop_duration_us: Box<dyn Histogram>,
    poll_delay_us: Box<dyn Histogram>,
}

impl DispatcherStats {
    pub(crate) fn new(scope: &dyn Scope, prefix: &str) -> Self {
        Self {
            loop_duration_us: scope.histogram(&format!("{prefix}loop_duration_us")),
            poll_delay_us: scope.histogram(&format!("{prefix}poll_delay_us")),
        }
    }

    pub(crate) fn record_loop_duration(&self, duration: Duration) {
        self.loop_duration_us.record_value(duration.as_micros() as u64);
    }

    pub(crate) fn record_poll_delay(&self, delay: Duration) {
        self.poll_delay_us.record_value(delay.as_micros() as u64);
    }
}
