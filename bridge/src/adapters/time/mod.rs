// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::app::ports::ClockPort;
use time::OffsetDateTime;

/// Wall clock in UTC; the only clock production code uses.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockPort for SystemClock {
    fn now_utc(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_utc_and_moves_forward() {
        let clock = SystemClock;
        let first = clock.now_utc();
        let second = clock.now_utc();
        assert!(first.offset().is_utc());
        assert!(second >= first);
    }
}
