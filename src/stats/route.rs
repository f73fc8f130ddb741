use std::sync::atomic::*;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct RouteStatFields {
    pub xact_count: Arc<AtomicU64>,
    pub query_count: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
    pub bytes_sent: Arc<AtomicU64>,
    pub xact_time_microseconds: Arc<AtomicU64>,
    pub query_time_microseconds: Arc<AtomicU64>,
    pub wait_time: Arc<AtomicU64>,
    pub errors: Arc<AtomicU64>,
}

/// Plain copy of one set of counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteStatValues {
    pub xact_count: u64,
    pub query_count: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub xact_time_microseconds: u64,
    pub query_time_microseconds: u64,
    pub wait_time: u64,
    pub errors: u64,
}

impl RouteStatFields {
    pub fn snapshot(&self) -> RouteStatValues {
        RouteStatValues {
            xact_count: self.xact_count.load(Ordering::Relaxed),
            query_count: self.query_count.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            xact_time_microseconds: self.xact_time_microseconds.load(Ordering::Relaxed),
            query_time_microseconds: self.query_time_microseconds.load(Ordering::Relaxed),
            wait_time: self.wait_time.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.xact_count.store(0, Ordering::Relaxed);
        self.query_count.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.xact_time_microseconds.store(0, Ordering::Relaxed);
        self.query_time_microseconds.store(0, Ordering::Relaxed);
        self.wait_time.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }
}

/// Per-route counters. `total` only grows, `current` is the window the
/// collector turns into `averages` and then clears.
#[derive(Debug, Clone, Default)]
pub struct RouteStats {
    pub total: RouteStatFields,

    pub current: RouteStatFields,

    pub averages: RouteStatFields,
}

impl RouteStats {
    #[inline(always)]
    pub fn xact_count_add(&self) {
        self.total.xact_count.fetch_add(1, Ordering::Relaxed);
        self.current.xact_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn query_count_add(&self) {
        self.total.query_count.fetch_add(1, Ordering::Relaxed);
        self.current.query_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn bytes_received_add(&self, bytes: u64) {
        self.total
            .bytes_received
            .fetch_add(bytes, Ordering::Relaxed);
        self.current
            .bytes_received
            .fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn bytes_sent_add(&self, bytes: u64) {
        self.total.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.current.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn xact_time_add(&self, microseconds: u64) {
        if microseconds == 0 {
            return;
        }
        self.total
            .xact_time_microseconds
            .fetch_add(microseconds, Ordering::Relaxed);
        self.current
            .xact_time_microseconds
            .fetch_add(microseconds, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn query_time_add_microseconds(&self, microseconds: u64) {
        self.total
            .query_time_microseconds
            .fetch_add(microseconds, Ordering::Relaxed);
        self.current
            .query_time_microseconds
            .fetch_add(microseconds, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn wait_time_add(&self, time: u64) {
        self.total.wait_time.fetch_add(time, Ordering::Relaxed);
        self.current.wait_time.fetch_add(time, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn error(&self) {
        self.total.errors.fetch_add(1, Ordering::Relaxed);
        self.current.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Turn the current window into per-second rates and per-request times.
    pub fn update_averages(&self, stat_period_ms: u64) {
        let stat_period_per_second = (stat_period_ms / 1_000).max(1);
        let current = self.current.snapshot();

        self.averages.xact_count.store(
            current.xact_count / stat_period_per_second,
            Ordering::Relaxed,
        );
        self.averages.xact_time_microseconds.store(
            current
                .xact_time_microseconds
                .checked_div(current.xact_count)
                .unwrap_or(0),
            Ordering::Relaxed,
        );

        self.averages.query_count.store(
            current.query_count / stat_period_per_second,
            Ordering::Relaxed,
        );
        self.averages.query_time_microseconds.store(
            current
                .query_time_microseconds
                .checked_div(current.query_count)
                .unwrap_or(0),
            Ordering::Relaxed,
        );

        self.averages.bytes_received.store(
            current.bytes_received / stat_period_per_second,
            Ordering::Relaxed,
        );
        self.averages.bytes_sent.store(
            current.bytes_sent / stat_period_per_second,
            Ordering::Relaxed,
        );
        self.averages.wait_time.store(
            current.wait_time / stat_period_per_second,
            Ordering::Relaxed,
        );
        self.averages
            .errors
            .store(current.errors / stat_period_per_second, Ordering::Relaxed);
    }

    pub fn reset_current_counts(&self) {
        self.current.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_survive_window_reset() {
        let stats = RouteStats::default();
        for _ in 0..30 {
            stats.query_count_add();
            stats.query_time_add_microseconds(100);
        }
        stats.bytes_received_add(3_000);
        stats.xact_count_add();

        stats.update_averages(15_000);
        stats.reset_current_counts();

        let total = stats.total.snapshot();
        assert_eq!(total.query_count, 30);
        assert_eq!(total.query_time_microseconds, 3_000);
        assert_eq!(total.bytes_received, 3_000);

        let averages = stats.averages.snapshot();
        assert_eq!(averages.query_count, 2);
        assert_eq!(averages.query_time_microseconds, 100);
        assert_eq!(averages.bytes_received, 200);

        assert_eq!(stats.current.snapshot(), RouteStatValues::default());
    }

    #[test]
    fn test_empty_window_has_zero_averages() {
        let stats = RouteStats::default();
        stats.update_averages(500);
        assert_eq!(stats.averages.snapshot(), RouteStatValues::default());
    }
}
