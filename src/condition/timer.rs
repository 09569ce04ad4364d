/// Accumulates the time a condition spends true within the current bucket.
///
/// Callers must split the bucket (via `new_bucket_start`) before reporting a
/// condition change that crosses a bucket boundary; the timer itself only
/// sees monotonically non-decreasing timestamps.
#[derive(Debug)]
pub struct ConditionTimer {
    condition: bool,
    last_change_ns: i64,
    accumulated_ns: i64,
    correction_ns: i64,
}

impl ConditionTimer {
    pub fn new(condition: bool, bucket_start_ns: i64) -> Self {
        Self {
            condition,
            last_change_ns: bucket_start_ns,
            accumulated_ns: 0,
            correction_ns: 0,
        }
    }

    pub fn condition(&self) -> bool {
        self.condition
    }

    /// Records a condition flip at `ts_ns`. A repeated value is a no-op.
    pub fn on_condition_changed(&mut self, condition: bool, ts_ns: i64) {
        if condition == self.condition {
            return;
        }
        if self.condition {
            self.accumulated_ns += (ts_ns - self.last_change_ns).max(0);
        }
        self.condition = condition;
        self.last_change_ns = ts_ns;
    }

    /// Rolls the timer over a bucket boundary.
    ///
    /// `event_ts_ns` is the event that forced the flush; `next_bucket_start_ns`
    /// is where the new bucket officially begins (equal to `event_ts_ns` for a
    /// mid-bucket split). Returns the condition-true time of the closed bucket
    /// and a correction equal to the true time accrued between the official
    /// boundary and the event, which belongs to the new bucket.
    pub fn new_bucket_start(&mut self, event_ts_ns: i64, next_bucket_start_ns: i64) -> (i64, i64) {
        let boundary = next_bucket_start_ns.min(event_ts_ns);
        if self.condition && boundary > self.last_change_ns {
            self.accumulated_ns += boundary - self.last_change_ns;
            self.last_change_ns = boundary;
        }
        let true_ns = self.accumulated_ns;
        self.accumulated_ns = 0;
        let correction = self.correction_ns;
        self.correction_ns = if self.condition {
            (event_ts_ns - next_bucket_start_ns).max(0)
        } else {
            0
        };
        (true_ns, correction)
    }
}
