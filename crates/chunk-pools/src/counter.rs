/// ProgressCounter tracks a population of work items (jobs, data weight,
/// rows) across its lifecycle states.
///
/// `pending + running + completed + suspended == total` holds after every
/// transition; `failed`, `aborted` and `lost` are monotone histories of
/// retried work, whose items are returned to `pending` for replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProgressCounter {
    total: i64,
    running: i64,
    completed: i64,
    pending: i64,
    suspended: i64,
    failed: i64,
    aborted: i64,
    lost: i64,
}

impl ProgressCounter {
    pub fn new(total: i64) -> Self {
        let mut counter = Self::default();
        counter.set(total);
        counter
    }

    pub fn set(&mut self, total: i64) {
        assert_eq!(self.total, 0, "counter total already set");
        self.total = total;
        self.pending = total;
    }

    pub fn increment(&mut self, delta: i64) {
        self.total += delta;
        self.pending += delta;
        self.check();
    }

    pub fn start(&mut self, count: i64) {
        self.pending -= count;
        self.running += count;
        self.check();
    }

    pub fn completed(&mut self, count: i64) {
        self.running -= count;
        self.completed += count;
        self.check();
    }

    pub fn failed(&mut self, count: i64) {
        self.running -= count;
        self.failed += count;
        self.pending += count;
        self.check();
    }

    pub fn aborted(&mut self, count: i64) {
        self.running -= count;
        self.aborted += count;
        self.pending += count;
        self.check();
    }

    pub fn lost(&mut self, count: i64) {
        self.completed -= count;
        self.lost += count;
        self.pending += count;
        self.check();
    }

    pub fn suspend(&mut self, count: i64) {
        self.pending -= count;
        self.suspended += count;
        self.check();
    }

    pub fn resume(&mut self, count: i64) {
        self.suspended -= count;
        self.pending += count;
        self.check();
    }

    pub fn total(&self) -> i64 {
        self.total
    }
    pub fn running(&self) -> i64 {
        self.running
    }
    pub fn get_completed(&self) -> i64 {
        self.completed
    }
    pub fn pending(&self) -> i64 {
        self.pending
    }
    pub fn suspended(&self) -> i64 {
        self.suspended
    }
    pub fn get_failed(&self) -> i64 {
        self.failed
    }
    pub fn get_aborted(&self) -> i64 {
        self.aborted
    }
    pub fn get_lost(&self) -> i64 {
        self.lost
    }

    fn check(&self) {
        assert!(
            self.running >= 0
                && self.completed >= 0
                && self.pending >= 0
                && self.suspended >= 0,
            "progress counter bucket underflow: {self}",
        );
        assert_eq!(
            self.pending + self.running + self.completed + self.suspended,
            self.total,
            "progress counter conservation violated: {self}",
        );
    }
}

impl ProgressCounter {
    pub fn save(&self, out: &mut Vec<u8>) {
        use crate::persist::{put_i64, record, tags};
        record(out, tags::COUNTER, |out| {
            put_i64(out, self.total);
            put_i64(out, self.running);
            put_i64(out, self.completed);
            put_i64(out, self.pending);
            put_i64(out, self.suspended);
            put_i64(out, self.failed);
            put_i64(out, self.aborted);
            put_i64(out, self.lost);
        });
    }

    pub fn load(input: &mut &[u8]) -> Result<Self, crate::persist::PersistError> {
        use crate::persist::{expect_record, get_i64, parse_payload, tags};
        let payload = expect_record(input, tags::COUNTER)?;
        parse_payload(payload, |input| {
            let counter = Self {
                total: get_i64(input)?,
                running: get_i64(input)?,
                completed: get_i64(input)?,
                pending: get_i64(input)?,
                suspended: get_i64(input)?,
                failed: get_i64(input)?,
                aborted: get_i64(input)?,
                lost: get_i64(input)?,
            };
            counter.check();
            Ok(counter)
        })
    }
}

impl std::fmt::Display for ProgressCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{T: {}, R: {}, C: {}, P: {}, S: {}, F: {}, A: {}, L: {}}}",
            self.total,
            self.running,
            self.completed,
            self.pending,
            self.suspended,
            self.failed,
            self.aborted,
            self.lost,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn lifecycle_transitions() {
        let mut counter = ProgressCounter::new(4);
        assert_eq!(counter.pending(), 4);

        counter.start(2);
        assert_eq!(counter.running(), 2);
        assert_eq!(counter.pending(), 2);

        counter.completed(1);
        counter.failed(1);
        assert_eq!(counter.get_completed(), 1);
        assert_eq!(counter.get_failed(), 1);
        assert_eq!(counter.pending(), 3);
        assert_eq!(counter.running(), 0);

        counter.lost(1);
        assert_eq!(counter.get_completed(), 0);
        assert_eq!(counter.get_lost(), 1);
        assert_eq!(counter.pending(), 4);
    }

    #[test]
    fn display_summarizes_all_buckets() {
        let mut counter = ProgressCounter::new(4);
        counter.start(2);
        counter.completed(1);
        counter.failed(1);
        insta::assert_snapshot!(
            counter.to_string(),
            @"{T: 4, R: 0, C: 1, P: 3, S: 0, F: 1, A: 0, L: 0}"
        );
    }

    #[test]
    fn increment_grows_pending() {
        let mut counter = ProgressCounter::default();
        counter.increment(10);
        counter.increment(5);
        assert_eq!(counter.total(), 15);
        assert_eq!(counter.pending(), 15);
    }

    #[test]
    fn suspend_resume_round_trip() {
        let mut counter = ProgressCounter::new(3);
        counter.suspend(2);
        assert_eq!(counter.suspended(), 2);
        assert_eq!(counter.pending(), 1);
        counter.resume(2);
        assert_eq!(counter.pending(), 3);
    }

    // Conservation holds under an arbitrary valid transition sequence.
    #[test]
    fn conservation_soak() {
        let mut rng = SmallRng::seed_from_u64(0xc0ffee);
        let mut counter = ProgressCounter::new(100);

        for _ in 0..10_000 {
            match rng.gen_range(0..5) {
                0 if counter.pending() > 0 => counter.start(1),
                1 if counter.running() > 0 => counter.completed(1),
                2 if counter.running() > 0 => counter.failed(1),
                3 if counter.running() > 0 => counter.aborted(1),
                4 if counter.get_completed() > 0 => counter.lost(1),
                _ => {}
            }
            // check() has already asserted conservation internally.
            assert_eq!(
                counter.pending() + counter.running() + counter.get_completed(),
                counter.total(),
            );
        }
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn overdrawn_completion_panics() {
        let mut counter = ProgressCounter::new(1);
        counter.completed(1);
    }
}
