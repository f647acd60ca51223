use std::time::Duration;

/// Where a suspended task resumes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Wake {
    /// After this many frames have started.
    Ticks(u32),
    /// Once this much session time has elapsed.
    After(Duration),
    /// At the end of the current frame, after loads have been advanced.
    EndOfFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Update,
    EndOfFrame,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum WakeAt {
    Frame(u64),
    Time(Duration),
    EndOfFrame(u64),
}

#[derive(Debug)]
struct Entry<T> {
    seq: u64,
    wake_at: WakeAt,
    task: T,
}

/// Cooperative, single-threaded task queue. Tasks are plain values the owner
/// dispatches; suspending means scheduling the next step with a [`Wake`].
///
/// Due tasks are returned in the order they were scheduled.
#[derive(Debug)]
pub struct Scheduler<T> {
    frame: u64,
    now: Duration,
    next_seq: u64,
    entries: Vec<Entry<T>>,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self {
            frame: 0,
            now: Duration::ZERO,
            next_seq: 0,
            entries: Vec::new(),
        }
    }
}

impl<T> Scheduler<T> {
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    pub fn begin_frame(&mut self, now: Duration) {
        self.frame = self.frame.saturating_add(1);
        self.now = self.now.max(now);
    }

    pub fn schedule(&mut self, task: T, wake: Wake) {
        let wake_at = match wake {
            Wake::Ticks(ticks) => WakeAt::Frame(self.frame.saturating_add(u64::from(ticks.max(1)))),
            Wake::After(delay) => WakeAt::Time(self.now.saturating_add(delay)),
            Wake::EndOfFrame => WakeAt::EndOfFrame(self.frame),
        };
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.entries.push(Entry { seq, wake_at, task });
    }

    /// Removes and returns every task due in `phase` of the current frame.
    pub fn take_due(&mut self, phase: FramePhase) -> Vec<T> {
        let frame = self.frame;
        let now = self.now;
        let is_due = |wake_at: &WakeAt| match (phase, *wake_at) {
            (FramePhase::Update, WakeAt::Frame(at)) => at <= frame,
            (FramePhase::Update, WakeAt::Time(at)) => at <= now,
            (FramePhase::EndOfFrame, WakeAt::EndOfFrame(at)) => at <= frame,
            _ => false,
        };

        let mut due = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            if is_due(&self.entries[index].wake_at) {
                due.push(self.entries.remove(index));
            } else {
                index += 1;
            }
        }
        due.sort_by_key(|entry| entry.seq);
        due.into_iter().map(|entry| entry.task).collect()
    }

    pub fn cancel_where(&mut self, mut predicate: impl FnMut(&T) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| !predicate(&entry.task));
        before - self.entries.len()
    }

    pub fn is_scheduled(&self, mut predicate: impl FnMut(&T) -> bool) -> bool {
        self.entries.iter().any(|entry| predicate(&entry.task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_wake_resumes_after_requested_frames() {
        let mut scheduler = Scheduler::default();
        scheduler.begin_frame(Duration::ZERO);
        scheduler.schedule("settle", Wake::Ticks(2));

        scheduler.begin_frame(Duration::ZERO);
        assert!(scheduler.take_due(FramePhase::Update).is_empty());
        scheduler.begin_frame(Duration::ZERO);
        assert_eq!(scheduler.take_due(FramePhase::Update), vec!["settle"]);
    }

    #[test]
    fn timed_wake_uses_session_time() {
        let mut scheduler = Scheduler::default();
        scheduler.schedule("sweep", Wake::After(Duration::from_millis(500)));

        scheduler.begin_frame(Duration::from_millis(499));
        assert!(scheduler.take_due(FramePhase::Update).is_empty());
        scheduler.begin_frame(Duration::from_millis(500));
        assert_eq!(scheduler.take_due(FramePhase::Update), vec!["sweep"]);
    }

    #[test]
    fn end_of_frame_tasks_only_run_in_end_phase_in_schedule_order() {
        let mut scheduler = Scheduler::default();
        scheduler.begin_frame(Duration::ZERO);
        scheduler.schedule("scan", Wake::EndOfFrame);
        scheduler.schedule("instantiate", Wake::EndOfFrame);

        assert!(scheduler.take_due(FramePhase::Update).is_empty());
        assert_eq!(
            scheduler.take_due(FramePhase::EndOfFrame),
            vec!["scan", "instantiate"]
        );
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn cancel_where_drops_matching_tasks() {
        let mut scheduler = Scheduler::default();
        scheduler.schedule(1, Wake::Ticks(1));
        scheduler.schedule(2, Wake::Ticks(1));
        scheduler.schedule(3, Wake::EndOfFrame);

        assert_eq!(scheduler.cancel_where(|task| *task < 3), 2);
        assert!(scheduler.is_scheduled(|task| *task == 3));
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn clock_never_runs_backwards() {
        let mut scheduler: Scheduler<()> = Scheduler::default();
        scheduler.begin_frame(Duration::from_secs(2));
        scheduler.begin_frame(Duration::from_secs(1));
        assert_eq!(scheduler.now(), Duration::from_secs(2));
        assert_eq!(scheduler.frame(), 2);
    }
}
