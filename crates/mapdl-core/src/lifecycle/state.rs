use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Stage of a session's life.
///
/// `NotStarted -> Starting -> Running -> Exiting -> Exited`. A start that
/// fails goes from `Starting` straight to `Exiting` to release what it had
/// acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LifecycleState {
    NotStarted = 0,
    Starting = 1,
    Running = 2,
    Exiting = 3,
    Exited = 4,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::NotStarted,
            1 => LifecycleState::Starting,
            2 => LifecycleState::Running,
            3 => LifecycleState::Exiting,
            _ => LifecycleState::Exited,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::NotStarted => "NOT_STARTED",
            LifecycleState::Starting => "STARTING",
            LifecycleState::Running => "RUNNING",
            LifecycleState::Exiting => "EXITING",
            LifecycleState::Exited => "EXITED",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub(crate) struct LifecycleCell(AtomicU8);

impl LifecycleCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(LifecycleState::NotStarted as u8))
    }

    pub fn get(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn begin_start(&self) -> bool {
        self.transition(LifecycleState::NotStarted, LifecycleState::Starting)
    }

    pub fn mark_running(&self) -> bool {
        self.transition(LifecycleState::Starting, LifecycleState::Running)
    }

    /// `Running` or `Starting` to `Exiting`. Only one caller wins.
    pub fn begin_exit(&self) -> bool {
        self.transition(LifecycleState::Running, LifecycleState::Exiting)
            || self.transition(LifecycleState::Starting, LifecycleState::Exiting)
    }

    pub fn mark_exited(&self) -> bool {
        self.transition(LifecycleState::Exiting, LifecycleState::Exited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let cell = LifecycleCell::new();
        assert_eq!(cell.get(), LifecycleState::NotStarted);
        assert!(!cell.mark_running());
        assert!(cell.begin_start());
        assert!(!cell.begin_start());
        assert!(cell.mark_running());
        assert!(cell.begin_exit());
        assert!(!cell.begin_exit());
        assert_eq!(cell.get(), LifecycleState::Exiting);
        assert!(cell.mark_exited());
        assert_eq!(cell.get(), LifecycleState::Exited);
        assert!(!cell.begin_exit());
    }

    #[test]
    fn test_failed_start_exits() {
        let cell = LifecycleCell::new();
        cell.begin_start();
        assert!(cell.begin_exit());
        assert!(cell.mark_exited());
        assert!(!cell.mark_running());
        assert_eq!(cell.get().to_string(), "EXITED");
    }
}
