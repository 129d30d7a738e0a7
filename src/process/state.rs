//! Process state machine
//!
//! The only mutation surface for a Process's state is the `swap` primitive
//! on [`StateCell`], which checks the expected current state and the
//! legality table in one critical section. The cell is built on a
//! `tokio::sync::watch` channel so concurrent callers that observe a
//! transitional state can await its completion instead of attempting their
//! own transition.

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

/// Lifecycle state of a managed backend process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Ready,
    SleepPending,
    Asleep,
    Waking,
    Stopping,
    Shutdown,
}

impl ProcessState {
    /// The authoritative transition table. Everything else is illegal.
    pub fn can_transition_to(self, to: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, to),
            (Stopped, Starting)
                | (Stopped, Shutdown)
                | (Starting, Stopped)
                | (Starting, Ready)
                | (Ready, SleepPending)
                | (Ready, Stopping)
                | (SleepPending, Asleep)
                | (SleepPending, Stopping)
                | (Asleep, Waking)
                | (Asleep, Stopping)
                | (Waking, Stopped)
                | (Waking, Ready)
                | (Waking, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Shutdown)
        )
    }

    /// States during which a transition task is in flight; waiters block on
    /// the state gate until one of these is left.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            ProcessState::Starting
                | ProcessState::Waking
                | ProcessState::SleepPending
                | ProcessState::Stopping
        )
    }

    /// States whose interval the OS child's lifetime must contain
    pub fn child_expected_alive(self) -> bool {
        !matches!(self, ProcessState::Stopped | ProcessState::Shutdown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Ready => "ready",
            ProcessState::SleepPending => "sleepPending",
            ProcessState::Asleep => "asleep",
            ProcessState::Waking => "waking",
            ProcessState::Stopping => "stopping",
            ProcessState::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected swap; carries the state actually observed
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("cannot transition {from} -> {to}: current state is {actual}")]
pub struct SwapError {
    pub from: ProcessState,
    pub to: ProcessState,
    pub actual: ProcessState,
}

/// Linearizable state holder for one Process
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<ProcessState>,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            tx: watch::channel(ProcessState::Stopped).0,
        }
    }

    /// Current state (racy by nature; use `swap` for decisions)
    pub fn current(&self) -> ProcessState {
        *self.tx.borrow()
    }

    /// Receiver for awaiting state changes (the transition gates)
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.tx.subscribe()
    }

    /// Atomically transition `from` -> `to`.
    ///
    /// Fails without side effects when the current state is not `from` or
    /// the edge is not in the legality table; the error carries the state
    /// that was actually observed.
    pub fn swap(&self, from: ProcessState, to: ProcessState) -> Result<(), SwapError> {
        let mut result = Ok(());
        self.tx.send_if_modified(|state| {
            if *state == from && from.can_transition_to(to) {
                *state = to;
                true
            } else {
                result = Err(SwapError {
                    from,
                    to,
                    actual: *state,
                });
                false
            }
        });
        result
    }

    /// Unconditionally set the state, bypassing the legality table.
    ///
    /// Reserved for the child supervisor (unexpected death -> Stopped) and
    /// the fail-fast wake path. Shutdown is terminal: once there, only
    /// Shutdown can be set again. Returns the previous state.
    pub fn force(&self, to: ProcessState) -> ProcessState {
        let mut prev = ProcessState::Shutdown;
        self.tx.send_if_modified(|state| {
            prev = *state;
            if *state == ProcessState::Shutdown && to != ProcessState::Shutdown {
                return false;
            }
            if *state == to {
                return false;
            }
            *state = to;
            true
        });
        prev
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProcessState::*;

    const ALL: [ProcessState; 8] = [
        Stopped,
        Starting,
        Ready,
        SleepPending,
        Asleep,
        Waking,
        Stopping,
        Shutdown,
    ];

    #[test]
    fn transition_table_matches_design() {
        let legal = [
            (Stopped, Starting),
            (Stopped, Shutdown),
            (Starting, Stopped),
            (Starting, Ready),
            (Ready, SleepPending),
            (Ready, Stopping),
            (SleepPending, Asleep),
            (SleepPending, Stopping),
            (Asleep, Waking),
            (Asleep, Stopping),
            (Waking, Stopped),
            (Waking, Ready),
            (Waking, Stopping),
            (Stopping, Stopped),
            (Stopping, Shutdown),
        ];
        for from in ALL {
            for to in ALL {
                let expected = legal.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "edge {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn shutdown_is_terminal() {
        for to in ALL {
            assert!(!Shutdown.can_transition_to(to));
        }
    }

    #[test]
    fn swap_happy_path() {
        let cell = StateCell::new();
        cell.swap(Stopped, Starting).unwrap();
        cell.swap(Starting, Ready).unwrap();
        assert_eq!(cell.current(), Ready);
    }

    #[test]
    fn swap_wrong_from_reports_actual_and_leaves_state() {
        let cell = StateCell::new();
        let err = cell.swap(Ready, Stopping).unwrap_err();
        assert_eq!(err.actual, Stopped);
        assert_eq!(cell.current(), Stopped);
    }

    #[test]
    fn swap_illegal_edge_rejected() {
        let cell = StateCell::new();
        cell.swap(Stopped, Starting).unwrap();
        cell.swap(Starting, Ready).unwrap();
        // Ready -> Asleep skips SleepPending and is not in the table
        let err = cell.swap(Ready, Asleep).unwrap_err();
        assert_eq!(err.actual, Ready);
        assert_eq!(cell.current(), Ready);
    }

    #[test]
    fn force_bypasses_table_but_not_shutdown() {
        let cell = StateCell::new();
        cell.swap(Stopped, Starting).unwrap();
        cell.swap(Starting, Ready).unwrap();

        // Supervisor path: child died while Ready
        let prev = cell.force(Stopped);
        assert_eq!(prev, Ready);
        assert_eq!(cell.current(), Stopped);

        cell.force(Shutdown);
        assert_eq!(cell.force(Ready), Shutdown);
        assert_eq!(cell.current(), Shutdown);
    }

    #[tokio::test]
    async fn subscribers_observe_transitions_in_order() {
        let cell = StateCell::new();
        let mut rx = cell.subscribe();
        cell.swap(Stopped, Starting).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Starting);
        cell.swap(Starting, Ready).unwrap();
        let ready = rx.wait_for(|s| !s.is_transitional()).await.unwrap();
        assert_eq!(*ready, Ready);
    }
}
