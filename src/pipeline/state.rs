//! Scan session state and its single-assignment commit

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;

/// Payload extracted from the first successful decode
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecodedPayload(String);

impl DecodedPayload {
    pub fn new(payload: impl Into<String>) -> Self {
        Self(payload.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for DecodedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scan session state machine.
///
/// `Idle → Scanning → {Decoded, Cancelled}`. `Idle` may also go straight to
/// `Cancelled` when the host leaves before scanning ever started. Terminal
/// states never change again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanState {
    /// Created, capture not started yet
    Idle,
    Scanning,
    Decoded(DecodedPayload),
    Cancelled,
}

impl ScanState {
    pub fn is_scanning(&self) -> bool {
        matches!(self, ScanState::Scanning)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanState::Decoded(_) | ScanState::Cancelled)
    }

    pub fn payload(&self) -> Option<&DecodedPayload> {
        match self {
            ScanState::Decoded(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ScanState::Idle => "Idle",
            ScanState::Scanning => "Scanning",
            ScanState::Decoded(_) => "Decoded",
            ScanState::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Shared state with compare-and-commit transitions.
///
/// A transition succeeds only if the state it was checked against is still
/// the one installed, so two racing completions can never both commit.
pub(crate) struct StateCell {
    state: ArcSwap<ScanState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(ScanState::Idle),
        }
    }

    pub(crate) fn get(&self) -> ScanState {
        (**self.state.load()).clone()
    }

    pub(crate) fn is_scanning(&self) -> bool {
        self.state.load().is_scanning()
    }

    /// `Idle → Scanning`
    pub(crate) fn begin(&self) -> Result<(), ScanState> {
        self.transition(|s| matches!(s, ScanState::Idle), ScanState::Scanning)
    }

    /// `Scanning → Decoded`. Only the first caller wins.
    pub(crate) fn commit(&self, payload: DecodedPayload) -> Result<(), ScanState> {
        self.transition(ScanState::is_scanning, ScanState::Decoded(payload))
    }

    /// `Idle | Scanning → Cancelled`
    pub(crate) fn cancel(&self) -> Result<(), ScanState> {
        self.transition(|s| !s.is_terminal(), ScanState::Cancelled)
    }

    /// Returns the state that blocked the transition on failure.
    fn transition(
        &self,
        allowed: impl Fn(&ScanState) -> bool,
        next: ScanState,
    ) -> Result<(), ScanState> {
        let next = Arc::new(next);
        loop {
            let current = self.state.load();
            if !allowed(&**current) {
                return Err((**current).clone());
            }
            let previous = self.state.compare_and_swap(&current, next.clone());
            if Arc::ptr_eq(&*previous, &*current) {
                return Ok(());
            }
            // Lost a race; re-check against whatever is installed now
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_valid_transitions() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), ScanState::Idle);
        cell.begin().unwrap();
        assert!(cell.is_scanning());
        cell.commit(DecodedPayload::new("ABC123")).unwrap();
        assert_eq!(
            cell.get().payload().map(DecodedPayload::as_str),
            Some("ABC123")
        );
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let cell = StateCell::new();
        cell.begin().unwrap();
        cell.cancel().unwrap();

        assert_eq!(
            cell.commit(DecodedPayload::new("late")),
            Err(ScanState::Cancelled)
        );
        assert_eq!(cell.begin(), Err(ScanState::Cancelled));
        assert_eq!(cell.cancel(), Err(ScanState::Cancelled));

        let decoded = StateCell::new();
        decoded.begin().unwrap();
        decoded.commit(DecodedPayload::new("P1")).unwrap();
        assert!(decoded.cancel().is_err());
        assert!(decoded.commit(DecodedPayload::new("P2")).is_err());
        assert_eq!(decoded.get(), ScanState::Decoded(DecodedPayload::new("P1")));
    }

    #[test]
    fn test_commit_requires_scanning() {
        let cell = StateCell::new();
        assert_eq!(cell.commit(DecodedPayload::new("early")), Err(ScanState::Idle));
        cell.cancel().unwrap();
        assert_eq!(cell.get(), ScanState::Cancelled);
    }

    #[test]
    fn test_exactly_one_concurrent_commit_wins() {
        const CONTENDERS: usize = 16;

        for _ in 0..50 {
            let cell = Arc::new(StateCell::new());
            cell.begin().unwrap();
            let barrier = Arc::new(Barrier::new(CONTENDERS));

            let handles: Vec<_> = (0..CONTENDERS)
                .map(|i| {
                    let cell = cell.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        let won = cell.commit(DecodedPayload::new(format!("P{i}"))).is_ok();
                        won.then_some(i)
                    })
                })
                .collect();

            let winners: Vec<usize> = handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .collect();

            assert_eq!(winners.len(), 1);
            let expected = DecodedPayload::new(format!("P{}", winners[0]));
            assert_eq!(cell.get(), ScanState::Decoded(expected));
        }
    }
}
