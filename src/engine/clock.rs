use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Source of "now" and of waiting. Live trading uses wall time; backtests
/// advance a simulated clock instead of sleeping.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

struct SimulatedState {
    now: DateTime<Utc>,
    schedule: VecDeque<DateTime<Utc>>,
}

/// Clock that only moves when slept on.
///
/// With a schedule, each sleep jumps to the next scheduled instant (replaying
/// recorded cycle times). Without one, or once it runs out, sleep advances by
/// the requested duration.
pub struct SimulatedClock {
    state: Mutex<SimulatedState>,
}

impl SimulatedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(SimulatedState {
                now: start,
                schedule: VecDeque::new(),
            }),
        }
    }

    /// Starts at the first instant; later instants are visited in order.
    pub fn with_schedule(instants: impl IntoIterator<Item = DateTime<Utc>>) -> Option<Self> {
        let mut schedule: VecDeque<_> = instants.into_iter().collect();
        let start = schedule.pop_front()?;
        Some(Self {
            state: Mutex::new(SimulatedState { now: start, schedule }),
        })
    }

    pub fn advance(&self, duration: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.now +=
            chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

#[async_trait]
impl Clock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).now
    }

    async fn sleep(&self, duration: Duration) {
        let next = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .schedule
            .pop_front();
        match next {
            Some(instant) => {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.now = state.now.max(instant);
            }
            None => self.advance(duration),
        }
        tokio::task::yield_now().await;
    }
}
