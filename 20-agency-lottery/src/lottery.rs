//! Readiness barrier and the one-time draw.
//!
//! Every agency in `1..=N` must announce readiness before the draw may run.
//! The draw reads the full bet snapshot once, groups the winners by agency
//! and is never repeated for the rest of the process. All state lives behind
//! one lock so a readiness update can never interleave with the draw.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    bet::AgencyId,
    storage::{Storage, StorageError},
};

#[derive(Debug, Error)]
pub enum DrawError {
    #[error("{pending} of {total} agencies have not announced readiness")]
    AgenciesNotReady { pending: usize, total: usize },
    #[error("failed to read bets for the draw: {0}")]
    Storage(#[from] StorageError),
}

/// Answer to a winners query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WinnersReply {
    Winners(Vec<String>),
    NotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrawState {
    Pending,
    Done,
}

struct LotteryState {
    ready: Vec<bool>,
    draw: DrawState,
    winners: HashMap<AgencyId, Vec<String>>,
}

impl LotteryState {
    fn slot(&self, agency: AgencyId) -> Option<usize> {
        let index = agency.get() as usize - 1;
        (index < self.ready.len()).then_some(index)
    }

    fn mark_ready(&mut self, agency: AgencyId) -> bool {
        match self.slot(agency) {
            Some(index) => {
                self.ready[index] = true;
                true
            }
            None => false,
        }
    }

    fn pending(&self) -> usize {
        self.ready.iter().filter(|ready| !**ready).count()
    }

    fn winners_for(&self, agency: AgencyId) -> Vec<String> {
        self.winners.get(&agency).cloned().unwrap_or_default()
    }

    async fn execute_draw(&mut self, storage: &Storage) -> Result<bool, DrawError> {
        if self.draw == DrawState::Done {
            return Ok(false);
        }
        let pending = self.pending();
        if pending > 0 {
            return Err(DrawError::AgenciesNotReady {
                pending,
                total: self.ready.len(),
            });
        }

        let bets = storage.load_all().await?;
        let mut winners: HashMap<AgencyId, Vec<String>> = HashMap::new();
        for bet in bets.iter().filter(|bet| storage.is_winner(bet)) {
            winners
                .entry(bet.agency)
                .or_default()
                .push(bet.document.clone());
        }

        let total: usize = winners.values().map(Vec::len).sum();
        info!(bets = bets.len(), winners = total, "draw completed");

        self.winners = winners;
        self.draw = DrawState::Done;
        Ok(true)
    }
}

pub struct LotteryCoordinator {
    state: Mutex<LotteryState>,
}

impl LotteryCoordinator {
    /// Creates a coordinator expecting agencies `1..=agencies`.
    pub fn new(agencies: usize) -> Self {
        Self {
            state: Mutex::new(LotteryState {
                ready: vec![false; agencies],
                draw: DrawState::Pending,
                winners: HashMap::new(),
            }),
        }
    }

    /// Marks the agency ready. Ids outside `1..=N` are ignored and reported
    /// by returning `false`.
    pub async fn mark_ready(&self, agency: AgencyId) -> bool {
        self.state.lock().await.mark_ready(agency)
    }

    pub async fn all_ready(&self) -> bool {
        self.state.lock().await.pending() == 0
    }

    pub async fn draw_done(&self) -> bool {
        self.state.lock().await.draw == DrawState::Done
    }

    /// Runs the draw if it has not run yet.
    ///
    /// Returns `Ok(true)` when this call performed the draw and `Ok(false)`
    /// when it had already happened. Fails if any agency is still pending.
    pub async fn run_draw(&self, storage: &Storage) -> Result<bool, DrawError> {
        self.state.lock().await.execute_draw(storage).await
    }

    /// Runs the draw only when the barrier is satisfied and it has not run.
    pub async fn draw_if_ready(&self, storage: &Storage) -> Result<bool, DrawError> {
        let mut state = self.state.lock().await;
        if state.draw == DrawState::Done || state.pending() > 0 {
            return Ok(false);
        }
        state.execute_draw(storage).await
    }

    /// Winning documents for the agency, in storage order. Empty before the
    /// draw or for unknown ids.
    pub async fn winners_for(&self, agency: AgencyId) -> Vec<String> {
        self.state.lock().await.winners_for(agency)
    }

    /// Answers a winners query. A query before the draw doubles as a
    /// readiness announcement for the asking agency.
    pub async fn query_winners(&self, agency: AgencyId) -> WinnersReply {
        let mut state = self.state.lock().await;
        if state.draw == DrawState::Done {
            WinnersReply::Winners(state.winners_for(agency))
        } else {
            state.mark_ready(agency);
            WinnersReply::NotReady
        }
    }
}
