//! Bet persistence behind a small blocking interface.
//!
//! The server only needs three things from storage: append a batch, read the
//! full snapshot for the draw, and decide whether a bet won. Implementations
//! hold their own lock so an append and a snapshot read never interleave.
//! [`Storage`] wraps any implementation for use from async tasks by running
//! each call on the blocking thread pool.

use std::{
    fs::OpenOptions,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use thiserror::Error;
use tracing::debug;

use crate::bet::{Bet, BetParseError, FIELD_SEPARATOR};

/// Number that wins the draw unless configured otherwise.
pub const DEFAULT_WINNING_NUMBER: u32 = 7574;

pub trait BetStore: Send + Sync {
    /// Persists every bet of the batch in one call.
    fn append_bets(&self, bets: &[Bet]) -> Result<(), StorageError>;

    /// Returns every stored bet in insertion order.
    fn load_all_bets(&self) -> Result<Vec<Bet>, StorageError>;

    fn is_winner(&self, bet: &Bet) -> bool;
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bet storage I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("bet storage CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("corrupt bet row {line}: {source}")]
    Corrupt {
        line: u64,
        #[source]
        source: BetParseError,
    },
    #[error("storage task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

/// Appends bets to a headerless CSV file, one row per bet.
pub struct CsvBetStore {
    path: PathBuf,
    winning_number: u32,
    file_lock: Mutex<()>,
}

impl CsvBetStore {
    pub fn new(path: impl Into<PathBuf>, winning_number: u32) -> Self {
        Self {
            path: path.into(),
            winning_number,
            file_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BetStore for CsvBetStore {
    fn append_bets(&self, bets: &[Bet]) -> Result<(), StorageError> {
        let _guard = self.file_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        for bet in bets {
            writer.write_record([
                bet.agency.to_string(),
                bet.first_name.clone(),
                bet.last_name.clone(),
                bet.document.clone(),
                bet.birthdate.format("%Y-%m-%d").to_string(),
                bet.number.to_string(),
            ])?;
            debug!(document = %bet.document, number = bet.number, "bet stored");
        }
        writer.flush()?;
        Ok(())
    }

    fn load_all_bets(&self) -> Result<Vec<Bet>, StorageError> {
        let _guard = self.file_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(&self.path)?;

        let mut bets = Vec::new();
        for (index, row) in reader.records().enumerate() {
            let row = row?;
            let line = row
                .position()
                .map(|pos| pos.line())
                .unwrap_or(index as u64 + 1);
            let joined = row.iter().collect::<Vec<_>>().join(&FIELD_SEPARATOR.to_string());
            let bet = joined
                .parse::<Bet>()
                .map_err(|source| StorageError::Corrupt { line, source })?;
            bets.push(bet);
        }
        Ok(bets)
    }

    fn is_winner(&self, bet: &Bet) -> bool {
        bet.number == self.winning_number
    }
}

/// Process-local store, handy for tests and embedding.
pub struct MemoryBetStore {
    bets: Mutex<Vec<Bet>>,
    winning_number: u32,
}

impl MemoryBetStore {
    pub fn new(winning_number: u32) -> Self {
        Self {
            bets: Mutex::new(Vec::new()),
            winning_number,
        }
    }
}

impl Default for MemoryBetStore {
    fn default() -> Self {
        Self::new(DEFAULT_WINNING_NUMBER)
    }
}

impl BetStore for MemoryBetStore {
    fn append_bets(&self, bets: &[Bet]) -> Result<(), StorageError> {
        self.bets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(bets);
        Ok(())
    }

    fn load_all_bets(&self) -> Result<Vec<Bet>, StorageError> {
        Ok(self
            .bets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn is_winner(&self, bet: &Bet) -> bool {
        bet.number == self.winning_number
    }
}

/// Cloneable async handle over a [`BetStore`].
#[derive(Clone)]
pub struct Storage {
    inner: Arc<dyn BetStore>,
}

impl Storage {
    pub fn new<S>(store: S) -> Self
    where
        S: BetStore + 'static,
    {
        Self {
            inner: Arc::new(store),
        }
    }

    pub fn from_arc(inner: Arc<dyn BetStore>) -> Self {
        Self { inner }
    }

    /// Stores the batch and returns how many bets were written.
    pub async fn append(&self, bets: Vec<Bet>) -> Result<usize, StorageError> {
        let store = Arc::clone(&self.inner);
        let count = bets.len();
        tokio::task::spawn_blocking(move || store.append_bets(&bets)).await??;
        Ok(count)
    }

    pub async fn load_all(&self) -> Result<Vec<Bet>, StorageError> {
        let store = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || store.load_all_bets()).await?
    }

    pub fn is_winner(&self, bet: &Bet) -> bool {
        self.inner.is_winner(bet)
    }
}
