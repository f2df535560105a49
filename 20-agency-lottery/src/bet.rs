//! Bet records and the batch payload grammar.
//!
//! A batch payload is a list of records separated by `;`. Each record holds
//! exactly six `,`-separated fields: agency, first name, last name, document,
//! birthdate (ISO `YYYY-MM-DD`) and bet number.

use std::{fmt, str::FromStr};

use chrono::NaiveDate;
use thiserror::Error;
use tracing::warn;

pub const RECORD_SEPARATOR: char = ';';
pub const FIELD_SEPARATOR: char = ',';
pub const FIELD_COUNT: usize = 6;

/// Identifier of an agency. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AgencyId(u32);

impl AgencyId {
    pub fn new(raw: u32) -> Option<Self> {
        (raw > 0).then_some(Self(raw))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl FromStr for AgencyId {
    type Err = BetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        trimmed
            .parse::<u32>()
            .ok()
            .and_then(AgencyId::new)
            .ok_or_else(|| BetParseError::AgencyId(trimmed.to_string()))
    }
}

impl fmt::Display for AgencyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bet {
    pub agency: AgencyId,
    pub first_name: String,
    pub last_name: String,
    pub document: String,
    pub birthdate: NaiveDate,
    pub number: u32,
}

impl Bet {
    /// Renders the bet in the six-field wire form.
    pub fn to_record(&self) -> String {
        format!(
            "{agency}{sep}{first}{sep}{last}{sep}{document}{sep}{birthdate}{sep}{number}",
            sep = FIELD_SEPARATOR,
            agency = self.agency,
            first = self.first_name,
            last = self.last_name,
            document = self.document,
            birthdate = self.birthdate.format("%Y-%m-%d"),
            number = self.number,
        )
    }
}

impl FromStr for Bet {
    type Err = BetParseError;

    fn from_str(record: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = record.split(FIELD_SEPARATOR).map(str::trim).collect();
        let &[agency, first_name, last_name, document, birthdate, number] = fields.as_slice() else {
            return Err(BetParseError::FieldCount(fields.len()));
        };

        let agency = agency.parse::<AgencyId>()?;
        let birthdate = NaiveDate::parse_from_str(birthdate, "%Y-%m-%d")
            .map_err(|_| BetParseError::Birthdate(birthdate.to_string()))?;
        let number = number
            .parse::<u32>()
            .map_err(|_| BetParseError::Number(number.to_string()))?;

        Ok(Bet {
            agency,
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            document: document.to_string(),
            birthdate,
            number,
        })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BetParseError {
    #[error("expected {FIELD_COUNT} fields, found {0}")]
    FieldCount(usize),
    #[error("invalid agency id {0:?}")]
    AgencyId(String),
    #[error("invalid birthdate {0:?}")]
    Birthdate(String),
    #[error("invalid bet number {0:?}")]
    Number(String),
}

/// Outcome of parsing a batch payload.
#[derive(Debug, Default)]
pub struct ParsedBatch {
    pub bets: Vec<Bet>,
    pub rejected: usize,
}

/// Parses every record of a batch payload, dropping malformed ones.
///
/// Empty records (for instance after a trailing `;`) are skipped without
/// counting as rejected.
pub fn parse_batch(payload: &str) -> ParsedBatch {
    let mut batch = ParsedBatch::default();

    for (index, record) in payload.split(RECORD_SEPARATOR).enumerate() {
        if record.trim().is_empty() {
            continue;
        }
        match record.parse::<Bet>() {
            Ok(bet) => batch.bets.push(bet),
            Err(error) => {
                warn!(record = index, %error, "dropping malformed bet record");
                batch.rejected += 1;
            }
        }
    }

    batch
}

/// Joins bets into a batch payload.
pub fn encode_batch(bets: &[Bet]) -> String {
    bets.iter()
        .map(Bet::to_record)
        .collect::<Vec<_>>()
        .join(&RECORD_SEPARATOR.to_string())
}
