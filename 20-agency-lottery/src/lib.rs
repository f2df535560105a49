//! Lottery server for agencies that submit bets over a small TCP protocol.
//!
//! Agencies upload their bets, announce that they are done, and later ask
//! for their winners. The draw runs once, after every configured agency has
//! announced readiness.
//!
//! - [`message`] implements the length-prefixed binary frame format.
//! - [`bet`] holds the bet record and the batch payload grammar.
//! - [`storage`] defines the persistence interface plus CSV and in-memory
//!   stores.
//! - [`lottery`] guards the readiness barrier, the draw and the winners.
//! - [`session`] runs the per-connection request loop.
//! - [`server`] accepts connections into a bounded pool of sessions and
//!   shuts down gracefully.
//! - [`client`] drives the agency side of the protocol.
//! - [`cli`] parses the command line for both modes.
//!
//! Integration tests exercise the server over real sockets and the binary
//! end to end.

pub mod bet;
pub mod cli;
pub mod client;
pub mod lottery;
pub mod message;
pub mod server;
pub mod session;
pub mod signal;
pub mod storage;
