//! Thin facade over the on-chain betting program.

pub mod accounts;
pub mod client;

pub use client::{LedgerClient, LedgerError};
