//! Retry/backoff for adapter calls and the durable repair ledger.

pub mod retry;
pub mod ledger;
pub mod sql_ledger;
