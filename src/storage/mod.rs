//! Store adapters: one per backing store, behind [`traits::StoreAdapter`].

pub mod traits;
pub mod memory;
pub mod sql;
pub mod airtable;
pub mod vector;
pub(crate) mod http;
