//! Carrier billing-invoice retrieval: portal automation, S3 archiving, job
//! status tracking and completion webhooks.

pub mod browser;
pub mod carrier;
pub mod cli;
pub mod config;
pub mod error;
pub mod notify;
pub mod orchestrator;
pub mod portal;
pub mod retry;
pub mod selector;
pub mod state_machine;
pub mod status;
pub mod storage;
pub mod ui;

#[cfg(test)]
pub(crate) mod testing;
