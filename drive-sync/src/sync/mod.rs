pub mod backoff;
pub mod conflict;
pub mod differ;
pub mod executor;
pub mod local;
pub mod orchestrator;
pub mod paths;
pub mod record;
pub mod remote_scan;
pub mod state;
pub mod summary;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;
