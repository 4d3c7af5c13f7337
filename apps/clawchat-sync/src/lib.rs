pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod credentials;
pub mod executor;
pub mod queue;
pub mod socket;
pub mod status;
pub mod storage;
pub mod store;
pub mod stream;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;
