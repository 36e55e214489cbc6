mod failure_config;
mod logging;
mod memory_store;
mod transport;

#[rustfmt::skip]
pub use {
  failure_config::FailureConfig,
  failure_config::FailureConfigMap,
  logging::init_logging,
  memory_store::MemoryStore,
  transport::LocalTransport,
  transport::RecordingTransport,
};
