//! The vocabulary shared by every other module: peer addresses, the task model that flows from
//! local mutations to the network, configuration, errors and the wire types exchanged between
//! peers.

mod config;
mod error;
mod remoting;
mod task;
mod wire;

#[rustfmt::skip]
pub use {
  config::DistroConfig,
  error::DistroError,
  error::Result,
  remoting::Host,
  remoting::Socket,
  task::DataOperation,
  task::DistroKey,
  task::DistroTask,
  task::SyncTask,
  wire::decode,
  wire::encode,
  wire::Datum,
  wire::DistroBatch,
  wire::PushStatus,
  wire::VerifyRecord,
};
