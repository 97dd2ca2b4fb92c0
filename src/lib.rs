//! Offline capture and synchronization queue for farm field records.
//!
//! Producers hand records to [`gateway::SubmissionGateway`]; records that
//! cannot be delivered live land in a [`queue::QueueStore`] and are replayed by
//! [`reconciler::SyncReconciler`] when [`connectivity::ConnectivityMonitor`]
//! reports the device back online.

pub mod config;
pub mod connectivity;
pub mod db;
pub mod gateway;
pub mod model;
pub mod queue;
pub mod reconciler;
pub mod remote;
pub mod status;
