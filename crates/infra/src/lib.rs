//! Infrastructure layer: storage, broker, mail transport, config, and the
//! services that run the dispatch pipeline on top of them.

pub mod broker;
pub mod config;
pub mod dispatch;
pub mod scheduler;
pub mod store;
pub mod transport;
pub mod workers;

mod integration_tests;
