//! Background delivery workers.

pub mod mail_worker;
pub mod pool;

pub use mail_worker::{DeliveryOutcome, MailWorker, MirrorOutcome};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
