//! Periodic job subsystem.
//!
//! Cron policies are persisted in Redis ZSETs and cached per-process in a
//! `PolicyStore` kept coherent over pub/sub. The `Scheduler` is the public
//! surface for adding and removing policies; the `PeriodicEnqueuer` turns
//! stored policies into concrete scheduled job instances on a timer.

pub mod enqueuer;
pub mod policy;
pub mod scheduler;
pub mod store;

pub use enqueuer::PeriodicEnqueuer;
pub use policy::PeriodicPolicy;
pub use scheduler::Scheduler;
pub use store::PolicyStore;
