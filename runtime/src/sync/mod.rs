//! Synchronization primitives built on the task/scheduler core (spec.md
//! §4.6–§4.8): channels, the task-level mutex/condvar pair, and scoped
//! deadlines.

pub mod channel;
pub mod deadline;
pub mod qutex;
pub mod rendez;
