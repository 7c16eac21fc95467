//! Bounded in-process queues.

pub mod work;
