//! Domain model: aggregates, value objects, and the status state machine.

pub mod aggregates;
pub mod transitions;
pub mod value_objects;
