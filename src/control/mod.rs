//! Closed-loop temperature control.

pub mod pid;

pub use pid::PidController;
