//! box CLI - build container images from plan files.

pub mod commands;
pub mod session;
pub mod signals;
