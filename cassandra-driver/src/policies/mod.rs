//! Pluggable decisions the driver delegates to the user.

pub mod reconnection;
pub mod retry;
