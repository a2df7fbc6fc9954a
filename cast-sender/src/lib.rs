//! # cast-sender
//!
//! Headless sender that finds a receiver on the local network, connects
//! to it and streams the primary display as H.264.
//!
//! ## Modes
//!
//! - **Discover**: list the receivers that answer within a time window.
//! - **Cast**: stream to a given address, or to the first receiver found.

pub mod config;
pub mod logging;
pub mod service;
