//! # Common Components
//!
//! Shared utilities and data structures used by both broker and tank components.
//!
//! ## Modules
//!
//! - [`messages`]: Protocol message definitions for broker and ring traffic
//! - [`fish`]: The movable object handed around the ring
//! - [`config`]: Configuration parsing utilities
//! - [`logging`]: Logger initialisation shared by the binaries

pub mod config;
pub mod fish;
pub mod logging;
pub mod messages;
