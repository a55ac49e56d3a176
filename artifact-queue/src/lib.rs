//! artifact-queue library crate.
//!
//! A single-slot pipeline queue that runs upscale, submit and reprice
//! scripts over uploaded images, with its backlog persisted across restarts.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod extract;
pub mod logging;
pub mod pipeline;
pub mod stores;

pub use error::{Error, Result};
