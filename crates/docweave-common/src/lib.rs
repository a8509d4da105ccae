//! Common utilities for docweave
//!
//! This crate holds the error taxonomy shared by every docweave crate.

pub mod error;

pub use error::{DocweaveError, Result, ValidationError, DUPLICATE_KEY_CODE};
