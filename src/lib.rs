//! PriceWatch Backend Library
//!
//! Exposes the tracker's modules for the server binary and the tests.

pub mod adapters;
pub mod api;
pub mod checker;
pub mod extract;
pub mod models;
pub mod notifier;
pub mod storage;
pub mod sweep;
pub mod urlnorm;
