//! Core descriptor logic: types, parsing, catalogs, install, execution, receipts.

pub mod catalog;
pub mod error;
pub mod executor;
pub mod installer;
pub mod parser;
pub mod state;
pub mod types;
