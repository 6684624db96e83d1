// cexp — Composite expansion engine
//
// Library root. Expands composite components of a document into
// replacement subtrees and keeps them current with minimal patches.

pub mod array;
pub mod composite;
pub mod config;
pub mod diag;
pub mod diff;
pub mod document;
pub mod dot;
pub mod error;
pub mod id;
pub mod patch;
pub mod registry;
pub mod rng;
pub mod serialized;
pub mod shadow;
pub mod state;
pub mod value;
pub mod verify;

pub use config::EngineOptions;
pub use document::{Document, ExpansionReport};
pub use error::{ExpandError, Result};
