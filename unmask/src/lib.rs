//! Order-agnostic protein sequence generation.
//!
//! A sequence starts fully hidden; positions are revealed one at a time in a
//! random order, each filled with a symbol sampled from a scoring model that
//! conditions on everything revealed so far.

pub mod error;
pub mod generate;
pub mod model;
pub mod sampling;
pub mod tokenizer;

pub use error::{Error, Result};
pub use generate::{generate, Generated, Generation, InitPolicy, Stage, StepRecord};
pub use model::{ByteNetArgs, ByteNetLM, Scorer};
pub use tokenizer::Tokenizer;
