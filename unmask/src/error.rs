//! Error types for tokenization, model scoring and generation.

use thiserror::Error;

/// Errors raised by the tokenizer, the scoring model and the generation loop.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    /// Symbol is not part of the tokenizer alphabet.
    #[error("unknown symbol {0:?}")]
    UnknownSymbol(char),

    /// Id lies outside the declared id range.
    #[error("unknown token id {0}")]
    UnknownId(usize),

    /// Alphabet definition is inconsistent.
    #[error("invalid alphabet: {0}")]
    InvalidAlphabet(String),

    /// Initialization policy name is not recognized.
    #[error("invalid initialization policy {0:?}, expected \"mask\" or \"random\"")]
    InvalidPolicy(String),

    /// Generation was requested for a zero-length sequence.
    #[error("sequence length must be at least 1")]
    EmptySequence,

    /// Supplied reveal order is not a permutation of the positions.
    #[error("reveal order is not a permutation of 0..{0}")]
    InvalidRevealOrder(usize),

    /// Operation is not allowed in the current state of the run.
    #[error("invalid generation state: {0}")]
    InvalidState(&'static str),

    /// Model returned scores that break the scoring contract.
    #[error("model contract violation: {0}")]
    ModelContractViolation(String),

    /// Model hyper-parameters are inconsistent.
    #[error("invalid model config: {0}")]
    InvalidConfig(String),

    /// Named parameter was not found in the supplied tensors.
    #[error("missing parameter {0}")]
    MissingParameter(String),

    /// Supplied tensors contain a name the model has no parameter for.
    #[error("unexpected parameter {0}")]
    UnexpectedParameter(String),

    /// Named parameter has a different shape than the model expects.
    #[error("parameter {name} has shape {found:?}, expected {expected:?}")]
    ParameterShape {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
