//! Model hyper-parameters read from a training config file.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};
use unmask::model::Activation;
use unmask::{ByteNetArgs, Tokenizer};

use crate::error::Result;

/// Architecture keys of a training config. Other keys are ignored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub d_embed: usize,
    pub d_model: usize,
    pub n_layers: usize,
    pub kernel_size: usize,
    pub r: usize,
    /// Low-rank factorization of block weights; only `None` is supported.
    #[serde(default)]
    pub rank: Option<usize>,
    #[serde(default = "default_slim")]
    pub slim: bool,
    #[serde(default)]
    pub activation: Activation,
}

fn default_slim() -> bool {
    true
}

impl RunConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Model arguments for `tokenizer`'s class space.
    pub fn model_args(&self, tokenizer: &Tokenizer, tie_weights: bool, final_norm: bool) -> Result<ByteNetArgs> {
        if let Some(rank) = self.rank {
            return Err(unmask::Error::InvalidConfig(format!(
                "low-rank block weights (rank {rank}) are not supported"
            ))
            .into());
        }
        let args = ByteNetArgs {
            n_tokens: tokenizer.vocab_size(),
            d_embed: self.d_embed,
            d_model: self.d_model,
            n_layers: self.n_layers,
            kernel_size: self.kernel_size,
            r: self.r,
            padding_idx: Some(tokenizer.pad_id()),
            slim: self.slim,
            activation: self.activation,
            final_norm,
            tie_weights,
        };
        args.validate()?;
        Ok(args)
    }
}
