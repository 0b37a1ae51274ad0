//! Symbol ⇄ id mapping for protein sequences.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Canonical amino acids.
pub const CANONICAL_AAS: &str = "ACDEFGHIKLMNPQRSTVWY";
/// Ambiguous residue codes.
pub const AMBIGUOUS_AAS: &str = "BZX";
/// Rare residues (selenocysteine, pyrrolysine and the J ambiguity code).
pub const OTHER_AAS: &str = "JOU";
/// Residue letters in the order used by the BLOSUM62 matrix.
pub const BLOSUM62_AAS: &str = "ARNDCQEGHILKMFPSTWYVBZX";

pub const GAP: char = '-';
pub const MASK: char = '#';
pub const PAD: char = '!';

/// Full class space shared with the model: residues, gap, mask, pad.
pub const PROTEIN_ALPHABET: &str = "ACDEFGHIKLMNPQRSTVWYBZXJOU-#!";

/// Bidirectional mapping between alphabet symbols and class ids.
///
/// Ids are positions in the alphabet string. The generation alphabet is the
/// subset of ids a sampler is allowed to write into a sequence.
#[derive(Clone, Debug)]
pub struct Tokenizer {
    alphabet: Vec<char>,
    index: HashMap<char, usize>,
    generation: Vec<usize>,
    pad_id: usize,
    mask_id: usize,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::protein()
    }
}

impl Tokenizer {
    /// Build a tokenizer over `alphabet`, sampling restricted to `generation`.
    pub fn new(alphabet: &str, generation: &str, pad: char, mask: char) -> Result<Self> {
        let alphabet: Vec<char> = alphabet.chars().collect();
        let mut index = HashMap::with_capacity(alphabet.len());
        for (id, &symbol) in alphabet.iter().enumerate() {
            if index.insert(symbol, id).is_some() {
                return Err(Error::InvalidAlphabet(format!("duplicate symbol {symbol:?}")));
            }
        }

        let pad_id = *index
            .get(&pad)
            .ok_or_else(|| Error::InvalidAlphabet(format!("pad symbol {pad:?} missing")))?;
        let mask_id = *index
            .get(&mask)
            .ok_or_else(|| Error::InvalidAlphabet(format!("mask symbol {mask:?} missing")))?;
        if pad_id == mask_id {
            return Err(Error::InvalidAlphabet("pad and mask must differ".into()));
        }

        let mut generation_ids = Vec::new();
        for symbol in generation.chars() {
            let id = *index.get(&symbol).ok_or_else(|| {
                Error::InvalidAlphabet(format!("generation symbol {symbol:?} not in alphabet"))
            })?;
            if id == pad_id || id == mask_id {
                return Err(Error::InvalidAlphabet(format!(
                    "generation alphabet may not contain special symbol {symbol:?}"
                )));
            }
            if !generation_ids.contains(&id) {
                generation_ids.push(id);
            }
        }
        if generation_ids.is_empty() {
            return Err(Error::InvalidAlphabet("generation alphabet is empty".into()));
        }
        generation_ids.sort_unstable();

        Ok(Self {
            alphabet,
            index,
            generation: generation_ids,
            pad_id,
            mask_id,
        })
    }

    /// The protein tokenizer: 29 classes, sampling over the 26 residue letters.
    ///
    /// The gap symbol `-` is a class the model scores but is never sampled.
    pub fn protein() -> Self {
        let residues = format!("{CANONICAL_AAS}{AMBIGUOUS_AAS}{OTHER_AAS}");
        Self::new(PROTEIN_ALPHABET, &residues, PAD, MASK).expect("protein alphabet is consistent")
    }

    /// Map every symbol of `symbols` to its id.
    pub fn tokenize(&self, symbols: &str) -> Result<Vec<usize>> {
        symbols
            .chars()
            .map(|c| self.index.get(&c).copied().ok_or(Error::UnknownSymbol(c)))
            .collect()
    }

    /// Tokenize several sequences, failing on the first unknown symbol.
    pub fn tokenize_batch<S: AsRef<str>>(&self, batch: &[S]) -> Result<Vec<Vec<usize>>> {
        batch.iter().map(|s| self.tokenize(s.as_ref())).collect()
    }

    /// Map ids back to their symbols.
    pub fn untokenize(&self, ids: &[usize]) -> Result<String> {
        ids.iter()
            .map(|&id| self.alphabet.get(id).copied().ok_or(Error::UnknownId(id)))
            .collect()
    }

    pub fn pad_id(&self) -> usize {
        self.pad_id
    }

    pub fn mask_id(&self) -> usize {
        self.mask_id
    }

    /// Ids eligible to be written by the sampler, in ascending order.
    ///
    /// Never contains PAD or MASK. For the protein tokenizer the gap `-` is
    /// left out as well, so generated sequences are ungapped.
    pub fn generation_ids(&self) -> &[usize] {
        &self.generation
    }

    pub fn is_generation(&self, id: usize) -> bool {
        self.generation.binary_search(&id).is_ok()
    }

    /// Number of classes, including specials.
    pub fn vocab_size(&self) -> usize {
        self.alphabet.len()
    }

    pub fn contains(&self, symbol: char) -> bool {
        self.index.contains_key(&symbol)
    }
}
