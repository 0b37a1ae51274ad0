//! Order-agnostic unmasking: reveal one random position per step and fill it
//! with a symbol sampled from the model's distribution at that position.

use std::fmt;
use std::str::FromStr;

use ndarray::Array1;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{Error, Result};
use crate::model::Scorer;
use crate::sampling::{normalize, sample};
use crate::tokenizer::Tokenizer;

/// How the sequence is filled before the first step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InitPolicy {
    /// Every position holds the mask id.
    #[default]
    Mask,
    /// Every position holds a uniformly drawn generation symbol.
    Random,
}

impl FromStr for InitPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mask" => Ok(InitPolicy::Mask),
            "random" => Ok(InitPolicy::Random),
            other => Err(Error::InvalidPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for InitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitPolicy::Mask => f.write_str("mask"),
            InitPolicy::Random => f.write_str("random"),
        }
    }
}

/// Progress of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Initialized,
    /// Next step to execute.
    Running(usize),
    Complete,
    /// A step failed; the run cannot continue.
    Failed,
}

/// What happened during one step.
#[derive(Clone, Debug)]
pub struct StepRecord {
    pub step: usize,
    pub position: usize,
    pub id: usize,
    /// Probability the model assigned to `id` before restriction to the
    /// generation alphabet.
    pub probability: f32,
    /// Normalized distribution over all classes at `position`.
    pub distribution: Array1<f32>,
}

/// Result of a finished run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Generated {
    pub ids: Vec<usize>,
    pub symbols: String,
    /// Positions in the order they were revealed.
    pub order: Vec<usize>,
}

/// Sequence state owned by a single generation run.
pub struct Generation<'t> {
    tokenizer: &'t Tokenizer,
    ids: Vec<usize>,
    visible: Vec<bool>,
    order: Vec<usize>,
    stage: Stage,
}

impl<'t> Generation<'t> {
    /// Build the initial sequence of `length` positions, all hidden.
    pub fn new<R: Rng + ?Sized>(
        length: usize,
        policy: InitPolicy,
        tokenizer: &'t Tokenizer,
        rng: &mut R,
    ) -> Result<Self> {
        if length == 0 {
            return Err(Error::EmptySequence);
        }
        let ids = match policy {
            InitPolicy::Mask => vec![tokenizer.mask_id(); length],
            InitPolicy::Random => {
                let pool = tokenizer.generation_ids();
                (0..length).map(|_| pool[rng.gen_range(0..pool.len())]).collect()
            }
        };
        Ok(Self {
            tokenizer,
            ids,
            visible: vec![false; length],
            order: Vec::new(),
            stage: Stage::Initialized,
        })
    }

    /// Draw a uniformly random reveal order and start the run.
    pub fn begin<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        self.begin_with_order(order)
    }

    /// Start the run with a caller-supplied reveal order.
    pub fn begin_with_order(&mut self, order: Vec<usize>) -> Result<()> {
        if self.stage != Stage::Initialized {
            return Err(Error::InvalidState("run already started"));
        }
        let len = self.len();
        let mut seen = vec![false; len];
        if order.len() != len {
            return Err(Error::InvalidRevealOrder(len));
        }
        for &position in &order {
            match seen.get_mut(position) {
                Some(flag) if !*flag => *flag = true,
                _ => return Err(Error::InvalidRevealOrder(len)),
            }
        }
        self.order = order;
        self.stage = Stage::Running(0);
        Ok(())
    }

    /// Reveal the next position, query the model and write the sampled id.
    ///
    /// A model error moves the run to [`Stage::Failed`].
    pub fn step<M, R>(&mut self, model: &M, rng: &mut R) -> Result<StepRecord>
    where
        M: Scorer + ?Sized,
        R: Rng + ?Sized,
    {
        let step = match self.stage {
            Stage::Running(step) => step,
            Stage::Initialized => return Err(Error::InvalidState("run not started")),
            Stage::Complete => return Err(Error::InvalidState("run already complete")),
            Stage::Failed => return Err(Error::InvalidState("run failed")),
        };
        let record = self.advance(step, model, rng);
        if record.is_err() {
            self.stage = Stage::Failed;
        }
        record
    }

    fn advance<M, R>(&mut self, step: usize, model: &M, rng: &mut R) -> Result<StepRecord>
    where
        M: Scorer + ?Sized,
        R: Rng + ?Sized,
    {
        let position = self.order[step];

        // the target is marked visible before the query
        self.visible[position] = true;
        let scores = model.score(&self.ids, &self.visible);

        let expected = (self.len(), self.tokenizer.vocab_size());
        if scores.dim() != expected {
            return Err(Error::ModelContractViolation(format!(
                "scores have shape {:?}, expected {:?}",
                scores.dim(),
                expected
            )));
        }
        if let Some(((row, class), value)) = scores.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(Error::ModelContractViolation(format!(
                "non-finite score {value} at position {row}, class {class}"
            )));
        }
        let distribution = normalize(scores.row(position))?;
        let id = sample(distribution.view(), self.tokenizer.generation_ids(), rng)?;
        self.ids[position] = id;

        self.stage = if step + 1 == self.len() {
            Stage::Complete
        } else {
            Stage::Running(step + 1)
        };

        let record = StepRecord {
            step,
            position,
            id,
            probability: distribution[id],
            distribution,
        };
        log::debug!(
            "step {} position {} -> {:?} (p={:.4})",
            record.step,
            record.position,
            self.tokenizer.untokenize(&[id]).unwrap_or_default(),
            record.probability
        );
        Ok(record)
    }

    /// Consume a complete run.
    pub fn finish(self) -> Result<Generated> {
        if self.stage != Stage::Complete {
            return Err(Error::InvalidState("run not complete"));
        }
        let symbols = self.tokenizer.untokenize(&self.ids)?;
        Ok(Generated {
            ids: self.ids,
            symbols,
            order: self.order,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn ids(&self) -> &[usize] {
        &self.ids
    }

    pub fn visible(&self) -> &[bool] {
        &self.visible
    }

    /// Reveal order; empty until the run has begun.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Current sequence as symbols.
    pub fn symbols(&self) -> Result<String> {
        self.tokenizer.untokenize(&self.ids)
    }
}

/// Run a complete unmasking pass of `length` positions.
pub fn generate<M, R>(
    length: usize,
    policy: InitPolicy,
    tokenizer: &Tokenizer,
    model: &M,
    rng: &mut R,
) -> Result<Generated>
where
    M: Scorer + ?Sized,
    R: Rng + ?Sized,
{
    let mut run = Generation::new(length, policy, tokenizer, rng)?;
    log::info!("input seq {}", run.symbols()?);

    run.begin(rng)?;
    while run.stage() != Stage::Complete {
        run.step(model, rng)?;
    }

    let generated = run.finish()?;
    log::info!("output seq {}", generated.symbols);
    Ok(generated)
}
