use std::cell::{Cell, RefCell};

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use unmask::{generate, ByteNetArgs, ByteNetLM, Error, Generation, InitPolicy, Scorer, Stage, Tokenizer};

/// Puts all probability on one class at every position.
struct PointMass {
    target: usize,
    classes: usize,
}

impl Scorer for PointMass {
    fn score(&self, ids: &[usize], _visible: &[bool]) -> Array2<f32> {
        let mut scores = Array2::from_elem((ids.len(), self.classes), -1.0e4);
        scores.column_mut(self.target).fill(0.0);
        scores
    }
}

/// Puts all probability on `script[k]` during the k-th call.
struct Scripted {
    script: Vec<usize>,
    classes: usize,
    calls: Cell<usize>,
}

impl Scorer for Scripted {
    fn score(&self, ids: &[usize], _visible: &[bool]) -> Array2<f32> {
        let call = self.calls.get();
        self.calls.set(call + 1);
        let mut scores = Array2::from_elem((ids.len(), self.classes), -1.0e4);
        scores.column_mut(self.script[call]).fill(0.0);
        scores
    }
}

/// Uniform scores; records every input it is called with.
struct Recorder {
    classes: usize,
    calls: RefCell<Vec<(Vec<usize>, Vec<bool>)>>,
}

impl Recorder {
    fn new(classes: usize) -> Self {
        Self {
            classes,
            calls: RefCell::new(Vec::new()),
        }
    }
}

impl Scorer for Recorder {
    fn score(&self, ids: &[usize], visible: &[bool]) -> Array2<f32> {
        self.calls.borrow_mut().push((ids.to_vec(), visible.to_vec()));
        Array2::zeros((ids.len(), self.classes))
    }
}

/// Returns scores of the wrong width; counts calls.
struct Broken {
    calls: Cell<usize>,
}

impl Scorer for Broken {
    fn score(&self, ids: &[usize], _visible: &[bool]) -> Array2<f32> {
        self.calls.set(self.calls.get() + 1);
        Array2::zeros((ids.len(), 1))
    }
}

struct Fixed(Array2<f32>);

impl Scorer for Fixed {
    fn score(&self, _ids: &[usize], _visible: &[bool]) -> Array2<f32> {
        self.0.clone()
    }
}

fn id_of(tokenizer: &Tokenizer, symbol: &str) -> usize {
    tokenizer.tokenize(symbol).unwrap()[0]
}

#[test]
fn point_mass_fills_every_position() {
    let tokenizer = Tokenizer::protein();
    let model = PointMass {
        target: id_of(&tokenizer, "A"),
        classes: tokenizer.vocab_size(),
    };
    for seed in 0..10 {
        let mut rng = StdRng::seed_from_u64(seed);
        let out = generate(4, InitPolicy::Mask, &tokenizer, &model, &mut rng).unwrap();
        assert_eq!(out.symbols, "AAAA");
        assert_eq!(out.ids, vec![id_of(&tokenizer, "A"); 4]);
    }
}

#[test]
fn fixed_order_assigns_step_symbols_by_position() {
    let tokenizer = Tokenizer::protein();
    let model = Scripted {
        script: tokenizer.tokenize("CDE").unwrap(),
        classes: tokenizer.vocab_size(),
        calls: Cell::new(0),
    };
    let mut rng = StdRng::seed_from_u64(3);
    let mut run = Generation::new(3, InitPolicy::Mask, &tokenizer, &mut rng).unwrap();
    run.begin_with_order(vec![2, 0, 1]).unwrap();

    let positions: Vec<usize> = (0..3)
        .map(|_| run.step(&model, &mut rng).unwrap().position)
        .collect();
    assert_eq!(positions, vec![2, 0, 1]);

    let out = run.finish().unwrap();
    assert_eq!(out.symbols, "DEC");
    assert_eq!(out.order, vec![2, 0, 1]);
}

#[test]
fn reveal_order_is_a_permutation() {
    let tokenizer = Tokenizer::protein();
    let model = Recorder::new(tokenizer.vocab_size());
    for seed in 0..5 {
        let mut rng = StdRng::seed_from_u64(seed);
        let out = generate(50, InitPolicy::Mask, &tokenizer, &model, &mut rng).unwrap();
        let mut order = out.order.clone();
        order.sort_unstable();
        assert_eq!(order, (0..50).collect::<Vec<_>>());
    }
}

#[test]
fn visibility_grows_by_one_and_includes_target() {
    let tokenizer = Tokenizer::protein();
    let model = Recorder::new(tokenizer.vocab_size());
    let mut rng = StdRng::seed_from_u64(11);
    let out = generate(20, InitPolicy::Mask, &tokenizer, &model, &mut rng).unwrap();

    let calls = model.calls.borrow();
    assert_eq!(calls.len(), 20);
    let mut previous = vec![false; 20];
    for (step, (_, visible)) in calls.iter().enumerate() {
        assert_eq!(visible.iter().filter(|&&v| v).count(), step + 1);
        assert!(visible[out.order[step]]);
        for (before, now) in previous.iter().zip(visible) {
            assert!(!before || *now);
        }
        previous = visible.clone();
    }
    assert!(previous.iter().all(|&v| v));
}

#[test]
fn target_still_holds_placeholder_when_queried() {
    let tokenizer = Tokenizer::protein();
    let model = Recorder::new(tokenizer.vocab_size());
    let mut rng = StdRng::seed_from_u64(5);
    let out = generate(12, InitPolicy::Mask, &tokenizer, &model, &mut rng).unwrap();

    for (step, (ids, _)) in model.calls.borrow().iter().enumerate() {
        assert_eq!(ids[out.order[step]], tokenizer.mask_id());
    }
}

#[test]
fn written_ids_stay_in_generation_alphabet() {
    let tokenizer = Tokenizer::protein();
    let model = Recorder::new(tokenizer.vocab_size());
    let mut rng = StdRng::seed_from_u64(21);
    let out = generate(64, InitPolicy::Mask, &tokenizer, &model, &mut rng).unwrap();

    for (step, (ids, _)) in model.calls.borrow().iter().enumerate() {
        let written = &out.order[..step];
        for (position, &id) in ids.iter().enumerate() {
            if written.contains(&position) {
                assert!(tokenizer.is_generation(id));
            } else {
                assert_eq!(id, tokenizer.mask_id());
            }
        }
    }
    assert!(out.ids.iter().all(|&id| tokenizer.is_generation(id)));
    assert!(!out.symbols.contains(['#', '!', '-']));
}

#[test]
fn step_distributions_are_valid() {
    let tokenizer = Tokenizer::protein();
    let mut rng = StdRng::seed_from_u64(8);
    let args = ByteNetArgs {
        n_tokens: tokenizer.vocab_size(),
        padding_idx: Some(tokenizer.pad_id()),
        ..ByteNetArgs::default()
    };
    let model = ByteNetLM::new(args, &mut rng).unwrap();

    let mut run = Generation::new(16, InitPolicy::Mask, &tokenizer, &mut rng).unwrap();
    run.begin(&mut rng).unwrap();
    while run.stage() != Stage::Complete {
        let record = run.step(&model, &mut rng).unwrap();
        assert_eq!(record.distribution.len(), tokenizer.vocab_size());
        assert!(record.distribution.iter().all(|&p| p >= 0.0));
        assert!((record.distribution.sum() - 1.0).abs() < 1e-4);
        assert_eq!(record.probability, record.distribution[record.id]);
    }
    let out = run.finish().unwrap();
    assert_eq!(out.ids.len(), 16);
    assert!(out.ids.iter().all(|&id| tokenizer.is_generation(id)));
}

#[test]
fn same_seed_same_sequence() {
    let tokenizer = Tokenizer::protein();
    let model = Recorder::new(tokenizer.vocab_size());
    for policy in [InitPolicy::Mask, InitPolicy::Random] {
        let a = generate(40, policy, &tokenizer, &model, &mut StdRng::seed_from_u64(99)).unwrap();
        let b = generate(40, policy, &tokenizer, &model, &mut StdRng::seed_from_u64(99)).unwrap();
        assert_eq!(a, b);
    }
}

#[test]
fn random_init_uses_generation_alphabet_and_stays_hidden() {
    let tokenizer = Tokenizer::protein();
    let mut rng = StdRng::seed_from_u64(2);
    let run = Generation::new(200, InitPolicy::Random, &tokenizer, &mut rng).unwrap();
    assert_eq!(run.stage(), Stage::Initialized);
    assert!(run.ids().iter().all(|&id| tokenizer.is_generation(id)));
    assert!(run.visible().iter().all(|&v| !v));
    assert!(run.order().is_empty());
}

#[test]
fn mask_init_is_all_mask() {
    let tokenizer = Tokenizer::protein();
    let mut rng = StdRng::seed_from_u64(2);
    let run = Generation::new(7, InitPolicy::Mask, &tokenizer, &mut rng).unwrap();
    assert_eq!(run.symbols().unwrap(), "#######");
    assert!(run.visible().iter().all(|&v| !v));
}

#[test]
fn policy_names() {
    assert_eq!("mask".parse::<InitPolicy>().unwrap(), InitPolicy::Mask);
    assert_eq!("random".parse::<InitPolicy>().unwrap(), InitPolicy::Random);
    assert_eq!(
        "zeros".parse::<InitPolicy>().unwrap_err(),
        Error::InvalidPolicy("zeros".into())
    );
    assert_eq!(InitPolicy::Random.to_string(), "random");
}

#[test]
fn wrong_score_shape_is_a_contract_violation() {
    let tokenizer = Tokenizer::protein();
    let model = Fixed(Array2::zeros((3, 5)));
    let mut rng = StdRng::seed_from_u64(0);
    let err = generate(3, InitPolicy::Mask, &tokenizer, &model, &mut rng).unwrap_err();
    assert!(matches!(err, Error::ModelContractViolation(_)));
}

#[test]
fn non_finite_scores_are_a_contract_violation() {
    let tokenizer = Tokenizer::protein();
    let mut scores = Array2::zeros((2, tokenizer.vocab_size()));
    scores[[0, 3]] = f32::NAN;
    scores[[1, 3]] = f32::NAN;
    let model = Fixed(scores);
    let mut rng = StdRng::seed_from_u64(0);
    let err = generate(2, InitPolicy::Mask, &tokenizer, &model, &mut rng).unwrap_err();
    assert!(matches!(err, Error::ModelContractViolation(_)));
}

#[test]
fn non_finite_score_outside_target_row_is_a_contract_violation() {
    let tokenizer = Tokenizer::protein();
    let mut scores = Array2::zeros((2, tokenizer.vocab_size()));
    scores[[1, 3]] = f32::NAN;
    let model = Fixed(scores);
    let mut rng = StdRng::seed_from_u64(0);
    let mut run = Generation::new(2, InitPolicy::Mask, &tokenizer, &mut rng).unwrap();
    run.begin_with_order(vec![0, 1]).unwrap();
    let err = run.step(&model, &mut rng).unwrap_err();
    assert!(matches!(err, Error::ModelContractViolation(_)));
    assert_eq!(run.ids(), &[tokenizer.mask_id(); 2]);
}

#[test]
fn failed_step_ends_the_run() {
    let tokenizer = Tokenizer::protein();
    let model = Broken { calls: Cell::new(0) };
    let mut rng = StdRng::seed_from_u64(0);
    let mut run = Generation::new(3, InitPolicy::Mask, &tokenizer, &mut rng).unwrap();
    run.begin(&mut rng).unwrap();

    let err = run.step(&model, &mut rng).unwrap_err();
    assert!(matches!(err, Error::ModelContractViolation(_)));
    assert_eq!(run.stage(), Stage::Failed);

    assert_eq!(
        run.step(&model, &mut rng).unwrap_err(),
        Error::InvalidState("run failed")
    );
    assert_eq!(model.calls.get(), 1);
    assert!(matches!(run.finish(), Err(Error::InvalidState(_))));
}

#[test]
fn mass_only_on_specials_is_a_contract_violation() {
    let tokenizer = Tokenizer::protein();
    let model = PointMass {
        target: tokenizer.pad_id(),
        classes: tokenizer.vocab_size(),
    };
    let mut rng = StdRng::seed_from_u64(0);
    let err = generate(2, InitPolicy::Mask, &tokenizer, &model, &mut rng).unwrap_err();
    assert!(matches!(err, Error::ModelContractViolation(_)));
}

#[test]
fn zero_length_is_rejected() {
    let tokenizer = Tokenizer::protein();
    let model = Recorder::new(tokenizer.vocab_size());
    let mut rng = StdRng::seed_from_u64(0);
    let err = generate(0, InitPolicy::Mask, &tokenizer, &model, &mut rng).unwrap_err();
    assert_eq!(err, Error::EmptySequence);
    assert!(model.calls.borrow().is_empty());
}

#[test]
fn transitions_only_move_forward() {
    let tokenizer = Tokenizer::protein();
    let model = Recorder::new(tokenizer.vocab_size());
    let mut rng = StdRng::seed_from_u64(4);
    let mut run = Generation::new(2, InitPolicy::Mask, &tokenizer, &mut rng).unwrap();

    assert!(matches!(run.step(&model, &mut rng), Err(Error::InvalidState(_))));
    run.begin(&mut rng).unwrap();
    assert_eq!(run.stage(), Stage::Running(0));
    assert!(matches!(run.begin(&mut rng), Err(Error::InvalidState(_))));

    run.step(&model, &mut rng).unwrap();
    assert_eq!(run.stage(), Stage::Running(1));
    run.step(&model, &mut rng).unwrap();
    assert_eq!(run.stage(), Stage::Complete);
    assert!(matches!(run.step(&model, &mut rng), Err(Error::InvalidState(_))));
    assert_eq!(model.calls.borrow().len(), 2);
}

#[test]
fn finish_requires_complete_run() {
    let tokenizer = Tokenizer::protein();
    let mut rng = StdRng::seed_from_u64(4);
    let mut run = Generation::new(2, InitPolicy::Mask, &tokenizer, &mut rng).unwrap();
    run.begin(&mut rng).unwrap();
    assert!(matches!(run.finish(), Err(Error::InvalidState(_))));
}

#[test]
fn reveal_order_must_be_a_permutation() {
    let tokenizer = Tokenizer::protein();
    let mut rng = StdRng::seed_from_u64(4);
    for bad in [vec![0, 0, 1], vec![0, 1], vec![0, 1, 3], vec![2, 1, 0, 3]] {
        let mut run = Generation::new(3, InitPolicy::Mask, &tokenizer, &mut rng).unwrap();
        assert_eq!(run.begin_with_order(bad), Err(Error::InvalidRevealOrder(3)));
        assert_eq!(run.stage(), Stage::Initialized);
    }
}
