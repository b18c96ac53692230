mod common;

use candle_core::Tensor;
use common::TinyGenerator;
use model::Generator;
use training::ParameterAverager;

fn l2_distance(lhs: &TinyGenerator, rhs: &TinyGenerator) -> f64 {
    lhs.vars()
        .iter()
        .zip(rhs.vars().iter())
        .map(|((lname, lvar), (rname, rvar))| {
            assert_eq!(lname, rname);
            (lvar.as_tensor() - rvar.as_tensor())
                .unwrap()
                .sqr()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_vec0::<f32>()
                .unwrap() as f64
        })
        .sum::<f64>()
        .sqrt()
}

fn perturb(generator: &TinyGenerator, offset: f64) {
    for (_, var) in generator.vars() {
        let shifted = var.as_tensor().affine(1.0, offset).unwrap();
        var.set(&shifted).unwrap();
    }
}

#[test]
fn construction_copies_source_exactly() {
    let source = TinyGenerator::new(4, 1);
    let averager = ParameterAverager::new(TinyGenerator::new(4, 1), &source).expect("averager");

    for ((_, shadow), (_, original)) in averager.shadow().vars().iter().zip(source.vars().iter()) {
        let shadow: Vec<f32> = shadow.as_tensor().flatten_all().unwrap().to_vec1().unwrap();
        let original: Vec<f32> = original.as_tensor().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(shadow, original);
    }
}

#[test]
fn zero_decay_tracks_latest_source() {
    let source = TinyGenerator::new(4, 1);
    let averager = ParameterAverager::new(TinyGenerator::new(4, 1), &source).expect("averager");

    perturb(&source, 0.75);
    averager.accumulate(&source, 0.0).expect("accumulate");
    assert_eq!(l2_distance(averager.shadow(), &source), 0.0);
}

#[test]
fn repeated_updates_converge_monotonically() {
    let source = TinyGenerator::new(4, 1);
    let averager = ParameterAverager::new(TinyGenerator::new(4, 1), &source).expect("averager");
    perturb(&source, 1.0);

    let mut previous = l2_distance(averager.shadow(), &source);
    assert!(previous > 0.0);
    for _ in 0..20 {
        averager.accumulate(&source, 0.9).expect("accumulate");
        let distance = l2_distance(averager.shadow(), &source);
        assert!(distance < previous);
        previous = distance;
    }
}

#[test]
fn averaging_never_creates_gradient_links() {
    let source = TinyGenerator::new(4, 0);
    let averager = ParameterAverager::new(TinyGenerator::new(4, 0), &source).expect("averager");
    averager.accumulate(&source, 0.5).expect("accumulate");

    let code = Tensor::ones((2, 4), candle_core::DType::F32, &candle_core::Device::Cpu).unwrap();
    let output = averager
        .shadow()
        .forward(&model::LatentInput::Single(code), 0, 1.0)
        .unwrap();
    let grads = output.sum_all().unwrap().backward().unwrap();
    for (_, var) in source.vars() {
        assert!(grads.get(var.as_tensor()).is_none());
    }
}

#[test]
fn mismatched_architectures_are_rejected() {
    let source = TinyGenerator::new(4, 1);
    assert!(ParameterAverager::new(TinyGenerator::new(4, 0), &source).is_err());
}

#[test]
fn decay_outside_unit_interval_is_rejected() {
    let source = TinyGenerator::new(4, 0);
    let averager = ParameterAverager::new(TinyGenerator::new(4, 0), &source).expect("averager");
    assert!(averager.accumulate(&source, 1.5).is_err());
}
