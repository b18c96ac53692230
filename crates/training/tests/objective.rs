mod common;

use candle_core::{Device, Tensor};
use common::{random_images, scalar, Negated, TinyCritic};
use model::{Discriminator, ModelConfig, ProgressiveDiscriminator};
use rand::{rngs::StdRng, SeedableRng};
use training::{
    enable_higher_order_gradients, AdversarialObjective, LossFamily, LossKind, WganGp, R1,
};

fn weight_norm_sq(critic: &TinyCritic, step: usize) -> f64 {
    scalar(&critic.head_weight(step).sqr().unwrap().sum_all().unwrap())
}

#[test]
fn wgan_penalty_matches_linear_critic_gradient() {
    enable_higher_order_gradients();
    let critic = TinyCritic::new(1);
    let real = random_images(4, 8, 0.0);
    let fake = random_images(4, 8, 2.0);
    let mut rng = StdRng::seed_from_u64(3);

    let terms = WganGp
        .discriminator_terms(&critic, &real, &fake, 1, 1.0, &mut rng)
        .expect("terms");

    let norm = weight_norm_sq(&critic, 1).sqrt();
    let expected = 10.0 * (norm - 1.0).powi(2);
    let actual = terms.penalty_value().expect("penalty");
    assert!((actual - expected).abs() < 1e-3 * expected.max(1.0));
}

#[test]
fn wgan_penalty_is_invariant_to_critic_sign_flip() {
    enable_higher_order_gradients();
    let critic = TinyCritic::new(0);
    let flipped = Negated(&critic);
    let real = random_images(3, 4, 0.5);
    let fake = random_images(3, 4, 1.5);

    let terms = WganGp
        .discriminator_terms(&critic, &real, &fake, 0, 1.0, &mut StdRng::seed_from_u64(9))
        .expect("terms");
    let flipped_terms = WganGp
        .discriminator_terms(&flipped, &real, &fake, 0, 1.0, &mut StdRng::seed_from_u64(9))
        .expect("flipped terms");

    let penalty = terms.penalty_value().unwrap();
    let flipped_penalty = flipped_terms.penalty_value().unwrap();
    assert!((penalty - flipped_penalty).abs() < 1e-4 * penalty.max(1.0));

    let fake_term = scalar(&terms.fake);
    let flipped_fake_term = scalar(&flipped_terms.fake);
    assert!((fake_term + flipped_fake_term).abs() < 1e-5);
}

#[test]
fn gradient_penalty_reaches_critic_parameters() {
    enable_higher_order_gradients();
    let critic = TinyCritic::new(0);
    let real = random_images(2, 4, 0.1);
    let fake = random_images(2, 4, 0.9);

    for objective in [
        AdversarialObjective::from(LossKind::WganGp),
        AdversarialObjective::from(LossKind::R1),
    ] {
        let terms = objective
            .discriminator_terms(&critic, &real, &fake, 0, 1.0, &mut StdRng::seed_from_u64(1))
            .expect("terms");
        let grads = terms.penalty.backward().expect("penalty backward");
        let weight = critic.head_weight(0);
        let grad = grads.get(&weight).expect("critic weight gradient");
        let magnitude = scalar(&grad.abs().unwrap().sum_all().unwrap());
        assert!(magnitude > 0.0, "{:?} penalty left the critic untouched", objective.kind());
    }
}

#[test]
fn r1_penalty_depends_on_real_samples_only() {
    enable_higher_order_gradients();
    let critic = TinyCritic::new(0);
    let real = random_images(3, 4, 0.0);
    let mut rng = StdRng::seed_from_u64(5);

    let first = R1
        .discriminator_terms(&critic, &real, &random_images(3, 4, 1.0), 0, 1.0, &mut rng)
        .expect("terms");
    let second = R1
        .discriminator_terms(&critic, &real, &random_images(3, 4, 7.0), 0, 1.0, &mut rng)
        .expect("terms");

    let expected = 5.0 * weight_norm_sq(&critic, 0);
    let penalty = first.penalty_value().unwrap();
    assert!((penalty - expected).abs() < 1e-4 * expected.max(1.0));
    assert_eq!(penalty, second.penalty_value().unwrap());
    assert_ne!(scalar(&first.fake), scalar(&second.fake));
}

#[test]
fn generator_losses_follow_loss_family() {
    let scores = Tensor::new(&[[1.0f32], [-3.0], [0.5]], &Device::Cpu).unwrap();

    let wgan = WganGp.generator_loss(&scores).expect("wgan loss");
    assert!((scalar(&wgan) - 0.5).abs() < 1e-6);

    let r1 = R1.generator_loss(&scores).expect("r1 loss");
    let expected = [1.0f64, -3.0, 0.5]
        .iter()
        .map(|s| (1.0 + (-s).exp()).ln())
        .sum::<f64>()
        / 3.0;
    assert!((scalar(&r1) - expected).abs() < 1e-5);
}

#[test]
fn softplus_is_stable_for_large_inputs() {
    let xs = Tensor::new(&[-200.0f32, 0.0, 200.0], &Device::Cpu).unwrap();
    let values = training::loss::softplus(&xs)
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    assert!(values.iter().all(|v| v.is_finite()));
    assert!(values[0].abs() < 1e-6);
    assert!((values[1] - std::f32::consts::LN_2).abs() < 1e-6);
    assert!((values[2] - 200.0).abs() < 1e-3);
}

#[test]
fn critic_scores_one_value_per_sample() {
    let critic = TinyCritic::new(1);
    let scores = critic
        .forward(&random_images(5, 8, 0.0), 1, 1.0)
        .expect("scores");
    assert_eq!(scores.dims(), &[5, 1]);
}

#[test]
fn penalties_reach_every_conv_weight_of_progressive_critic() {
    enable_higher_order_gradients();
    let critic = ProgressiveDiscriminator::new(ModelConfig {
        code_size: 8,
        channels: 4,
        mapping_layers: 1,
        max_step: 1,
        device: Device::Cpu,
    })
    .expect("critic");
    let real = random_images(2, 8, 0.3);
    let fake = random_images(2, 8, 1.7);

    for objective in [
        AdversarialObjective::from(LossKind::WganGp),
        AdversarialObjective::from(LossKind::R1),
    ] {
        let terms = objective
            .discriminator_terms(&critic, &real, &fake, 1, 0.5, &mut StdRng::seed_from_u64(4))
            .expect("terms");
        let penalty = terms.penalty_value().expect("penalty");
        assert!(penalty.is_finite() && penalty > 0.0);

        let grads = terms.penalty.backward().expect("penalty backward");
        let weights: Vec<_> = critic
            .parameters()
            .expect("parameters")
            .into_iter()
            .filter(|(name, _)| name.ends_with("weight"))
            .collect();
        assert!(weights.len() >= 7);
        for (name, var) in weights {
            let grad = grads
                .get(var.as_tensor())
                .unwrap_or_else(|| panic!("{:?}: no penalty gradient on {name}", objective.kind()));
            let magnitude = scalar(&grad.abs().unwrap().sum_all().unwrap());
            assert!(magnitude > 0.0, "{:?}: zero penalty gradient on {name}", objective.kind());
        }
    }
}

#[test]
fn wgan_loss_value_is_negated_critic_margin() {
    enable_higher_order_gradients();
    let critic = TinyCritic::new(0);
    let real = random_images(3, 4, 0.2);
    let fake = random_images(3, 4, 2.4);

    let terms = WganGp
        .discriminator_terms(&critic, &real, &fake, 0, 1.0, &mut StdRng::seed_from_u64(5))
        .expect("terms");
    let real_scores = critic.forward(&real, 0, 1.0).expect("real scores");
    let fake_scores = critic.forward(&fake, 0, 1.0).expect("fake scores");
    let real_mean = scalar(&real_scores.mean_all().unwrap());
    let fake_mean = scalar(&fake_scores.mean_all().unwrap());
    let drift = 0.001 * scalar(&real_scores.sqr().unwrap().mean_all().unwrap());

    let loss = terms.loss_value().expect("loss");
    assert!((loss - (scalar(&terms.real) + scalar(&terms.fake))).abs() < 1e-9);
    assert!((loss - (fake_mean - real_mean + drift)).abs() < 1e-5);
}
