use model::resolution_for_step;
use training::{
    config::ResolutionEntry, DatasetKind, LearningRateTable, ResolutionScheduler, TierTransition,
    TrainingConfig, TrainingState,
};

fn state(step: usize, samples: usize) -> TrainingState {
    let mut state = TrainingState::new(step);
    state.samples_seen_in_phase = samples;
    state
}

#[test]
fn blend_saturates_without_advancing_inside_two_phases() {
    let scheduler = ResolutionScheduler::new(100, 5).unwrap();
    let mut state = state(2, 95);

    assert!(scheduler.advance(&mut state).is_none());
    assert!((state.blend_factor - 0.95).abs() < 1e-12);

    state.record_samples(10);
    assert_eq!(state.samples_seen_in_phase, 105);
    assert!(scheduler.advance(&mut state).is_none());
    assert_eq!(state.blend_factor, 1.0);
    assert_eq!(state.step, 2);
}

#[test]
fn exceeding_two_phases_enters_next_tier() {
    let scheduler = ResolutionScheduler::new(100, 5).unwrap();
    let mut state = state(2, 205);

    let transition = scheduler.advance(&mut state);
    assert_eq!(
        transition,
        Some(TierTransition {
            completed_step: 2,
            step: 3,
            resolution: 32,
        })
    );
    assert_eq!(state.step, 3);
    assert_eq!(state.samples_seen_in_phase, 0);
    assert_eq!(state.blend_factor, 0.0);
}

#[test]
fn exactly_two_phases_does_not_advance() {
    let scheduler = ResolutionScheduler::new(100, 5).unwrap();
    let mut state = state(1, 200);
    assert!(scheduler.advance(&mut state).is_none());
    assert_eq!(state.step, 1);
}

#[test]
fn last_tier_stays_clamped_without_reset() {
    let scheduler = ResolutionScheduler::new(100, 3).unwrap();
    let mut state = state(3, 250);

    assert!(scheduler.advance(&mut state).is_none());
    assert_eq!(state.step, 3);
    assert_eq!(state.samples_seen_in_phase, 250);
    assert_eq!(state.blend_factor, 1.0);
}

#[test]
fn blend_factor_stays_in_unit_interval_and_resolution_grows() {
    let scheduler = ResolutionScheduler::new(40, 4).unwrap();
    let mut state = TrainingState::new(1);
    let mut last_resolution = state.resolution();
    let mut transitions = 0;

    for _ in 0..200 {
        if let Some(transition) = scheduler.advance(&mut state) {
            transitions += 1;
            assert_eq!(state.blend_factor, 0.0);
            assert_eq!(transition.resolution, resolution_for_step(transition.step));
        }
        assert!((0.0..=1.0).contains(&state.blend_factor));
        if state.samples_seen_in_phase >= 40 {
            assert_eq!(state.blend_factor, 1.0);
        }
        assert!(state.resolution() >= last_resolution);
        assert_eq!(state.resolution(), 4 * 2usize.pow(state.step as u32));
        last_resolution = state.resolution();
        state.record_samples(7);
    }

    assert_eq!(transitions, 3);
    assert_eq!(state.step, 4);
}

#[test]
fn zero_phase_length_is_rejected() {
    assert!(ResolutionScheduler::new(0, 3).is_err());
}

#[test]
fn learning_rate_table_follows_schedule_flag() {
    let mut config = TrainingConfig::for_dataset("data", DatasetKind::Folder);
    config.optimizer.learning_rate = 0.0005;

    let plain = LearningRateTable::from_training_config(&config);
    assert_eq!(plain.rate_for(128), 0.0005);

    config.progressive.sched = true;
    config.optimizer.lr_schedule = vec![ResolutionEntry {
        resolution: 256,
        value: 0.004,
    }];
    let scheduled = LearningRateTable::from_training_config(&config);
    assert_eq!(scheduled.rate_for(64), 0.0005);
    assert_eq!(scheduled.rate_for(128), 0.0015);
    assert_eq!(scheduled.rate_for(256), 0.004);
    assert_eq!(scheduled.rate_for(1024), 0.003);
}
