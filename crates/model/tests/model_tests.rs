use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use model::{
    resolution_for_step, Discriminator, Generator, LatentInput, ModelConfig,
    ProgressiveDiscriminator, StyledGenerator,
};

fn build_config(max_step: usize) -> ModelConfig {
    ModelConfig {
        code_size: 8,
        channels: 4,
        mapping_layers: 2,
        max_step,
        device: Device::Cpu,
    }
}

fn latent(batch: usize, code_size: usize, offset: f32) -> Result<Tensor> {
    let data: Vec<f32> = (0..batch * code_size)
        .map(|idx| ((idx as f32) * 0.37 + offset).sin())
        .collect();
    Ok(Tensor::from_vec(data, (batch, code_size), &Device::Cpu)?)
}

#[test]
fn generator_output_follows_tier_resolution() -> Result<()> {
    let generator = StyledGenerator::new(build_config(2))?;
    let code = LatentInput::Single(latent(3, 8, 0.0)?);

    for step in 0..=2 {
        let images = generator.forward(&code, step, 1.0)?;
        let size = resolution_for_step(step);
        assert_eq!(images.dims(), &[3, 3, size, size]);
        assert_eq!(images.dtype(), DType::F32);
    }
    Ok(())
}

#[test]
fn discriminator_scores_each_sample() -> Result<()> {
    let discriminator = ProgressiveDiscriminator::new(build_config(2))?;
    for step in 0..=2 {
        let size = resolution_for_step(step);
        let images = Tensor::zeros((5, 3, size, size), DType::F32, &Device::Cpu)?;
        let scores = discriminator.forward(&images, step, 0.5)?;
        assert_eq!(scores.dims(), &[5, 1]);
    }
    Ok(())
}

#[test]
fn discriminator_rejects_mismatched_resolution() -> Result<()> {
    let discriminator = ProgressiveDiscriminator::new(build_config(1))?;
    let images = Tensor::zeros((1, 3, 4, 4), DType::F32, &Device::Cpu)?;
    assert!(discriminator.forward(&images, 1, 1.0).is_err());
    Ok(())
}

#[test]
fn blend_factor_is_ignored_on_first_tier() -> Result<()> {
    let generator = StyledGenerator::new(build_config(1))?;
    let code = LatentInput::Single(latent(2, 8, 0.3)?);

    let faded = generator.forward(&code, 0, 0.25)?;
    let full = generator.forward(&code, 0, 1.0)?;
    let diff = (faded - full)?.abs()?.sum_all()?.to_vec0::<f32>()?;
    assert_eq!(diff, 0.0);
    Ok(())
}

#[test]
fn partial_blend_mixes_previous_tier() -> Result<()> {
    let generator = StyledGenerator::new(build_config(1))?;
    let code = LatentInput::Single(latent(2, 8, 0.1)?);

    let faded = generator.forward(&code, 1, 0.0)?;
    let full = generator.forward(&code, 1, 1.0)?;
    let diff = (faded - full)?.abs()?.sum_all()?.to_vec0::<f32>()?;
    assert!(diff > 0.0);
    Ok(())
}

#[test]
fn style_mixing_changes_late_blocks() -> Result<()> {
    let generator = StyledGenerator::new(build_config(2))?;
    let primary = latent(2, 8, 0.0)?;
    let secondary = latent(2, 8, 1.7)?;

    let single = generator.forward(&LatentInput::Single(primary.clone()), 2, 1.0)?;
    let mixed = generator.forward(
        &LatentInput::Mixed {
            primary,
            secondary,
            crossover: 1,
        },
        2,
        1.0,
    )?;
    let diff = (single - mixed)?.abs()?.sum_all()?.to_vec0::<f32>()?;
    assert!(diff > 0.0);
    Ok(())
}

#[test]
fn parameter_groups_split_style_network() -> Result<()> {
    let generator = StyledGenerator::new(build_config(1))?;
    let groups = generator.parameter_groups()?;

    assert!(!groups.style.is_empty());
    assert!(!groups.synthesis.is_empty());
    assert!(groups.style.iter().all(|(name, _)| name.starts_with("style.")));
    assert!(groups
        .synthesis
        .iter()
        .all(|(name, _)| name.starts_with("synthesis.")));
    assert_eq!(
        groups.all().len(),
        groups.style.len() + groups.synthesis.len()
    );
    Ok(())
}
