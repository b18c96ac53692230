use std::fs;

use anyhow::Result;
use tempfile::tempdir;
use training::{DatasetKind, LossKind, TrainingConfig, TrainingError};

#[test]
fn toml_config_resolves_relative_paths() -> Result<()> {
    let tmp = tempdir()?;
    let path = tmp.path().join("train.toml");
    fs::write(
        &path,
        r#"
[data]
path = "images"
kind = "lsun"
batch_size = 8
batch_schedule = [{ resolution = 64, value = 4 }]

[progressive]
phase = 600000
init_size = 8
max_size = 128
sched = true

[loss]
kind = "r1"
mixing = true

[runtime.checkpoint]
directory = "ckpt"
every_n_iters = 500

[runtime.samples]
directory = "previews"
every_n_iters = 50
"#,
    )?;

    let config = TrainingConfig::load(&path)?;
    assert_eq!(config.data.path, tmp.path().join("images"));
    assert_eq!(config.data.kind, DatasetKind::Lsun);
    assert_eq!(config.loss.kind, LossKind::R1);
    assert!(config.loss.mixing);
    assert_eq!(config.initial_step(), 1);
    assert_eq!(config.max_step(), 5);
    assert_eq!(config.runtime.checkpoint.directory, tmp.path().join("ckpt"));
    let samples = config.runtime.samples.expect("samples section");
    assert_eq!(samples.directory, tmp.path().join("previews"));
    assert_eq!(samples.grid.len(), 2);
    Ok(())
}

#[test]
fn json_config_is_accepted() -> Result<()> {
    let tmp = tempdir()?;
    let path = tmp.path().join("train.json");
    fs::write(
        &path,
        r#"{ "data": { "path": "/srv/faces" }, "loss": { "kind": "wgan-gp", "n_critic": 5 } }"#,
    )?;

    let config = TrainingConfig::load(&path)?;
    assert_eq!(config.data.path, std::path::PathBuf::from("/srv/faces"));
    assert_eq!(config.loss.kind, LossKind::WganGp);
    assert_eq!(config.loss.n_critic, 5);
    assert_eq!(config.progressive.phase, 320_000);
    Ok(())
}

#[test]
fn unknown_loss_kind_is_a_format_error() -> Result<()> {
    let tmp = tempdir()?;
    let path = tmp.path().join("train.toml");
    fs::write(&path, "[data]\npath = \"x\"\n\n[loss]\nkind = \"hinge\"\n")?;

    assert!(matches!(
        TrainingConfig::load(&path),
        Err(TrainingError::ConfigFormat(_))
    ));
    Ok(())
}

#[test]
fn invalid_values_are_reported_after_parsing() -> Result<()> {
    let tmp = tempdir()?;
    let path = tmp.path().join("train.toml");
    fs::write(
        &path,
        "[data]\npath = \"x\"\n\n[progressive]\nphase = 0\n\n[loss]\nmixing_prob = 1.5\n",
    )?;

    let Err(TrainingError::Validation(messages)) = TrainingConfig::load(&path) else {
        panic!("expected validation failure");
    };
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().any(|m| m.contains("progressive.phase")));
    assert!(messages.iter().any(|m| m.contains("loss.mixing_prob")));
    Ok(())
}

#[test]
fn unsupported_extension_is_rejected() -> Result<()> {
    let tmp = tempdir()?;
    let path = tmp.path().join("train.yaml");
    fs::write(&path, "data: {}")?;
    assert!(matches!(
        TrainingConfig::load(&path),
        Err(TrainingError::ConfigFormat(_))
    ));
    Ok(())
}
