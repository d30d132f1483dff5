//! Versioned checkpoint persistence.
//!
//! A checkpoint directory holds the policy's weight files next to a
//! `checkpoint.json` with an explicit schema: the schema version, the
//! full training configuration, and the global environment-step count.
//! Loading verifies the schema version before touching the weights, so
//! an incompatible layout fails with a clear error instead of a partial
//! restore.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::TrainConfig;
use crate::error::CheckpointError;
use crate::policy::ActorCriticPolicy;

/// Bump on any incompatible change to the checkpoint layout.
pub const SCHEMA_VERSION: u32 = 1;

const META_FILE: &str = "checkpoint.json";

/// Everything restored besides the weight tensors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub schema_version: u32,
    pub config: TrainConfig,
    pub total_env_steps: u64,
}

/// Writes weights and metadata under `dir`, creating it if needed.
pub fn save<P: ActorCriticPolicy>(
    dir: &Path,
    policy: &P,
    config: &TrainConfig,
    total_env_steps: u64,
) -> Result<(), CheckpointError> {
    fs::create_dir_all(dir)?;
    let meta = CheckpointMeta {
        schema_version: SCHEMA_VERSION,
        config: config.clone(),
        total_env_steps,
    };
    fs::write(dir.join(META_FILE), serde_json::to_vec_pretty(&meta)?)?;
    policy.save_weights(dir)?;
    Ok(())
}

/// Restores weights into `policy` and returns the stored metadata.
pub fn load<P: ActorCriticPolicy>(
    dir: &Path,
    policy: &mut P,
) -> Result<CheckpointMeta, CheckpointError> {
    let meta: CheckpointMeta = serde_json::from_slice(&fs::read(dir.join(META_FILE))?)?;
    if meta.schema_version != SCHEMA_VERSION {
        return Err(CheckpointError::SchemaVersionMismatch {
            found: meta.schema_version,
            expected: SCHEMA_VERSION,
        });
    }
    policy.load_weights(dir)?;
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spaces::ActionSpace;
    use crate::policy::MlpPolicy;
    use tch::{Device, Tensor};

    fn policy(config: &TrainConfig) -> MlpPolicy {
        MlpPolicy::new(
            config,
            4,
            6,
            &ActionSpace::Discrete { n: 3 },
            Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn round_trip_restores_meta_and_weights() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainConfig {
            hidden_size: 16,
            ..TrainConfig::default()
        };
        let saved = policy(&config);
        save(dir.path(), &saved, &config, 12_345).unwrap();

        let mut restored = policy(&config);
        let meta = load(dir.path(), &mut restored).unwrap();
        assert_eq!(meta.schema_version, SCHEMA_VERSION);
        assert_eq!(meta.total_env_steps, 12_345);
        assert_eq!(meta.config.hidden_size, 16);

        let share_obs = Tensor::zeros([2, 6], (tch::Kind::Float, Device::Cpu));
        let rnn = Tensor::zeros([2, 16], (tch::Kind::Float, Device::Cpu));
        let masks = Tensor::ones([2, 1], (tch::Kind::Float, Device::Cpu));
        let a = saved.get_values(&share_obs, &rnn, &masks);
        let b = restored.get_values(&share_obs, &rnn, &masks);
        let diff = f64::try_from((a - b).abs().max()).unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn schema_version_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainConfig {
            hidden_size: 16,
            ..TrainConfig::default()
        };
        let saved = policy(&config);
        save(dir.path(), &saved, &config, 0).unwrap();

        let mut meta: CheckpointMeta =
            serde_json::from_slice(&fs::read(dir.path().join(META_FILE)).unwrap()).unwrap();
        meta.schema_version += 1;
        fs::write(
            dir.path().join(META_FILE),
            serde_json::to_vec(&meta).unwrap(),
        )
        .unwrap();

        let mut restored = policy(&config);
        let err = load(dir.path(), &mut restored).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::SchemaVersionMismatch { found: 2, expected: 1 }
        ));
    }
}
