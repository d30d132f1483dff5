//! onpolicy - on-policy multi-agent reinforcement learning core
//!
//! Rollout storage, generalized advantage estimation, minibatch
//! generation, and MAPPO/MAPPG training loops for cooperative
//! multi-agent environments. The numeric core (storage, estimation,
//! configuration) is independent of the tensor backend; the policy,
//! trainer, and driver layers sit behind the `nn` feature.

pub mod config;
pub mod env;
pub mod error;
pub mod metrics;
pub mod normalizer;
pub mod spaces;
pub mod storage;

#[cfg(feature = "nn")]
pub mod checkpoint;
#[cfg(feature = "nn")]
pub mod policy;
#[cfg(feature = "nn")]
pub mod runner;
#[cfg(feature = "nn")]
pub mod trainer;

pub use config::TrainConfig;
pub use env::VectorEnv;
pub use metrics::{LogMetrics, MemoryMetrics, MetricsSink, NoopMetrics};
pub use normalizer::PopArt;
pub use spaces::ActionSpace;
pub use storage::{MiniBatch, RolloutBuffer, StepRecord, TurnRecord};

#[cfg(feature = "nn")]
pub use policy::{ActorCriticPolicy, MlpPolicy};
#[cfg(feature = "nn")]
pub use runner::Runner;
#[cfg(feature = "nn")]
pub use trainer::{MappgTrainer, MappoTrainer, TrainStats, TrainerVariant};
