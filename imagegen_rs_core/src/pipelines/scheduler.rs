use candle_core::Result;
use candle_transformers::models::stable_diffusion::{
    ddim::DDIMSchedulerConfig,
    schedulers::{
        BetaSchedule, PredictionType, Scheduler, SchedulerConfig as _, TimestepSpacing,
    },
};
use serde::Deserialize;

/// The `scheduler/scheduler_config.json` of a diffusers checkpoint.
#[derive(Deserialize, Clone, Debug)]
pub struct SchedulerConfig {
    #[serde(rename = "_class_name")]
    pub scheduler_type: SchedulerType,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaScheduleType,
    #[serde(default = "default_train_timesteps")]
    pub num_train_timesteps: usize,
    #[serde(default)]
    pub steps_offset: usize,
    #[serde(default)]
    pub prediction_type: PredictionKind,
    #[serde(default)]
    pub timestep_spacing: Spacing,
}

fn default_train_timesteps() -> usize {
    1000
}

/// Schedulers a checkpoint may name. PNDM checkpoints are sampled with DDIM over the same betas.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerType {
    #[serde(rename = "DDIMScheduler")]
    Ddim,
    #[serde(rename = "PNDMScheduler")]
    Pndm,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BetaScheduleType {
    Linear,
    ScaledLinear,
    SquaredcosCapV2,
}

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PredictionKind {
    #[default]
    Epsilon,
    VPrediction,
    Sample,
}

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Spacing {
    #[default]
    Leading,
    Linspace,
    Trailing,
}

impl SchedulerConfig {
    fn ddim_config(&self) -> DDIMSchedulerConfig {
        DDIMSchedulerConfig {
            beta_start: self.beta_start,
            beta_end: self.beta_end,
            beta_schedule: match self.beta_schedule {
                BetaScheduleType::Linear => BetaSchedule::Linear,
                BetaScheduleType::ScaledLinear => BetaSchedule::ScaledLinear,
                BetaScheduleType::SquaredcosCapV2 => BetaSchedule::SquaredcosCapV2,
            },
            steps_offset: self.steps_offset,
            prediction_type: match self.prediction_type {
                PredictionKind::Epsilon => PredictionType::Epsilon,
                PredictionKind::VPrediction => PredictionType::VPrediction,
                PredictionKind::Sample => PredictionType::Sample,
            },
            train_timesteps: self.num_train_timesteps,
            timestep_spacing: match self.timestep_spacing {
                Spacing::Leading => TimestepSpacing::Leading,
                Spacing::Linspace => TimestepSpacing::Linspace,
                Spacing::Trailing => TimestepSpacing::Trailing,
            },
            ..Default::default()
        }
    }

    /// Build a scheduler for `num_steps` inference steps.
    pub fn build(&self, num_steps: usize) -> Result<Box<dyn Scheduler>> {
        match self.scheduler_type {
            SchedulerType::Ddim | SchedulerType::Pndm => self.ddim_config().build(num_steps),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SD15_SCHEDULER: &str = r#"{
        "_class_name": "PNDMScheduler",
        "_diffusers_version": "0.6.0",
        "beta_end": 0.012,
        "beta_schedule": "scaled_linear",
        "beta_start": 0.00085,
        "num_train_timesteps": 1000,
        "set_alpha_to_one": false,
        "skip_prk_steps": true,
        "steps_offset": 1,
        "trained_betas": null,
        "clip_sample": false
    }"#;

    #[test]
    fn parses_pndm_config() -> anyhow::Result<()> {
        let cfg: SchedulerConfig = serde_json::from_str(SD15_SCHEDULER)?;
        assert_eq!(cfg.scheduler_type, SchedulerType::Pndm);
        assert_eq!(cfg.beta_schedule, BetaScheduleType::ScaledLinear);
        assert_eq!(cfg.prediction_type, PredictionKind::Epsilon);
        assert_eq!(cfg.timestep_spacing, Spacing::Leading);
        assert_eq!(cfg.steps_offset, 1);
        Ok(())
    }

    #[test]
    fn builds_one_timestep_per_step() -> anyhow::Result<()> {
        let cfg: SchedulerConfig = serde_json::from_str(SD15_SCHEDULER)?;
        let scheduler = cfg.build(30)?;
        let timesteps = scheduler.timesteps();
        assert_eq!(timesteps.len(), 30);
        assert!(timesteps.windows(2).all(|w| w[0] > w[1]));
        assert!(timesteps.iter().all(|t| *t < 1000));
        Ok(())
    }

    #[test]
    fn rejects_unknown_schedulers() {
        let json = SD15_SCHEDULER.replace("PNDMScheduler", "LCMScheduler");
        assert!(serde_json::from_str::<SchedulerConfig>(&json).is_err());
    }
}
