//! Optimizer implementations (AdamW, SGD).

use candle_core::backprop::GradStore;
use candle_nn::{Optimizer, ParamsAdamW, VarMap};

use crate::config::{OptimizerKind, TrainingConfig};
use crate::error::{HeartGptError, Result};

/// Optimizer configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerConfig {
    /// Which update rule to use.
    pub kind: OptimizerKind,
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Weight decay
    pub weight_decay: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::default(),
            learning_rate: 2e-4,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 0.001,
            eps: 1e-8,
        }
    }
}

impl OptimizerConfig {
    /// Optimizer settings taken from the trainer configuration.
    #[must_use]
    pub fn from_training(training: &TrainingConfig) -> Self {
        Self {
            kind: training.optim,
            learning_rate: training.learning_rate,
            weight_decay: training.weight_decay,
            ..Self::default()
        }
    }

    /// Build the optimizer over every variable in `varmap`.
    ///
    /// # Errors
    ///
    /// Returns an error if the optimizer cannot be created.
    pub fn build(&self, varmap: &VarMap) -> Result<TrainOptimizer> {
        let vars = varmap.all_vars();
        match self.kind {
            OptimizerKind::Sgd => {
                if self.weight_decay > 0.0 {
                    tracing::warn!("sgd ignores weight_decay {}", self.weight_decay);
                }
                let opt = candle_nn::SGD::new(vars, self.learning_rate)
                    .map_err(|e| HeartGptError::Training(format!("Failed to create SGD: {e}")))?;
                Ok(TrainOptimizer::Sgd(opt))
            }
            kind => {
                match kind {
                    OptimizerKind::PagedAdamw32bit => {
                        tracing::info!("{kind}: paging is not supported, using AdamW");
                    }
                    OptimizerKind::PagedAdamw8bit => {
                        tracing::info!("{kind}: paging and 8-bit state are not supported, using AdamW");
                    }
                    _ => {}
                }
                let params = ParamsAdamW {
                    lr: self.learning_rate,
                    beta1: self.beta1,
                    beta2: self.beta2,
                    eps: self.eps,
                    weight_decay: self.weight_decay,
                };
                let opt = candle_nn::AdamW::new(vars, params)
                    .map_err(|e| HeartGptError::Training(format!("Failed to create AdamW: {e}")))?;
                Ok(TrainOptimizer::AdamW(opt))
            }
        }
    }
}

/// Optimizer driven by the trainer.
pub enum TrainOptimizer {
    /// Decoupled weight decay Adam.
    AdamW(candle_nn::AdamW),
    /// Stochastic gradient descent.
    Sgd(candle_nn::SGD),
}

impl TrainOptimizer {
    /// Apply accumulated gradients.
    ///
    /// # Errors
    ///
    /// Returns an error if the step fails.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        let result = match self {
            Self::AdamW(opt) => opt.step(grads),
            Self::Sgd(opt) => opt.step(grads),
        };
        result.map_err(|e| HeartGptError::Training(format!("Optimizer step failed: {e}")))
    }

    /// Get current learning rate.
    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::AdamW(opt) => opt.learning_rate(),
            Self::Sgd(opt) => opt.learning_rate(),
        }
    }

    /// Set learning rate (used by schedulers).
    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::AdamW(opt) => opt.set_learning_rate(lr),
            Self::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_from_training_config() {
        let training = TrainingConfig {
            learning_rate: 1e-3,
            weight_decay: 0.1,
            optim: OptimizerKind::Sgd,
            ..TrainingConfig::default()
        };
        let config = OptimizerConfig::from_training(&training);
        assert_eq!(config.kind, OptimizerKind::Sgd);
        assert!((config.learning_rate - 1e-3).abs() < f64::EPSILON);
        assert!((config.weight_decay - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_build_adamw() -> Result<()> {
        let config = OptimizerConfig::default();
        let varmap = VarMap::new();
        let mut optimizer = config.build(&varmap)?;
        assert!(matches!(optimizer, TrainOptimizer::AdamW(_)));
        assert!((optimizer.learning_rate() - 2e-4).abs() < f64::EPSILON);
        optimizer.set_learning_rate(1e-5);
        assert!((optimizer.learning_rate() - 1e-5).abs() < f64::EPSILON);
        Ok(())
    }

    #[test]
    fn test_sgd_step_moves_against_gradient() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let w = varmap.get(2, "w", candle_nn::init::ONE, DType::F32, &device)?;
        let config = OptimizerConfig {
            kind: OptimizerKind::Sgd,
            learning_rate: 0.5,
            weight_decay: 0.0,
            ..OptimizerConfig::default()
        };
        let mut optimizer = config.build(&varmap)?;
        let loss = w.sqr()?.sum_all()?;
        optimizer.step(&loss.backward()?)?;
        let updated = varmap.all_vars()[0].as_tensor().to_vec1::<f32>()?;
        assert_eq!(updated, vec![0.0, 0.0]);
        Ok(())
    }
}
