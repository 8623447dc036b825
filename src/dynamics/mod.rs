//! Forward-dynamics ensemble and the disagreement reward
//!
//! Each [`DynamicsModel`] predicts the next feature vector from the current
//! one and the action. Models share nothing but their input: each owns its
//! parameters under its own `dynamics_{i}` scope and is trained against the
//! same detached target. The intrinsic reward is the population variance of
//! their point predictions across the ensemble, averaged over feature
//! dimensions.
//!
//! # Architecture
//!
//! ```text
//! [x, onehot(a)] -> Dense(hidden) -> leaky_relu
//!   repeat n_blocks:  res = Dense([x, a]) -> leaky_relu -> Dense([res, a]);  x += res
//! [x, onehot(a)] -> Dense(feat_dim)         (2 * feat_dim with var_output)
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use tch::{
    Kind, Tensor,
    nn::{self, Module},
};

/// Ensemble hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicsConfig {
    /// Number of ensemble members
    pub num_dynamics: usize,
    pub hidden_dim: i64,
    /// Residual blocks between the input and output layers
    pub n_blocks: usize,
    /// Predict a log-variance alongside the mean and train with Gaussian NLL
    pub var_output: bool,
    /// Feed normalized observations instead of extractor features
    pub predict_from_pixels: bool,
    /// Fraction of target dimensions each model is trained on
    pub subset_fraction: f64,
}

impl Default for DynamicsConfig {
    fn default() -> Self {
        Self {
            num_dynamics: 5,
            hidden_dim: 512,
            n_blocks: 4,
            var_output: true,
            predict_from_pixels: false,
            subset_fraction: 1.0,
        }
    }
}

/// One model's output
#[derive(Debug)]
pub struct Prediction {
    /// Predicted next features [B, feat_dim]
    pub mean: Tensor,
    /// Predicted log-variance [B, feat_dim], with `var_output`
    pub log_var: Option<Tensor>,
}

/// A single forward-dynamics model
#[derive(Debug)]
pub struct DynamicsModel {
    input: nn::Linear,
    blocks: Vec<(nn::Linear, nn::Linear)>,
    out: nn::Linear,
    action_dim: i64,
    out_dim: i64,
    var_output: bool,
    /// 0/1 weights over target dimensions [out_dim]; `None` trains on all
    subset_mask: Option<Tensor>,
}

impl DynamicsModel {
    /// Build a model under `path`
    ///
    /// `in_dim` is the size of the input representation and `out_dim` the
    /// size of the predicted target.
    pub fn new(
        path: &nn::Path,
        in_dim: i64,
        out_dim: i64,
        action_dim: i64,
        config: &DynamicsConfig,
        rng: &mut impl Rng,
    ) -> Self {
        let hidden = config.hidden_dim;
        let input = nn::linear(path / "input", in_dim + action_dim, hidden, Default::default());
        let blocks = (0..config.n_blocks)
            .map(|k| {
                let width = hidden + action_dim;
                let a = nn::linear(path / format!("res{k}a"), width, hidden, Default::default());
                let b = nn::linear(path / format!("res{k}b"), width, hidden, Default::default());
                (a, b)
            })
            .collect();
        let head_dim = if config.var_output { 2 * out_dim } else { out_dim };
        let out = nn::linear(path / "out", hidden + action_dim, head_dim, Default::default());

        let subset_mask = (config.subset_fraction < 1.0).then(|| {
            let keep = ((out_dim as f64 * config.subset_fraction).ceil() as usize).max(1);
            let chosen = rand::seq::index::sample(&mut *rng, out_dim as usize, keep);
            let mut mask = vec![0f32; out_dim as usize];
            for i in chosen.iter() {
                mask[i] = 1.0;
            }
            Tensor::from_slice(&mask).to_device(path.device())
        });

        Self {
            input,
            blocks,
            out,
            action_dim,
            out_dim,
            var_output: config.var_output,
            subset_mask,
        }
    }

    /// Predict next features from `inputs` [B, in_dim] and `actions` [B]
    pub fn predict(&self, inputs: &Tensor, actions: &Tensor) -> Prediction {
        let onehot = actions.onehot(self.action_dim).to_kind(inputs.kind());
        let with_action = |x: &Tensor| Tensor::cat(&[x, &onehot], 1);

        let mut x = self.input.forward(&with_action(inputs)).leaky_relu();
        for (a, b) in &self.blocks {
            let res = a.forward(&with_action(&x)).leaky_relu();
            let res = b.forward(&with_action(&res));
            x = x + res;
        }
        let out = self.out.forward(&with_action(&x));

        if self.var_output {
            let mean = out.narrow(1, 0, self.out_dim);
            let log_var = out.narrow(1, self.out_dim, self.out_dim).clamp(-10.0, 10.0);
            Prediction { mean, log_var: Some(log_var) }
        } else {
            Prediction { mean: out, log_var: None }
        }
    }

    /// Per-transition training loss [B] against `targets` [B, out_dim]
    ///
    /// Squared error, or Gaussian negative log-likelihood with `var_output`,
    /// averaged over the model's target dimensions.
    pub fn loss(&self, inputs: &Tensor, actions: &Tensor, targets: &Tensor) -> Tensor {
        let Prediction { mean, log_var } = self.predict(inputs, actions);
        let sq = (mean - targets).square();
        let per_dim = match log_var {
            Some(log_var) => (sq * (-&log_var).exp() + log_var) * 0.5,
            None => sq,
        };

        match &self.subset_mask {
            Some(mask) => {
                (per_dim * mask).sum_dim_intlist(-1, false, Kind::Float) / mask.sum(Kind::Float)
            }
            None => per_dim.mean_dim(-1, false, Kind::Float),
        }
    }
}

/// `N` independently parameterized dynamics models
#[derive(Debug)]
pub struct DynamicsEnsemble {
    models: Vec<DynamicsModel>,
    predict_from_pixels: bool,
}

impl DynamicsEnsemble {
    /// Build `config.num_dynamics` models under `root / "dynamics_{i}"`
    pub fn new(
        root: &nn::Path,
        in_dim: i64,
        out_dim: i64,
        action_dim: i64,
        config: &DynamicsConfig,
        rng: &mut impl Rng,
    ) -> Self {
        let models = (0..config.num_dynamics)
            .map(|i| {
                let path = root / format!("dynamics_{i}");
                DynamicsModel::new(&path, in_dim, out_dim, action_dim, config, &mut *rng)
            })
            .collect();
        Self { models, predict_from_pixels: config.predict_from_pixels }
    }

    /// Stacked point predictions [N, B, out_dim]
    pub fn predict(&self, inputs: &Tensor, actions: &Tensor) -> Tensor {
        let preds: Vec<Tensor> =
            self.models.iter().map(|m| m.predict(inputs, actions).mean).collect();
        Tensor::stack(&preds, 0)
    }

    /// Intrinsic reward per transition [B]
    pub fn disagreement(&self, inputs: &Tensor, actions: &Tensor) -> Tensor {
        disagreement(&self.predict(inputs, actions))
    }

    /// Sum over models of each model's mean loss, plus the per-model values
    pub fn loss(
        &self,
        inputs: &Tensor,
        actions: &Tensor,
        targets: &Tensor,
    ) -> (Tensor, Vec<Tensor>) {
        let targets = targets.detach();
        let per_model: Vec<Tensor> = self
            .models
            .iter()
            .map(|m| m.loss(inputs, actions, &targets).mean(Kind::Float))
            .collect();
        let zero = Tensor::from(0f32).to_device(inputs.device());
        let total = per_model.iter().fold(zero, |acc, l| acc + l);
        (total, per_model)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn predict_from_pixels(&self) -> bool {
        self.predict_from_pixels
    }
}

/// Disagreement of stacked predictions [N, B, D] -> [B]
///
/// Population variance across the model axis, averaged over feature
/// dimensions.
pub fn disagreement(predictions: &Tensor) -> Tensor {
    predictions.var_dim(0, false, false).mean_dim(-1, false, Kind::Float)
}
