//! Feature extractors
//!
//! A feature extractor maps a batch of normalized observations to fixed-size
//! latent vectors. The dynamics ensemble predicts these vectors, so the choice
//! of extractor decides what "novel" means to the agent.
//!
//! Variants are independent structs behind the [`FeatureExtractor`] trait and
//! are selected with [`FeatureLearning`]:
//!
//! | selector          | features                        | auxiliary loss             |
//! |-------------------|---------------------------------|----------------------------|
//! | `none`            | frozen random MLP               | none                       |
//! | `idf`             | trained MLP                     | inverse-dynamics CE        |
//! | `vaesph`          | VAE posterior mean              | NLL (scalar scale) + KL    |
//! | `vaenonsph`       | VAE posterior mean              | NLL (per-dim scale) + KL   |
//! | `pix2pix`         | the normalized observation      | none                       |

use std::fmt;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tch::{
    Device, Kind, Tensor,
    nn::{self, Init},
};

use crate::policy::Activation;

pub mod idf;
pub mod pixels;
pub mod random;
pub mod vae;

pub use idf::InverseDynamics;
pub use pixels::JustPixels;
pub use random::RandomFeatures;
pub use vae::Vae;

/// Feature-learning strategy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FeatureLearning {
    /// Fixed random encoder
    #[default]
    #[serde(rename = "none")]
    None,
    /// Inverse-dynamics features
    #[serde(rename = "idf")]
    Idf,
    /// Variational autoencoder with one shared output scale
    #[serde(rename = "vaesph")]
    VaeSpherical,
    /// Variational autoencoder with a per-dimension output scale
    #[serde(rename = "vaenonsph")]
    VaeNonSpherical,
    /// Raw normalized observations
    #[serde(rename = "pix2pix")]
    Pixels,
}

impl FeatureLearning {
    pub fn as_str(self) -> &'static str {
        match self {
            FeatureLearning::None => "none",
            FeatureLearning::Idf => "idf",
            FeatureLearning::VaeSpherical => "vaesph",
            FeatureLearning::VaeNonSpherical => "vaenonsph",
            FeatureLearning::Pixels => "pix2pix",
        }
    }

    /// Parse a selector name
    pub fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "none" => FeatureLearning::None,
            "idf" => FeatureLearning::Idf,
            "vaesph" => FeatureLearning::VaeSpherical,
            "vaenonsph" => FeatureLearning::VaeNonSpherical,
            "pix2pix" => FeatureLearning::Pixels,
            other => bail!(
                "unknown feature learning strategy '{other}' \
                 (expected none, idf, vaesph, vaenonsph or pix2pix)"
            ),
        })
    }
}

impl fmt::Display for FeatureLearning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extractor hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub feat_learning: FeatureLearning,
    /// Latent size; ignored by `pix2pix`, whose features are the observation
    pub feat_dim: i64,
    pub hidden_dim: i64,
    /// Layer-normalize features (no learned affine)
    pub layernorm: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            feat_learning: FeatureLearning::None,
            feat_dim: 512,
            hidden_dim: 512,
            layernorm: false,
        }
    }
}

/// Tensors an auxiliary objective may look at
pub struct AuxBatch<'a> {
    /// Normalized observations [B, obs_dim]
    pub observations: &'a Tensor,
    /// Normalized next observations [B, obs_dim]
    pub next_observations: &'a Tensor,
    /// Actions [B] (Int64)
    pub actions: &'a Tensor,
}

/// Maps observations to latent features
pub trait FeatureExtractor {
    /// Which strategy this is
    fn kind(&self) -> FeatureLearning;

    /// Size of the produced features
    fn feat_dim(&self) -> i64;

    /// Encode a batch of normalized observations to [B, feat_dim]
    fn encode(&self, observations: &Tensor) -> Tensor;

    /// Self-supervised loss added to the total objective (scalar)
    fn auxiliary_loss(&self, batch: &AuxBatch<'_>) -> Tensor;
}

/// Build the extractor selected by `config` under `path`
pub fn build_extractor(
    path: &nn::Path,
    config: &FeatureConfig,
    obs_dim: i64,
    action_dim: i64,
) -> Box<dyn FeatureExtractor> {
    match config.feat_learning {
        FeatureLearning::None => Box::new(RandomFeatures::new(path, obs_dim, config)),
        FeatureLearning::Idf => Box::new(InverseDynamics::new(path, obs_dim, action_dim, config)),
        FeatureLearning::VaeSpherical => Box::new(Vae::new(path, obs_dim, config, true)),
        FeatureLearning::VaeNonSpherical => Box::new(Vae::new(path, obs_dim, config, false)),
        FeatureLearning::Pixels => Box::new(JustPixels::new(obs_dim, config.layernorm)),
    }
}

/// Normalize each row to zero mean and unit variance
pub fn layernorm(x: &Tensor) -> Tensor {
    let mean = x.mean_dim(-1, true, Kind::Float);
    let var = x.var_dim(-1, false, true);
    (x - mean) / (var + 1e-8).sqrt()
}

/// Mean per-dimension variance of a feature batch, reported as `feat_var`
pub fn feature_variance(features: &Tensor) -> Tensor {
    features.var_dim(0, false, false).mean(Kind::Float)
}

/// Two-layer trunk shared by the learned encoders
pub(crate) fn mlp_encoder(
    path: &nn::Path,
    in_dim: i64,
    hidden: i64,
    out_dim: i64,
) -> nn::Sequential {
    let orthogonal =
        |gain: f64| nn::LinearConfig { ws_init: Init::Orthogonal { gain }, ..Default::default() };
    let hidden_config = orthogonal(2.0_f64.sqrt());
    let out_config = orthogonal(1.0);

    nn::seq()
        .add(nn::linear(path / "fc1", in_dim, hidden, hidden_config))
        .add_fn(|x| Activation::LeakyReLU.apply(x))
        .add(nn::linear(path / "fc2", hidden, hidden, hidden_config))
        .add_fn(|x| Activation::LeakyReLU.apply(x))
        .add(nn::linear(path / "out", hidden, out_dim, out_config))
}

/// Scalar zero used by extractors without an auxiliary objective
pub(crate) fn zero_loss(device: Device) -> Tensor {
    Tensor::from(0f32).to_device(device)
}
