//! Variational autoencoder features
//!
//! Features are the posterior mean. The auxiliary loss is the negative
//! log-likelihood of the observation under a Gaussian decoder plus the KL
//! divergence of the posterior from a unit Gaussian. The spherical variant
//! learns one output scale shared by every observation dimension; the
//! non-spherical variant predicts a scale per dimension.

use std::f64::consts::PI;

use tch::{
    Kind, Tensor,
    nn::{self, Init, Module},
};

use super::{AuxBatch, FeatureConfig, FeatureExtractor, FeatureLearning, layernorm, mlp_encoder};

#[derive(Debug)]
pub struct Vae {
    encoder: nn::Sequential,
    decoder: nn::Sequential,
    /// Pre-softplus shared output scale, spherical variant only
    scale: Option<Tensor>,
    obs_dim: i64,
    feat_dim: i64,
    layernorm: bool,
}

impl Vae {
    pub fn new(path: &nn::Path, obs_dim: i64, config: &FeatureConfig, spherical: bool) -> Self {
        let feat_dim = config.feat_dim;
        let encoder = mlp_encoder(&(path / "encoder"), obs_dim, config.hidden_dim, 2 * feat_dim);
        let decoder_out = if spherical { obs_dim } else { 2 * obs_dim };
        let decoder = mlp_encoder(&(path / "decoder"), feat_dim, config.hidden_dim, decoder_out);
        let scale = spherical.then(|| path.var("scale", &[], Init::Const(0.0)));

        Self { encoder, decoder, scale, obs_dim, feat_dim, layernorm: config.layernorm }
    }

    /// Posterior mean and log standard deviation, each [B, feat_dim]
    pub fn posterior(&self, observations: &Tensor) -> (Tensor, Tensor) {
        let out = self.encoder.forward(observations);
        let mean = out.narrow(1, 0, self.feat_dim);
        let logstd = out.narrow(1, self.feat_dim, self.feat_dim).clamp(-10.0, 5.0);
        (mean, logstd)
    }

    /// Decoder mean and scale for latent samples, each broadcastable to
    /// [B, obs_dim]
    fn decode(&self, latent: &Tensor) -> (Tensor, Tensor) {
        let out = self.decoder.forward(latent);
        match &self.scale {
            Some(scale) => (out, softplus(scale) + 1e-4),
            None => {
                let mean = out.narrow(1, 0, self.obs_dim);
                let raw = out.narrow(1, self.obs_dim, self.obs_dim);
                (mean, softplus(&raw) + 1e-4)
            }
        }
    }

    pub fn is_spherical(&self) -> bool {
        self.scale.is_some()
    }
}

fn softplus(x: &Tensor) -> Tensor {
    x.clamp(-20.0, 20.0).exp().log1p()
}

impl FeatureExtractor for Vae {
    fn kind(&self) -> FeatureLearning {
        if self.is_spherical() {
            FeatureLearning::VaeSpherical
        } else {
            FeatureLearning::VaeNonSpherical
        }
    }

    fn feat_dim(&self) -> i64 {
        self.feat_dim
    }

    fn encode(&self, observations: &Tensor) -> Tensor {
        let (mean, _) = self.posterior(observations);
        if self.layernorm { layernorm(&mean) } else { mean }
    }

    fn auxiliary_loss(&self, batch: &AuxBatch<'_>) -> Tensor {
        let x = batch.observations;
        let (mean, logstd) = self.posterior(x);

        let latent = &mean + logstd.exp() * mean.randn_like();
        let (recon_mean, recon_scale) = self.decode(&latent);

        let z = (x - recon_mean) / &recon_scale;
        let nll = (z.square() * 0.5 + recon_scale.log() + 0.5 * (2.0 * PI).ln())
            .sum_dim_intlist(-1, false, Kind::Float);

        let kl = ((mean.square() + (&logstd * 2.0).exp() - 1.0) * 0.5 - &logstd)
            .sum_dim_intlist(-1, false, Kind::Float);

        (nll + kl).mean(Kind::Float)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn build(spherical: bool) -> (nn::VarStore, Vae) {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = FeatureConfig { feat_dim: 4, hidden_dim: 16, ..Default::default() };
        let vae = Vae::new(&(vs.root() / "features"), 6, &config, spherical);
        (vs, vae)
    }

    #[test]
    fn test_spherical_has_one_scale_parameter() {
        let (vs, vae) = build(true);
        assert_eq!(vae.kind(), FeatureLearning::VaeSpherical);
        let vars = vs.variables();
        assert_eq!(vars["features.scale"].size(), Vec::<i64>::new());

        let (vs, vae) = build(false);
        assert_eq!(vae.kind(), FeatureLearning::VaeNonSpherical);
        assert!(!vs.variables().contains_key("features.scale"));
    }

    #[test]
    fn test_posterior_shapes() {
        let (_vs, vae) = build(false);
        let obs = Tensor::randn([5, 6], (Kind::Float, Device::Cpu));
        let (mean, logstd) = vae.posterior(&obs);
        assert_eq!(mean.size(), vec![5, 4]);
        assert_eq!(logstd.size(), vec![5, 4]);
        assert_eq!(vae.encode(&obs).size(), vec![5, 4]);
    }

    #[test]
    fn test_loss_is_differentiable() {
        let (vs, vae) = build(true);
        let obs = Tensor::randn([5, 6], (Kind::Float, Device::Cpu));
        let actions = Tensor::zeros([5], (Kind::Int64, Device::Cpu));
        let batch = AuxBatch { observations: &obs, next_observations: &obs, actions: &actions };

        let loss = vae.auxiliary_loss(&batch);
        loss.backward();

        let scale_grad = vs.variables()["features.scale"].grad();
        assert!(scale_grad.defined());
        assert!(f64::try_from(&loss).unwrap().is_finite());
    }
}
