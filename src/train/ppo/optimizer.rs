//! PPO optimizer with an ensemble-disagreement exploration bonus
//!
//! [`PpoOptimizer`] owns every trainable component (policy, feature
//! extractor, dynamics ensemble) in a single [`nn::VarStore`] under one Adam
//! optimizer, plus the running statistics that normalize observations and
//! rewards. Each call to [`PpoOptimizer::step`] runs one full update:
//!
//! 1. collect a segment of `nsteps_per_seg` steps from every environment
//! 2. score each transition with the ensemble's prediction variance
//! 3. normalize and mix intrinsic and extrinsic rewards
//! 4. compute GAE advantages and returns
//! 5. run `n_epochs` passes of minibatch gradient steps over the segment

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result, bail, ensure};
use rand::Rng;
use rand::rngs::StdRng;
use tch::nn::OptimizerConfig;
use tch::{Device, Kind, Tensor, nn};
use tracing::{debug, info, warn};

use super::config::TrainConfig;
use super::loss::{compute_entropy_loss, compute_policy_loss, compute_value_loss};
use super::stats::TrainingStats;
use crate::buffer::rollout::gae::advantage_stats;
use crate::buffer::rollout::sampling::Minibatch;
use crate::buffer::rollout::{
    ActOutput, EpisodeStats, SegmentCollector, SegmentPolicy, SegmentTensors, compute_advantages,
    generate_minibatch_indices, normalize_advantages,
};
use crate::dynamics::DynamicsEnsemble;
use crate::env::pool::EnvPool;
use crate::env::{Environment, SpaceInfo, SpaceType};
use crate::features::{AuxBatch, FeatureExtractor, build_extractor, feature_variance};
use crate::policy::MlpPolicy;
use crate::train::checkpoint::{self, CheckpointState};
use crate::utils::normalize::{RewardForwardFilter, RunningMeanStd};
use crate::utils::seeding::RunContext;

/// Variance floor of the observation statistics; keeps the pooled std at or
/// above 0.01
const OBS_RMS_EPSILON: f64 = 1e-4;
const REWARD_RMS_EPSILON: f64 = 1e-8;
/// Random stream for minibatch shuffling and the priming actions
const SHUFFLE_STREAM: u64 = 1;
const DYNAMICS_STREAM: u64 = 2;

/// Lifecycle of a [`PpoOptimizer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerState {
    /// Built, no environments attached
    Idle,
    /// Ready to collect the next segment
    Collecting,
    /// Scoring a collected segment
    ComputingAdvantages,
    /// Running gradient epochs
    Updating,
    /// A step failed; only [`PpoOptimizer::stop_interaction`] is allowed
    Failed,
    /// Environments released
    Stopped,
}

/// What one call to [`PpoOptimizer::step`] produced
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    /// Metrics of the finished update
    pub update: Option<BTreeMap<String, f64>>,
}

/// Per-segment reward means for reporting
#[derive(Debug, Clone, Copy, Default)]
struct RewardSummary {
    int_norm: f64,
    ext: f64,
    total: f64,
}

fn mean_of(rows: &[Vec<f32>]) -> f64 {
    let n: usize = rows.iter().map(Vec::len).sum();
    if n == 0 {
        return 0.0;
    }
    rows.iter().flatten().map(|&x| x as f64).sum::<f64>() / n as f64
}

fn to_vec_f32(t: &Tensor) -> Result<Vec<f32>> {
    Ok(Vec::<f32>::try_from(&t.to_kind(Kind::Float).to_device(Device::Cpu))?)
}

fn to_f64(t: &Tensor) -> Result<f64> {
    Ok(f64::try_from(t)?)
}

/// Normalize a batch of rows and stack them into one [rows, dim] tensor
fn normalized_tensor(rows: &[Vec<f32>], rms: &RunningMeanStd, device: Device) -> Tensor {
    let flat: Vec<f32> = rows.iter().flat_map(|row| rms.normalize_pooled(row)).collect();
    Tensor::from_slice(&flat).view([rows.len() as i64, rms.dim() as i64]).to_device(device)
}

/// Scale gradients so their global L2 norm is at most `max_norm`
///
/// Returns the norm before scaling. Variables whose gradient is undefined
/// (frozen encoders, heads the loss never touched) are skipped.
fn clip_gradients(vs: &nn::VarStore, max_norm: Option<f64>) -> f64 {
    let grads: Vec<Tensor> = vs
        .trainable_variables()
        .iter()
        .map(|v| v.grad())
        .filter(|g| g.defined())
        .collect();

    let total_norm = grads
        .iter()
        .map(|g| f64::try_from(g.square().sum(Kind::Float)).unwrap_or(f64::NAN))
        .sum::<f64>()
        .sqrt();

    if let Some(max_norm) = max_norm
        && total_norm.is_finite()
        && total_norm > max_norm
    {
        let scale = max_norm / (total_norm + 1e-6);
        tch::no_grad(|| {
            for g in &grads {
                let _ = g.shallow_clone().g_mul_scalar_(scale);
            }
        });
    }
    total_norm
}

/// Borrowed view of the networks that the collector drives
struct AgentPolicy<'a> {
    policy: &'a MlpPolicy,
    extractor: &'a dyn FeatureExtractor,
    obs_rms: &'a RunningMeanStd,
    device: Device,
    policy_on_features: bool,
}

impl AgentPolicy<'_> {
    fn input(&self, observations: &[Vec<f32>]) -> Tensor {
        let obs = normalized_tensor(observations, self.obs_rms, self.device);
        if self.policy_on_features { self.extractor.encode(&obs) } else { obs }
    }
}

impl SegmentPolicy for AgentPolicy<'_> {
    fn act(&mut self, observations: &[Vec<f32>]) -> Result<ActOutput> {
        let (actions, log_probs, values) =
            tch::no_grad(|| self.policy.act(&self.input(observations)));
        Ok(ActOutput {
            actions: Vec::<i64>::try_from(&actions.to_device(Device::Cpu))?,
            values: to_vec_f32(&values)?,
            log_probs: to_vec_f32(&log_probs)?,
        })
    }

    fn value(&mut self, observations: &[Vec<f32>]) -> Result<Vec<f32>> {
        let (_, values) = tch::no_grad(|| self.policy.forward(&self.input(observations)));
        to_vec_f32(&values)
    }
}

/// PPO optimizer whose rewards are topped up with the disagreement of a
/// dynamics ensemble
pub struct PpoOptimizer<E: Environment> {
    config: TrainConfig,
    device: Device,
    vs: nn::VarStore,
    policy: MlpPolicy,
    extractor: Box<dyn FeatureExtractor>,
    dynamics: DynamicsEnsemble,
    opt: nn::Optimizer,
    rng: StdRng,
    state: OptimizerState,
    collector: Option<SegmentCollector<E>>,
    obs_space: SpaceInfo,
    num_actions: usize,
    obs_rms: RunningMeanStd,
    int_rms: RunningMeanStd,
    ext_rms: RunningMeanStd,
    int_rff: RewardForwardFilter,
    ext_rff: RewardForwardFilter,
    n_updates: usize,
    restored_stats: Option<EpisodeStats>,
    started_at: Option<(Instant, usize)>,
}

impl<E: Environment> PpoOptimizer<E> {
    /// Build every network for the given spaces
    ///
    /// # Errors
    /// Fails if the configuration is invalid or the action space is not
    /// discrete.
    pub fn new(
        config: TrainConfig,
        ctx: &RunContext,
        observation_space: &SpaceInfo,
        action_space: &SpaceInfo,
    ) -> Result<Self> {
        config.validate()?;
        let num_actions = match action_space.dtype {
            SpaceType::Discrete(n) if n > 0 => n,
            other => bail!(
                "only discrete action spaces are supported, got {:?} with shape {:?}",
                other,
                action_space.shape
            ),
        };
        let obs_dim = observation_space.flat_dim();
        ensure!(obs_dim > 0, "observation space {:?} is empty", observation_space.shape);

        ctx.seed_torch();
        let vs = nn::VarStore::new(ctx.device);
        let root = vs.root();
        let (obs_dim_i, action_dim) = (obs_dim as i64, num_actions as i64);

        let extractor =
            build_extractor(&(&root / "features"), &config.model.features, obs_dim_i, action_dim);
        let feat_dim = extractor.feat_dim();
        let policy_in = if config.model.policy_on_features { feat_dim } else { obs_dim_i };
        let policy =
            MlpPolicy::new(&(&root / "policy"), policy_in, action_dim, &config.model.policy);

        let dyn_in = if config.dynamics.predict_from_pixels { obs_dim_i } else { feat_dim };
        let mut dyn_rng = ctx.rng(DYNAMICS_STREAM);
        let dynamics = DynamicsEnsemble::new(
            &root,
            dyn_in,
            feat_dim,
            action_dim,
            &config.dynamics,
            &mut dyn_rng,
        );

        let opt = nn::Adam::default().build(&vs, config.ppo.learning_rate)?;

        info!(
            obs_dim,
            num_actions,
            feat_learning = %config.model.features.feat_learning,
            feat_dim,
            num_dynamics = dynamics.len(),
            device = ?ctx.device,
            "built disagreement PPO optimizer"
        );

        let gamma = config.ppo.gamma;
        Ok(Self {
            device: ctx.device,
            vs,
            policy,
            extractor,
            dynamics,
            opt,
            rng: ctx.rng(SHUFFLE_STREAM),
            state: OptimizerState::Idle,
            collector: None,
            obs_space: observation_space.clone(),
            num_actions,
            obs_rms: RunningMeanStd::new(obs_dim, OBS_RMS_EPSILON),
            int_rms: RunningMeanStd::new(1, REWARD_RMS_EPSILON),
            ext_rms: RunningMeanStd::new(1, REWARD_RMS_EPSILON),
            int_rff: RewardForwardFilter::new(gamma),
            ext_rff: RewardForwardFilter::new(gamma),
            n_updates: 0,
            restored_stats: None,
            started_at: None,
            config,
        })
    }

    /// Attach an environment pool and start collecting
    ///
    /// Unless statistics were restored from a checkpoint, the observation
    /// normalizer is first primed with `obs_norm_steps` uniformly random
    /// actions.
    pub fn start_interaction(&mut self, mut pool: EnvPool<E>) -> Result<()> {
        ensure!(
            self.state == OptimizerState::Idle,
            "start_interaction called in state {:?}",
            self.state
        );
        ensure!(
            pool.num_envs() == self.config.rollout.num_envs,
            "pool has {} environments but the configuration expects {}",
            pool.num_envs(),
            self.config.rollout.num_envs
        );
        ensure!(
            pool.observation_space() == &self.obs_space,
            "pool observation space {:?} does not match {:?}",
            pool.observation_space(),
            self.obs_space
        );
        ensure!(
            pool.action_space().dtype == SpaceType::Discrete(self.num_actions),
            "pool action space {:?} does not match Discrete({})",
            pool.action_space().dtype,
            self.num_actions
        );

        if self.obs_rms.count() == 0.0 && self.config.rollout.obs_norm_steps > 0 {
            self.prime_observation_stats(&mut pool)?;
        }

        let mut collector = SegmentCollector::new(pool, self.config.rollout.nsteps_per_seg)?;
        if let Some(stats) = self.restored_stats.take() {
            collector.set_stats(stats);
        }
        self.started_at = Some((Instant::now(), collector.stats().tcount));
        self.collector = Some(collector);
        self.state = OptimizerState::Collecting;

        info!(
            num_envs = self.config.rollout.num_envs,
            nsteps_per_seg = self.config.rollout.nsteps_per_seg,
            "started interaction"
        );
        Ok(())
    }

    fn prime_observation_stats(&mut self, pool: &mut EnvPool<E>) -> Result<()> {
        let num_envs = pool.num_envs();
        let steps = self.config.rollout.obs_norm_steps.div_ceil(num_envs);

        let initial = pool.reset_all()?;
        self.obs_rms.update(&initial);
        for _ in 0..steps {
            let actions: Vec<i64> = (0..num_envs)
                .map(|_| self.rng.gen_range(0..self.num_actions as i64))
                .collect();
            let step = pool.step(&actions)?;
            self.obs_rms.update(&step.observations);
        }

        debug!(
            samples = self.obs_rms.count(),
            pooled_std = self.obs_rms.pooled_std(),
            "primed observation statistics"
        );
        Ok(())
    }

    /// Collect one segment and run one PPO update on it
    ///
    /// # Errors
    /// Environment failures and non-finite advantages or losses abort the
    /// step and move the optimizer to [`OptimizerState::Failed`].
    pub fn step(&mut self) -> Result<StepOutput> {
        match self.state {
            OptimizerState::Collecting => {}
            OptimizerState::Idle => bail!("step called before start_interaction"),
            OptimizerState::Stopped => bail!("step called after stop_interaction"),
            OptimizerState::Failed => bail!("a previous step failed; start a fresh run"),
            state => bail!("step called while {state:?}"),
        }

        let result = self.run_update();
        if result.is_err() {
            warn!(phase = ?self.state, n_updates = self.n_updates, "update failed");
            self.state = OptimizerState::Failed;
        }
        result
    }

    fn run_update(&mut self) -> Result<StepOutput> {
        let collector = self.collector.as_mut().context("no environment pool attached")?;
        let mut agent = AgentPolicy {
            policy: &self.policy,
            extractor: self.extractor.as_ref(),
            obs_rms: &self.obs_rms,
            device: self.device,
            policy_on_features: self.config.model.policy_on_features,
        };
        collector.collect_segment(&mut agent)?;

        self.state = OptimizerState::ComputingAdvantages;
        let mut tensors = self.stage_segment()?;
        let int_raw = self.intrinsic_rewards(&tensors)?;
        let ext_raw = collector_ref(&self.collector)?.buffer().ext_rewards().to_vec();
        let (total, rewards) = self.mix_rewards(&int_raw, &ext_raw);

        let ppo = &self.config.ppo;
        let (gamma, gae_lambda, use_news, norm_adv) =
            (ppo.gamma as f32, ppo.gae_lambda as f32, ppo.use_news, ppo.norm_adv);
        let collector = self.collector.as_mut().context("no environment pool attached")?;
        let buffer = collector.buffer_mut();
        buffer.set_int_rewards(int_raw);
        let int_raw_mean = mean_of(buffer.int_rewards());
        compute_advantages(buffer, &total, gamma, gae_lambda, use_news);

        let (adv_mean, adv_std, adv_min, adv_max) = advantage_stats(buffer);
        if !(adv_mean.is_finite() && adv_std.is_finite()) {
            bail!(
                "non-finite advantages (mean={adv_mean} std={adv_std} \
                 min={adv_min} max={adv_max}); reward means int={:.4} ext={:.4}",
                int_raw_mean,
                rewards.ext
            );
        }
        let ret_mean = mean_of(buffer.returns());
        if norm_adv {
            normalize_advantages(buffer);
        }
        tensors.refresh_targets(buffer);

        self.state = OptimizerState::Updating;
        let stats = self.update(&tensors)?;
        self.n_updates += 1;
        self.state = OptimizerState::Collecting;

        let mut metrics = stats.to_metrics();
        metrics.insert("adv/mean".into(), f64::from(adv_mean));
        metrics.insert("adv/std".into(), f64::from(adv_std));
        metrics.insert("ret/mean".into(), ret_mean);
        metrics.insert("rew/int_raw_mean".into(), int_raw_mean);
        metrics.insert("rew/int_norm_mean".into(), rewards.int_norm);
        metrics.insert("rew/ext_mean".into(), rewards.ext);
        metrics.insert("rew/total_mean".into(), rewards.total);
        metrics.insert("int_rms/std".into(), self.int_rms.std()[0]);
        self.add_progress_metrics(&mut metrics)?;

        info!(
            n_updates = self.n_updates,
            tcount = self.tcount(),
            recent_ext_ret = metrics.get("recent_ext_ret").copied().unwrap_or(f64::NAN),
            int_raw = int_raw_mean,
            dyn_loss = stats.dyn_loss,
            "update complete"
        );
        Ok(StepOutput { update: Some(metrics) })
    }

    /// Flatten the collected segment onto the device with normalized
    /// observations
    fn stage_segment(&self) -> Result<SegmentTensors> {
        let buffer = collector_ref(&self.collector)?.buffer();
        let normalize = |steps: &[Vec<Vec<f32>>]| -> Vec<Vec<Vec<f32>>> {
            steps
                .iter()
                .map(|row| row.iter().map(|obs| self.obs_rms.normalize_pooled(obs)).collect())
                .collect()
        };
        SegmentTensors::from_buffer(
            buffer,
            &normalize(buffer.observations()),
            &normalize(buffer.next_observations()),
            self.device,
        )
    }

    /// Raw intrinsic reward per transition, as `[step][env]`
    fn intrinsic_rewards(&self, tensors: &SegmentTensors) -> Result<Vec<Vec<f32>>> {
        let scores = tch::no_grad(|| {
            let inputs = if self.dynamics.predict_from_pixels() {
                tensors.observations.shallow_clone()
            } else {
                self.extractor.encode(&tensors.observations)
            };
            self.dynamics.disagreement(&inputs, &tensors.actions)
        });
        let scores = to_vec_f32(&scores)?;
        if let Some(bad) = scores.iter().position(|r| !r.is_finite()) {
            bail!("non-finite intrinsic reward {} at transition {bad}", scores[bad]);
        }

        let num_envs = self.config.rollout.num_envs;
        Ok(scores.chunks(num_envs).map(<[f32]>::to_vec).collect())
    }

    /// Normalize both reward streams and mix them with their coefficients
    fn mix_rewards(
        &mut self,
        int_raw: &[Vec<f32>],
        ext_raw: &[Vec<f32>],
    ) -> (Vec<Vec<f32>>, RewardSummary) {
        let reward = &self.config.reward;

        let int_rewards = if reward.norm_rew {
            let rffs: Vec<f32> = int_raw.iter().flat_map(|row| self.int_rff.update(row)).collect();
            self.int_rms.update_scalars(&rffs);
            scale_rows(int_raw, &self.int_rms)
        } else {
            int_raw.to_vec()
        };

        let mut ext_rewards = ext_raw.to_vec();
        if reward.clip_ext_rew {
            ext_rewards.iter_mut().flatten().for_each(|r| *r = r.clamp(-1.0, 1.0));
        }
        if reward.norm_ext_rew {
            let rffs: Vec<f32> =
                ext_rewards.iter().flat_map(|row| self.ext_rff.update(row)).collect();
            self.ext_rms.update_scalars(&rffs);
            ext_rewards = scale_rows(&ext_rewards, &self.ext_rms);
        }

        let (ext_coeff, int_coeff) = (reward.ext_coeff as f32, reward.int_coeff as f32);
        let total: Vec<Vec<f32>> = ext_rewards
            .iter()
            .zip(&int_rewards)
            .map(|(ext, int)| {
                ext.iter().zip(int).map(|(&e, &i)| ext_coeff * e + int_coeff * i).collect()
            })
            .collect();

        let summary = RewardSummary {
            int_norm: mean_of(&int_rewards),
            ext: mean_of(ext_raw),
            total: mean_of(&total),
        };
        (total, summary)
    }

    /// `n_epochs` passes of minibatch gradient steps
    fn update(&mut self, tensors: &SegmentTensors) -> Result<TrainingStats> {
        let mut stats_sum = TrainingStats::zeros();
        for epoch in 0..self.config.ppo.n_epochs {
            let n_minibatches = self.config.ppo.n_minibatches;
            let batches = generate_minibatch_indices(tensors.len(), n_minibatches, &mut self.rng);
            for indices in &batches {
                let mb = tensors.select(indices);
                let stats = self
                    .train_minibatch(&mb)
                    .with_context(|| format!("update {} epoch {epoch}", self.n_updates + 1))?;
                stats_sum += &stats;
            }
        }
        Ok(stats_sum.average())
    }

    fn train_minibatch(&mut self, mb: &Minibatch) -> Result<TrainingStats> {
        let ppo = &self.config.ppo;

        let features = self.extractor.encode(&mb.observations);
        let policy_in = if self.config.model.policy_on_features {
            features.shallow_clone()
        } else {
            mb.observations.shallow_clone()
        };
        let (log_probs, entropy, values) = self.policy.evaluate_actions(&policy_in, &mb.actions);

        let (policy_loss, clip_fraction, approx_kl) =
            compute_policy_loss(&log_probs, &mb.old_log_probs, &mb.advantages, ppo.clip_range);
        let (value_loss, explained_var) =
            compute_value_loss(&values, &mb.old_values, &mb.returns, ppo.clip_range_vf);
        let entropy_loss = compute_entropy_loss(&entropy);

        let aux_loss = self.extractor.auxiliary_loss(&AuxBatch {
            observations: &mb.observations,
            next_observations: &mb.next_observations,
            actions: &mb.actions,
        });

        // The ensemble trains on detached features so its loss never shapes
        // the encoder
        let next_features = self.extractor.encode(&mb.next_observations);
        let dyn_inputs = if self.dynamics.predict_from_pixels() {
            mb.observations.shallow_clone()
        } else {
            features.detach()
        };
        let (dyn_loss, _) = self.dynamics.loss(&dyn_inputs, &mb.actions, &next_features);

        let loss = &policy_loss
            + ppo.vf_coef * &value_loss
            + ppo.ent_coef * &entropy_loss
            + &aux_loss
            + &dyn_loss;

        let total_loss = to_f64(&loss)?;
        if !total_loss.is_finite() {
            bail!(
                "non-finite loss {total_loss} \
                 (policy={:.4} value={:.4} aux={:.4} dynamics={:.4}); {}",
                to_f64(&policy_loss)?,
                to_f64(&value_loss)?,
                to_f64(&aux_loss)?,
                to_f64(&dyn_loss)?,
                mb.advantage_summary()
            );
        }

        self.opt.zero_grad();
        loss.backward();
        let grad_norm = clip_gradients(&self.vs, ppo.max_grad_norm);
        if !grad_norm.is_finite() {
            bail!("non-finite gradient norm; {}", mb.advantage_summary());
        }
        self.opt.step();

        Ok(TrainingStats {
            policy_loss: to_f64(&policy_loss)?,
            value_loss: to_f64(&value_loss)?,
            entropy: to_f64(&entropy.mean(Kind::Float))?,
            aux_loss: to_f64(&aux_loss)?,
            dyn_loss: to_f64(&dyn_loss)?,
            total_loss,
            clip_fraction,
            approx_kl,
            explained_var,
            feat_var: to_f64(&feature_variance(&features.detach()))?,
            grad_norm,
            num_updates: 1,
        })
    }

    fn add_progress_metrics(&self, metrics: &mut BTreeMap<String, f64>) -> Result<()> {
        let stats = collector_ref(&self.collector)?.stats();
        metrics.insert("n_updates".into(), self.n_updates as f64);
        metrics.insert("tcount".into(), stats.tcount as f64);
        metrics.insert("n_episodes".into(), stats.episodes as f64);
        if let Some(best) = stats.best_ext_ret {
            metrics.insert("best_ext_ret".into(), best as f64);
        }
        if let Some(ret) = stats.mean_recent_return() {
            metrics.insert("recent_ext_ret".into(), ret);
        }
        if let Some(len) = stats.mean_recent_length() {
            metrics.insert("recent_ep_len".into(), len);
        }
        if let Some(coverage) = stats.coverage {
            metrics.insert("coverage".into(), coverage);
        }
        if let Some((started, tcount0)) = self.started_at {
            let elapsed = started.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                metrics.insert("tps".into(), (stats.tcount - tcount0) as f64 / elapsed);
            }
        }
        Ok(())
    }

    /// Close the environments; further steps are refused
    pub fn stop_interaction(&mut self) -> Result<()> {
        if self.state == OptimizerState::Stopped {
            return Ok(());
        }
        if let Some(collector) = self.collector.take() {
            self.restored_stats = Some(collector.stats().clone());
            collector.into_pool()?;
        }
        self.state = OptimizerState::Stopped;
        info!(n_updates = self.n_updates, tcount = self.tcount(), "stopped interaction");
        Ok(())
    }

    /// Environment steps taken so far, across all environments
    pub fn tcount(&self) -> usize {
        self.episode_stats().map_or(0, |stats| stats.tcount)
    }

    /// Episode counters of the current run
    pub fn episode_stats(&self) -> Option<&EpisodeStats> {
        match &self.collector {
            Some(collector) => Some(collector.stats()),
            None => self.restored_stats.as_ref(),
        }
    }

    pub fn n_updates(&self) -> usize {
        self.n_updates
    }

    pub fn state(&self) -> OptimizerState {
        self.state
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn policy(&self) -> &MlpPolicy {
        &self.policy
    }

    pub fn dynamics(&self) -> &DynamicsEnsemble {
        &self.dynamics
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Observation normalizer
    pub fn obs_rms(&self) -> &RunningMeanStd {
        &self.obs_rms
    }

    /// Intrinsic reward normalizer
    pub fn int_rms(&self) -> &RunningMeanStd {
        &self.int_rms
    }

    /// Write parameters and running statistics to `dir`
    pub fn save_checkpoint(&self, dir: &Path) -> Result<()> {
        ensure!(
            matches!(
                self.state,
                OptimizerState::Idle | OptimizerState::Collecting | OptimizerState::Stopped
            ),
            "cannot checkpoint while {:?}",
            self.state
        );
        let state = CheckpointState {
            version: CheckpointState::format_version(),
            config: self.config.clone(),
            n_updates: self.n_updates,
            episode_stats: self.episode_stats().cloned(),
            obs_rms: self.obs_rms.clone(),
            int_rms: self.int_rms.clone(),
            ext_rms: self.ext_rms.clone(),
            int_rff: self.int_rff.clone(),
            ext_rff: self.ext_rff.clone(),
        };
        checkpoint::save(dir, &self.vs, &state)
    }

    /// Restore parameters and running statistics saved by
    /// [`save_checkpoint`](Self::save_checkpoint)
    ///
    /// Only allowed before [`start_interaction`](Self::start_interaction).
    /// Adam moments are not part of a checkpoint and restart from zero.
    pub fn load_checkpoint(&mut self, dir: &Path) -> Result<()> {
        ensure!(
            self.state == OptimizerState::Idle,
            "checkpoints can only be loaded before start_interaction (state is {:?})",
            self.state
        );
        let state = checkpoint::load(dir, &mut self.vs)?;
        ensure!(
            state.obs_rms.dim() == self.obs_rms.dim(),
            "checkpoint observation statistics have {} dimensions, expected {}",
            state.obs_rms.dim(),
            self.obs_rms.dim()
        );
        if state.config != self.config {
            warn!(path = %dir.display(), "checkpoint was written with a different configuration");
        }

        self.n_updates = state.n_updates;
        self.restored_stats = state.episode_stats;
        self.obs_rms = state.obs_rms;
        self.int_rms = state.int_rms;
        self.ext_rms = state.ext_rms;
        self.int_rff = state.int_rff;
        self.ext_rff = state.ext_rff;
        Ok(())
    }
}

fn collector_ref<E: Environment>(
    collector: &Option<SegmentCollector<E>>,
) -> Result<&SegmentCollector<E>> {
    collector.as_ref().context("no environment pool attached")
}

fn scale_rows(rows: &[Vec<f32>], rms: &RunningMeanStd) -> Vec<Vec<f32>> {
    rows.iter().map(|row| row.iter().map(|&r| rms.scale(r)).collect()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::countdown::Countdown;
    use crate::features::FeatureLearning;

    fn tiny_config() -> TrainConfig {
        let mut config = TrainConfig::default();
        config.rollout.num_envs = 2;
        config.rollout.nsteps_per_seg = 8;
        config.rollout.obs_norm_steps = 16;
        config.ppo.n_minibatches = 2;
        config.ppo.n_epochs = 2;
        config.ppo.max_grad_norm = Some(0.5);
        config.model.policy.hidden_dim = 16;
        config.model.features.feat_dim = 8;
        config.model.features.hidden_dim = 16;
        config.dynamics.num_dynamics = 3;
        config.dynamics.hidden_dim = 16;
        config.dynamics.n_blocks = 1;
        config
    }

    fn countdown_pool(num_envs: usize) -> EnvPool<Countdown> {
        EnvPool::new(|i| Ok(Countdown::new(i, 4)), num_envs, 1).unwrap()
    }

    fn optimizer(config: TrainConfig) -> PpoOptimizer<Countdown> {
        let template = Countdown::new(0, 4);
        PpoOptimizer::new(
            config,
            &RunContext::cpu(7, 0),
            &template.observation_space(),
            &template.action_space(),
        )
        .unwrap()
    }

    #[test]
    fn test_lifecycle() {
        let mut opt = optimizer(tiny_config());
        assert_eq!(opt.state(), OptimizerState::Idle);
        assert!(opt.step().is_err());

        opt.start_interaction(countdown_pool(2)).unwrap();
        assert_eq!(opt.state(), OptimizerState::Collecting);
        assert!(opt.obs_rms().count() > 0.0);

        let out = opt.step().unwrap();
        let metrics = out.update.unwrap();
        assert_eq!(opt.n_updates(), 1);
        assert_eq!(opt.tcount(), 16);
        assert_eq!(metrics["tcount"], 16.0);
        for (name, value) in &metrics {
            assert!(value.is_finite(), "{name} = {value}");
        }
        assert!(metrics["rew/int_raw_mean"] >= 0.0);

        opt.stop_interaction().unwrap();
        assert_eq!(opt.state(), OptimizerState::Stopped);
        assert!(opt.step().is_err());
        assert_eq!(opt.tcount(), 16);
    }

    #[test]
    fn test_environment_failure_aborts_step() {
        let mut config = tiny_config();
        config.rollout.obs_norm_steps = 0;
        let mut opt = optimizer(config);
        let pool = EnvPool::new(|i| Ok(Countdown::new(i, 4).fail_at_step(3)), 2, 1).unwrap();
        opt.start_interaction(pool).unwrap();

        assert!(opt.step().is_err());
        assert_eq!(opt.state(), OptimizerState::Failed);
        assert_eq!(opt.n_updates(), 0);
        assert!(opt.step().is_err());
        opt.stop_interaction().unwrap();
    }

    #[test]
    fn test_non_finite_reward_aborts_step() {
        let mut config = tiny_config();
        config.rollout.obs_norm_steps = 0;
        let mut opt = optimizer(config);
        let pool =
            EnvPool::new(|i| Ok(Countdown::new(i, 4).nan_reward_at_step(2)), 2, 1).unwrap();
        opt.start_interaction(pool).unwrap();

        let err = opt.step().unwrap_err();
        assert!(format!("{err:#}").contains("non-finite advantages"), "{err:#}");
        assert_eq!(opt.state(), OptimizerState::Failed);
        assert_eq!(opt.n_updates(), 0);
        assert!(opt.step().is_err());
        opt.stop_interaction().unwrap();
    }

    #[test]
    fn test_rejects_continuous_actions() {
        let result = PpoOptimizer::<Countdown>::new(
            tiny_config(),
            &RunContext::cpu(0, 0),
            &SpaceInfo::vector(3),
            &SpaceInfo::vector(2),
        );
        let err = result.err().unwrap();
        assert!(err.to_string().contains("discrete"));
    }

    #[test]
    fn test_pool_size_must_match() {
        let mut opt = optimizer(tiny_config());
        assert!(opt.start_interaction(countdown_pool(3)).is_err());
        assert_eq!(opt.state(), OptimizerState::Idle);
    }

    #[test]
    fn test_idf_features_train() {
        let mut config = tiny_config();
        config.model.features.feat_learning = FeatureLearning::Idf;
        config.model.policy_on_features = true;

        let mut opt = optimizer(config);
        opt.start_interaction(countdown_pool(2)).unwrap();
        let metrics = opt.step().unwrap().update.unwrap();
        assert!(metrics["opt/aux_loss"] > 0.0);
        assert!(metrics["opt/grad_norm"].is_finite());
    }

    #[test]
    fn test_reward_mixing() {
        let mut config = tiny_config();
        config.reward.norm_rew = false;
        config.reward.ext_coeff = 2.0;
        config.reward.int_coeff = 0.5;
        let mut opt = optimizer(config);

        let (total, summary) = opt.mix_rewards(&[vec![1.0, 0.0]], &[vec![5.0, -0.25]]);
        // ext clipped to [-1, 1] before mixing
        assert_eq!(total, vec![vec![2.5, -0.5]]);
        assert_eq!(summary.ext, 2.375);
    }

    #[test]
    fn test_intrinsic_rewards_are_divided_not_centered() {
        let mut opt = optimizer(tiny_config());
        let (total, _) = opt.mix_rewards(&[vec![1.0, 3.0]], &[vec![0.0, 0.0]]);
        let std = opt.int_rms().std()[0] as f32;
        assert!((total[0][0] - 1.0 / std).abs() < 1e-5);
        assert!((total[0][1] - 3.0 / std).abs() < 1e-5);
    }

    #[test]
    fn test_clip_gradients_scales_to_max_norm() {
        let vs = nn::VarStore::new(Device::Cpu);
        let w = vs.root().var("w", &[2], nn::Init::Const(0.0));
        let _frozen = vs.root().var("frozen", &[2], nn::Init::Const(0.0)).set_requires_grad(false);

        // d/dw sum(w * [3, 4]) = [3, 4], norm 5
        let target = Tensor::from_slice(&[3.0f32, 4.0]);
        (&w * &target).sum(Kind::Float).backward();

        let norm = clip_gradients(&vs, Some(1.0));
        assert!((norm - 5.0).abs() < 1e-5);
        let clipped = Vec::<f32>::try_from(&w.grad()).unwrap();
        assert!((clipped[0] - 0.6).abs() < 1e-4);
        assert!((clipped[1] - 0.8).abs() < 1e-4);

        assert!((clip_gradients(&vs, None) - 1.0).abs() < 1e-3);
    }
}
