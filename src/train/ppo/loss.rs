//! Loss computation functions for PPO
//!
//! This module contains the core loss computation functions used
//! in PPO training including policy loss, value loss, and entropy loss.

use tch::{Kind, Tensor};

/// Unclipped and clipped surrogate objectives, per sample
///
/// `(ratio * A, clamp(ratio, 1 - eps, 1 + eps) * A)`
pub fn surrogate_terms(ratio: &Tensor, advantages: &Tensor, clip_range: f64) -> (Tensor, Tensor) {
    let unclipped = advantages * ratio;
    let clipped = advantages * ratio.clamp(1.0 - clip_range, 1.0 + clip_range);
    (unclipped, clipped)
}

/// Compute PPO policy loss (clipped surrogate objective)
///
/// # Arguments
///
/// * `log_probs` - Log probabilities of actions under current policy
/// * `old_log_probs` - Log probabilities of actions under old policy
/// * `advantages` - Advantage estimates (already normalized if requested)
/// * `clip_range` - Clipping parameter epsilon
///
/// # Returns
///
/// Returns (policy_loss, clip_fraction, approx_kl) where
/// `approx_kl = 0.5 * mean((log_probs - old_log_probs)^2)`
pub fn compute_policy_loss(
    log_probs: &Tensor,
    old_log_probs: &Tensor,
    advantages: &Tensor,
    clip_range: f64,
) -> (Tensor, f64, f64) {
    // Compute ratio: pi(a|s) / pi_old(a|s)
    let log_ratio = log_probs - old_log_probs;
    let ratio = log_ratio.exp();

    let (surr1, surr2) = surrogate_terms(&ratio, advantages, clip_range);
    let policy_loss = -surr1.minimum(&surr2).mean(Kind::Float);

    // Compute clip fraction (for monitoring)
    let clip_mask = (&ratio - 1.0).abs().gt(clip_range);
    let clip_fraction =
        f64::try_from(clip_mask.to_kind(Kind::Float).mean(Kind::Float)).unwrap_or(0.0);

    let approx_kl =
        f64::try_from((log_ratio.square() * 0.5).mean(Kind::Float)).unwrap_or(f64::NAN);

    (policy_loss, clip_fraction, approx_kl)
}

/// Compute value function loss
///
/// # Arguments
///
/// * `values` - Value predictions from current policy
/// * `old_values` - Value predictions from old policy
/// * `returns` - Value targets
/// * `clip_range_vf` - Optional clipping for value function
///
/// # Returns
///
/// Returns (value_loss, explained_variance)
pub fn compute_value_loss(
    values: &Tensor,
    old_values: &Tensor,
    returns: &Tensor,
    clip_range_vf: Option<f64>,
) -> (Tensor, f64) {
    let value_loss = if let Some(clip_vf) = clip_range_vf {
        let values_clipped = old_values + (values - old_values).clamp(-clip_vf, clip_vf);
        let value_loss_1 = (values - returns).square();
        let value_loss_2 = (&values_clipped - returns).square();
        value_loss_1.max_other(&value_loss_2).mean(Kind::Float)
    } else {
        (values - returns).square().mean(Kind::Float)
    };

    // 1 - Var(returns - values) / Var(returns)
    let returns_var = f64::try_from(returns.var(false)).unwrap_or(0.0);
    let residual_var = f64::try_from((returns - values).var(false)).unwrap_or(0.0);
    let explained_var = if returns_var > 0.0 { 1.0 - residual_var / returns_var } else { 0.0 };

    (value_loss, explained_var)
}

/// Compute entropy bonus
///
/// Negative mean entropy (we want to maximize entropy, so minimize negative)
pub fn compute_entropy_loss(entropy: &Tensor) -> Tensor {
    -entropy.mean(Kind::Float)
}
