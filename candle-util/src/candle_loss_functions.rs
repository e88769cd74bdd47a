use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

/// Reconstruction loss of the conditional VAE
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossKind {
    /// squared error on (normalized) expression values
    Mse,
    /// negative binomial on raw counts
    Nb,
}

impl LossKind {
    pub fn name(&self) -> &'static str {
        match self {
            LossKind::Mse => "mse",
            LossKind::Nb => "nb",
        }
    }
}

impl std::fmt::Display for LossKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// KL divergence loss between two Gaussian distributions
///
/// -0.5 * (1 + log(sigma^2) - mu^2 - sigma^2)
///
/// * `z_mean` - mean of Gaussian distribution
/// * `z_lnvar` - log variance of Gaussian distribution
///
pub fn gaussian_kl_loss(z_mean: &Tensor, z_lnvar: &Tensor) -> Result<Tensor> {
    let z_var = z_lnvar.exp()?;
    (z_var - 1. + z_mean.powf(2.)? - z_lnvar)?.sum(z_mean.rank() - 1)? * 0.5
}

/// Gaussian log-likelihood up to a constant
///
/// llik(i) = -0.5 * sum_w [ x(i,w) - xhat(i,w) ]^2
///
/// * `x_nd` - data tensor (observed data)
/// * `hat_nd` - reconstruction
///
pub fn gaussian_likelihood(x_nd: &Tensor, hat_nd: &Tensor) -> Result<Tensor> {
    x_nd.sub(hat_nd)?.powf(2.)?.sum(x_nd.rank() - 1)? * (-0.5)
}

/// Fast lgamma approximation for tensors (Paul Mineiro's fastlgamma).
///
/// ```text
/// lgamma(x) ≈ -2.081061466 - x + 0.0833333/(x+3) - log(x*(1+x)*(2+x)) + (2.5+x)*log(x+3)
/// ```
pub fn lgamma_approx(x: &Tensor) -> Result<Tensor> {
    let x_safe = x.clamp(1e-6f32, f32::MAX)?;

    let x_plus_1 = (&x_safe + 1.0)?;
    let x_plus_2 = (&x_safe + 2.0)?;
    let logterm = ((&x_safe * &x_plus_1)? * &x_plus_2)?.log()?;

    let xp3 = (&x_safe + 3.0)?;
    let recip_term = (xp3.recip()? * 0.0833333)?;
    let mult_term = ((&x_safe + 2.5)? * xp3.log()?)?;

    (((recip_term - 2.081061466)? - &x_safe)? - &logterm)? + &mult_term
}

/// Negative binomial log-likelihood with a gene-specific dispersion
///
/// ```text
/// llik(i) = sum_w lgamma(x + r) - lgamma(r) - lgamma(x + 1)
///                 + r * log(r) + x * log(mu) - (r + x) * log(r + mu)
/// ```
///
/// * `x_nd` - observed counts (n x d)
/// * `mu_nd` - mean (n x d), strictly positive
/// * `log_r_1d` - log-dispersion (1 x d)
///
pub fn negative_binomial_likelihood(
    x_nd: &Tensor,
    mu_nd: &Tensor,
    log_r_1d: &Tensor,
) -> Result<Tensor> {
    let log_r = log_r_1d.clamp(-10.0, 10.0)?;
    let r = log_r.exp()?;

    let x_plus_r = x_nd.broadcast_add(&r)?;
    let r_plus_mu = mu_nd.broadcast_add(&r)?;

    let lgamma_terms = lgamma_approx(&x_plus_r)?
        .broadcast_sub(&lgamma_approx(&r)?)?
        .sub(&lgamma_approx(&(x_nd + 1.0)?)?)?;

    let log_terms = r
        .mul(&log_r)?
        .broadcast_add(&x_nd.mul(&mu_nd.log()?)?)?
        .sub(&x_plus_r.mul(&r_plus_mu.log()?)?)?;

    lgamma_terms.add(&log_terms)?.sum(x_nd.rank() - 1)
}
