use candle_core::{Result, Tensor};

pub trait ConditionalEncoderModuleT {
    /// An encoder that spits out Gaussian latent parameters given
    /// the condition of each sample
    ///
    /// # Arguments
    /// * `x_nd` - input data (n x d)
    /// * `c_n` - condition index of each sample (n), u32
    /// * `train` - whether to use dropout/batchnorm or not
    ///
    /// # Returns `(z_mean_nk, z_lnvar_nk)`
    fn latent_gaussian_params(
        &self,
        x_nd: &Tensor,
        c_n: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor)>;

    /// An encoder that spits out two results (latent inference, KL loss)
    ///
    /// # Returns `(z_nk, kl_loss_n)`
    fn forward_t(&self, x_nd: &Tensor, c_n: &Tensor, train: bool) -> Result<(Tensor, Tensor)>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;

    fn num_conditions(&self) -> usize;
}

pub trait ConditionalDecoderModuleT {
    /// A decoder that spits out reconstruction
    fn forward_t(&self, z_nk: &Tensor, c_n: &Tensor, train: bool) -> Result<Tensor>;

    /// A decoder that spits out reconstruction and log-likelihood
    /// * `z_nk` - latent states
    /// * `c_n` - condition index of each sample
    /// * `x_nd` - observed data to validate with
    fn forward_with_llik(
        &self,
        z_nk: &Tensor,
        c_n: &Tensor,
        x_nd: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor)>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;

    fn num_conditions(&self) -> usize;
}
