use crate::candle_aux_layers::*;
use crate::candle_loss_functions::*;
use crate::candle_model_traits::*;

use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{Linear, Module, ModuleT, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Activation applied to the decoder output
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputActivation {
    Relu,
    Linear,
}

/// Architecture and loss of a conditional VAE
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CvaeConfig {
    pub n_features: usize,
    pub n_conditions: usize,
    pub hidden_layers: Vec<usize>,
    pub z_dim: usize,
    pub dropout_rate: f32,
    pub use_batchnorm: bool,
    pub output_activation: OutputActivation,
    pub loss: LossKind,
    /// element-wise gradient clipping bound
    pub clip_value: f64,
    /// KL weight
    pub alpha: f64,
    /// reconstruction weight
    pub eta: f64,
    /// run batch norm layers in inference mode even while training
    #[serde(default)]
    pub freeze_stats: bool,
}

impl CvaeConfig {
    /// e.g., `[128]` for one hidden layer of width 128
    pub fn architecture_name(&self) -> String {
        let widths: Vec<String> = self.hidden_layers.iter().map(|h| h.to_string()).collect();
        format!("[{}]", widths.join(", "))
    }
}

const MIN_LNVAR: f64 = -8.;
const MAX_LNVAR: f64 = 8.;
const NB_EPS: f64 = 1e-4;

pub struct CvaeEncoder {
    n_features: usize,
    n_latent: usize,
    log_input: bool,
    first: ConditionalDense,
    fc: StackLayers<DenseBlock>,
    z_mean: Linear,
    z_lnvar: Linear,
}

impl CvaeEncoder {
    /// Will create these variables:
    ///
    /// * `enc.fc.0.{weight,bias}` expression input
    /// * `enc.cond.{k}` condition rows
    /// * `enc.bn.{j}.*`, `enc.fc.{j}.*` for the remaining hidden layers
    /// * `enc.z.mean.*`, `enc.z.lnvar.*`
    pub fn new(config: &CvaeConfig, vs: VarBuilder) -> Result<Self> {
        debug_assert!(!config.hidden_layers.is_empty());

        let vs = vs.pp("enc");
        let dense_args = |in_dim: usize, out_dim: usize| DenseArgs {
            in_dim,
            out_dim,
            use_batchnorm: config.use_batchnorm,
            dropout_rate: config.dropout_rate,
            freeze_stats: config.freeze_stats,
        };

        let h0 = config.hidden_layers[0];
        let first = ConditionalDense::new(
            &dense_args(config.n_features, h0),
            config.n_conditions,
            ("fc.0", "cond", "bn.0"),
            vs.clone(),
        )?;

        let mut fc = StackLayers::<DenseBlock>::new();
        let mut prev_dim = h0;
        for (j, &next_dim) in config.hidden_layers.iter().enumerate().skip(1) {
            fc.push(DenseBlock::new(
                &dense_args(prev_dim, next_dim),
                &format!("fc.{}", j),
                &format!("bn.{}", j),
                vs.clone(),
            )?);
            prev_dim = next_dim;
        }

        let z_mean = candle_nn::linear(prev_dim, config.z_dim, vs.pp("z.mean"))?;
        let z_lnvar = candle_nn::linear(prev_dim, config.z_dim, vs.pp("z.lnvar"))?;

        Ok(Self {
            n_features: config.n_features,
            n_latent: config.z_dim,
            log_input: config.loss == LossKind::Nb,
            first,
            fc,
            z_mean,
            z_lnvar,
        })
    }

    ///
    /// z = mu + sigma * eps
    /// where eps ~ N(0, 1)
    fn reparameterize(&self, z_mean: &Tensor, z_lnvar: &Tensor, train: bool) -> Result<Tensor> {
        if train {
            let eps = Tensor::randn_like(z_mean, 0., 1.)?;
            z_mean + (z_lnvar * 0.5)?.exp()? * eps
        } else {
            Ok(z_mean.clone())
        }
    }
}

impl ConditionalEncoderModuleT for CvaeEncoder {
    fn latent_gaussian_params(
        &self,
        x_nd: &Tensor,
        c_n: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        // counts go in on the log scale
        let x_nd = if self.log_input {
            (x_nd + 1.)?.log()?
        } else {
            x_nd.clone()
        };

        let h_nl = self.first.forward_t(&x_nd, c_n, train)?;
        let h_nl = self.fc.forward_t(&h_nl, train)?;
        let z_mean_nk = self.z_mean.forward(&h_nl)?;
        let z_lnvar_nk = self.z_lnvar.forward(&h_nl)?.clamp(MIN_LNVAR, MAX_LNVAR)?;
        Ok((z_mean_nk, z_lnvar_nk))
    }

    fn forward_t(&self, x_nd: &Tensor, c_n: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let (z_mean_nk, z_lnvar_nk) = self.latent_gaussian_params(x_nd, c_n, train)?;
        let z_nk = self.reparameterize(&z_mean_nk, &z_lnvar_nk, train)?;
        Ok((z_nk, gaussian_kl_loss(&z_mean_nk, &z_lnvar_nk)?))
    }

    fn dim_obs(&self) -> usize {
        self.n_features
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }

    fn num_conditions(&self) -> usize {
        self.first.num_conditions()
    }
}

pub struct CvaeDecoder {
    n_features: usize,
    n_latent: usize,
    loss: LossKind,
    output_activation: OutputActivation,
    first: ConditionalDense,
    fc: StackLayers<DenseBlock>,
    out: Linear,
    log_theta: Option<Tensor>,
}

impl CvaeDecoder {
    /// Mirror of the encoder; hidden layers are visited in reverse.
    ///
    /// * `dec.fc.0.*`, `dec.cond.{k}`, `dec.bn.0.*`
    /// * `dec.fc.{j}.*`, `dec.bn.{j}.*`
    /// * `dec.out.*`
    /// * `dec.log_theta` (negative binomial only)
    pub fn new(config: &CvaeConfig, vs: VarBuilder) -> Result<Self> {
        debug_assert!(!config.hidden_layers.is_empty());

        let vs = vs.pp("dec");
        let dense_args = |in_dim: usize, out_dim: usize| DenseArgs {
            in_dim,
            out_dim,
            use_batchnorm: config.use_batchnorm,
            dropout_rate: config.dropout_rate,
            freeze_stats: config.freeze_stats,
        };

        let layers: Vec<usize> = config.hidden_layers.iter().rev().cloned().collect();

        let first = ConditionalDense::new(
            &dense_args(config.z_dim, layers[0]),
            config.n_conditions,
            ("fc.0", "cond", "bn.0"),
            vs.clone(),
        )?;

        let mut fc = StackLayers::<DenseBlock>::new();
        let mut prev_dim = layers[0];
        for (j, &next_dim) in layers.iter().enumerate().skip(1) {
            fc.push(DenseBlock::new(
                &dense_args(prev_dim, next_dim),
                &format!("fc.{}", j),
                &format!("bn.{}", j),
                vs.clone(),
            )?);
            prev_dim = next_dim;
        }

        let out = candle_nn::linear(prev_dim, config.n_features, vs.pp("out"))?;

        let log_theta = match config.loss {
            LossKind::Nb => Some(vs.get_with_hints(
                (1, config.n_features),
                "log_theta",
                candle_nn::Init::Const(0.),
            )?),
            LossKind::Mse => None,
        };

        Ok(Self {
            n_features: config.n_features,
            n_latent: config.z_dim,
            loss: config.loss,
            output_activation: config.output_activation,
            first,
            fc,
            out,
            log_theta,
        })
    }
}

impl ConditionalDecoderModuleT for CvaeDecoder {
    fn forward_t(&self, z_nk: &Tensor, c_n: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.first.forward_t(z_nk, c_n, train)?;
        let h = self.fc.forward_t(&h, train)?;
        let out = self.out.forward(&h)?;
        match (self.loss, self.output_activation) {
            (LossKind::Nb, _) => out.relu()? + NB_EPS,
            (LossKind::Mse, OutputActivation::Relu) => out.relu(),
            (LossKind::Mse, OutputActivation::Linear) => Ok(out),
        }
    }

    fn forward_with_llik(
        &self,
        z_nk: &Tensor,
        c_n: &Tensor,
        x_nd: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let recon_nd = self.forward_t(z_nk, c_n, train)?;
        let llik_n = match &self.log_theta {
            Some(log_theta) => negative_binomial_likelihood(x_nd, &recon_nd, log_theta)?,
            None => gaussian_likelihood(x_nd, &recon_nd)?,
        };
        Ok((recon_nd, llik_n))
    }

    fn dim_obs(&self) -> usize {
        self.n_features
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }

    fn num_conditions(&self) -> usize {
        self.first.num_conditions()
    }
}

/// A conditional VAE that owns its parameters.
///
/// Every model has its own `VarMap`; extending a model copies the
/// variables so the old and new models never share storage.
pub struct CvaeModel {
    config: CvaeConfig,
    varmap: VarMap,
    encoder: CvaeEncoder,
    decoder: CvaeDecoder,
    trainable: HashSet<String>,
    device: Device,
}

impl CvaeModel {
    /// A freshly initialized model; all variables are trainable
    pub fn new(config: CvaeConfig, device: &Device) -> Result<Self> {
        Self::from_varmap(config, VarMap::new(), None, device)
    }

    /// Build the network on top of an existing `VarMap`. Variables
    /// already present are reused as they are; missing ones are
    /// created with their default initialization.
    ///
    /// * `trainable` - names of variables to optimize (`None`: all)
    pub fn from_varmap(
        config: CvaeConfig,
        varmap: VarMap,
        trainable: Option<HashSet<String>>,
        device: &Device,
    ) -> Result<Self> {
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let encoder = CvaeEncoder::new(&config, vs.clone())?;
        let decoder = CvaeDecoder::new(&config, vs)?;

        let trainable = match trainable {
            Some(names) => names,
            None => variable_names(&varmap)?.into_iter().collect(),
        };

        Ok(Self {
            config,
            varmap,
            encoder,
            decoder,
            trainable,
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &CvaeConfig {
        &self.config
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn encoder(&self) -> &CvaeEncoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &CvaeDecoder {
        &self.decoder
    }

    pub fn num_conditions(&self) -> usize {
        self.config.n_conditions
    }

    pub fn trainable_names(&self) -> &HashSet<String> {
        &self.trainable
    }

    /// Restrict optimization to these variables
    pub fn set_trainable(&mut self, names: HashSet<String>) {
        self.trainable = names;
    }

    /// Variables that the optimizer may update, sorted by name
    pub fn trainable_vars(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let mut ret: Vec<(String, Var)> = data
            .iter()
            .filter(|(name, _)| self.trainable.contains(name.as_str()))
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        ret.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(ret)
    }

    /// Per-sample loss `eta * recon + alpha * kl`, averaged over the minibatch
    ///
    /// # Returns `(loss, mean_llik)`
    pub fn loss(&self, x_nd: &Tensor, c_n: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let (z_nk, kl_n) = self.encoder.forward_t(x_nd, c_n, train)?;
        let (_, llik_n) = self.decoder.forward_with_llik(&z_nk, c_n, x_nd, train)?;
        let loss_n = ((llik_n.neg()? * self.config.eta)? + (kl_n * self.config.alpha)?)?;
        Ok((loss_n.mean_all()?, llik_n.mean_all()?))
    }

    /// Latent means; no sampling
    pub fn latent_mean(&self, x_nd: &Tensor, c_n: &Tensor) -> Result<Tensor> {
        let (z_mean_nk, _) = self.encoder.latent_gaussian_params(x_nd, c_n, false)?;
        Ok(z_mean_nk)
    }

    /// Decode the latent means back to the feature space
    pub fn reconstruct(&self, x_nd: &Tensor, c_n: &Tensor) -> Result<Tensor> {
        let z_nk = self.latent_mean(x_nd, c_n)?;
        self.decoder.forward_t(&z_nk, c_n, false)
    }
}

/// All variable names in the map, sorted
pub fn variable_names(varmap: &VarMap) -> Result<Vec<String>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
    let mut names: Vec<String> = data.keys().cloned().collect();
    names.sort();
    Ok(names)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn toy_config(loss: LossKind) -> CvaeConfig {
        CvaeConfig {
            n_features: 10,
            n_conditions: 2,
            hidden_layers: vec![8],
            z_dim: 3,
            dropout_rate: 0.1,
            use_batchnorm: true,
            output_activation: OutputActivation::Relu,
            loss,
            clip_value: 1e6,
            alpha: 1e-5,
            eta: 1.0,
            freeze_stats: false,
        }
    }

    #[test]
    fn architecture_name_matches_layers() {
        let mut config = toy_config(LossKind::Mse);
        assert_eq!(config.architecture_name(), "[8]");
        config.hidden_layers = vec![128, 64];
        assert_eq!(config.architecture_name(), "[128, 64]");
    }

    #[test]
    fn forward_shapes_and_variable_names() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let model = CvaeModel::new(toy_config(LossKind::Nb), &device)?;

        let names = variable_names(model.varmap())?;
        for expected in [
            "enc.fc.0.weight",
            "enc.cond.0",
            "enc.cond.1",
            "enc.z.mean.weight",
            "enc.z.lnvar.weight",
            "dec.fc.0.weight",
            "dec.cond.1",
            "dec.out.weight",
            "dec.log_theta",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {}", expected);
        }
        assert_eq!(model.trainable_names().len(), names.len());

        let x = Tensor::rand(0f32, 5f32, (6, 10), &device)?.floor()?;
        let c = Tensor::from_vec(vec![0u32, 0, 1, 1, 0, 1], 6, &device)?;

        let z = model.latent_mean(&x, &c)?;
        assert_eq!(z.dims(), &[6, 3]);

        let recon = model.reconstruct(&x, &c)?;
        assert_eq!(recon.dims(), &[6, 10]);
        let min_recon = recon.min_all()?.to_scalar::<f32>()?;
        assert!(min_recon > 0.);

        let (loss, _) = model.loss(&x, &c, true)?;
        assert!(loss.to_scalar::<f32>()?.is_finite());
        Ok(())
    }

    #[test]
    fn mse_model_has_no_dispersion() -> anyhow::Result<()> {
        let model = CvaeModel::new(toy_config(LossKind::Mse), &Device::Cpu)?;
        let names = variable_names(model.varmap())?;
        assert!(!names.iter().any(|n| n == "dec.log_theta"));
        Ok(())
    }
}
