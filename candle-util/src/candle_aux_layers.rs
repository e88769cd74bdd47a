use candle_core::{Result, Tensor};
use candle_nn::{Activation, BatchNorm, Dropout, Init, Linear, Module, ModuleT, VarBuilder};

/// build a stack of `M` layers applied one after another
pub struct StackLayers<M>
where
    M: ModuleT,
{
    module_layers: Vec<M>,
}

impl<M> ModuleT for StackLayers<M>
where
    M: ModuleT,
{
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = input.clone();
        for module in self.module_layers.iter() {
            x = module.forward_t(&x, train)?;
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: ModuleT,
{
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push(&mut self, layer: M) {
        self.module_layers.push(layer);
    }

    pub fn len(&self) -> usize {
        self.module_layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.module_layers.is_empty()
    }
}

impl<M> Default for StackLayers<M>
where
    M: ModuleT,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Glorot/Xavier uniform initialization, `U(-a, a)` with `a = sqrt(6 / (fan_in + fan_out))`
pub fn xavier_uniform(fan_in: usize, fan_out: usize) -> Init {
    let bound = (6.0 / (fan_in + fan_out).max(1) as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

fn default_bn_config() -> candle_nn::BatchNormConfig {
    candle_nn::BatchNormConfig {
        eps: 1e-4,
        remove_mean: true,
        affine: true,
        momentum: 0.1,
    }
}

pub struct DenseArgs {
    pub in_dim: usize,
    pub out_dim: usize,
    pub use_batchnorm: bool,
    pub dropout_rate: f32,
    /// keep batch-norm statistics fixed in training mode
    pub freeze_stats: bool,
}

/// linear -> (batch norm) -> leaky relu -> dropout
pub struct DenseBlock {
    linear: Linear,
    bn: Option<BatchNorm>,
    activation: Activation,
    dropout: Dropout,
    freeze_stats: bool,
}

impl DenseBlock {
    /// Will create these variables:
    /// * `{fc_name}.weight`, `{fc_name}.bias`
    /// * `{bn_name}.*` if batch norm is used
    pub fn new(args: &DenseArgs, fc_name: &str, bn_name: &str, vs: VarBuilder) -> Result<Self> {
        let linear = candle_nn::linear(args.in_dim, args.out_dim, vs.pp(fc_name))?;
        let bn = if args.use_batchnorm {
            Some(candle_nn::batch_norm(
                args.out_dim,
                default_bn_config(),
                vs.pp(bn_name),
            )?)
        } else {
            None
        };
        Ok(Self {
            linear,
            bn,
            activation: Activation::LeakyRelu(0.01),
            dropout: Dropout::new(args.dropout_rate),
            freeze_stats: args.freeze_stats,
        })
    }
}

impl ModuleT for DenseBlock {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.linear.forward(x)?;
        normalize_activate_dropout(
            &h,
            self.bn.as_ref(),
            &self.activation,
            &self.dropout,
            train && !self.freeze_stats,
            train,
        )
    }
}

/// The first layer of a conditional network:
///
/// `h = W x + b + u[c]` where `u[c]` is a row vector owned by
/// condition `c`, followed by batch norm, activation and dropout.
///
/// Each condition row is a separate variable (`{cond_name}.{k}`), so
/// the parameters specific to one condition can be found by name.
pub struct ConditionalDense {
    linear: Linear,
    condition_rows: Vec<Tensor>,
    bn: Option<BatchNorm>,
    activation: Activation,
    dropout: Dropout,
    freeze_stats: bool,
}

impl ConditionalDense {
    /// Will create these variables:
    /// * `{fc_name}.weight`, `{fc_name}.bias`
    /// * `{cond_name}.{k}` for `k` in `[0, n_conditions)`
    /// * `{bn_name}.*` if batch norm is used
    pub fn new(
        args: &DenseArgs,
        n_conditions: usize,
        names: (&str, &str, &str),
        vs: VarBuilder,
    ) -> Result<Self> {
        let (fc_name, cond_name, bn_name) = names;

        let linear = candle_nn::linear(args.in_dim, args.out_dim, vs.pp(fc_name))?;

        let init = xavier_uniform(n_conditions, args.out_dim);
        let cond_vs = vs.pp(cond_name);
        let condition_rows = (0..n_conditions)
            .map(|k| cond_vs.get_with_hints((1, args.out_dim), &k.to_string(), init))
            .collect::<Result<Vec<_>>>()?;

        let bn = if args.use_batchnorm {
            Some(candle_nn::batch_norm(
                args.out_dim,
                default_bn_config(),
                vs.pp(bn_name),
            )?)
        } else {
            None
        };

        Ok(Self {
            linear,
            condition_rows,
            bn,
            activation: Activation::LeakyRelu(0.01),
            dropout: Dropout::new(args.dropout_rate),
            freeze_stats: args.freeze_stats,
        })
    }

    pub fn num_conditions(&self) -> usize {
        self.condition_rows.len()
    }

    pub fn forward_t(&self, x_nd: &Tensor, c_n: &Tensor, train: bool) -> Result<Tensor> {
        let cond_kh = Tensor::cat(&self.condition_rows, 0)?;
        let h = self
            .linear
            .forward(x_nd)?
            .add(&cond_kh.index_select(c_n, 0)?)?;
        normalize_activate_dropout(
            &h,
            self.bn.as_ref(),
            &self.activation,
            &self.dropout,
            train && !self.freeze_stats,
            train,
        )
    }
}

fn normalize_activate_dropout(
    h: &Tensor,
    bn: Option<&BatchNorm>,
    activation: &Activation,
    dropout: &Dropout,
    bn_train: bool,
    train: bool,
) -> Result<Tensor> {
    let h = match bn {
        Some(bn) => bn.forward_t(h, bn_train)?,
        None => h.clone(),
    };
    let h = activation.forward(&h)?;
    dropout.forward_t(&h, train)
}
