use crate::candle_cvae::*;

use candle_core::{Result, Var};
use candle_nn::VarMap;
use std::collections::HashSet;

/// How to adapt a trained conditional VAE to new conditions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurgeryArgs {
    /// number of conditions to append
    pub new_conditions: usize,
    /// keep all but the first layers fixed
    pub freeze: bool,
    /// with `freeze`, also keep the expression/latent input weights fixed
    pub freeze_expression: bool,
    /// set the dropout rate of the extended network to zero
    pub remove_dropout: bool,
}

/// Extend a model by `args.new_conditions` conditions.
///
/// The old model is consumed. Its variables are copied into a fresh
/// `VarMap`, so their values in the extended model start out
/// identical. Condition rows `enc.cond.{k}` and `dec.cond.{k}` for
/// the new indexes are created with Xavier uniform initialization.
///
/// Trainable variables of the extended model:
///
/// | freeze | freeze_expression | trainable |
/// |---|---|---|
/// | false | - | all |
/// | true | false | `enc.fc.0.*`, `dec.fc.0.*`, new condition rows |
/// | true | true | new condition rows |
///
pub fn extend_conditions(model: CvaeModel, args: &SurgeryArgs) -> Result<CvaeModel> {
    let device = model.device().clone();

    let mut config = model.config().clone();
    let old_conditions = config.n_conditions;
    config.n_conditions += args.new_conditions;
    if args.remove_dropout {
        config.dropout_rate = 0.;
    }
    config.freeze_stats = args.freeze;

    let varmap = copy_varmap(model.varmap())?;
    drop(model);

    let mut extended = CvaeModel::from_varmap(config, varmap, None, &device)?;

    let new_rows: Vec<String> = (old_conditions..old_conditions + args.new_conditions)
        .flat_map(|k| [format!("enc.cond.{}", k), format!("dec.cond.{}", k)])
        .collect();

    if args.freeze {
        let all_names = variable_names(extended.varmap())?;
        let mut trainable: HashSet<String> = new_rows.into_iter().collect();
        if !args.freeze_expression {
            trainable.extend(
                all_names
                    .into_iter()
                    .filter(|name| is_first_layer_variable(name)),
            );
        }
        extended.set_trainable(trainable);
    }

    log::debug!(
        "extended {} -> {} conditions, {} trainable variables",
        old_conditions,
        extended.num_conditions(),
        extended.trainable_names().len()
    );

    Ok(extended)
}

fn is_first_layer_variable(name: &str) -> bool {
    name.starts_with("enc.fc.0.") || name.starts_with("dec.fc.0.")
}

/// Deep copy of every variable in `src`
pub fn copy_varmap(src: &VarMap) -> Result<VarMap> {
    let src_data = src
        .data()
        .lock()
        .map_err(|e| candle_core::Error::Msg(e.to_string()))?;

    let dst = VarMap::new();
    {
        let mut dst_data = dst
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        for (name, var) in src_data.iter() {
            let copied = Var::from_tensor(&var.as_tensor().copy()?)?;
            dst_data.insert(name.clone(), copied);
        }
    }
    Ok(dst)
}
