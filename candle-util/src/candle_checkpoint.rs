use crate::candle_cvae::{CvaeConfig, CvaeModel};

use candle_core::Device;
use candle_nn::VarMap;
use std::path::Path;

pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const CONFIG_FILE: &str = "config.json";

/// Save the variables and architecture of a model under `dir`:
/// * `model.safetensors`
/// * `config.json`
pub fn save_cvae(model: &CvaeModel, dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    model.varmap().save(dir.join(WEIGHTS_FILE))?;

    let config_json = serde_json::to_string_pretty(model.config())?;
    std::fs::write(dir.join(CONFIG_FILE), config_json)?;

    log::info!("saved model to {}", dir.display());
    Ok(())
}

/// Does `dir` hold a saved model?
pub fn has_checkpoint(dir: &Path) -> bool {
    dir.join(WEIGHTS_FILE).is_file() && dir.join(CONFIG_FILE).is_file()
}

pub fn read_cvae_config(dir: &Path) -> anyhow::Result<CvaeConfig> {
    let text = std::fs::read_to_string(dir.join(CONFIG_FILE))?;
    Ok(serde_json::from_str(&text)?)
}

/// Load a model saved by `save_cvae`; all variables are trainable
pub fn load_cvae(dir: &Path, device: &Device) -> anyhow::Result<CvaeModel> {
    let config = read_cvae_config(dir)?;
    let mut varmap = VarMap::new();
    let model = CvaeModel::from_varmap(config, varmap.clone(), None, device)?;
    varmap.load(dir.join(WEIGHTS_FILE))?;
    log::info!("loaded model from {}", dir.display());
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_cvae::tests::toy_config;
    use crate::candle_loss_functions::LossKind;
    use candle_core::Tensor;

    #[test]
    fn save_and_load_reproduce_latent_means() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;
        let model = CvaeModel::new(toy_config(LossKind::Nb), &device)?;
        assert!(!has_checkpoint(dir.path()));
        save_cvae(&model, dir.path())?;
        assert!(has_checkpoint(dir.path()));

        let loaded = load_cvae(dir.path(), &device)?;
        assert_eq!(loaded.config(), model.config());

        let x = Tensor::ones((3, 10), candle_core::DType::F32, &device)?;
        let c = Tensor::from_vec(vec![0u32, 1, 1], 3, &device)?;
        let z0: Vec<Vec<f32>> = model.latent_mean(&x, &c)?.to_vec2()?;
        let z1: Vec<Vec<f32>> = loaded.latent_mean(&x, &c)?.to_vec2()?;
        assert_eq!(z0, z1);
        Ok(())
    }
}
