pub struct TrainConfig {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub num_epochs: usize,
    /// linear learning-rate warmup; no early stopping meanwhile
    pub num_warmup_epochs: usize,
    /// stop after this many epochs without validation improvement
    pub early_stop_limit: Option<usize>,
    /// shrink the learning rate after this many stagnant epochs
    pub lr_reducer: Option<usize>,
    pub lr_reduce_factor: f64,
    pub device: candle_core::Device,
    pub verbose: bool,
    pub show_progress: bool,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            batch_size: 128,
            num_epochs: 100,
            num_warmup_epochs: 0,
            early_stop_limit: None,
            lr_reducer: None,
            lr_reduce_factor: 0.1,
            device: candle_core::Device::Cpu,
            verbose: false,
            show_progress: true,
            seed: 0,
        }
    }
}
