pub mod attention;
pub mod config;
pub mod layer_norm;
pub mod safetensors_util;
pub mod transformer;

pub use config::ModelConfig;
pub use safetensors_util::{load_safetensors, save_safetensors, LoadReport};
pub use transformer::Seq2SeqTransformer;
