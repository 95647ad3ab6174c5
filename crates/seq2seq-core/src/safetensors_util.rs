use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use memmap2::MmapOptions;
use safetensors::SafeTensors;
use tch::{nn, Kind, Tensor};

/// What a weight import touched, so callers can warn about partial loads.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub unexpected: Vec<String>,
    pub missing: Vec<String>,
}

pub fn load_safetensors<P: AsRef<Path>>(vs: &mut nn::VarStore, path: P) -> Result<LoadReport> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    // SAFETY: the mapping is read-only and dropped before this function returns.
    let buffer = unsafe { MmapOptions::new().map(&file)? };
    let tensors = SafeTensors::deserialize(&buffer)?;

    let mut variables = vs.variables();
    let device = vs.device();
    let mut report = LoadReport::default();

    for (name, view) in tensors.tensors() {
        let Some(var) = variables.get_mut(&name) else {
            report.unexpected.push(name);
            continue;
        };

        let kind = match view.dtype() {
            safetensors::Dtype::F32 => Kind::Float,
            safetensors::Dtype::F16 => Kind::Half,
            safetensors::Dtype::BF16 => Kind::BFloat16,
            other => anyhow::bail!("unsupported dtype {:?} for tensor {}", other, name),
        };
        let shape: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
        if shape != var.size() {
            anyhow::bail!(
                "shape mismatch for {}: checkpoint {:?}, model {:?}",
                name,
                shape,
                var.size()
            );
        }

        let tensor = Tensor::from_data_size(view.data(), &shape, kind)
            .to_kind(var.kind())
            .to_device(device);
        tch::no_grad(|| {
            var.copy_(&tensor);
        });
        report.loaded += 1;
        variables.remove(&name);
    }

    report.missing = variables.into_keys().collect();
    report.missing.sort();
    log::debug!(
        "loaded {} tensors from {} ({} missing, {} unexpected)",
        report.loaded,
        path.display(),
        report.missing.len(),
        report.unexpected.len()
    );
    Ok(report)
}

pub fn save_safetensors<P: AsRef<Path>>(vs: &nn::VarStore, path: P) -> Result<()> {
    let path = path.as_ref();
    let mut named: Vec<(String, Tensor)> = vs
        .variables()
        .into_iter()
        .map(|(name, tensor)| (name, tensor.to_device(tch::Device::Cpu)))
        .collect();
    named.sort_by(|a, b| a.0.cmp(&b.0));

    Tensor::write_safetensors(&named, path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
