use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use tch::{Device, TchError, Tensor};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LoadSafetensorsError {
    #[error("safetensors file {0} does not exist")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: TchError,
    },

    #[error("duplicate tensor {0} in safetensors file")]
    Duplicate(String),
}

#[derive(Debug, Error)]
pub enum SaveSafetensorsError {
    #[error("refusing to write an empty safetensors file to {0}")]
    Empty(PathBuf),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: TchError,
    },
}

/// Reads every tensor from a safetensors file onto `device`, keyed by name.
pub fn load_safetensors(
    path: &Path,
    device: Device,
) -> Result<BTreeMap<String, Tensor>, LoadSafetensorsError> {
    if !path.exists() {
        return Err(LoadSafetensorsError::NotFound(path.to_path_buf()));
    }
    let tensors =
        Tensor::read_safetensors(path).map_err(|source| LoadSafetensorsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    let mut loaded = BTreeMap::new();
    for (name, tensor) in tensors {
        let tensor = tensor.to_device(device);
        if loaded.insert(name.clone(), tensor).is_some() {
            return Err(LoadSafetensorsError::Duplicate(name));
        }
    }
    debug!(path = %path.display(), tensors = loaded.len(), "loaded safetensors");
    Ok(loaded)
}

/// Writes `tensors` to `path`. Tensors are moved to CPU and made contiguous first.
pub fn save_tensors_into_safetensors(
    tensors: &BTreeMap<String, Tensor>,
    path: &Path,
) -> Result<(), SaveSafetensorsError> {
    if tensors.is_empty() {
        return Err(SaveSafetensorsError::Empty(path.to_path_buf()));
    }
    let host: Vec<(&str, Tensor)> = tensors
        .iter()
        .map(|(name, t)| (name.as_str(), t.to_device(Device::Cpu).contiguous()))
        .collect();
    Tensor::write_safetensors(&host, path).map_err(|source| SaveSafetensorsError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), tensors = host.len(), "saved safetensors");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    #[test]
    fn test_save_then_load() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("weights.safetensors");
        let tensors = BTreeMap::from([
            (
                "a".to_string(),
                Tensor::arange(6, (Kind::Float, Device::Cpu)).reshape([2, 3]),
            ),
            (
                "b".to_string(),
                Tensor::arange(6, (Kind::Float, Device::Cpu))
                    .reshape([2, 3])
                    .tr(),
            ),
        ]);
        save_tensors_into_safetensors(&tensors, &path)?;
        let loaded = load_safetensors(&path, Device::Cpu)?;
        assert_eq!(loaded.len(), 2);
        for (name, tensor) in &tensors {
            assert!(loaded[name].equal(tensor));
        }
        Ok(())
    }

    #[test]
    fn test_missing_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.safetensors");
        assert!(matches!(
            load_safetensors(&path, Device::Cpu),
            Err(LoadSafetensorsError::NotFound(_))
        ));
        assert!(matches!(
            save_tensors_into_safetensors(&BTreeMap::new(), &path),
            Err(SaveSafetensorsError::Empty(_))
        ));
    }
}
