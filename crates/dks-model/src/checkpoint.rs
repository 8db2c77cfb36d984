//! Saving and restoring model parameters as safetensors.

use std::path::Path;

use candle_nn::VarMap;
use dks_core::DksError;

/// Writes every variable of `var_map` to `path`.
///
/// Parent directories are created if missing.
///
/// # Errors
///
/// Returns [`DksError::Io`] if the directory cannot be created and
/// [`DksError::Internal`] if serialization fails.
pub fn save_checkpoint(var_map: &VarMap, path: impl AsRef<Path>) -> Result<(), DksError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    var_map.save(path).map_err(|e| DksError::Internal {
        message: format!("save_checkpoint {}: {e}", path.display()),
    })?;
    tracing::info!(path = %path.display(), "saved checkpoint");
    Ok(())
}

/// Loads weights from `path` into the already-allocated variables of
/// `var_map`. Build the model first, then load.
///
/// # Errors
///
/// Returns [`DksError::Internal`] if the file is unreadable or a variable
/// is missing or has the wrong shape.
pub fn load_checkpoint(var_map: &mut VarMap, path: impl AsRef<Path>) -> Result<(), DksError> {
    let path = path.as_ref();
    var_map.load(path).map_err(|e| DksError::Internal {
        message: format!("load_checkpoint {}: {e}", path.display()),
    })?;
    tracing::info!(path = %path.display(), "loaded checkpoint");
    Ok(())
}
