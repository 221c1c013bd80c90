//! Model Registry
//!
//! Maps (brand, vehicle) to a persisted artifact at
//! `<root>/<brand folder>/idle_<vehicle>.pkl`. The presence of that file is
//! the only signal that a model exists.

use crate::model::{IdleModel, MODEL_MODE};
use crate::InferenceError;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

const ARTIFACT_EXTENSION: &str = "pkl";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Filesystem-backed model store
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    root: PathBuf,
}

impl ModelRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Folder name for a brand: trimmed, spaces to underscores, lower-cased.
    pub fn brand_folder(brand: &str) -> String {
        brand.trim().replace(' ', "_").to_lowercase()
    }

    /// Expected artifact path for (brand, vehicle)
    pub fn artifact_path(&self, brand: &str, vehicle_id: &str) -> Result<PathBuf, InferenceError> {
        let folder = Self::brand_folder(brand);
        check_component("brand", &folder)?;
        let vehicle = vehicle_id.trim();
        check_component("vehicle id", vehicle)?;

        Ok(self
            .root
            .join(folder)
            .join(format!("{}_{}.{}", MODEL_MODE, vehicle, ARTIFACT_EXTENSION)))
    }

    pub fn exists(&self, brand: &str, vehicle_id: &str) -> Result<bool, InferenceError> {
        Ok(self.artifact_path(brand, vehicle_id)?.is_file())
    }

    /// Load the model for (brand, vehicle); `ModelNotFound` names the expected path.
    pub fn load(&self, brand: &str, vehicle_id: &str) -> Result<IdleModel, InferenceError> {
        let path = self.artifact_path(brand, vehicle_id)?;
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(InferenceError::ModelNotFound { path });
            }
            Err(e) => {
                return Err(InferenceError::Artifact(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        let model = IdleModel::from_bytes(&bytes)?;
        debug!("Loaded model {} ({} bytes)", path.display(), bytes.len());
        Ok(model)
    }

    /// Persist `model`, superseding any previous artifact for the same key.
    ///
    /// The bundle is written beside the target and renamed into place, so a
    /// concurrent `load` sees either the old model or the new one.
    pub fn save(&self, model: &IdleModel) -> Result<PathBuf, InferenceError> {
        let path = self.artifact_path(&model.brand, &model.vehicle_id)?;
        let bytes = model.to_bytes()?;

        let dir = path
            .parent()
            .ok_or_else(|| InferenceError::Artifact(format!("no parent for {}", path.display())))?;
        std::fs::create_dir_all(dir)
            .map_err(|e| InferenceError::Artifact(format!("failed to create {}: {}", dir.display(), e)))?;

        let tmp = dir.join(format!(
            ".{}.{}.{}.tmp",
            model.vehicle_id,
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&tmp, &bytes)
            .map_err(|e| InferenceError::Artifact(format!("failed to write {}: {}", tmp.display(), e)))?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(InferenceError::Artifact(format!(
                "failed to move model into {}: {}",
                path.display(),
                e
            )));
        }

        info!("Saved model {} ({} bytes)", path.display(), bytes.len());
        Ok(path)
    }
}

fn check_component(what: &str, value: &str) -> Result<(), InferenceError> {
    if value.is_empty() {
        return Err(InferenceError::InvalidKey(format!("{} is empty", what)));
    }
    if value.contains('/') || value.contains('\\') || value.contains("..") || value == "." {
        return Err(InferenceError::InvalidKey(format!(
            "{} '{}' is not a valid path component",
            what, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::ForestConfig;
    use chrono::{Duration, Utc};
    use feature_engine::{FeatureWindow, WindowRow};

    fn model(brand: &str, vehicle: &str, rpm: f64) -> IdleModel {
        let t0 = Utc::now();
        let rows = (0..60)
            .map(|i| {
                WindowRow::new(
                    t0 + Duration::seconds(i),
                    [rpm + (i % 4) as f64, 20.0, 0.0, -1.0, 90.0, 13.5],
                )
            })
            .collect();
        let window = FeatureWindow::from_rows(vehicle, rows);
        IdleModel::train(vehicle, brand, &window, &ForestConfig::default()).unwrap()
    }

    #[test]
    fn test_brand_folder() {
        assert_eq!(ModelRegistry::brand_folder("Yamaha NMAX"), "yamaha_nmax");
        assert_eq!(ModelRegistry::brand_folder("  Honda  "), "honda");
    }

    #[test]
    fn test_artifact_path_layout() {
        let registry = ModelRegistry::new("models");
        assert_eq!(
            registry.artifact_path("Yamaha NMAX", "4").unwrap(),
            PathBuf::from("models/yamaha_nmax/idle_4.pkl")
        );
    }

    #[test]
    fn test_rejects_unsafe_keys() {
        let registry = ModelRegistry::new("models");
        for (brand, vehicle) in [("../etc", "4"), ("honda", "a/b"), ("honda", ""), ("", "4"), ("honda", "..\\x")] {
            assert!(
                matches!(registry.artifact_path(brand, vehicle), Err(InferenceError::InvalidKey(_))),
                "{:?}/{:?} accepted",
                brand,
                vehicle
            );
        }
    }

    #[test]
    fn test_missing_model_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path());

        assert!(!registry.exists("Yamaha NMAX", "9").unwrap());
        match registry.load("Yamaha NMAX", "9") {
            Err(InferenceError::ModelNotFound { path }) => {
                assert_eq!(path, dir.path().join("yamaha_nmax").join("idle_9.pkl"));
            }
            other => panic!("expected ModelNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path());
        let trained = model("Yamaha NMAX", "4", 1450.0);

        let path = registry.save(&trained).unwrap();
        assert_eq!(path, dir.path().join("yamaha_nmax/idle_4.pkl"));
        assert!(registry.exists("yamaha nmax", "4").unwrap());
        assert_eq!(registry.load("Yamaha NMAX", "4").unwrap(), trained);
    }

    #[test]
    fn test_retrain_supersedes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path());

        registry.save(&model("honda", "7", 1300.0)).unwrap();
        let newer = model("honda", "7", 1600.0);
        registry.save(&newer).unwrap();

        assert_eq!(registry.load("honda", "7").unwrap().scaler, newer.scaler);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("honda"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_corrupt_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path());
        let path = registry.artifact_path("honda", "3").unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not a model").unwrap();

        assert!(matches!(registry.load("honda", "3"), Err(InferenceError::Artifact(_))));
    }
}
