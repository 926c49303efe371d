/// Trained-model artifacts
///
/// The detector consumes four read-only JSON files from one directory:
/// - `scaler.json`: per-column mean and scale
/// - `boundary.json`: RBF one-class boundary (support vectors, dual coefficients, gamma, intercept)
/// - `reconstruction.json`: dense autoencoder layers
/// - `threshold.json`: reconstruction-error threshold
///
/// Each carries a `format_version`. Anything missing, unparseable or of the
/// wrong version is a setup error; the run does not start.
use crate::anomaly_detection::{
    Activation, AlertPolicy, DenseAutoencoder, DenseLayer, EnsembleDetector, RbfOneClassBoundary,
    Standardizer,
};
use crate::config::DetectorConfig;
use crate::errors::SetupError;
use ndarray::{Array1, Array2};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

pub const FORMAT_VERSION: &str = "1";

pub const SCALER_FILE: &str = "scaler.json";
pub const BOUNDARY_FILE: &str = "boundary.json";
pub const RECONSTRUCTION_FILE: &str = "reconstruction.json";
pub const THRESHOLD_FILE: &str = "threshold.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalerArtifact {
    pub format_version: String,
    #[serde(default)]
    pub description: Option<String>,
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundaryArtifact {
    pub format_version: String,
    #[serde(default)]
    pub description: Option<String>,
    pub kernel: String,
    pub gamma: f64,
    pub intercept: f64,
    pub support_vectors: Vec<Vec<f64>>,
    pub dual_coef: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerArtifact {
    /// `[inputs][outputs]`
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
    pub activation: Activation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructionArtifact {
    pub format_version: String,
    #[serde(default)]
    pub description: Option<String>,
    pub layers: Vec<LayerArtifact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdArtifact {
    pub format_version: String,
    #[serde(default)]
    pub description: Option<String>,
    pub threshold: f64,
}

/// Everything the detector needs, loaded and validated
pub struct ModelSet {
    pub standardizer: Standardizer,
    pub boundary: RbfOneClassBoundary,
    pub reconstruction: DenseAutoencoder,
    pub threshold: f64,
    /// SHA-256 over the four files, in load order
    pub fingerprint: String,
    pub format_version: String,
}

impl ModelSet {
    /// Load all four artifacts from `dir`
    pub fn load(dir: &Path) -> Result<Self, SetupError> {
        let mut hasher = Sha256::new();

        let scaler: ScalerArtifact = read_artifact(&dir.join(SCALER_FILE), &mut hasher)?;
        let boundary: BoundaryArtifact = read_artifact(&dir.join(BOUNDARY_FILE), &mut hasher)?;
        let reconstruction: ReconstructionArtifact =
            read_artifact(&dir.join(RECONSTRUCTION_FILE), &mut hasher)?;
        let threshold: ThresholdArtifact = read_artifact(&dir.join(THRESHOLD_FILE), &mut hasher)?;

        check_version(&dir.join(SCALER_FILE), &scaler.format_version)?;
        check_version(&dir.join(BOUNDARY_FILE), &boundary.format_version)?;
        check_version(&dir.join(RECONSTRUCTION_FILE), &reconstruction.format_version)?;
        check_version(&dir.join(THRESHOLD_FILE), &threshold.format_version)?;

        let standardizer = Standardizer::new(scaler.mean, scaler.scale)
            .map_err(|reason| invalid(&dir.join(SCALER_FILE), reason))?;
        let boundary = build_boundary(boundary).map_err(|r| invalid(&dir.join(BOUNDARY_FILE), r))?;
        let reconstruction =
            build_autoencoder(reconstruction).map_err(|r| invalid(&dir.join(RECONSTRUCTION_FILE), r))?;
        if !(threshold.threshold.is_finite() && threshold.threshold >= 0.0) {
            return Err(invalid(
                &dir.join(THRESHOLD_FILE),
                format!("threshold {} is not a non-negative number", threshold.threshold),
            ));
        }

        let fingerprint = hex(&hasher.finalize());
        tracing::info!(
            dir = %dir.display(),
            fingerprint = %&fingerprint[..16],
            ae_shape = ?reconstruction.shape(),
            threshold = threshold.threshold,
            "model artifacts loaded"
        );

        Ok(Self {
            standardizer,
            boundary,
            reconstruction,
            threshold: threshold.threshold,
            fingerprint,
            format_version: FORMAT_VERSION.to_string(),
        })
    }

    /// Build the run's detector from these models
    pub fn into_detector(self, config: &DetectorConfig, policy: AlertPolicy) -> EnsembleDetector {
        EnsembleDetector::new(
            self.standardizer,
            Box::new(self.boundary),
            Box::new(self.reconstruction),
            self.threshold,
            config,
            policy,
        )
    }
}

fn invalid(path: &Path, reason: impl Into<String>) -> SetupError {
    SetupError::ArtifactInvalid {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn read_artifact<T: DeserializeOwned>(path: &Path, hasher: &mut Sha256) -> Result<T, SetupError> {
    if !path.exists() {
        return Err(SetupError::ArtifactMissing(path.to_path_buf()));
    }
    let bytes = fs::read(path).map_err(|e| invalid(path, e.to_string()))?;
    hasher.update(&bytes);
    serde_json::from_slice(&bytes).map_err(|e| invalid(path, e.to_string()))
}

fn check_version(path: &Path, found: &str) -> Result<(), SetupError> {
    if found != FORMAT_VERSION {
        return Err(SetupError::ArtifactVersion {
            path: PathBuf::from(path),
            expected: FORMAT_VERSION.to_string(),
            found: found.to_string(),
        });
    }
    Ok(())
}

fn matrix(rows: &[Vec<f64>]) -> Result<Array2<f64>, String> {
    let ncols = rows.first().map(|r| r.len()).unwrap_or(0);
    if rows.iter().any(|r| r.len() != ncols) {
        return Err("ragged matrix".to_string());
    }
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    if flat.iter().any(|v| !v.is_finite()) {
        return Err("matrix contains non-finite values".to_string());
    }
    Array2::from_shape_vec((rows.len(), ncols), flat).map_err(|e| e.to_string())
}

fn build_boundary(artifact: BoundaryArtifact) -> Result<RbfOneClassBoundary, String> {
    if artifact.kernel != "rbf" {
        return Err(format!("unsupported kernel {:?}", artifact.kernel));
    }
    RbfOneClassBoundary::new(
        matrix(&artifact.support_vectors)?,
        Array1::from(artifact.dual_coef),
        artifact.gamma,
        artifact.intercept,
    )
}

fn build_autoencoder(artifact: ReconstructionArtifact) -> Result<DenseAutoencoder, String> {
    let layers = artifact
        .layers
        .into_iter()
        .map(|l| DenseLayer::new(matrix(&l.weights)?, Array1::from(l.bias), l.activation))
        .collect::<Result<Vec<_>, String>>()?;
    DenseAutoencoder::new(layers)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly_detection::{BoundaryModel, ReconstructionModel};
    use ndarray::array;

    fn write(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    fn write_valid_set(dir: &Path) {
        write(
            dir,
            SCALER_FILE,
            r#"{"format_version":"1","mean":[0,0,0,0,0,0],"scale":[1,1,1,1,1,1]}"#,
        );
        write(
            dir,
            BOUNDARY_FILE,
            r#"{"format_version":"1","kernel":"rbf","gamma":0.05,"intercept":-0.449329,
                "support_vectors":[[0,0,0,0,0,0]],"dual_coef":[1.0]}"#,
        );
        write(
            dir,
            RECONSTRUCTION_FILE,
            r#"{"format_version":"1","layers":[
                {"weights":[[0,0],[0,0],[0,0],[0,0],[0,0],[0,0]],"bias":[0,0],"activation":"relu"},
                {"weights":[[0,0,0,0,0,0],[0,0,0,0,0,0]],"bias":[0,0,0,0,0,0],"activation":"linear"}]}"#,
        );
        write(dir, THRESHOLD_FILE, r#"{"format_version":"1","threshold":2.5}"#);
    }

    #[test]
    fn test_load_valid_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        write_valid_set(dir.path());

        let models = ModelSet::load(dir.path()).unwrap();
        assert_eq!(models.threshold, 2.5);
        assert_eq!(models.fingerprint.len(), 64);
        assert_eq!(models.reconstruction.shape(), vec![6, 2, 6]);

        let z = array![1.0, 1.0, 1.0, 1.0, 0.0, 0.0];
        assert!(!models.boundary.is_outside(z.view()));
        assert!((models.reconstruction.reconstruction_error(z.view()) - 4.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        write_valid_set(dir.path());
        let first = ModelSet::load(dir.path()).unwrap().fingerprint;

        write(dir.path(), THRESHOLD_FILE, r#"{"format_version":"1","threshold":3.0}"#);
        let second = ModelSet::load(dir.path()).unwrap().fingerprint;
        assert_ne!(first, second);
    }

    #[test]
    fn test_missing_artifact_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_valid_set(dir.path());
        fs::remove_file(dir.path().join(BOUNDARY_FILE)).unwrap();

        match ModelSet::load(dir.path()) {
            Err(SetupError::ArtifactMissing(path)) => assert!(path.ends_with(BOUNDARY_FILE)),
            other => panic!("expected ArtifactMissing, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_wrong_version_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_valid_set(dir.path());
        write(dir.path(), THRESHOLD_FILE, r#"{"format_version":"2","threshold":2.5}"#);
        assert!(matches!(
            ModelSet::load(dir.path()),
            Err(SetupError::ArtifactVersion { .. })
        ));
    }

    #[test]
    fn test_bad_shapes_are_invalid() {
        let dir = tempfile::tempdir().unwrap();
        write_valid_set(dir.path());
        write(
            dir.path(),
            SCALER_FILE,
            r#"{"format_version":"1","mean":[0,0,0],"scale":[1,1,1]}"#,
        );
        assert!(matches!(
            ModelSet::load(dir.path()),
            Err(SetupError::ArtifactInvalid { .. })
        ));

        write_valid_set(dir.path());
        write(
            dir.path(),
            BOUNDARY_FILE,
            r#"{"format_version":"1","kernel":"poly","gamma":0.05,"intercept":0,
                "support_vectors":[[0,0,0,0,0,0]],"dual_coef":[1.0]}"#,
        );
        assert!(matches!(
            ModelSet::load(dir.path()),
            Err(SetupError::ArtifactInvalid { .. })
        ));
    }

    #[test]
    fn test_matrix_rejects_ragged_rows() {
        assert!(matrix(&[vec![1.0, 2.0], vec![3.0]]).is_err());
        assert_eq!(matrix(&[vec![1.0, 2.0]]).unwrap(), array![[1.0, 2.0]]);
    }
}
