/// Ensemble anomaly detection over window features
///
/// Two independently trained scorers look at each standardized feature
/// vector:
/// - a one-class RBF decision boundary (inside / outside)
/// - a bottleneck autoencoder (reconstruction error against a threshold)
///
/// Either one tripping marks the window anomalous. An alert needs a streak
/// of consecutive anomalous windows, and is then classified by traffic
/// volume into an attack family.
use crate::config::DetectorConfig;
use crate::features::FeatureVector;
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of feature columns every model consumes
pub const FEATURE_DIM: usize = 6;

/// Per-column mean/scale normalization fitted at training time
#[derive(Debug, Clone, PartialEq)]
pub struct Standardizer {
    mean: Array1<f64>,
    scale: Array1<f64>,
}

impl Standardizer {
    pub fn new(mean: Vec<f64>, scale: Vec<f64>) -> Result<Self, String> {
        if mean.len() != FEATURE_DIM || scale.len() != FEATURE_DIM {
            return Err(format!(
                "expected {} mean/scale values, got {}/{}",
                FEATURE_DIM,
                mean.len(),
                scale.len()
            ));
        }
        if mean.iter().chain(scale.iter()).any(|v| !v.is_finite()) {
            return Err("mean/scale must be finite".to_string());
        }
        // a constant training column has scale 0; pass it through unscaled
        let scale = scale
            .into_iter()
            .map(|s| if s == 0.0 { 1.0 } else { s })
            .collect::<Vec<_>>();
        Ok(Self {
            mean: Array1::from(mean),
            scale: Array1::from(scale),
        })
    }

    pub fn transform(&self, features: &FeatureVector) -> Array1<f64> {
        let x = Array1::from(features.as_array().to_vec());
        (x - &self.mean) / &self.scale
    }
}

/// One-class boundary scorer
pub trait BoundaryModel: Send {
    /// Signed distance-like score; negative means outside the boundary
    fn decision(&self, z: ArrayView1<f64>) -> f64;

    fn is_outside(&self, z: ArrayView1<f64>) -> bool {
        self.decision(z) < 0.0
    }
}

/// Reconstruction scorer
pub trait ReconstructionModel: Send {
    fn reconstruct(&self, z: ArrayView1<f64>) -> Array1<f64>;

    /// Mean squared reconstruction error
    fn reconstruction_error(&self, z: ArrayView1<f64>) -> f64 {
        let diff = &z - &self.reconstruct(z);
        diff.mapv(|d| d * d).mean().unwrap_or(0.0)
    }
}

/// One-class SVM with an RBF kernel:
/// `decision(z) = sum_i alpha_i * exp(-gamma * |z - sv_i|^2) + intercept`
#[derive(Debug, Clone)]
pub struct RbfOneClassBoundary {
    support_vectors: Array2<f64>,
    dual_coef: Array1<f64>,
    gamma: f64,
    intercept: f64,
}

impl RbfOneClassBoundary {
    pub fn new(
        support_vectors: Array2<f64>,
        dual_coef: Array1<f64>,
        gamma: f64,
        intercept: f64,
    ) -> Result<Self, String> {
        if support_vectors.ncols() != FEATURE_DIM {
            return Err(format!(
                "support vectors have {} columns, expected {}",
                support_vectors.ncols(),
                FEATURE_DIM
            ));
        }
        if support_vectors.nrows() == 0 {
            return Err("no support vectors".to_string());
        }
        if support_vectors.nrows() != dual_coef.len() {
            return Err(format!(
                "{} support vectors but {} dual coefficients",
                support_vectors.nrows(),
                dual_coef.len()
            ));
        }
        if !(gamma.is_finite() && gamma > 0.0) || !intercept.is_finite() {
            return Err(format!("invalid gamma {} / intercept {}", gamma, intercept));
        }
        Ok(Self {
            support_vectors,
            dual_coef,
            gamma,
            intercept,
        })
    }
}

impl BoundaryModel for RbfOneClassBoundary {
    fn decision(&self, z: ArrayView1<f64>) -> f64 {
        let kernel_sum: f64 = self
            .support_vectors
            .outer_iter()
            .zip(self.dual_coef.iter())
            .map(|(sv, alpha)| {
                let dist2: f64 = sv.iter().zip(z.iter()).map(|(a, b)| (a - b).powi(2)).sum();
                alpha * (-self.gamma * dist2).exp()
            })
            .sum();
        kernel_sum + self.intercept
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    Linear,
    Tanh,
    Sigmoid,
}

impl Activation {
    fn apply(&self, v: f64) -> f64 {
        match self {
            Activation::Relu => v.max(0.0),
            Activation::Linear => v,
            Activation::Tanh => v.tanh(),
            Activation::Sigmoid => 1.0 / (1.0 + (-v).exp()),
        }
    }
}

/// Fully connected layer, weights laid out `[inputs, outputs]`
#[derive(Debug, Clone)]
pub struct DenseLayer {
    weights: Array2<f64>,
    bias: Array1<f64>,
    activation: Activation,
}

impl DenseLayer {
    pub fn new(weights: Array2<f64>, bias: Array1<f64>, activation: Activation) -> Result<Self, String> {
        if weights.ncols() != bias.len() {
            return Err(format!(
                "layer has {} outputs but {} bias terms",
                weights.ncols(),
                bias.len()
            ));
        }
        Ok(Self {
            weights,
            bias,
            activation,
        })
    }

    pub fn inputs(&self) -> usize {
        self.weights.nrows()
    }

    pub fn outputs(&self) -> usize {
        self.weights.ncols()
    }

    fn forward(&self, x: ArrayView1<f64>) -> Array1<f64> {
        let activation = self.activation;
        (x.dot(&self.weights) + &self.bias).mapv(|v| activation.apply(v))
    }
}

/// Bottleneck autoencoder (e.g. 6-4-2-4-6)
#[derive(Debug, Clone)]
pub struct DenseAutoencoder {
    layers: Vec<DenseLayer>,
}

impl DenseAutoencoder {
    pub fn new(layers: Vec<DenseLayer>) -> Result<Self, String> {
        let first = layers.first().ok_or("autoencoder has no layers")?;
        if first.inputs() != FEATURE_DIM {
            return Err(format!("first layer takes {} inputs, expected {}", first.inputs(), FEATURE_DIM));
        }
        for (i, pair) in layers.windows(2).enumerate() {
            if pair[0].outputs() != pair[1].inputs() {
                return Err(format!(
                    "layer {} outputs {} but layer {} takes {}",
                    i,
                    pair[0].outputs(),
                    i + 1,
                    pair[1].inputs()
                ));
            }
        }
        let last = layers.last().map(|l| l.outputs()).unwrap_or(0);
        if last != FEATURE_DIM {
            return Err(format!("last layer gives {} outputs, expected {}", last, FEATURE_DIM));
        }
        Ok(Self { layers })
    }

    /// Layer widths, input first
    pub fn shape(&self) -> Vec<usize> {
        let mut shape = vec![FEATURE_DIM];
        shape.extend(self.layers.iter().map(|l| l.outputs()));
        shape
    }
}

impl ReconstructionModel for DenseAutoencoder {
    fn reconstruct(&self, z: ArrayView1<f64>) -> Array1<f64> {
        let mut x = z.to_owned();
        for layer in &self.layers {
            x = layer.forward(x.view());
        }
        x
    }
}

/// Attack family assigned to an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttackLabel {
    None,
    Anomaly,
    Flooding,
    SpoofingOrReplay,
}

impl AttackLabel {
    /// Label text on the alert line
    pub fn as_str(&self) -> &'static str {
        match self {
            AttackLabel::None => "NONE",
            AttackLabel::Anomaly => "ANOMALY",
            AttackLabel::Flooding => "FLOODING / DOS",
            AttackLabel::SpoofingOrReplay => "SPOOFING / REPLAY",
        }
    }

    pub fn from_label(text: &str) -> Option<Self> {
        match text.trim() {
            "NONE" => Some(AttackLabel::None),
            "ANOMALY" => Some(AttackLabel::Anomaly),
            "FLOODING / DOS" => Some(AttackLabel::Flooding),
            "SPOOFING / REPLAY" => Some(AttackLabel::SpoofingOrReplay),
            _ => None,
        }
    }
}

impl fmt::Display for AttackLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which alerts reach the user-facing stream.
///
/// Low-volume `Anomaly` alerts are mostly simulation jitter; the dashboard
/// hides them. Hidden alerts are still reported with `visible == false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertPolicy {
    SuppressWeakAnomaly,
    ShowAll,
}

impl AlertPolicy {
    pub fn is_visible(&self, label: AttackLabel) -> bool {
        match self {
            AlertPolicy::ShowAll => label != AttackLabel::None,
            AlertPolicy::SuppressWeakAnomaly => {
                matches!(label, AttackLabel::Flooding | AttackLabel::SpoofingOrReplay)
            }
        }
    }
}

/// Volume thresholds for attack classification
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassificationThresholds {
    pub high_volume: usize,
    pub min_iat_secs: f64,
    pub moderate_volume: usize,
}

impl Default for ClassificationThresholds {
    fn default() -> Self {
        Self::from(&DetectorConfig::default())
    }
}

impl From<&DetectorConfig> for ClassificationThresholds {
    fn from(config: &DetectorConfig) -> Self {
        Self {
            high_volume: config.high_volume,
            min_iat_secs: config.min_iat_secs,
            moderate_volume: config.moderate_volume,
        }
    }
}

/// Classify an alerting window by its traffic volume.
///
/// A window with fewer than two frames has `iat_mean == 0` and therefore
/// falls under the sub-millisecond rule as well.
pub fn classify(features: &FeatureVector, thresholds: &ClassificationThresholds) -> AttackLabel {
    if features.msg_count > thresholds.high_volume || features.iat_mean < thresholds.min_iat_secs {
        AttackLabel::Flooding
    } else if features.msg_count > thresholds.moderate_volume {
        AttackLabel::SpoofingOrReplay
    } else {
        AttackLabel::Anomaly
    }
}

/// Outcome of scoring one window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    pub boundary_outside: bool,
    pub reconstruction_over: bool,
    pub reconstruction_error: f64,
    pub fused: bool,
    /// Consecutive anomalous windows including this one
    pub streak: u32,
    /// `None` unless this window raised an alert
    pub label: AttackLabel,
    pub alert: bool,
    /// Whether the alert passes the display policy
    pub visible: bool,
    pub msg_count: usize,
}

impl DetectionResult {
    /// `[SVM]` and/or `[AE:<err>]` for the models that tripped
    pub fn tags(&self) -> String {
        let mut tags = String::new();
        if self.boundary_outside {
            tags.push_str("[SVM]");
        }
        if self.reconstruction_over {
            tags.push_str(&format!("[AE:{:.1}]", self.reconstruction_error));
        }
        tags
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DetectorStats {
    pub windows: u64,
    pub anomalous_windows: u64,
    pub alerts: u64,
    pub suppressed_alerts: u64,
}

/// Streaming ensemble detector. One instance per detection run; the streak
/// counter lives here and only the hysteresis rule (or `reset`) changes it.
pub struct EnsembleDetector {
    standardizer: Standardizer,
    boundary: Box<dyn BoundaryModel>,
    reconstruction: Box<dyn ReconstructionModel>,
    threshold: f64,
    alert_streak: u32,
    thresholds: ClassificationThresholds,
    policy: AlertPolicy,
    streak: u32,
    stats: DetectorStats,
}

impl EnsembleDetector {
    pub fn new(
        standardizer: Standardizer,
        boundary: Box<dyn BoundaryModel>,
        reconstruction: Box<dyn ReconstructionModel>,
        threshold: f64,
        config: &DetectorConfig,
        policy: AlertPolicy,
    ) -> Self {
        Self {
            standardizer,
            boundary,
            reconstruction,
            threshold,
            alert_streak: config.alert_streak.max(1),
            thresholds: ClassificationThresholds::from(config),
            policy,
            streak: 0,
            stats: DetectorStats::default(),
        }
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn alert_streak(&self) -> u32 {
        self.alert_streak
    }

    pub fn policy(&self) -> AlertPolicy {
        self.policy
    }

    pub fn stats(&self) -> DetectorStats {
        self.stats
    }

    /// Clear the streak and counters (detector re-initialization)
    pub fn reset(&mut self) {
        self.streak = 0;
        self.stats = DetectorStats::default();
    }

    /// Score one window and apply the hysteresis rule
    pub fn evaluate(&mut self, features: &FeatureVector) -> DetectionResult {
        let z = self.standardizer.transform(features);
        let boundary_outside = self.boundary.is_outside(z.view());
        let reconstruction_error = self.reconstruction.reconstruction_error(z.view());
        let reconstruction_over = reconstruction_error > self.threshold;
        let fused = boundary_outside || reconstruction_over;

        self.stats.windows += 1;
        if fused {
            self.streak = self.streak.saturating_add(1);
            self.stats.anomalous_windows += 1;
        } else {
            self.streak = 0;
        }

        let alert = self.streak >= self.alert_streak;
        let (label, visible) = if alert {
            let label = classify(features, &self.thresholds);
            let visible = self.policy.is_visible(label);
            self.stats.alerts += 1;
            if !visible {
                self.stats.suppressed_alerts += 1;
            }
            (label, visible)
        } else {
            (AttackLabel::None, false)
        };

        DetectionResult {
            boundary_outside,
            reconstruction_over,
            reconstruction_error,
            fused,
            streak: self.streak,
            label,
            alert,
            visible,
            msg_count: features.msg_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    /// Scorers that replay a scripted sequence of verdicts
    struct Scripted {
        outside: std::cell::Cell<usize>,
        script: Vec<bool>,
    }

    impl BoundaryModel for Scripted {
        fn decision(&self, _z: ArrayView1<f64>) -> f64 {
            let i = self.outside.get();
            self.outside.set(i + 1);
            if self.script.get(i).copied().unwrap_or(false) {
                -1.0
            } else {
                1.0
            }
        }
    }

    struct PerfectReconstruction;

    impl ReconstructionModel for PerfectReconstruction {
        fn reconstruct(&self, z: ArrayView1<f64>) -> Array1<f64> {
            z.to_owned()
        }
    }

    fn identity_scaler() -> Standardizer {
        Standardizer::new(vec![0.0; 6], vec![1.0; 6]).unwrap()
    }

    fn scripted_detector(script: Vec<bool>) -> EnsembleDetector {
        EnsembleDetector::new(
            identity_scaler(),
            Box::new(Scripted {
                outside: std::cell::Cell::new(0),
                script,
            }),
            Box::new(PerfectReconstruction),
            1.0,
            &DetectorConfig::default(),
            AlertPolicy::ShowAll,
        )
    }

    fn window(msg_count: usize, iat_mean: f64) -> FeatureVector {
        FeatureVector {
            msg_count,
            unique_ids: 1,
            iat_mean,
            ..FeatureVector::default()
        }
    }

    #[test]
    fn test_standardizer_zero_scale_passthrough() {
        let s = Standardizer::new(vec![1.0; 6], vec![2.0, 0.0, 1.0, 1.0, 1.0, 1.0]).unwrap();
        let fv = FeatureVector {
            msg_count: 5,
            unique_ids: 3,
            ..FeatureVector::default()
        };
        let z = s.transform(&fv);
        assert_eq!(z[0], 2.0);
        assert_eq!(z[1], 2.0);
        assert!(Standardizer::new(vec![0.0; 5], vec![1.0; 6]).is_err());
    }

    #[test]
    fn test_rbf_boundary_radius() {
        // single support vector at the origin: inside iff |z|^2 < 16
        let boundary = RbfOneClassBoundary::new(
            Array2::zeros((1, 6)),
            array![1.0],
            0.05,
            -(-0.8f64).exp(),
        )
        .unwrap();
        let inside = array![2.0, 2.0, 2.0, 0.0, 0.0, 0.0];
        let outside = array![3.0, 3.0, 0.0, 0.0, 0.0, 0.0];
        assert!(!boundary.is_outside(inside.view()));
        assert!(boundary.is_outside(outside.view()));
    }

    #[test]
    fn test_rbf_rejects_mismatched_shapes() {
        assert!(RbfOneClassBoundary::new(Array2::zeros((2, 6)), array![1.0], 0.1, 0.0).is_err());
        assert!(RbfOneClassBoundary::new(Array2::zeros((1, 5)), array![1.0], 0.1, 0.0).is_err());
        assert!(RbfOneClassBoundary::new(Array2::zeros((1, 6)), array![1.0], 0.0, 0.0).is_err());
    }

    #[test]
    fn test_autoencoder_forward_pass() {
        let encoder = DenseLayer::new(Array2::eye(6), Array1::zeros(6), Activation::Relu).unwrap();
        let decoder = DenseLayer::new(Array2::eye(6), Array1::zeros(6), Activation::Linear).unwrap();
        let ae = DenseAutoencoder::new(vec![encoder, decoder]).unwrap();

        // relu drops the negative column, so only it contributes error
        let z = array![1.0, 2.0, -3.0, 0.0, 0.0, 0.0];
        assert_eq!(ae.reconstruct(z.view()), array![1.0, 2.0, 0.0, 0.0, 0.0, 0.0]);
        assert!((ae.reconstruction_error(z.view()) - 1.5).abs() < 1e-12);
        assert_eq!(ae.shape(), vec![6, 6, 6]);
    }

    #[test]
    fn test_autoencoder_shape_validation() {
        let l1 = DenseLayer::new(Array2::zeros((6, 4)), Array1::zeros(4), Activation::Relu).unwrap();
        let l2 = DenseLayer::new(Array2::zeros((2, 6)), Array1::zeros(6), Activation::Linear).unwrap();
        assert!(DenseAutoencoder::new(vec![l1, l2]).is_err());
        assert!(DenseAutoencoder::new(vec![]).is_err());
        assert!(DenseLayer::new(Array2::zeros((6, 4)), Array1::zeros(3), Activation::Relu).is_err());
    }

    #[test]
    fn test_two_anomalous_then_clean_never_alerts() {
        let mut detector = scripted_detector(vec![true, true, false]);
        let results: Vec<_> = (0..3).map(|_| detector.evaluate(&window(9, 0.01))).collect();
        assert_eq!(results.iter().map(|r| r.streak).collect::<Vec<_>>(), vec![1, 2, 0]);
        assert!(results.iter().all(|r| !r.alert));
        assert_eq!(detector.stats().alerts, 0);
    }

    #[test]
    fn test_third_anomalous_window_alerts_once() {
        let mut detector = scripted_detector(vec![true, true, true, false]);
        let results: Vec<_> = (0..4).map(|_| detector.evaluate(&window(150, 0.0005))).collect();
        let alerts: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.alert)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(alerts, vec![2], "alert must fire at the third window only");
        assert_eq!(results[2].label, AttackLabel::Flooding);
        assert_eq!(results[3].label, AttackLabel::None);
    }

    #[test]
    fn test_alert_repeats_while_streak_holds() {
        let mut detector = scripted_detector(vec![true; 5]);
        let alerts = (0..5)
            .filter(|_| detector.evaluate(&window(25, 0.004)).alert)
            .count();
        assert_eq!(alerts, 3);
        detector.reset();
        assert_eq!(detector.streak(), 0);
        assert_eq!(detector.stats(), DetectorStats::default());
    }

    #[test]
    fn test_classification_thresholds() {
        let t = ClassificationThresholds::default();
        assert_eq!(classify(&window(150, 0.0005), &t), AttackLabel::Flooding);
        assert_eq!(classify(&window(50, 0.0008), &t), AttackLabel::Flooding);
        assert_eq!(classify(&window(25, 0.004), &t), AttackLabel::SpoofingOrReplay);
        assert_eq!(classify(&window(9, 0.011), &t), AttackLabel::Anomaly);
        // a lone frame reports zero IAT
        assert_eq!(classify(&window(1, 0.0), &t), AttackLabel::Flooding);
        assert_eq!(classify(&window(3, 0.03), &t), AttackLabel::Anomaly);
        // boundaries are strict
        assert_eq!(classify(&window(100, 0.002), &t), AttackLabel::SpoofingOrReplay);
        assert_eq!(classify(&window(20, 0.002), &t), AttackLabel::Anomaly);
    }

    #[test]
    fn test_suppression_policy_keeps_the_data() {
        let mut detector = EnsembleDetector::new(
            identity_scaler(),
            Box::new(Scripted {
                outside: std::cell::Cell::new(0),
                script: vec![true; 3],
            }),
            Box::new(PerfectReconstruction),
            1.0,
            &DetectorConfig::default(),
            AlertPolicy::SuppressWeakAnomaly,
        );
        let last = (0..3).map(|_| detector.evaluate(&window(9, 0.011))).last().unwrap();
        assert!(last.alert);
        assert_eq!(last.label, AttackLabel::Anomaly);
        assert!(!last.visible);
        assert_eq!(detector.stats().suppressed_alerts, 1);
    }

    #[test]
    fn test_policy_visibility() {
        let suppress = AlertPolicy::SuppressWeakAnomaly;
        assert!(!suppress.is_visible(AttackLabel::Anomaly));
        assert!(suppress.is_visible(AttackLabel::Flooding));
        assert!(suppress.is_visible(AttackLabel::SpoofingOrReplay));
        assert!(AlertPolicy::ShowAll.is_visible(AttackLabel::Anomaly));
        assert!(!AlertPolicy::ShowAll.is_visible(AttackLabel::None));
    }

    #[test]
    fn test_tags_name_the_tripped_models() {
        let result = DetectionResult {
            boundary_outside: true,
            reconstruction_over: true,
            reconstruction_error: 12.345,
            fused: true,
            streak: 3,
            label: AttackLabel::Flooding,
            alert: true,
            visible: true,
            msg_count: 150,
        };
        assert_eq!(result.tags(), "[SVM][AE:12.3]");
    }
}
