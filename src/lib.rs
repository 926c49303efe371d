pub mod anomaly_detection;
pub mod attack_sim;
pub mod can_bus;
pub mod cli;
pub mod config;
pub mod ecu;
pub mod errors;
pub mod features;
pub mod live_ids;
pub mod log_parser;
pub mod model_artifacts;
pub mod network;
pub mod observed;
pub mod security_log;
pub mod simulation;
pub mod status;
pub mod stop;
pub mod types;
pub mod vehicle;

pub use anomaly_detection::{AlertPolicy, AttackLabel, DetectionResult, EnsembleDetector};
pub use can_bus::{BusSender, BusSubscription, Received, VirtualCanBus};
pub use config::TestbedConfig;
pub use errors::{BusError, DataError, SetupError};
pub use features::{FeatureVector, WindowAggregator};
pub use stop::StopSignal;
pub use types::{CanFrame, CanId};
pub use vehicle::{VehicleMode, VehicleModel, VehicleSnapshot};
