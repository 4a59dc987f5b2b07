pub mod checks;
pub mod client;
pub mod clock;
pub mod collector;
pub mod config;
pub mod config_validation;
pub mod controller;
pub mod engine;
pub mod errors;
pub mod extractor;
pub mod metrics;
pub mod percentiles;
pub mod plan;
pub mod ramp;
pub mod report;
pub mod scenario;
pub mod scheduler;
pub mod selector;
pub mod thresholds;
pub mod utils;
pub mod yaml_config;
