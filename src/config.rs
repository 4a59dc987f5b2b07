use std::env;
use std::path::PathBuf;
use thiserror::Error;

use crate::client::{ClientConfig, PoolConfig};
use crate::plan::TestPlan;
use crate::yaml_config::YamlConfig;

pub const DEFAULT_CONFIG_FILE: &str = "loadtest.yaml";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {name}: {reason}")]
    InvalidVar {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Process-level settings read from the environment. Values set here win
/// over the plan file.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub config_file: PathBuf,
    pub base_url: Option<String>,
    pub admin_email: Option<String>,
    pub admin_password: Option<String>,
    pub skip_tls_verify: Option<bool>,
    pub custom_headers: Option<String>,
    pub metrics_port: Option<u16>,
    pub log_format: LogFormat,

    /// Where to write the JSON run report
    pub report_json: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config_file = env::var("CONFIG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));

        let skip_tls_verify = match non_empty("SKIP_TLS_VERIFY") {
            Some(v) => Some(parse_bool("SKIP_TLS_VERIFY", &v)?),
            None => None,
        };

        let metrics_port = match non_empty("METRICS_PORT") {
            Some(v) => Some(v.parse::<u16>().map_err(|e| ConfigError::InvalidVar {
                name: "METRICS_PORT",
                value: v.clone(),
                reason: e.to_string(),
            })?),
            None => None,
        };

        let log_format = match non_empty("LOG_FORMAT").map(|v| v.to_lowercase()) {
            None => LogFormat::Text,
            Some(v) if v == "text" || v == "pretty" => LogFormat::Text,
            Some(v) if v == "json" => LogFormat::Json,
            Some(v) => {
                return Err(ConfigError::InvalidVar {
                    name: "LOG_FORMAT",
                    value: v,
                    reason: "expected 'text' or 'json'".to_string(),
                })
            }
        };

        Ok(Config {
            config_file,
            base_url: non_empty("BASE_URL"),
            admin_email: non_empty("ADMIN_EMAIL"),
            admin_password: non_empty("ADMIN_PASSWORD"),
            skip_tls_verify,
            custom_headers: non_empty("CUSTOM_HEADERS"),
            metrics_port,
            log_format,
            report_json: non_empty("REPORT_JSON").map(PathBuf::from),
        })
    }

    /// Writes environment overrides into a parsed plan file.
    pub fn apply_overrides(&self, yaml: &mut YamlConfig) {
        if let Some(base_url) = &self.base_url {
            yaml.config.base_url = base_url.clone();
        }
        if let Some(email) = &self.admin_email {
            yaml.config
                .credentials
                .insert("admin_email".to_string(), email.clone());
        }
        if let Some(password) = &self.admin_password {
            yaml.config
                .credentials
                .insert("admin_password".to_string(), password.clone());
        }
        if let Some(skip) = self.skip_tls_verify {
            yaml.config.skip_tls_verify = skip;
        }
        if let Some(headers) = &self.custom_headers {
            yaml.config.custom_headers = Some(headers.clone());
        }
    }

    /// Client settings for a plan file with overrides already applied.
    pub fn to_client_config(yaml: &YamlConfig) -> ClientConfig {
        ClientConfig {
            skip_tls_verify: yaml.config.skip_tls_verify,
            custom_headers: yaml.config.custom_headers.clone(),
            pool_config: PoolConfig::default(),
        }
    }

    pub fn print_summary(&self, plan: &TestPlan, parsed_headers: &reqwest::header::HeaderMap) {
        println!("Starting load test: {}", plan.name);
        println!("  Plan file: {}", self.config_file.display());
        println!("  Base URL: {}", plan.base_url);
        println!(
            "  Ramp: {} stages, {:?} total, peak {} VUs",
            plan.profile.stages().len(),
            plan.profile.total_duration(),
            plan.profile.max_target()
        );
        for stage in plan.profile.stages() {
            println!("    {:>8?} -> {} VUs", stage.duration, stage.target);
        }
        println!("  Scenarios:");
        let total: f64 = plan.scenarios.iter().map(|s| s.weight).sum();
        for scenario in &plan.scenarios {
            let share = if total > 0.0 { scenario.weight / total * 100.0 } else { 0.0 };
            println!(
                "    {:<32} {:>5.1}%  ({} steps)",
                scenario.name,
                share,
                scenario.steps.len()
            );
        }
        println!("  Thresholds:");
        for threshold in &plan.thresholds {
            let abort = if threshold.abort_on_fail { " [abortOnFail]" } else { "" };
            println!("    {}{}", threshold, abort);
        }
        println!("  Graceful stop: {:?}", plan.settings.graceful_stop);

        if parsed_headers.is_empty() {
            println!("  Custom Headers Enabled: No");
        } else {
            println!("  Custom Headers Enabled: Yes");
            for (name, value) in parsed_headers.iter() {
                println!(
                    "    {}: {}",
                    name,
                    value.to_str().unwrap_or("<non-ASCII or sensitive value>")
                );
            }
        }

        match self.metrics_port {
            Some(port) => println!("  Metrics endpoint: http://0.0.0.0:{}/metrics", port),
            None => println!("  Metrics endpoint: disabled (METRICS_PORT not set)"),
        }
    }
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidVar {
            name,
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

/// Environment variables understood by the binary, for `--help` style output.
pub fn print_config_help() {
    eprintln!("Environment variables:");
    eprintln!("  CONFIG_FILE      - Path to the YAML test plan (default: {})", DEFAULT_CONFIG_FILE);
    eprintln!("  BASE_URL         - Override config.baseUrl");
    eprintln!("  ADMIN_EMAIL      - Override the admin_email credential");
    eprintln!("  ADMIN_PASSWORD   - Override the admin_password credential");
    eprintln!("  SKIP_TLS_VERIFY  - Skip TLS certificate verification (true/false)");
    eprintln!("  CUSTOM_HEADERS   - Comma-separated headers (use \\, for literal commas)");
    eprintln!("  METRICS_PORT     - Serve Prometheus metrics on this port");
    eprintln!("  METRIC_NAMESPACE - Prometheus metric namespace (default: rampload)");
    eprintln!("  LOG_FORMAT       - text or json (default: text)");
    eprintln!("  REPORT_JSON      - Write the final report as JSON to this path");
    eprintln!("  RUST_LOG         - Log filter (default: info)");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("X", "TRUE"), Ok(true));
        assert_eq!(parse_bool("X", "0"), Ok(false));
        assert!(parse_bool("X", "maybe").is_err());
    }

    #[test]
    fn test_overrides_apply_to_yaml() {
        let mut yaml = YamlConfig::from_str(
            r#"
version: "1.0"
config:
  baseUrl: "http://localhost:8080"
  credentials:
    admin_email: "admin@distrischool.com"
stages:
  - duration: 10s
    target: 1
scenarios:
  - name: health
    steps:
      - request: { method: GET, path: /api/health }
"#,
        )
        .unwrap();

        let config = Config {
            config_file: PathBuf::from("plan.yaml"),
            base_url: Some("https://staging.example.com".to_string()),
            admin_email: None,
            admin_password: Some("s3cret".to_string()),
            skip_tls_verify: Some(true),
            custom_headers: None,
            metrics_port: None,
            log_format: LogFormat::Text,
            report_json: None,
        };
        config.apply_overrides(&mut yaml);

        assert_eq!(yaml.config.base_url, "https://staging.example.com");
        assert_eq!(yaml.config.credentials["admin_email"], "admin@distrischool.com");
        assert_eq!(yaml.config.credentials["admin_password"], "s3cret");
        assert!(Config::to_client_config(&yaml).skip_tls_verify);
    }
}
