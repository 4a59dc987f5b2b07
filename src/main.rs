use std::process::ExitCode;
use std::sync::Arc;

use mimalloc::MiMalloc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rampload::client::{build_client, configure_custom_headers};
use rampload::config::{print_config_help, Config, LogFormat};
use rampload::controller::RunController;
use rampload::metrics::{register_metrics, start_metrics_server};
use rampload::report::{ConsoleReportSink, JsonReportSink, ReportSink};
use rampload::yaml_config::YamlConfig;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Exit status for a run that could not start because its configuration is bad.
const EXIT_CONFIG_ERROR: u8 = 2;

fn init_logging(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .with_current_span(false)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init(),
    }
}

fn config_error(message: impl std::fmt::Display) -> ExitCode {
    eprintln!("Configuration error: {}\n", message);
    print_config_help();
    ExitCode::from(EXIT_CONFIG_ERROR)
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => return config_error(e),
    };
    init_logging(config.log_format);

    let mut yaml = match YamlConfig::from_file(&config.config_file) {
        Ok(y) => y,
        Err(e) => return config_error(e),
    };
    config.apply_overrides(&mut yaml);

    // overrides can change the base URL, so validate again
    if let Err(e) = yaml.validate() {
        return config_error(e);
    }
    let plan = match yaml.to_plan() {
        Ok(p) => p,
        Err(e) => return config_error(e),
    };

    let client_config = Config::to_client_config(&yaml);
    let parsed_headers = match configure_custom_headers(client_config.custom_headers.as_deref()) {
        Ok(h) => h,
        Err(e) => return config_error(e),
    };
    let client = match build_client(&client_config) {
        Ok(c) => c,
        Err(e) => return config_error(e),
    };

    config.print_summary(&plan, &parsed_headers);

    if let Err(e) = register_metrics() {
        warn!(error = %e, "Failed to register Prometheus metrics");
    }
    if let Some(port) = config.metrics_port {
        tokio::spawn(start_metrics_server(port));
    }

    let controller = match RunController::new(plan, Arc::new(client)) {
        Ok(c) => c,
        Err(e) => return config_error(e),
    };

    let shutdown = controller.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, draining virtual users");
            shutdown.shutdown();
        }
    });

    let report = controller.run().await;

    let mut sinks: Vec<Box<dyn ReportSink>> = vec![Box::new(ConsoleReportSink)];
    if let Some(path) = &config.report_json {
        sinks.push(Box::new(JsonReportSink::new(path)));
    }
    for sink in &sinks {
        if let Err(e) = sink.emit(&report) {
            error!(error = %e, "Failed to emit report");
        }
    }

    if report.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
