use clap::Parser;
use log::{error, info};
use sas::configuration::{Config, ConfigOverrides};
use sas::controller::Controller;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "sas")]
#[command(version = "0.0.2")]
#[command(about = "Session auditing bastion for interactive terminals")]
struct Args {
    /// Path of the TOML configuration file
    config_file: PathBuf,

    #[arg(long, env = "SAS_BIND_HOST")]
    bind_host: Option<String>,

    /// Terminal port, 0 disables it
    #[arg(long, env = "SAS_SSHD_PORT")]
    sshd_port: Option<u16>,

    /// Web front port, 0 disables it
    #[arg(long, env = "SAS_HTTPD_PORT")]
    httpd_port: Option<u16>,

    #[arg(long, env = "SAS_LOG_DIR")]
    log_dir: Option<String>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            bind_host: self.bind_host.clone(),
            sshd_port: self.sshd_port,
            httpd_port: self.httpd_port,
            log_dir: self.log_dir.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    println!(
        "
==============================================================================
                 sas - session auditing bastion v0.0.2
==============================================================================
"
    );

    info!("Importing configuration");
    let args = Args::parse();

    let mut config = match Config::from_file(&args.config_file) {
        Ok(config) => config,
        Err(e) => {
            error!("Unable to import configuration from file: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = config.apply_overrides(args.overrides()) {
        error!("Invalid command line override: {}", e);
        std::process::exit(1);
    }
    info!("Configuration imported successfully");

    let controller = match Controller::new(config) {
        Ok(controller) => controller,
        Err(e) => {
            error!("Unable to create a controller instance: {}, exiting...", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = controller.run().await {
        error!("Error occured in the controller process: {}, exiting...", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_args_from_command_line() {
        let args = Args::parse_from(["sas", "sas.toml", "--sshd-port", "0", "--log-dir", "/tmp/x"]);
        let overrides = args.overrides();

        assert_eq!(args.config_file, PathBuf::from("sas.toml"));
        assert_eq!(overrides.sshd_port, Some(0));
        assert_eq!(overrides.log_dir.as_deref(), Some("/tmp/x"));
        assert!(overrides.bind_host.is_none());
    }

    #[test]
    #[serial]
    fn test_args_from_environment() {
        std::env::set_var("SAS_HTTPD_PORT", "8081");
        let args = Args::parse_from(["sas", "sas.toml"]);
        std::env::remove_var("SAS_HTTPD_PORT");

        assert_eq!(args.overrides().httpd_port, Some(8081));
    }
}
