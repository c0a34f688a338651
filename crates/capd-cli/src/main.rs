//! `capd` – the capability lease broker daemon.
//!
//! 1. Parses the command line and loads `/etc/capd/config.toml`.
//! 2. Initialises structured logging (and OTLP export when configured).
//! 3. Builds the registry from the configured capabilities.
//! 4. Claims the bus name, subscribes to `NameOwnerChanged` and installs
//!    the signal bridge.  Any failure here is fatal.
//! 5. Runs the broker task until a shutdown signal and exits with the
//!    signal number.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use capd_kernel::{CapabilityModule, InertModule, PermissionTable, Registry, SystemModule};
use capd_middleware::dbus_adapter::{self, DbusEndpointHost};
use capd_middleware::{BrokerHandle, SystemdNotifier};
use capd_runtime::{BrokerLoop, SignalBridge, init_tracing};
use capd_types::{BrokerError, CapabilityKind};
use clap::Parser;
use tracing::{error, info};

use crate::config::Config;

/// Exit status for any failure before the broker is running.
const EXIT_STARTUP_FAILURE: u8 = 1;

#[derive(Parser, Debug)]
#[command(author, version, about = "Capability lease broker", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", env = "CAPD_CONFIG")]
    config: Option<PathBuf>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let guard = init_tracing("capd");

    let path = config::resolve_path(cli.config.as_deref());
    let cfg = match config::load(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(path = %path.display(), error = %e, "invalid configuration");
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };

    if cli.print_config {
        return match toml::to_string_pretty(&cfg) {
            Ok(raw) => {
                print!("{raw}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "failed to render configuration");
                ExitCode::from(EXIT_STARTUP_FAILURE)
            }
        };
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };

    let code = match runtime.block_on(serve(cfg)) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "broker failed to start");
            i32::from(EXIT_STARTUP_FAILURE)
        }
    };

    drop(runtime);
    drop(guard);
    std::process::exit(code)
}

/// Wire everything together and run the broker to completion.
async fn serve(cfg: Config) -> Result<i32, BrokerError> {
    let registry = build_registry(&cfg);
    let (handle, commands) = BrokerHandle::channel(cfg.command_queue);

    let dbus = cfg.dbus();
    let conn = dbus_adapter::connect(&dbus, handle.clone()).await?;
    let _ownership_feed = dbus_adapter::watch_ownership(&conn, handle.clone()).await?;
    let _signals = SignalBridge::install(handle);

    let notifier = SystemdNotifier;
    notifier.check_supervision();
    let host = Arc::new(DbusEndpointHost::new(conn, &dbus));
    let broker = BrokerLoop::new(registry, host, Arc::new(notifier), commands);
    let code = broker.run().await;
    info!(code, "exiting");
    Ok(code)
}

/// The registry for the configured capabilities and allow list.
fn build_registry(cfg: &Config) -> Registry {
    let policy = PermissionTable::with_defaults(cfg.permissions.allow.iter().copied());
    cfg.capabilities
        .iter()
        .fold(
            Registry::builder(cfg.object_root.as_str()).policy(policy),
            |builder, &kind| builder.register(module_for(kind)),
        )
        .build()
}

fn module_for(kind: CapabilityKind) -> Box<dyn CapabilityModule> {
    match kind {
        CapabilityKind::System => Box::new(SystemModule::new()),
        other => Box::new(InertModule::new(other)),
    }
}
