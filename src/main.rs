use clap::Parser as _;
use climate_modbus_bridge::commands;
use tracing_subscriber::filter::targets::Targets;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

const LOG_VARIABLE: &str = "CLIMATE_BRIDGE_LOG";

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Bridge(commands::bridge::Args),
    Read(commands::read::Args),
    Registers(commands::registers::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn log_filter() -> Targets {
    let description = std::env::var(LOG_VARIABLE).unwrap_or_else(|_| "info".to_string());
    description.parse::<Targets>().unwrap_or_else(|e| {
        eprintln!("warning: ignoring {LOG_VARIABLE}={description:?}: {e}");
        Targets::new().with_default(tracing::Level::INFO)
    })
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(log_filter())
        .init();
    match Commands::parse() {
        Commands::Bridge(args) => end(commands::bridge::run(args).await),
        Commands::Read(args) => end(commands::read::run(args).await),
        Commands::Registers(args) => end(commands::registers::run(args)),
    }
}
