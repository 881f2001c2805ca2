//! pwdial: binds an APC Key 25 control surface to PipeWire routing,
//! a midish sequencer, LV2 plugin hosts and shell commands.

mod config;
mod daemon;
mod debounce;
mod device;
mod graph;
mod jalv;
mod midi;
mod midish;
mod proc;
mod prompt;
mod state;

use clap::Parser;
use proc::ProcessFailure;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pwdial", version, about = "MIDI control surface daemon for PipeWire desktops")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "PWDIAL_CONFIG", default_value = "pwdial.yaml")]
    config: String,

    /// Log filter, e.g. "info" or "pwdial=debug"
    #[arg(short, long, env = "PWDIAL_LOG", default_value = "info")]
    log_level: String,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_logging(&args.log_level);

    if let Err(e) = daemon::run(args.config, args.check_config).await {
        error!("{:#}", e);
        // A supervised process dying hands its exit code up.
        let code = e
            .root_cause()
            .downcast_ref::<ProcessFailure>()
            .map(|f| f.code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}
