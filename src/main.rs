use clap::Parser;
use log::error;

use postfach::config::{Config, Options};

fn main() {
    // Initialize the logger
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    // -h and -V exit inside parse(); anything invalid exits non-zero.
    let options = Options::parse();
    let (config, users) = match Config::from_options(&options) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("invalid configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    // One thread drives everything: the listeners, every session and every
    // outbound forward job are local tasks on this runtime.
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("cannot build runtime: {}", e);
            std::process::exit(1);
        }
    };
    let local = tokio::task::LocalSet::new();

    if let Err(e) = local.block_on(&runtime, postfach::run(config, users)) {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }
}
