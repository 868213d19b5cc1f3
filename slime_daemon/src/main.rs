mod slime_daemon;

use log::error;
use std::env;
use std::path::PathBuf;

use crate::slime_daemon::{run_slime_daemon, SlimeDaemonRunOptions, DEFAULT_SLIME_DAEMON_CONFIG_PATH};

fn usage() -> String {
    format!(
        "usage: slime_daemon [--config <path>]\n\
         defaults:\n\
         --config {} (skipped when absent)\n\
         environment overrides:\n\
         SLIME_DB_PATH, SLIME_STORE_URLS, SLIME_REDUNDANCY_NEED, SLIME_REDUNDANCY_TOTAL, SLIME_CACHE_SIZE",
        DEFAULT_SLIME_DAEMON_CONFIG_PATH
    )
}

fn parse_args() -> Result<SlimeDaemonRunOptions, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    let mut config_path = None;

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => return Err(usage()),
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                config_path = Some(PathBuf::from(value));
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    Ok(SlimeDaemonRunOptions { config_path })
}

fn main() {
    env_logger::init();
    let options = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    if let Err(err) = run_slime_daemon(options) {
        error!("run slime_daemon failed: {}", err);
        std::process::exit(1);
    }
}
