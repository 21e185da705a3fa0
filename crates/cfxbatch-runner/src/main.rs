use cfxbatch_core::{log_error, logging};
use cfxbatch_runner::cli::Cli;
use cfxbatch_runner::run;
use clap::Parser;
use colored::Colorize;
use std::process;

fn main() {
    logging::set_log_level_from_env();

    let cli = Cli::parse();

    if let Some(level) = &cli.log_level {
        match level.parse() {
            Ok(level) => logging::set_log_level(level),
            Err(e) => {
                eprintln!("{}", format!("[ERROR] {}", e).red());
                process::exit(2);
            }
        }
    }

    if let Some(path) = &cli.log_file {
        if let Err(e) = logging::init_logger(path) {
            eprintln!(
                "{}",
                format!("[ERROR] Failed to initialize log file: {}", e).red()
            );
            process::exit(2);
        }
    }

    if let Err(e) = run(cli) {
        let err_msg = format!("[ERROR] {}", e);
        log_error!("{}", err_msg);
        eprintln!("{}", err_msg.red());
        process::exit(1);
    }
}
