use crate::cmd_args::{Args, LogFormat};
use log::LevelFilter;
use std::process;
use syslog::{BasicLogger, Facility, Formatter3164};
use tracing_subscriber::EnvFilter;

/// Install the process logger: syslog when a program name is configured,
/// tracing-subscriber on stdout otherwise.
pub fn init(args: &Args, syslog_name: Option<String>) {
    if let Some(process_name) = syslog_name {
        let formatter = Formatter3164 {
            facility: Facility::LOG_USER,
            hostname: None,
            process: process_name,
            pid: process::id(),
        };
        match syslog::unix(formatter) {
            Ok(syslog_logger) => {
                // max level in syslog mode is INFO (performance penalty for DEBUG).
                match log::set_boxed_logger(Box::new(BasicLogger::new(syslog_logger))) {
                    Ok(()) => log::set_max_level(LevelFilter::Info),
                    Err(err) => eprintln!("Could not install syslog logger: {err}"),
                }
                return;
            }
            Err(err) => eprintln!("Could not connect to syslog, logging to stdout: {err}"),
        }
    }

    // Default filter comes from RUST_LOG, the command line level is added on top.
    let filter = EnvFilter::from_default_env().add_directive(args.log_level.into());

    let trace_sub = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!args.no_color);

    match args.log_format {
        LogFormat::Structured => trace_sub.json().init(),
        LogFormat::Debug => trace_sub.pretty().init(),
        LogFormat::Text => trace_sub.init(),
    };
}
