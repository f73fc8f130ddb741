use clap::{Parser, ValueEnum};
use tracing::Level;

/// pg_router: PostgreSQL connection pooler with session, transaction and statement pooling.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(default_value_t = String::from("pg_router.toml"), env)]
    pub config_file: String,

    #[arg(short, long, default_value_t = tracing::Level::INFO, env)]
    pub log_level: Level,

    #[clap(short='F', long, value_enum, default_value_t=LogFormat::Text, env)]
    pub log_format: LogFormat,

    #[arg(
        short,
        long,
        default_value_t = false,
        env,
        help = "disable colors in the log output"
    )]
    pub no_color: bool,
}

pub fn parse() -> Args {
    Args::parse()
}

#[derive(ValueEnum, Clone, Debug, PartialEq)]
pub enum LogFormat {
    Text,
    Structured,
    Debug,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags() {
        let args = Args::parse_from(["pg_router", "conf.toml", "-l", "debug", "-F", "structured"]);
        assert_eq!(args.config_file, "conf.toml");
        assert_eq!(args.log_level, Level::DEBUG);
        assert_eq!(args.log_format, LogFormat::Structured);
        assert!(!args.no_color);
    }
}
