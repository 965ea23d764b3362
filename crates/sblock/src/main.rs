mod cmd;
mod domains;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "sblock", version, about = "Shared-memory block transport CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_loopback_subcommand() {
        let cli = Cli::try_parse_from([
            "sblock",
            "loopback",
            "--count",
            "100",
            "--batch",
            "8",
            "--block-size",
            "512",
        ])
        .expect("loopback args should parse");

        let Command::Loopback(args) = cli.command else {
            panic!("expected loopback");
        };
        assert_eq!(args.count, 100);
        assert_eq!(args.batch, 8);
        assert_eq!(args.block_size, 512);
    }

    #[test]
    fn rejects_zero_batch() {
        let err = Cli::try_parse_from(["sblock", "loopback", "--batch", "0"])
            .expect_err("zero batch should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn parses_recover_subcommand() {
        let cli = Cli::try_parse_from(["sblock", "recover", "--hold", "1", "--in-flight", "3"])
            .expect("recover args should parse");
        assert!(matches!(cli.command, Command::Recover(_)));
    }

    #[test]
    fn format_is_global() {
        let cli = Cli::try_parse_from(["sblock", "dump", "--format", "json", "--shared"])
            .expect("dump args should parse");
        assert!(matches!(cli.format, Some(OutputFormat::Json)));
        assert!(matches!(cli.command, Command::Dump(_)));
    }
}
