use anyhow::bail;
use clap::{Parser, ValueEnum};
use core::time::Duration;
use users_tonic_core::{StreamMode, StreamOptions};

/// Runtime configuration for the `users-tonic-server` binary.
///
/// These settings control where the server listens and how `StreamUsers`
/// paces its output. All values are parsed from CLI arguments or environment
/// variables (a `.env` file is loaded first), with defaults that reproduce the
/// reference behavior: 100ms between streamed users and the store's read lock
/// held for the whole stream.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "users-tonic-server",
    version,
    about = "A gRPC service for creating, fetching and streaming users"
)]
pub struct CliArgs {
    /// Delay between consecutive users on a `StreamUsers` call, in
    /// milliseconds. `0` sends them back to back.
    ///
    /// Environment variable: `STREAM_PACE_MS`
    #[arg(long, env = "STREAM_PACE_MS", default_value_t = 100)]
    pub stream_pace_ms: u64,

    /// Whether a stream holds the store's read lock until it finishes
    /// (`hold-lock`), or copies the users and releases it straight away
    /// (`snapshot`).
    ///
    /// With `hold-lock`, `CreateUser` calls wait for every in-flight stream.
    ///
    /// Environment variable: `STREAM_MODE`
    #[arg(long, env = "STREAM_MODE", value_enum, default_value = "hold-lock")]
    pub stream_mode: StreamModeArg,

    /// Capacity of the channel between the streaming task and the gRPC
    /// response.
    ///
    /// Environment variable: `STREAM_BUFFER_SIZE`
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = 8)]
    pub stream_buffer_size: usize,

    /// Seconds to wait for in-flight streams to drain on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,

    /// Address to listen on (TCP or Unix socket path; use --uds for Unix socket).
    ///
    /// Example: "0.0.0.0:50051" or "/tmp/users-uds.sock"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be a file path.
    ///
    /// Environment variable: `UDS`
    #[arg(short, long, env = "UDS", default_value_t = false)]
    pub uds: bool,

    /// Console log rendering: `pretty` for humans, `json` for log shippers.
    ///
    /// Environment variable: `LOG_FORMAT`
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "pretty")]
    pub log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StreamModeArg {
    HoldLock,
    Snapshot,
}

impl From<StreamModeArg> for StreamMode {
    fn from(arg: StreamModeArg) -> Self {
        match arg {
            StreamModeArg::HoldLock => StreamMode::HoldLock,
            StreamModeArg::Snapshot => StreamMode::Snapshot,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub stream_options: StreamOptions,
    pub stream_buffer_size: usize,
    pub shutdown_timeout: Duration,
    pub server_addr: String,
    pub uds: bool,
    pub log_format: LogFormat,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.stream_buffer_size == 0 {
            bail!("STREAM_BUFFER_SIZE must be greater than 0");
        }

        if args.server_addr.trim().is_empty() {
            bail!("SERVER_ADDR must not be empty");
        }

        Ok(Self {
            stream_options: StreamOptions {
                pace: Duration::from_millis(args.stream_pace_ms),
                mode: args.stream_mode.into(),
            },
            stream_buffer_size: args.stream_buffer_size,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            server_addr: args.server_addr,
            uds: args.uds,
            log_format: args.log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("users-tonic-server").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn explicit_flags_override_defaults() {
        let config = ServerConfig::try_from(parse(&[
            "--stream-pace-ms",
            "0",
            "--stream-mode",
            "snapshot",
            "--stream-buffer-size",
            "1",
            "--shutdown-timeout",
            "10",
            "--server-addr",
            "/tmp/users.sock",
            "--uds",
            "--log-format",
            "json",
        ]))
        .unwrap();

        assert_eq!(config.stream_options.pace, Duration::ZERO);
        assert_eq!(config.stream_options.mode, StreamMode::Snapshot);
        assert_eq!(config.stream_buffer_size, 1);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.server_addr, "/tmp/users.sock");
        assert!(config.uds);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn every_flag_has_an_env_fallback() {
        use clap::CommandFactory;
        let command = CliArgs::command();
        let uds = command
            .get_arguments()
            .find(|arg| arg.get_id() == "uds")
            .unwrap();
        assert_eq!(uds.get_env().unwrap(), "UDS");
        for arg in command.get_arguments() {
            if matches!(arg.get_id().as_str(), "help" | "version") {
                continue;
            }
            assert!(arg.get_env().is_some(), "--{} has no env var", arg.get_id());
        }
    }

    #[test]
    fn rejects_zero_buffer() {
        let err = ServerConfig::try_from(parse(&["--stream-buffer-size", "0"])).unwrap_err();
        assert!(err.to_string().contains("STREAM_BUFFER_SIZE"));
    }

    #[test]
    fn rejects_blank_address() {
        let err = ServerConfig::try_from(parse(&["--server-addr", " "])).unwrap_err();
        assert!(err.to_string().contains("SERVER_ADDR"));
    }

    #[test]
    fn rejects_unknown_stream_mode() {
        let res = CliArgs::try_parse_from(["users-tonic-server", "--stream-mode", "burst"]);
        assert!(res.is_err());
    }
}
