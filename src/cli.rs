use clap::{ArgAction, Parser};
use std::ffi::OsString;

use crate::tunnel::RelayProtocol;

#[derive(Parser, Debug)]
#[command(name = "abacate")]
#[command(
    author,
    version,
    about = "Expose your local server to the internet to receive webhooks"
)]
pub struct Cli {
    /// URL of the local server requests are forwarded to
    #[arg(short, long, env = "ABACATE_TARGET")]
    pub target: Option<String>,

    /// Use the logger [default: true]
    #[arg(short, long, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub logger: Option<bool>,

    /// Prefix log lines with "🥑Abacate CLI" (short: -lp) [default: true]
    #[arg(long = "log_prefix", action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub log_prefix: Option<bool>,

    /// Include the time in the log prefix (short: -lt) [default: true]
    #[arg(long = "log_time", action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub log_time: Option<bool>,

    /// Local port the listener binds and the tunnel announces [default: 8954]
    #[arg(long)]
    pub port: Option<u16>,

    /// Relay server URL [default: https://localtunnel.me]
    #[arg(long, env = "ABACATE_RELAY_HOST")]
    pub host: Option<String>,

    /// Request a specific public subdomain (auto-assigned when omitted)
    #[arg(short, long)]
    pub subdomain: Option<String>,

    /// Relay protocol [default: localtunnel]
    #[arg(long, value_enum)]
    pub protocol: Option<RelayProtocol>,

    /// Reject invalid TLS certificates from an https target
    #[arg(long)]
    pub strict_cert: bool,

    /// Seconds to wait for the target before answering 504 [default: 30]
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Maximum number of requests forwarded at once [default: 100]
    #[arg(long)]
    pub max_in_flight: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Rewrite the two-letter short flags `-lp` and `-lt` to their long forms,
/// since clap short flags are single characters.
pub fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| {
            let Some(text) = arg.to_str() else {
                return arg;
            };
            for (short, long) in [("-lp", "--log_prefix"), ("-lt", "--log_time")] {
                if text == short {
                    return OsString::from(long);
                }
                if let Some(value) = text.strip_prefix(short).and_then(|v| v.strip_prefix('=')) {
                    return OsString::from(format!("{}={}", long, value));
                }
            }
            arg
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let args = std::iter::once("abacate")
            .chain(args.iter().copied())
            .map(OsString::from);
        Cli::try_parse_from(normalize_args(args)).unwrap()
    }

    #[test]
    fn test_short_forms() {
        let cli = parse(&["-t", "http://localhost:3000", "-l", "false", "-lp", "false", "-lt=false"]);
        assert_eq!(cli.target.as_deref(), Some("http://localhost:3000"));
        assert_eq!(cli.logger, Some(false));
        assert_eq!(cli.log_prefix, Some(false));
        assert_eq!(cli.log_time, Some(false));
    }

    #[test]
    fn test_bare_boolean_flag_means_true() {
        let cli = parse(&["--target", "http://localhost:3000", "--logger", "--log_prefix"]);
        assert_eq!(cli.logger, Some(true));
        assert_eq!(cli.log_prefix, Some(true));
        assert_eq!(cli.log_time, None);
    }

    #[test]
    fn test_protocol_value() {
        let cli = parse(&["-t", "http://localhost:3000", "--protocol", "websocket"]);
        assert_eq!(cli.protocol, Some(RelayProtocol::Websocket));
    }

    #[test]
    fn test_normalize_leaves_other_args() {
        let args = normalize_args(["abacate", "-lpx", "--log_time"].map(OsString::from));
        assert_eq!(args, ["abacate", "-lpx", "--log_time"].map(OsString::from).to_vec());
    }
}
