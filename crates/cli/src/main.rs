use std::process::ExitCode;

use clap::Parser;
use rtsp_probe::{ProbeClient, ProbeConfig, TransportMode};
use url::Url;

#[derive(Parser)]
#[command(
    name = "rtsp-probe",
    about = "Connect to an RTSP stream and verify that it delivers data"
)]
struct Args {
    /// Stream URL (rtsp://host[:port]/path)
    url: String,

    /// Username for Basic/Digest authentication
    #[arg(long, short)]
    username: Option<String>,

    /// Password for Basic/Digest authentication
    #[arg(long, short)]
    password: Option<String>,

    /// Receive media interleaved over the control connection instead of UDP
    #[arg(long)]
    tcp: bool,

    /// Disable keep-alive OPTIONS pings while playing
    #[arg(long)]
    no_ping: bool,

    /// Increase log verbosity (-v debug, -vvv per-frame trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Per-frame diagnostics live at TRACE; that level takes three `-v`s.
fn log_level(verbose: u8) -> tracing::Level {
    match verbose {
        0 => tracing::Level::INFO,
        1..=2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(log_level(args.verbose))
        .init();

    let url = match Url::parse(&args.url) {
        Ok(url) if url.scheme() == "rtsp" || url.scheme() == "rtsps" => url,
        Ok(url) => {
            eprintln!("not an RTSP URL (scheme is {:?}): {}", url.scheme(), args.url);
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("invalid URL {:?}: {}", args.url, e);
            return ExitCode::FAILURE;
        }
    };

    let mut config = ProbeConfig::new(url)
        .transport(if args.tcp {
            TransportMode::Tcp
        } else {
            TransportMode::Udp
        })
        .keepalive(!args.no_ping);
    if let Some(username) = args.username {
        config = config.credentials(username, args.password.unwrap_or_default());
    }

    let mut client = match ProbeClient::connect(config) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("could not connect: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match client.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_needs_three_verbose_flags() {
        assert_eq!(log_level(0), tracing::Level::INFO);
        assert_eq!(log_level(1), tracing::Level::DEBUG);
        assert_eq!(log_level(2), tracing::Level::DEBUG);
        assert_eq!(log_level(3), tracing::Level::TRACE);
    }
}
