//! Run the probe call against the in-process loopback peer

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;

use rvoip_call_probe::config::PeerConfig;
use rvoip_call_probe::logging::parse_log_level;
use rvoip_call_probe::loopback::{LoopbackMediaEngine, LoopbackUserAgent};
use rvoip_call_probe::{run_scenario, setup_logging, Credential, LoggingConfig, ProbeConfig};

#[derive(Parser, Debug)]
#[command(name = "call-probe")]
#[command(about = "Place an authenticated SIP call, bring up media and send DTMF")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "CALL_PROBE_CONFIG")]
    config: Option<PathBuf>,

    /// Callee URI
    #[arg(short, long, env = "CALL_PROBE_TARGET")]
    target: Option<String>,

    /// Caller URI
    #[arg(long, env = "CALL_PROBE_FROM")]
    from: Option<String>,

    /// DTMF digits sent once the call is up
    #[arg(short, long)]
    digits: Option<String>,

    /// Digest user
    #[arg(short, long, env = "CALL_PROBE_USER")]
    user: Option<String>,

    /// Digest password
    #[arg(short, long, env = "CALL_PROBE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Digest realm
    #[arg(short, long, env = "CALL_PROBE_REALM")]
    realm: Option<String>,

    /// How long to wait for the answer
    #[arg(long)]
    answer_timeout_ms: Option<u64>,

    /// How long the call stays up after the tones started
    #[arg(long)]
    hold_ms: Option<u64>,

    /// 407 challenges the loopback peer sends before accepting
    #[arg(long)]
    peer_challenges: Option<u8>,

    /// Delay before the loopback peer answers
    #[arg(long)]
    peer_answer_delay_ms: Option<u64>,

    /// Print the report as JSON and log in JSON
    #[arg(long)]
    json: bool,

    /// Log span creation and close with timings
    #[arg(long)]
    log_spans: bool,

    /// Include source file and line in log lines
    #[arg(long)]
    log_file_info: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "CALL_PROBE_LOG")]
    log_level: String,
}

impl Args {
    fn logging(&self) -> Result<LoggingConfig> {
        let mut logging = LoggingConfig::new(parse_log_level(&self.log_level)?, "call-probe");
        if self.json {
            logging = logging.with_json();
        }
        if self.log_spans {
            logging = logging.with_spans();
        }
        if self.log_file_info {
            logging = logging.with_file_info();
        }
        Ok(logging)
    }

    fn into_config(self) -> Result<ProbeConfig> {
        let mut config = match &self.config {
            Some(path) => ProbeConfig::load(path)
                .with_context(|| format!("loading configuration from {}", path.display()))?,
            None => ProbeConfig::new(),
        };

        if let Some(target) = self.target {
            config = config.with_target(target);
        }
        if let Some(from) = self.from {
            config = config.with_from(from);
        }
        if let Some(digits) = self.digits {
            config = config.with_digits(digits);
        }
        if self.user.is_some() || self.password.is_some() || self.realm.is_some() {
            let current = config.credential.clone();
            config = config.with_credential(Credential::new(
                self.realm.unwrap_or(current.realm),
                self.user.unwrap_or(current.user),
                self.password.unwrap_or(current.password),
            ));
        }
        if let Some(ms) = self.answer_timeout_ms {
            config = config.with_answer_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.hold_ms {
            config = config.with_hold(Duration::from_millis(ms));
        }

        let mut peer = config.peer.clone();
        if let Some(challenges) = self.peer_challenges {
            peer.challenges = challenges;
        }
        if let Some(ms) = self.peer_answer_delay_ms {
            peer.answer_delay_ms = ms;
        }
        config = config.with_peer(peer);

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    setup_logging(&args.logging()?)?;

    let json = args.json;
    let config = args.into_config()?;
    let peer: PeerConfig = config.peer.clone();
    let user_agent = LoopbackUserAgent::new(peer.script(&config.credential));
    let engine = Arc::new(LoopbackMediaEngine::new());

    match run_scenario(&config, &user_agent, engine).await {
        Ok(report) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "call {} to {} {} after {} INVITE(s), media {}, tones {}",
                    report.call_id,
                    report.target,
                    report.outcome,
                    report.invites_sent,
                    report.connection_mode,
                    report
                        .tones
                        .as_ref()
                        .map(|t| t.played.as_str())
                        .unwrap_or("-"),
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!(error = %e, "Probe failed");
            eprintln!("call-probe: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_flags_reach_subscriber_config() {
        let args = Args::try_parse_from(["cli", "--log-spans", "--log-file-info", "-l", "debug"]).unwrap();
        let logging = args.logging().unwrap();

        assert!(logging.log_spans);
        assert!(logging.file_info);
        assert!(!logging.json);
        assert_eq!(logging.level, tracing::Level::DEBUG);
    }

    #[test]
    fn logging_defaults_are_plain() {
        let args = Args::try_parse_from(["cli"]).unwrap();
        let logging = args.logging().unwrap();

        assert!(!logging.log_spans);
        assert!(!logging.file_info);
    }
}
