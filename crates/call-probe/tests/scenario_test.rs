//! Full probe runs against the loopback peer

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use rvoip_call_probe::config::PeerConfig;
use rvoip_call_probe::loopback::{LoopbackMediaEngine, LoopbackUserAgent, PeerScript};
use rvoip_call_probe::{run_scenario, CallProbeError, ProbeConfig, ToneGenerator};

fn config() -> ProbeConfig {
    ProbeConfig::new()
        .with_target("sip:10000@sipgate.de")
        .with_from("sip:alice@sipgate.de")
        .with_digits("123")
        .with_local_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .with_hold(Duration::from_secs(2))
}

#[tokio::test(start_paused = true)]
async fn test_challenged_call_connects_and_plays_digits() {
    let config = config();
    let ua = LoopbackUserAgent::new(config.peer.script(&config.credential));
    let engine = Arc::new(LoopbackMediaEngine::new());

    let report = run_scenario(&config, &ua, engine.clone()).await.unwrap();

    assert_eq!(report.invites_sent, 2);
    assert_eq!(report.outcome, "answered");
    assert_eq!(report.connection_mode, "SEND_RECV");
    let tones = report.tones.expect("digits finished within the hold");
    assert_eq!(tones.played, "123");
    assert_eq!(tones.notifications, 6);

    let stats = ua.stats();
    assert_eq!(stats.registrations, 1);
    assert_eq!(stats.acks, 1);
    assert_eq!(stats.disposed, 1);
    let contact = stats.requests[0].header("Contact").unwrap();
    assert_eq!(contact.value, "<sip:probe@127.0.0.1>");
    assert_eq!(engine.stats().connections_closed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unchallenged_call_needs_one_invite() {
    let config = config().with_peer(PeerConfig {
        challenges: 0,
        ..Default::default()
    });
    let ua = LoopbackUserAgent::new(config.peer.script(&config.credential));
    let engine = Arc::new(LoopbackMediaEngine::new());

    let report = run_scenario(&config, &ua, engine).await.unwrap();

    assert_eq!(report.invites_sent, 1);
    assert_eq!(ua.stats().invites, 1);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_challenge_fails_the_run() {
    let config = config();
    let ua = LoopbackUserAgent::new(PeerScript::default().with_challenges(2));
    let engine = Arc::new(LoopbackMediaEngine::new());

    let err = run_scenario(&config, &ua, engine.clone()).await.unwrap_err();

    assert!(matches!(err, CallProbeError::CallFailed { .. }));
    assert_eq!(ua.stats().invites, 2);
    assert_eq!(engine.stats().connections_closed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_fails_the_run() {
    let config = config().with_answer_timeout(Duration::from_secs(3));
    let ua = LoopbackUserAgent::new(PeerScript::default().never_answer());
    let engine = Arc::new(LoopbackMediaEngine::new());

    let err = run_scenario(&config, &ua, engine.clone()).await.unwrap_err();

    assert!(err.to_string().contains("timed_out"));
    assert_eq!(ua.stats().acks, 0);
    assert_eq!(ua.stats().disposed, 1);
    assert_eq!(engine.stats().connections_closed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_registration_stops_before_calling() {
    let config = config();
    let ua = LoopbackUserAgent::new(PeerScript::default().rejecting_registration());
    let engine = Arc::new(LoopbackMediaEngine::new());

    let err = run_scenario(&config, &ua, engine.clone()).await.unwrap_err();

    assert!(err.is_signaling());
    assert_eq!(ua.stats().invites, 0);
    assert_eq!(engine.stats().connections_created, 0);
}

#[tokio::test(start_paused = true)]
async fn test_short_hold_stops_unfinished_digits() {
    let config = config().with_hold(Duration::from_millis(100));
    let ua = LoopbackUserAgent::new(config.peer.script(&config.credential));
    let engine = Arc::new(LoopbackMediaEngine::new());

    let report = run_scenario(&config, &ua, engine.clone()).await.unwrap();

    assert!(report.tones.is_none());
    let generator = engine.tone_generators().pop().unwrap();
    assert!(!generator.is_started());
    assert_eq!(engine.stats().connections_closed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_config_file_drives_the_run() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
target = "sip:4711@example.org"
from = "sip:bob@example.org"
digits = "9#"
local_address = "127.0.0.1"
hold_ms = 1500

[credential]
realm = "example.org"
user = "bob"
password = "hunter2"

[media]
tone_duration_ms = 100

[peer]
challenges = 1
answer_delay_ms = 250
"#
    )
    .unwrap();

    let config = ProbeConfig::load(file.path()).unwrap();
    let ua = LoopbackUserAgent::new(config.peer.script(&config.credential));
    let engine = Arc::new(LoopbackMediaEngine::new());

    let report = run_scenario(&config, &ua, engine).await.unwrap();

    assert_eq!(report.target, "sip:4711@example.org");
    assert_eq!(report.invites_sent, 2);
    assert_eq!(report.tones.unwrap().played, "9#");
    assert_eq!(report.hold_ms, 1500);
}

#[test]
fn test_missing_config_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = ProbeConfig::load(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, CallProbeError::Io(_)));
}
