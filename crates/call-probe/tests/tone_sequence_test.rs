//! DTMF sequencing against the timer-driven loopback generator

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use rvoip_call_probe::loopback::{LoopbackMediaEngine, LoopbackToneGenerator};
use rvoip_call_probe::media::build_tone_path;
use rvoip_call_probe::{
    play_sequence, ConnectionMode, DtmfSymbol, MediaEngine, MediaSettings, ToneGenerator, ToneSequence,
};

const TONE: Duration = Duration::from_millis(200);

fn generator(engine: &LoopbackMediaEngine) -> (Arc<dyn ToneGenerator>, Arc<LoopbackToneGenerator>) {
    let connection = engine.create_connection().unwrap();
    connection.set_mode(ConnectionMode::SendRecv).unwrap();
    let path = build_tone_path(engine, connection.as_ref(), &MediaSettings::default()).unwrap();
    let loopback = engine.tone_generators().pop().unwrap();
    (path.generator, loopback)
}

#[tokio::test(start_paused = true)]
async fn test_single_digit_ends_stopped_after_two_notifications() {
    let engine = LoopbackMediaEngine::new();
    let (generator, loopback) = generator(&engine);
    assert!(!generator.is_started());

    let handle = play_sequence(generator.clone(), ToneSequence::parse("1").unwrap(), TONE).unwrap();
    assert!(generator.is_started());
    assert_eq!(generator.symbol(), Some(DtmfSymbol::Digit1));

    let report = handle.wait().await.unwrap();

    assert_eq!(report.played, "1");
    assert_eq!(report.notifications, 2);
    assert!(report.completed);
    assert_eq!(loopback.notifications(), 2);
    assert!(!generator.is_started());
    assert_eq!(generator.symbol(), None);
    assert_eq!(loopback.volume(), -255);
}

#[tokio::test(start_paused = true)]
async fn test_digits_play_in_order_with_one_tone_each() {
    let engine = LoopbackMediaEngine::new();
    let (generator, loopback) = generator(&engine);
    let started = Instant::now();

    let report = play_sequence(generator.clone(), ToneSequence::parse("123").unwrap(), TONE)
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.played, "123");
    assert_eq!(report.notifications, 6);
    assert!(report.completed);
    assert_eq!(
        loopback.played(),
        vec![DtmfSymbol::Digit1, DtmfSymbol::Digit2, DtmfSymbol::Digit3]
    );
    assert_eq!(loopback.media_time_resets(), 2);
    assert!(started.elapsed() >= TONE * 3);
    assert!(!generator.is_started());
}

#[tokio::test(start_paused = true)]
async fn test_abort_silences_generator() {
    let engine = LoopbackMediaEngine::new();
    let (generator, loopback) = generator(&engine);

    let handle = play_sequence(generator.clone(), ToneSequence::parse("1234").unwrap(), TONE).unwrap();
    tokio::time::sleep(TONE + Duration::from_millis(50)).await;
    assert!(!handle.is_finished());

    handle.abort();

    assert!(!generator.is_started());
    assert_eq!(generator.symbol(), None);
    tokio::time::sleep(TONE * 4).await;
    assert!(loopback.played().len() < 4);
}

#[tokio::test(start_paused = true)]
async fn test_external_stop_ends_sequence() {
    let engine = LoopbackMediaEngine::new();
    let (generator, loopback) = generator(&engine);

    let handle = play_sequence(generator.clone(), ToneSequence::parse("1234").unwrap(), TONE).unwrap();
    // Second digit is sounding
    tokio::time::sleep(TONE + Duration::from_millis(50)).await;
    assert_eq!(generator.symbol(), Some(DtmfSymbol::Digit2));

    generator.stop();
    let report = handle.wait().await.unwrap();

    assert_eq!(report.played, "12");
    assert!(!report.completed);
    assert!(!generator.is_started());

    tokio::time::sleep(TONE * 4).await;
    assert!(!generator.is_started());
    assert_eq!(loopback.played(), vec![DtmfSymbol::Digit1, DtmfSymbol::Digit2]);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_driver_leaves_generator_alone() {
    let engine = LoopbackMediaEngine::new();
    let (generator, loopback) = generator(&engine);

    let handle = play_sequence(generator.clone(), ToneSequence::parse("1234").unwrap(), TONE).unwrap();
    let canceller = handle.canceller();
    tokio::time::sleep(TONE + Duration::from_millis(50)).await;

    canceller.cancel();
    assert!(canceller.is_cancelled());
    generator.stop();

    tokio::time::sleep(TONE * 4).await;
    assert!(handle.is_finished());
    assert!(!generator.is_started());
    assert_eq!(loopback.played().len(), 2);
}

#[tokio::test]
async fn test_generator_needs_activation_before_start() {
    let engine = LoopbackMediaEngine::new();
    let (generator, _) = generator(&engine);

    generator.set_symbol(Some(DtmfSymbol::Star));
    assert!(generator.start().is_err());

    generator.activate().unwrap();
    generator.start().unwrap();
    assert!(generator.is_started());
    generator.stop();
    assert!(!generator.is_started());
}
