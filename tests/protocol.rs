//! Wire protocol handling at the session boundary

use std::sync::Arc;

use petcar_link::engine::{EchoSynthesizer, ScriptedGenerator};
use petcar_link::protocol::{
    Channel, ControlCmd, DecodeError, Frame, HEADER_LEN, PROTOCOL_VERSION, control, encode,
};
use petcar_link::{Error, SessionState};

mod common;

use common::{engines, session_config, start_session};

fn audio_in(seq: u32, text: &str) -> Vec<u8> {
    let mut frame = Frame::audio(Channel::AudioIn, text.as_bytes().to_vec());
    frame.set_seq(seq);
    encode(&frame)
}

#[tokio::test]
async fn test_duplicate_sequence_number_is_dropped() {
    let generator = Arc::new(ScriptedGenerator::new(vec!["好。".to_string()]));
    let (mut terminal, _handle, _task) = start_session(
        session_config(),
        engines(Arc::clone(&generator), Arc::new(EchoSynthesizer::new())),
    );

    terminal.send_raw(audio_in(0, "小车小车")).await;
    terminal.send_raw(audio_in(0, "捣乱")).await;
    terminal.send_raw(audio_in(1, "向前走\n")).await;
    terminal.until_state("generating").await;

    assert_eq!(generator.prompts(), vec!["向前走"]);
}

#[tokio::test]
async fn test_sequence_gap_is_tolerated() {
    let generator = Arc::new(ScriptedGenerator::new(vec!["好。".to_string()]));
    let (mut terminal, _handle, _task) = start_session(
        session_config(),
        engines(Arc::clone(&generator), Arc::new(EchoSynthesizer::new())),
    );

    terminal.send_raw(audio_in(0, "小车小车")).await;
    terminal.send_raw(audio_in(7, "后退\n")).await;
    terminal.until_state("generating").await;

    assert_eq!(generator.prompts(), vec!["后退"]);
}

#[tokio::test]
async fn test_malformed_frames_are_skipped() {
    let generator = Arc::new(ScriptedGenerator::new(vec!["好。".to_string()]));
    let (mut terminal, handle, _task) = start_session(
        session_config(),
        engines(Arc::clone(&generator), Arc::new(EchoSynthesizer::new())),
    );

    // Truncated header
    terminal.send_raw(vec![PROTOCOL_VERSION, 0, 0]).await;
    // Unknown channel id
    let mut bad_channel = audio_in(0, "x");
    bad_channel[1] = 9;
    terminal.send_raw(bad_channel).await;
    // Declared length disagrees with the payload
    let mut short = audio_in(0, "小车");
    short.truncate(HEADER_LEN + 2);
    terminal.send_raw(short).await;

    terminal.say("小车小车你好\n").await;
    terminal.until_state("generating").await;

    assert_eq!(generator.prompts(), vec!["你好"]);
    assert_ne!(handle.state(), SessionState::Closing);
}

#[tokio::test]
async fn test_unknown_version_ends_session() {
    let (mut terminal, _handle, task) = start_session(
        session_config(),
        engines(
            Arc::new(ScriptedGenerator::new(Vec::new())),
            Arc::new(EchoSynthesizer::new()),
        ),
    );

    let mut frame = encode(&Frame::Control(ControlCmd::ping()));
    frame[0] = PROTOCOL_VERSION + 1;
    terminal.send_raw(frame).await;

    let result = task.await.unwrap();
    assert!(matches!(
        result,
        Err(Error::Protocol(DecodeError::UnknownVersion(v))) if v == PROTOCOL_VERSION + 1
    ));
}

#[tokio::test]
async fn test_ping_is_answered_with_pong() {
    let (mut terminal, _handle, _task) = start_session(
        session_config(),
        engines(
            Arc::new(ScriptedGenerator::new(Vec::new())),
            Arc::new(EchoSynthesizer::new()),
        ),
    );

    terminal.send(Frame::Control(ControlCmd::ping())).await;
    let pong = terminal.until_control(control::PONG).await;
    assert!(pong.is(control::PONG));
}
