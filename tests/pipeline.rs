//! Conversation pipeline integration tests
//!
//! Drives whole sessions over an in-memory connection with scripted engines.

use std::sync::Arc;
use std::time::Duration;

use petcar_link::connection::memory_pair;
use petcar_link::engine::{EchoSynthesizer, ScriptedGenerator};
use petcar_link::protocol::{Channel, Frame, control};
use petcar_link::{CloseReason, Error, Session, SessionState};

mod common;

use common::{TestTerminal, audio, engines, session_config, start_session, states, texts};

const REPLY: &str = "好的，我这就向前走五步。";

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn test_command_streams_reply_audio_and_action() {
    let generator = Arc::new(ScriptedGenerator::new(vec![format!(
        "{REPLY}[ACTION:forward(5)]"
    )]));
    let synthesizer = Arc::new(EchoSynthesizer::new());
    let (mut terminal, handle, task) =
        start_session(session_config(), engines(Arc::clone(&generator), Arc::clone(&synthesizer)));

    terminal.say("小车小车向前走五步\n").await;
    let frames = terminal.until_state("listening").await;
    let frames = [frames, terminal.until_state("listening").await].concat();

    assert_eq!(
        states(&frames),
        vec!["idle", "listening", "triggered", "generating", "speaking", "listening"]
    );
    assert_eq!(texts(&frames), vec!["向前走五步".to_string(), REPLY.to_string()]);
    assert_eq!(audio(&frames), REPLY.as_bytes());
    assert_eq!(synthesizer.received(), vec![REPLY.to_string()]);
    assert_eq!(generator.prompts(), vec!["向前走五步"]);

    let action = match frames.iter().find_map(|f| match f {
        Frame::Control(cmd) if cmd.is(control::ACTION) => Some(cmd.clone()),
        _ => None,
    }) {
        Some(cmd) => cmd,
        None => terminal.until_control(control::ACTION).await,
    };
    assert_eq!(action.value, serde_json::json!({"name": "forward", "args": [5]}));

    assert_eq!(handle.stats().completed_turns(), 1);
    terminal.stop().await;
    let summary = task.await.unwrap().unwrap();
    assert_eq!(summary.reason, CloseReason::Stopped);
}

#[tokio::test]
async fn test_outbound_sequence_numbers_increase_per_channel() {
    let generator = Arc::new(ScriptedGenerator::new(vec!["一。二。三。".to_string()]));
    let (mut terminal, _handle, _task) = start_session(
        session_config(),
        engines(generator, Arc::new(EchoSynthesizer::new().with_chunking(3, Duration::ZERO))),
    );

    terminal.say("小车小车数数\n").await;
    let mut frames = terminal.until_state("listening").await;
    frames.extend(terminal.until_state("listening").await);

    for channel in [Channel::AudioOut, Channel::Control] {
        let seqs: Vec<u32> = frames
            .iter()
            .filter(|f| f.channel() == channel)
            .map(Frame::seq)
            .collect();
        assert!(!seqs.is_empty());
        assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1), "{channel}: {seqs:?}");
        assert_eq!(seqs[0], 0);
    }
}

#[tokio::test]
async fn test_command_split_across_chunks() {
    let generator = Arc::new(ScriptedGenerator::new(vec!["好。".to_string()]));
    let (mut terminal, _handle, _task) = start_session(
        session_config(),
        engines(Arc::clone(&generator), Arc::new(EchoSynthesizer::new())),
    );

    terminal.say("小车").await;
    terminal.say("小车，向").await;
    terminal.say("前走\n").await;
    terminal.until_state("generating").await;
    terminal.until_state("listening").await;

    assert_eq!(generator.prompts(), vec!["向前走"]);
}

#[tokio::test]
async fn test_speech_without_wake_phrase_is_ignored() {
    let generator = Arc::new(ScriptedGenerator::new(vec!["好。".to_string()]));
    let (mut terminal, handle, task) = start_session(
        session_config(),
        engines(Arc::clone(&generator), Arc::new(EchoSynthesizer::new())),
    );

    terminal.say("今天天气不错\n").await;
    terminal.until_state("listening").await;
    terminal.say("小车小车你好\n").await;
    let frames = terminal.until_state("generating").await;

    assert_eq!(states(&frames), vec!["triggered", "generating"]);
    assert_eq!(generator.prompts(), vec!["你好"]);

    terminal.stop().await;
    task.await.unwrap().unwrap();
    assert_eq!(handle.state(), SessionState::Closing);
}

#[tokio::test]
async fn test_history_carries_previous_exchanges() {
    let generator = Arc::new(ScriptedGenerator::new(vec!["嗯。".to_string()]));
    let (mut terminal, _handle, _task) = start_session(
        session_config(),
        engines(Arc::clone(&generator), Arc::new(EchoSynthesizer::new())),
    );

    for command in ["一", "二", "三"] {
        terminal.say(&format!("小车小车{command}\n")).await;
        terminal.until_state("generating").await;
        terminal.until_state("listening").await;
    }

    assert_eq!(generator.history_lens(), vec![0, 1, 2]);
}

// =============================================================================
// Deadlines and failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_wake_without_command_is_abandoned_at_deadline() {
    let generator = Arc::new(ScriptedGenerator::new(vec!["好。".to_string()]));
    let (mut terminal, handle, _task) = start_session(
        session_config(),
        engines(Arc::clone(&generator), Arc::new(EchoSynthesizer::new())),
    );

    terminal.say("小车小车\n").await;
    terminal.until_state("triggered").await;
    let started = tokio::time::Instant::now();
    terminal.until_state("listening").await;

    assert!(started.elapsed() >= Duration::from_secs(4));
    assert!(generator.prompts().is_empty());
    assert_eq!(handle.stats().completed_turns(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_partial_command_is_used_at_deadline() {
    let generator = Arc::new(ScriptedGenerator::new(vec!["好。".to_string()]));
    let (mut terminal, _handle, _task) = start_session(
        session_config(),
        engines(Arc::clone(&generator), Arc::new(EchoSynthesizer::new())),
    );

    terminal.say("小车小车转个圈").await;
    terminal.until_state("triggered").await;
    terminal.until_state("generating").await;

    assert_eq!(generator.prompts(), vec!["转个圈"]);
}

#[tokio::test]
async fn test_generation_failure_reports_error_and_recovers() {
    let generator = Arc::new(ScriptedGenerator::new(vec!["好。".to_string()]));
    generator.push_failure("model offline");
    let (mut terminal, handle, _task) = start_session(
        session_config(),
        engines(Arc::clone(&generator), Arc::new(EchoSynthesizer::new())),
    );

    terminal.say("小车小车你好\n").await;
    let error = terminal.until_control(control::ERROR).await;
    assert_eq!(error.value["code"], "generation_failed");
    terminal.until_state("listening").await;

    terminal.say("小车小车你好\n").await;
    let frames = terminal.until_state("listening").await;
    assert_eq!(audio(&frames), "好。".as_bytes());
    assert_eq!(handle.stats().failed_turns(), 1);
    assert_eq!(handle.stats().completed_turns(), 1);
}

// =============================================================================
// Barge-in
// =============================================================================

#[tokio::test]
async fn test_barge_in_cancels_reply_and_discards_its_audio() {
    let story = "从前有座山，山里有座庙，庙里有个老和尚在讲故事。";
    let generator = Arc::new(
        ScriptedGenerator::new(Vec::new()).with_char_delay(Duration::from_millis(20)),
    );
    generator.push_reply(story);
    generator.push_reply("好的。");
    let synthesizer = Arc::new(EchoSynthesizer::new().with_chunking(3, Duration::from_millis(20)));
    let (mut terminal, handle, _task) = start_session(
        session_config(),
        engines(Arc::clone(&generator), synthesizer),
    );

    terminal.say("小车小车讲个故事\n").await;
    terminal.until_state("speaking").await;

    terminal.say("小车小车停下\n").await;
    terminal.until_state("triggered").await;
    let after = terminal.until_state("listening").await;

    assert_eq!(states(&after), vec!["generating", "speaking", "listening"]);
    assert_eq!(audio(&after), "好的。".as_bytes());
    assert_eq!(generator.prompts(), vec!["讲个故事", "停下"]);
    assert_eq!(generator.history_lens(), vec![0, 0]);
    assert_eq!(handle.stats().cancelled_turns(), 1);
    assert_eq!(handle.stats().completed_turns(), 1);
}

// =============================================================================
// Teardown
// =============================================================================

#[tokio::test]
async fn test_hang_up_mid_turn_closes_session() {
    let generator = Arc::new(
        ScriptedGenerator::new(vec!["这是一个很长很长的回答。".to_string()])
            .with_char_delay(Duration::from_millis(50)),
    );
    let (mut terminal, handle, task) = start_session(
        session_config(),
        engines(generator, Arc::new(EchoSynthesizer::new())),
    );

    terminal.say("小车小车说点什么\n").await;
    terminal.until_state("generating").await;
    terminal.hang_up().await;

    let summary = task.await.unwrap().unwrap();
    assert!(matches!(summary.reason, CloseReason::Disconnected(_)));
    assert_eq!(summary.completed_turns, 0);
    assert_eq!(handle.stats().cancelled_turns(), 1);
    assert_eq!(handle.state(), SessionState::Closing);
}

#[tokio::test]
async fn test_server_close_announces_closing() {
    let generator = Arc::new(ScriptedGenerator::new(Vec::new()));
    let (mut terminal, handle, task) = start_session(
        session_config(),
        engines(generator, Arc::new(EchoSynthesizer::new())),
    );

    terminal.until_state("idle").await;
    handle.close();
    terminal.until_state("closing").await;
    assert!(terminal.next_frame().await.is_none());

    let summary = task.await.unwrap().unwrap();
    assert_eq!(summary.reason, CloseReason::Shutdown);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_terminal_tears_down_session() {
    let story = "从前有座山，山里有座庙，庙里有个老和尚在讲故事。".repeat(3);
    let generator = Arc::new(ScriptedGenerator::new(vec![story]));
    let synthesizer = Arc::new(EchoSynthesizer::new().with_chunking(3, Duration::ZERO));
    let config = session_config();
    let stall_timeout = config.stall_timeout;

    // Room for two frames; the terminal never reads any of them
    let ((server_rx, server_tx), (term_rx, term_tx)) = memory_pair(2);
    let session = Session::new(config, engines(generator, synthesizer));
    let handle = session.handle();
    let task = tokio::spawn(session.run(Box::new(server_rx), Box::new(server_tx)));

    let mut terminal = TestTerminal::new(term_rx, term_tx);
    terminal.say("小车小车讲故事\n").await;

    let result = task.await.unwrap();
    assert!(
        matches!(result, Err(Error::StallTimeout(after)) if after == stall_timeout),
        "{result:?}"
    );
    assert_eq!(handle.state(), SessionState::Closing);
    assert_eq!(handle.stats().completed_turns(), 0);
}
