//! Terminal reconnect integration tests
//!
//! Runs a real [`Terminal`] against in-process sessions, one per connection.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use petcar_link::config::TerminalConfig;
use petcar_link::engine::{EchoSynthesizer, ScriptedGenerator};
use petcar_link::terminal::ScriptSource;
use petcar_link::{SessionState, Terminal};

mod common;

use common::{CollectingExecutor, SegmentedSink, SessionConnector, engines, session_config};

fn terminal_config() -> TerminalConfig {
    TerminalConfig {
        heartbeat_interval: Duration::from_millis(500),
        watchdog_timeout: Duration::from_secs(5),
        reconnect_base_delay: Duration::from_millis(50),
        reconnect_max_delay: Duration::from_millis(200),
        max_reconnect_attempts: Some(3),
        ..TerminalConfig::default()
    }
}

#[tokio::test]
async fn test_script_runs_to_completion_and_dispatches_actions() {
    let generator = Arc::new(ScriptedGenerator::new(vec![
        "好的，我这就向前走五步。[ACTION:forward(5)]".to_string(),
    ]));
    let (connector, _handles) = SessionConnector::new(
        session_config(),
        engines(generator, Arc::new(EchoSynthesizer::new())),
    );
    let executor = Arc::new(CollectingExecutor::default());
    let sink = SegmentedSink::default();

    let mut terminal = Terminal::new(
        terminal_config(),
        Box::new(ScriptSource::new(["小车小车向前走五步"], Duration::from_millis(20))),
        Box::new(sink.clone()),
        executor.clone(),
    );

    tokio::time::timeout(
        Duration::from_secs(10),
        terminal.run(&connector, &CancellationToken::new()),
    )
    .await
    .expect("terminal finished")
    .unwrap();

    assert_eq!(terminal.connections(), 1);
    assert_eq!(sink.segments()[0], "好的，我这就向前走五步。".as_bytes());

    let commands = executor.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].to_string(), "forward(5)");
}

#[tokio::test]
async fn test_reconnect_abandons_turn_and_discards_stale_audio() {
    let story = "从前有座山，山里有座庙，庙里有个老和尚在给小和尚讲故事。";
    let generator = Arc::new(
        ScriptedGenerator::new(Vec::new()).with_char_delay(Duration::from_millis(10)),
    );
    generator.push_reply(story);
    generator.push_reply("好的，我这就向前走五步。[ACTION:forward(5)]");
    let synthesizer =
        Arc::new(EchoSynthesizer::new().with_chunking(3, Duration::from_millis(30)));

    let (connector, mut handles) = SessionConnector::new(
        session_config(),
        engines(Arc::clone(&generator), synthesizer),
    );
    let executor = Arc::new(CollectingExecutor::default());
    let sink = SegmentedSink::default();

    let mut terminal = Terminal::new(
        terminal_config(),
        Box::new(ScriptSource::new(
            ["小车小车讲个故事", "小车小车向前走五步"],
            Duration::from_secs(1),
        )),
        Box::new(sink.clone()),
        executor.clone(),
    );

    // Drop the first session while its reply is still being spoken
    let killer = tokio::spawn(async move {
        let first = handles.recv().await.expect("first session");
        let mut state = first.subscribe();
        state
            .wait_for(|s| *s == SessionState::Speaking)
            .await
            .expect("first session speaks");
        first.close();

        let second = handles.recv().await.expect("second session");
        (first, second)
    });

    tokio::time::timeout(
        Duration::from_secs(20),
        terminal.run(&connector, &CancellationToken::new()),
    )
    .await
    .expect("terminal finished")
    .unwrap();

    let (first, second) = killer.await.unwrap();
    assert_eq!(terminal.connections(), 2);
    assert_eq!(first.stats().completed_turns(), 0);
    assert_eq!(first.stats().cancelled_turns(), 1);
    assert_eq!(second.stats().completed_turns(), 1);

    let segments = sink.segments();
    assert!(story.as_bytes().starts_with(&segments[0]));
    assert!(segments[0].len() < story.len());
    assert_eq!(segments[1], "好的，我这就向前走五步。".as_bytes());

    assert_eq!(generator.prompts(), vec!["讲个故事", "向前走五步"]);
    assert_eq!(generator.history_lens(), vec![0, 0]);
    assert_eq!(executor.commands().len(), 1);
}
