//! End-to-end tests for traced Python guests.
//!
//! These tests need a `python3` interpreter on PATH and skip themselves
//! when there is none.

use futures::channel::mpsc as client;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracebox_core::{
    DirectIsolation, LocalsFilter, SandboxConfig, ServerMessage, Session, SessionState,
    TraceEvent,
};

const TIMEOUT: Duration = Duration::from_secs(20);

fn python3_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

macro_rules! require_python3 {
    () => {
        if !python3_available() {
            eprintln!("Skipping test: python3 not found on PATH");
            return;
        }
    };
}

#[derive(Debug, Default)]
struct Transcript {
    events: Vec<TraceEvent>,
    terminal: String,
}

impl Transcript {
    fn lines(&self) -> Vec<i64> {
        self.events.iter().map(|e| e.line).collect()
    }
}

/// Run `source` to completion, stepping at every pause.
async fn run_program(source: &str, stdin: Option<&str>, filter: LocalsFilter) -> Transcript {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(
        SandboxConfig::builder()
            .control_dir(dir.path())
            .isolation(DirectIsolation::default())
            .locals_filter(filter)
            .build()
            .unwrap(),
    );
    let (out_tx, mut outbound) = mpsc::unbounded_channel();
    let (inbound, in_rx) = client::unbounded::<Result<String, Infallible>>();
    let (_shutdown_tx, shutdown) = broadcast::channel(1);
    let session = tokio::spawn(Session::new(config, out_tx).run(in_rx, shutdown));

    let send = |value: serde_json::Value| inbound.unbounded_send(Ok(value.to_string())).unwrap();
    send(json!({"CMD": "WS_CMD_START", "CONTENT": {"CODE": source}}));
    // Typed at the first pause, once the terminal is known to exist.
    let mut stdin = stdin;

    let mut transcript = Transcript::default();
    let mut running = false;
    loop {
        let message = tokio::time::timeout(TIMEOUT, outbound.recv())
            .await
            .expect("guest made progress")
            .expect("session alive");
        match message {
            ServerMessage::Stdout { text } => transcript.terminal.push_str(&text),
            ServerMessage::Data(event) => transcript.events.push(event),
            ServerMessage::State { state: SessionState::Running } => running = true,
            ServerMessage::State { state: SessionState::Wait } => {
                if let Some(text) = stdin.take() {
                    send(json!({"CMD": "WS_CMD_STDIN", "CONTENT": {"TEXT": text}}));
                }
                send(json!({"CMD": "WS_CMD_STEP", "CONTENT": {}}));
            }
            ServerMessage::State { state: SessionState::Idle } if running => break,
            ServerMessage::State { state } => panic!("unexpected state {state}"),
        }
    }

    inbound.close_channel();
    session.await.unwrap();
    assert!(
        std::fs::read_dir(dir.path()).unwrap().next().is_none(),
        "control socket left behind"
    );
    transcript
}

#[tokio::test]
async fn test_steps_every_line_then_reports_exception() {
    require_python3!();
    let source = "a = 1\nb = a + 1\nc = b / 0\n";
    let t = run_program(source, None, LocalsFilter::Encodable).await;

    assert_eq!(t.lines(), vec![1, 2, 3]);
    assert!(t.events.iter().all(|e| e.file == "<guest>"));
    let last = &t.events[2].variables;
    assert_eq!(last.get("a"), Some(&json!(1)));
    assert_eq!(last.get("b"), Some(&json!(2)));
    assert!(!last.contains_key("c"));

    assert!(t.terminal.contains("EXCEPTION OCCURRED"));
    assert!(t.terminal.contains("ZeroDivisionError: division by zero"));
    assert!(t.terminal.contains("Row 3"));
    assert!(t.terminal.contains("--- PROGRAM COMPLETED ---"));
}

#[tokio::test]
async fn test_nested_frames_in_exception_report() {
    require_python3!();
    let source = "\
def inner(x):
    return x / 0

def outer():
    return inner(1)

outer()
";
    let t = run_program(source, None, LocalsFilter::Encodable).await;

    assert_eq!(t.lines(), vec![1, 4, 7, 5, 2]);
    let inner = t.events.last().unwrap();
    assert_eq!(inner.variables.get("x"), Some(&json!(1)));

    let report: Vec<&str> = t
        .terminal
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .skip_while(|l| *l != "EXCEPTION OCCURRED")
        .collect();
    assert!(report.contains(&"Row 7"));
    assert!(report.contains(&"   └─▶ Inside [outer] (Row 5)"));
    assert!(report.contains(&"      └─▶ Inside [inner] (Row 2)"));
}

#[tokio::test]
async fn test_syntax_error_report() {
    require_python3!();
    let t = run_program("x = 1\ny = (\n", None, LocalsFilter::Encodable).await;

    assert!(t.events.is_empty());
    assert!(t.terminal.contains("EXCEPTION OCCURRED"));
    assert!(t.terminal.contains("SyntaxError"));
    assert!(t.terminal.contains("Row 2"));
}

#[tokio::test]
async fn test_unencodable_locals_are_dropped() {
    require_python3!();
    let source = "f = open\nn = float('nan')\nx = [1, 'two']\ny = x\n";
    let t = run_program(source, None, LocalsFilter::Encodable).await;

    assert_eq!(t.lines(), vec![1, 2, 3, 4]);
    let last = &t.events[3].variables;
    assert_eq!(last.get("x"), Some(&json!([1, "two"])));
    assert!(!last.contains_key("f"));
    assert!(!last.contains_key("n"));
    assert!(!last.contains_key("__builtins__"));
}

#[tokio::test]
async fn test_round_trip_filter_drops_lossy_values() {
    require_python3!();
    // Tuples encode as lists and do not compare equal after decoding.
    let source = "t = (1, 2)\nl = [1, 2]\nend = True\n";
    let t = run_program(source, None, LocalsFilter::RoundTrip).await;

    let last = &t.events[2].variables;
    assert_eq!(last.get("l"), Some(&json!([1, 2])));
    assert!(!last.contains_key("t"));

    let t = run_program(source, None, LocalsFilter::Encodable).await;
    assert_eq!(t.events[2].variables.get("t"), Some(&json!([1, 2])));
}

#[tokio::test]
async fn test_empty_program_completes_without_data() {
    require_python3!();
    let t = run_program("", None, LocalsFilter::Encodable).await;

    assert!(t.events.is_empty());
    assert!(t.terminal.contains("--- PROGRAM STARTED ---"));
    assert!(t.terminal.contains("--- PROGRAM COMPLETED ---"));
    assert!(!t.terminal.contains("EXCEPTION OCCURRED"));
}

#[tokio::test]
async fn test_comment_only_program_completes_without_data() {
    require_python3!();
    let t = run_program("# nothing to run\n\n", None, LocalsFilter::Encodable).await;

    assert!(t.events.is_empty());
    assert!(t.terminal.contains("--- PROGRAM COMPLETED ---"));
}

#[tokio::test]
async fn test_stdin_is_echoed_to_guest() {
    require_python3!();
    let source = "name = input('name? ')\nprint('hello ' + name)\n";
    let t = run_program(source, Some("tracebox\n"), LocalsFilter::Encodable).await;

    assert_eq!(t.lines(), vec![1, 2]);
    assert_eq!(t.events[1].variables.get("name"), Some(&json!("tracebox")));
    assert!(t.terminal.contains("hello tracebox"));
}

#[tokio::test]
async fn test_source_with_quotes_runs_verbatim() {
    require_python3!();
    let source = "s = \"\"\"a '''b''' c\"\"\"\nprint(s)\n";
    let t = run_program(source, None, LocalsFilter::Encodable).await;

    assert_eq!(t.lines(), vec![1, 2]);
    assert!(t.terminal.contains("a '''b''' c"));
}
