//! Headless mode runner - event loop without a table view
//!
//! Forwards engine events to stdout and accepts line commands on stdin:
//! `start <name>`, `stop <name>`, `refresh`, `list`, `reset`, `quit`.

use tokio::sync::{broadcast, mpsc};

use avdemon_app::{signals, Dispatch, Engine, Settings};
use avdemon_core::prelude::*;
use avdemon_daemon::CommandRunner;

use super::HeadlessEvent;

/// A command read from stdin
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdinCommand {
    Start(String),
    Stop(String),
    Refresh,
    List,
    /// Release intents stuck in starting/stopping
    Reset,
    Quit,
    Unknown(String),
}

/// Parse one stdin line; blank lines yield `None`
pub fn parse_stdin_command(line: &str) -> Option<StdinCommand> {
    let mut parts = line.split_whitespace();
    let verb = parts.next()?;
    let arg = parts.next();

    Some(match (verb, arg) {
        ("start", Some(name)) => StdinCommand::Start(name.to_string()),
        ("stop", Some(name)) => StdinCommand::Stop(name.to_string()),
        ("r" | "refresh", None) => StdinCommand::Refresh,
        ("l" | "list", None) => StdinCommand::List,
        ("reset", None) => StdinCommand::Reset,
        ("q" | "quit", None) => StdinCommand::Quit,
        _ => StdinCommand::Unknown(line.trim().to_string()),
    })
}

/// Run in headless mode until a signal or `quit`
pub async fn run_headless(settings: Settings) -> Result<()> {
    info!("═══════════════════════════════════════════════════════");
    info!("AVD Demon starting in HEADLESS mode");
    info!("═══════════════════════════════════════════════════════");

    let mut engine = Engine::new(settings);
    signals::spawn_signal_handler(engine.shutdown_sender());

    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    std::thread::spawn(move || {
        spawn_stdin_reader_blocking(cmd_tx);
    });

    engine.refresh().await;
    HeadlessEvent::inventory(&engine.snapshot()).emit();

    if let Err(e) = engine.start_background() {
        warn!("Background tasks failed to start: {}", e);
        HeadlessEvent::error(e.to_string(), false).emit();
    }

    let result = headless_event_loop(&engine, cmd_rx, |event| event.emit()).await;

    engine.shutdown().await;
    HeadlessEvent::shutdown().emit();

    info!("AVD Demon headless mode exiting");
    result
}

/// Forward engine events to `emit` and execute stdin commands.
///
/// Returns on `quit` or when the engine's shutdown flag is raised.
pub async fn headless_event_loop<R, F>(
    engine: &Engine<R>,
    mut commands: mpsc::Receiver<StdinCommand>,
    mut emit: F,
) -> Result<()>
where
    R: CommandRunner + Sync + 'static,
    F: FnMut(HeadlessEvent),
{
    let mut events = engine.events();
    let mut shutdown_rx = engine.shutdown_receiver();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            biased;

            event = events.recv() => match event {
                Ok(event) => emit(HeadlessEvent::from_engine_event(event, &engine.snapshot())),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Headless output lagged, {} event(s) skipped", skipped);
                    emit(HeadlessEvent::inventory(&engine.snapshot()));
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::ChannelClosed),
            },

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown requested");
                    break;
                }
            }

            command = commands.recv(), if stdin_open => match command {
                Some(StdinCommand::Quit) => {
                    info!("Stdin: quit requested");
                    break;
                }
                Some(command) => handle_command(engine, command, &mut emit).await,
                None => {
                    // Keep streaming until a signal arrives
                    stdin_open = false;
                }
            },
        }
    }

    Ok(())
}

async fn handle_command<R, F>(engine: &Engine<R>, command: StdinCommand, emit: &mut F)
where
    R: CommandRunner + Sync + 'static,
    F: FnMut(HeadlessEvent),
{
    match command {
        StdinCommand::Start(name) => match engine.start(&name).await {
            Ok(Dispatch::Accepted) => {}
            Ok(Dispatch::Ignored) => info!("Start of {} ignored: operation in flight", name),
            Err(e) => emit(command_error("Start", &name, e)),
        },
        StdinCommand::Stop(name) => match engine.stop(&name).await {
            Ok(report) if report.dispatch == Dispatch::Ignored => {
                info!("Stop of {} ignored: operation in flight", name)
            }
            Ok(_) => {}
            Err(e) => emit(command_error("Stop", &name, e)),
        },
        StdinCommand::Refresh => {
            engine.refresh().await;
        }
        StdinCommand::List => emit(HeadlessEvent::inventory(&engine.snapshot())),
        StdinCommand::Reset => {
            engine.reset().await;
        }
        StdinCommand::Unknown(line) => warn!("Unknown stdin command: {}", line),
        StdinCommand::Quit => {}
    }
}

/// Log a failed stdin command and turn it into an error event.
///
/// Recoverable errors (unknown image, failed launch) are user mistakes or
/// transient tool trouble and only warrant a warning.
fn command_error(verb: &str, name: &str, e: Error) -> HeadlessEvent {
    if e.is_recoverable() {
        warn!("{} of {} failed: {}", verb, name, e);
    } else {
        error!("{} of {} failed: {}", verb, name, e);
    }
    HeadlessEvent::error(e.to_string(), e.is_fatal())
}

/// Read stdin line by line and forward parsed commands (blocking)
fn spawn_stdin_reader_blocking(cmd_tx: mpsc::Sender<StdinCommand>) {
    use std::io::BufRead;

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        match line {
            Ok(line) => {
                let Some(command) = parse_stdin_command(&line) else {
                    continue;
                };
                let quit = command == StdinCommand::Quit;
                if cmd_tx.blocking_send(command).is_err() || quit {
                    break;
                }
            }
            Err(e) => {
                error!("Failed to read stdin: {}", e);
                break;
            }
        }
    }

    info!("Stdin reader exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use avdemon_daemon::test_utils::FakeRunner;
    use avdemon_daemon::{CommandOutput, Tool};
    use std::sync::Arc;

    fn engine() -> Engine<FakeRunner> {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(
            Tool::Emulator,
            &["-list-avds"],
            CommandOutput::ok("Pixel_7_API_33\n"),
        );
        runner.make_unresolvable(Tool::AvdManager);
        runner.set_adb_devices(&[]);
        Engine::with_runner(Settings::default(), runner)
    }

    fn event_name(event: &HeadlessEvent) -> String {
        serde_json::to_value(event).unwrap()["event"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_parse_stdin_command() {
        assert_eq!(
            parse_stdin_command("start Pixel_7_API_33"),
            Some(StdinCommand::Start("Pixel_7_API_33".into()))
        );
        assert_eq!(
            parse_stdin_command("  stop Pixel_7_API_33 "),
            Some(StdinCommand::Stop("Pixel_7_API_33".into()))
        );
        assert_eq!(parse_stdin_command("r"), Some(StdinCommand::Refresh));
        assert_eq!(parse_stdin_command("list"), Some(StdinCommand::List));
        assert_eq!(parse_stdin_command("q"), Some(StdinCommand::Quit));
        assert_eq!(parse_stdin_command("reset"), Some(StdinCommand::Reset));
        assert_eq!(parse_stdin_command("   "), None);
        assert_eq!(
            parse_stdin_command("start"),
            Some(StdinCommand::Unknown("start".into()))
        );
    }

    #[tokio::test]
    async fn test_loop_runs_commands_and_forwards_events() {
        let engine = engine();
        let (tx, rx) = mpsc::channel(8);
        tx.send(StdinCommand::Refresh).await.unwrap();
        tx.send(StdinCommand::Start("Pixel_7_API_33".into())).await.unwrap();
        tx.send(StdinCommand::Start("Nope".into())).await.unwrap();
        tx.send(StdinCommand::Quit).await.unwrap();

        let mut emitted = Vec::new();
        headless_event_loop(&engine, rx, |event| emitted.push(event))
            .await
            .unwrap();

        let names: Vec<String> = emitted.iter().map(event_name).collect();
        assert_eq!(
            names,
            vec![
                "inventory",
                "transition_started",
                "transition_finished",
                "error",
            ]
        );
        assert!(engine.snapshot().get("Pixel_7_API_33").unwrap().is_running);
    }

    #[tokio::test]
    async fn test_reset_command_reports_cleared_images() {
        let engine = engine();
        engine.refresh().await;
        assert!(engine
            .store()
            .try_begin("Pixel_7_API_33", avdemon_core::TransitionIntent::Starting)
            .unwrap());
        let (tx, rx) = mpsc::channel(8);
        tx.send(StdinCommand::Reset).await.unwrap();
        tx.send(StdinCommand::Quit).await.unwrap();

        let mut emitted = Vec::new();
        headless_event_loop(&engine, rx, |event| emitted.push(event))
            .await
            .unwrap();

        let reset = emitted
            .iter()
            .map(|event| serde_json::to_value(event).unwrap())
            .find(|value| value["event"] == "state_reset")
            .expect("no state_reset event");
        assert_eq!(reset["cleared"][0], "Pixel_7_API_33");
        assert!(!engine.snapshot().get("Pixel_7_API_33").unwrap().is_claimed());
    }

    #[test]
    fn test_command_error_fatality() {
        let event = command_error("Start", "Nope", Error::image_not_found("Nope"));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "error");
        assert_eq!(value["fatal"], false);

        let value = serde_json::to_value(command_error("Stop", "x", Error::ChannelClosed)).unwrap();
        assert_eq!(value["fatal"], true);
    }

    #[tokio::test]
    async fn test_loop_exits_on_shutdown_flag() {
        let engine = engine();
        let (_tx, rx) = mpsc::channel(8);
        let shutdown = engine.shutdown_sender();

        let handle = async {
            headless_event_loop(&engine, rx, |_| {}).await.unwrap();
        };
        let trigger = async {
            shutdown.send(true).unwrap();
        };

        tokio::join!(handle, trigger);
    }
}
