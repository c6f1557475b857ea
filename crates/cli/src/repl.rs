use std::future::Future;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use familiar_client::{AgentClient, ClientError};
use familiar_core::config::{ConfigurationSnapshot, HostCfg};
use familiar_core::service::{HostService, StateHandle};
use familiar_core::settings::Settings;
use familiar_core::types::{Connection, LifecycleState, StatusSnapshot};
use rustyline::error::ReadlineError;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::commands::{self, Command};

enum Flow {
    Prompt,
    Wait,
    Quit,
}

struct Session<'a> {
    service: &'a HostService,
    state: StateHandle,
    snapshot: ConfigurationSnapshot,
    cfg: Arc<HostCfg>,
    pool: Option<SqlitePool>,
    client: Option<AgentClient>,
    reply_tx: mpsc::UnboundedSender<String>,
}

pub async fn run(
    service: &HostService,
    snapshot: ConfigurationSnapshot,
    cfg: Arc<HostCfg>,
    pool: Option<SqlitePool>,
    token: CancellationToken,
    startup_notice: Option<String>,
) -> anyhow::Result<()> {
    if let Some(notice) = startup_notice {
        println!("{notice}");
    }
    println!("familiar: /help lists commands");

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();
    let mut session = Session {
        service,
        state: service.state(),
        snapshot,
        cfg,
        pool,
        client: None,
        reply_tx,
    };
    session.refresh_client();
    if let Some(line) = describe_transition(&session.state.snapshot(), session.state.connection().as_ref()) {
        println!("{line}");
    }

    let (reader, mut input_rx) = LineReader::spawn();
    reader.prompt();

    let mut spinner = Spinner::new();
    let mut status_rx = session.state.clone();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = spinner.tick(), if spinner.is_active() => spinner.advance()?,
            snap = status_rx.changed() => {
                let Some(snap) = snap else { break };
                session.refresh_client();
                if let Some(line) = describe_transition(&snap, session.state.connection().as_ref()) {
                    clear_line()?;
                    println!("{line}");
                }
            }
            input = input_rx.recv() => {
                let Some(input) = input else { break };
                match input {
                    Input::Line(line) => match session.dispatch(Command::parse(&line)) {
                        Flow::Prompt => reader.prompt(),
                        Flow::Wait => spinner.start()?,
                        Flow::Quit => break,
                    },
                    Input::Interrupted => {
                        token.cancel();
                        break;
                    }
                    Input::Eof => break,
                    Input::Failed(err) => {
                        eprintln!("input error: {err}");
                        break;
                    }
                }
            }
            Some(reply) = reply_rx.recv() => {
                spinner.stop()?;
                println!("{reply}");
                reader.prompt();
            }
        }
    }
    drop(reader);

    spinner.stop()?;
    println!();
    Ok(())
}

impl Session<'_> {
    fn dispatch(&mut self, command: Command) -> Flow {
        match command {
            Command::Empty => Flow::Prompt,
            Command::Quit => Flow::Quit,
            Command::Help => {
                println!("{}", commands::HELP);
                Flow::Prompt
            }
            Command::Unknown(text) => {
                println!("unknown command {text}; /help lists commands");
                Flow::Prompt
            }
            Command::Stop => {
                self.service.stop_command();
                Flow::Prompt
            }
            Command::Restart => {
                self.service.stop_command();
                self.service.start_command(self.snapshot.clone());
                Flow::Prompt
            }
            Command::Reset => {
                let Some(pool) = self.pool.clone() else {
                    println!("nothing to reset; settings are not persisted in ephemeral mode");
                    return Flow::Prompt;
                };
                self.reply_later(async move {
                    match Settings::clear(&pool).await {
                        Ok(()) => "settings cleared; they are read from the environment on next launch".to_owned(),
                        Err(e) => {
                            tracing::warn!(error = %e, "settings reset failed");
                            format!("error: {e}")
                        }
                    }
                })
            }
            Command::Status => {
                let snap = self.state.snapshot();
                println!("{}", describe_status(&snap));
                if self.client.is_none() {
                    return Flow::Prompt;
                }
                self.call(|c| async move { c.status().await.map(|v| commands::render_json(&v)) })
            }
            Command::Memory => self.call(|c| async move { c.memory().await.map(|v| commands::render_json(&v)) }),
            Command::Skills => self.call(|c| async move { c.skills().await.map(|s| commands::render_skills(&s)) }),
            Command::Toggle(name) => self.call(|c| async move {
                let result = c.toggle_skill(&name).await?;
                Ok(format!("{name}: {}", if result.enabled { "enabled" } else { "disabled" }))
            }),
            Command::Tools => self.call(|c| async move { c.tools().await.map(|t| commands::render_tools(&t)) }),
            Command::Config => self.call(|c| async move { c.config().await.map(|cfg| commands::render_config(&cfg)) }),
            Command::Services => {
                self.call(|c| async move { c.connect_status().await.map(|s| commands::render_services(&s)) })
            }
            Command::Chat(text) => self.call(|c| async move { c.chat(&text).await.map(|r| commands::render_chat(&r)) }),
        }
    }

    /// Run an API call in the background; its rendered result arrives on the reply channel.
    fn call<F, Fut>(&self, request: F) -> Flow
    where
        F: FnOnce(AgentClient) -> Fut,
        Fut: Future<Output = Result<String, ClientError>> + Send + 'static,
    {
        let Some(client) = self.client.clone() else {
            println!("{}", not_running_hint(&self.state.current()));
            return Flow::Prompt;
        };
        let fut = request(client);
        self.reply_later(async move {
            fut.await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "agent api call failed");
                format!("error: {e}")
            })
        })
    }

    fn reply_later(&self, reply: impl Future<Output = String> + Send + 'static) -> Flow {
        let reply_tx = self.reply_tx.clone();
        tokio::spawn(async move {
            let _ = reply_tx.send(reply.await);
        });
        Flow::Wait
    }

    fn refresh_client(&mut self) {
        self.client = None;
        if !self.state.current().is_running() {
            return;
        }
        let Some(connection) = self.state.connection() else {
            return;
        };
        match AgentClient::from_connection(&connection, &self.cfg) {
            Ok(client) => self.client = Some(client),
            Err(e) => tracing::error!(error = %e, "cannot build agent client"),
        }
    }
}

fn describe_transition(snap: &StatusSnapshot, connection: Option<&Connection>) -> Option<String> {
    match &snap.state {
        LifecycleState::Idle => None,
        LifecycleState::Starting => Some("starting agent...".into()),
        LifecycleState::Running { .. } => {
            let url = connection.map(|c| c.base_url.as_str()).unwrap_or("?");
            let remote = connection.is_some_and(|c| c.remote);
            Some(if remote {
                format!("connected to {url}")
            } else {
                format!("agent running at {url}")
            })
        }
        LifecycleState::Error { message } => Some(format!("agent error: {message}\ntype /restart to try again")),
        LifecycleState::Stopped => Some("agent stopped".into()),
    }
}

fn describe_status(snap: &StatusSnapshot) -> String {
    let secs = (chrono::Utc::now() - snap.since).num_seconds().max(0);
    match &snap.state {
        LifecycleState::Error { message } => format!("state: error for {secs}s: {message}"),
        state => format!("state: {state} for {secs}s"),
    }
}

fn not_running_hint(state: &LifecycleState) -> String {
    match state {
        LifecycleState::Starting => "agent is still starting; try again in a moment".into(),
        LifecycleState::Error { .. } => "agent is not running; /restart to try again".into(),
        state => format!("agent is {state}; /restart to start it"),
    }
}

const SPINNER_FRAMES: [&str; 4] = ["-", "\\", "|", "/"];

/// "thinking..." indicator drawn over the prompt line while a reply is pending.
struct Spinner {
    frame: usize,
    active: bool,
    interval: Interval,
}

impl Spinner {
    fn new() -> Self {
        let mut interval = tokio::time::interval(Duration::from_millis(100));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            frame: 0,
            active: false,
            interval,
        }
    }

    fn is_active(&self) -> bool {
        self.active
    }

    async fn tick(&mut self) {
        self.interval.tick().await;
    }

    fn start(&mut self) -> io::Result<()> {
        self.frame = 0;
        self.active = true;
        self.draw()
    }

    fn advance(&mut self) -> io::Result<()> {
        self.frame = (self.frame + 1) % SPINNER_FRAMES.len();
        self.draw()
    }

    fn stop(&mut self) -> io::Result<()> {
        if std::mem::take(&mut self.active) {
            clear_line()?;
        }
        Ok(())
    }

    fn draw(&self) -> io::Result<()> {
        let mut out = io::stdout().lock();
        write!(out, "\rthinking... {}", SPINNER_FRAMES[self.frame])?;
        out.flush()
    }
}

fn clear_line() -> io::Result<()> {
    let mut out = io::stdout().lock();
    out.write_all(b"\r\x1b[2K")?;
    out.flush()
}

enum Input {
    Line(String),
    Interrupted,
    Eof,
    Failed(String),
}

/// rustyline blocks, so the editor lives on its own thread and reads one
/// line each time [`LineReader::prompt`] is called. Dropping the reader ends
/// the thread after its current read.
struct LineReader {
    ready: std::sync::mpsc::Sender<()>,
}

impl LineReader {
    const THREAD_NAME: &'static str = "familiar-input";

    fn spawn() -> (Self, mpsc::UnboundedReceiver<Input>) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (ready, ready_rx) = std::sync::mpsc::channel::<()>();
        let failed = input_tx.clone();
        let spawned = std::thread::Builder::new()
            .name(Self::THREAD_NAME.into())
            .spawn(move || read_lines(&input_tx, &ready_rx));
        if let Err(e) = spawned {
            let _ = failed.send(Input::Failed(e.to_string()));
        }
        (Self { ready }, input_rx)
    }

    fn prompt(&self) {
        let _ = self.ready.send(());
    }
}

fn read_lines(input_tx: &mpsc::UnboundedSender<Input>, ready_rx: &std::sync::mpsc::Receiver<()>) {
    let mut editor = match rustyline::DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            let _ = input_tx.send(Input::Failed(e.to_string()));
            return;
        }
    };
    while ready_rx.recv().is_ok() {
        let input = match editor.readline("you> ") {
            Ok(line) => {
                if !line.trim().is_empty() {
                    let _ = editor.add_history_entry(line.as_str());
                }
                Input::Line(line)
            }
            Err(ReadlineError::Interrupted) => Input::Interrupted,
            Err(ReadlineError::Eof) => Input::Eof,
            Err(e) => Input::Failed(e.to_string()),
        };
        let more = matches!(input, Input::Line(_));
        if input_tx.send(input).is_err() || !more {
            break;
        }
    }
}
