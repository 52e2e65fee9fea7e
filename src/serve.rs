//! Build dashboard server.
//!
//! The dashboard talks to the server over one WebSocket per client. Every bus
//! event is forwarded to every client as a JSON text frame; clients send plain
//! text commands back. Everything that changes build state goes through a single
//! command loop ([`ServeLoop`]) so builds never overlap.
use std::{net::SocketAddr, path::PathBuf, time::Duration};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinHandle},
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tower_http::{services::ServeDir, trace::TraceLayer};

use crate::{
    build::{BuildDriver, BuildSummary, CancelSignal},
    engine::TexEngine,
    error::PediaError,
    messages::{BroadcastBus, Message, MessageBus, ServerInfoMessage},
};

const COMMAND_CAPACITY: usize = 64;
const DEBUG_INPUT_PREFIX: &str = "debug_input:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServeCommand {
    Build,
    ClientConnected,
    DebugInput(String),
    FilesChanged(Vec<PathBuf>),
    Quit,
}

impl ServeCommand {
    /// Map a client text frame to a command.
    pub fn from_client_text(text: &str) -> Option<ServeCommand> {
        match text.trim() {
            "trigger_build" => Some(ServeCommand::Build),
            "quit" => Some(ServeCommand::Quit),
            other => other
                .strip_prefix(DEBUG_INPUT_PREFIX)
                .map(|path| ServeCommand::DebugInput(path.trim().to_string())),
        }
    }
}

struct RunningBuild {
    cancel: CancelSignal,
    handle: JoinHandle<Result<BuildSummary, PediaError>>,
}

async fn build_finished(
    running: &mut Option<RunningBuild>,
) -> Result<Result<BuildSummary, PediaError>, JoinError> {
    match running {
        Some(build) => (&mut build.handle).await,
        None => std::future::pending().await,
    }
}

/// The command loop behind `pedia serve`.
///
/// At most one build runs at a time. A build request that arrives while one is
/// running is remembered and served once the running build finishes.
pub struct ServeLoop<E: TexEngine, B: MessageBus> {
    driver: BuildDriver<E, B>,
    commands: mpsc::Receiver<ServeCommand>,
    running: Option<RunningBuild>,
    pending: bool,
}

impl<E: TexEngine, B: MessageBus> ServeLoop<E, B> {
    pub fn new(driver: BuildDriver<E, B>, commands: mpsc::Receiver<ServeCommand>) -> Self {
        ServeLoop {
            driver,
            commands,
            running: None,
            pending: false,
        }
    }

    /// Process commands until `Quit` arrives or every sender is gone. Always
    /// ends by posting `server_quitting` once.
    #[tracing::instrument(skip_all)]
    pub async fn run(mut self) {
        loop {
            let command = tokio::select! {
                command = self.commands.recv() => command,
                joined = build_finished(&mut self.running) => {
                    self.running = None;
                    match joined {
                        Ok(Ok(summary)) => tracing::info!(
                            "[Serve] build ended in state {:?}",
                            summary.state
                        ),
                        Ok(Err(e)) => tracing::info!("[Serve] build ended: {e}"),
                        Err(e) => tracing::error!("[Serve] build task failed: {e}"),
                    }
                    if self.pending {
                        self.pending = false;
                        self.start_build();
                    }
                    continue;
                }
            };
            match command {
                None | Some(ServeCommand::Quit) => break,
                Some(ServeCommand::Build) => self.request_build(),
                Some(ServeCommand::ClientConnected) => {
                    self.driver.bus().post(Message::ServerInfo(ServerInfoMessage {
                        app_port: self.driver.config().serve.app_port,
                        n_workers: self.driver.n_workers(),
                    }));
                    self.request_build();
                }
                Some(ServeCommand::DebugInput(path)) => {
                    let driver = self.driver.clone();
                    tokio::spawn(async move {
                        if let Err(e) = driver.debug_input(&path).await {
                            driver.bus().error(
                                Some(path.as_str()),
                                "cannot debug input",
                                vec![e.to_string()],
                            );
                        }
                    });
                }
                Some(ServeCommand::FilesChanged(paths)) => {
                    self.invalidate_changed(&paths).await;
                    self.request_build();
                }
            }
        }
        self.shut_down().await;
    }

    fn request_build(&mut self) {
        if self.running.is_some() {
            tracing::debug!("[Serve] build already running; queueing another");
            self.pending = true;
        } else {
            self.start_build();
        }
    }

    fn start_build(&mut self) {
        let cancel = CancelSignal::new();
        let driver = self.driver.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move { driver.build(&task_cancel).await });
        self.running = Some(RunningBuild { cancel, handle });
    }

    /// Drop cached results for changed inputs. A change to anything that is not
    /// an input (class files, index definitions) can affect every compilation.
    async fn invalidate_changed(&self, paths: &[PathBuf]) {
        let config = self.driver.config();
        let input_root = config.input_root();
        for path in paths.iter() {
            let is_input = path.starts_with(&input_root)
                && path.extension().and_then(|e| e.to_str()) == Some("tex");
            let result = if is_input {
                match config.relative_path(path) {
                    Ok(rel) => {
                        tracing::debug!("[Serve] {rel} changed");
                        self.driver.cache().invalidate(&rel).await
                    }
                    Err(e) => Err(e),
                }
            } else {
                tracing::info!("[Serve] {} changed; invalidating all", path.display());
                self.driver.cache().invalidate_all().await.map(|_| ())
            };
            if let Err(e) = result {
                tracing::warn!("[Serve] could not invalidate after change to {path:?}: {e}");
            }
        }
    }

    async fn shut_down(&mut self) {
        if let Some(build) = self.running.take() {
            tracing::info!("[Serve] cancelling running build");
            build.cancel.cancel();
            if let Err(e) = build.handle.await {
                tracing::error!("[Serve] build task failed while cancelling: {e}");
            }
        }
        self.driver.bus().post(Message::ServerQuitting);
    }
}

#[derive(Clone)]
struct DashboardState {
    bus: BroadcastBus,
    commands: mpsc::Sender<ServeCommand>,
}

/// The dashboard HTTP server together with its command loop.
pub struct DashboardServer<E: TexEngine> {
    driver: BuildDriver<E, BroadcastBus>,
    tx: mpsc::Sender<ServeCommand>,
    rx: mpsc::Receiver<ServeCommand>,
}

impl<E: TexEngine> DashboardServer<E> {
    pub fn new(driver: BuildDriver<E, BroadcastBus>) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        DashboardServer { driver, tx, rx }
    }

    /// A handle for feeding commands from outside, e.g. a watcher or a signal
    /// handler.
    pub fn commander(&self) -> mpsc::Sender<ServeCommand> {
        self.tx.clone()
    }

    /// Serve until a `Quit` command has been processed.
    pub async fn run(self) -> Result<(), PediaError> {
        let config = self.driver.config();
        let addr = SocketAddr::from(([127, 0, 0, 1], config.serve.ui_port));
        let ui_dist = config.ui_dist();
        if !ui_dist.is_dir() {
            tracing::warn!(
                "[Serve] dashboard assets not found at {}; only /ws is available",
                ui_dist.display()
            );
        }

        let state = DashboardState {
            bus: self.driver.bus().clone(),
            commands: self.tx.clone(),
        };
        let app = Router::new()
            .route("/ws", get(ws_handler))
            .fallback_service(ServeDir::new(&ui_dist))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("[Serve] dashboard at http://{addr}");

        let stop = CancelSignal::new();
        let server_stop = stop.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move { server_stop.cancelled().await })
                .await
        });

        // The router state holds a sender for as long as the listener runs, so
        // only `Quit` ends the loop.
        drop(self.tx);
        ServeLoop::new(self.driver, self.rx).run().await;

        // let client sessions flush `server_quitting` before the listener goes away
        tokio::time::sleep(Duration::from_millis(200)).await;
        stop.cancel();
        server.await??;
        tracing::info!("[Serve] shut down");
        Ok(())
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<DashboardState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket: WebSocket| {
        let (sink, stream) = socket.split();
        client_session(sink, stream, state)
    })
}

/// Relay bus events to one client and its text frames to the command loop.
///
/// The client learns about the server from the `server_info` the command loop
/// broadcasts in answer to `ClientConnected`; the subscription is taken first
/// so that answer is never missed.
async fn client_session<S, R, E>(mut sink: S, mut stream: R, state: DashboardState)
where
    S: Sink<WsMessage> + Unpin,
    R: Stream<Item = Result<WsMessage, E>> + Unpin,
{
    let mut events = BroadcastStream::new(state.bus.subscribe());

    if state.commands.send(ServeCommand::ClientConnected).await.is_err() {
        return;
    }
    tracing::debug!("[Serve] client connected");

    let forward = async {
        while let Some(item) = events.next().await {
            let msg = match item {
                Ok(msg) => msg,
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    tracing::warn!("[Serve] client fell behind; dropped {n} event(s)");
                    continue;
                }
            };
            let quitting = matches!(msg, Message::ServerQuitting);
            match msg.to_wire() {
                Ok(text) => {
                    if sink.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!("[Serve] cannot encode {} event: {e}", msg.kind()),
            }
            if quitting {
                break;
            }
        }
        let _ = sink.close().await;
    };

    let receive = async {
        while let Some(Ok(frame)) = stream.next().await {
            match frame {
                WsMessage::Text(text) => match ServeCommand::from_client_text(&text) {
                    Some(command) => {
                        if state.commands.send(command).await.is_err() {
                            break;
                        }
                    }
                    None => tracing::warn!("[Serve] ignoring unknown client message {text:?}"),
                },
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = forward => {}
        _ = receive => {}
    }
    tracing::debug!("[Serve] client disconnected");
}
