mod cli;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

use clawchat_sync::config::ClientConfig;
use clawchat_sync::connectivity::TcpProbe;
use clawchat_sync::coordinator::{DataRefresh, RefreshChain, SyncCoordinator};
use clawchat_sync::credentials::StoredCredentials;
use clawchat_sync::executor::HttpExecutor;
use clawchat_sync::queue::{FlushHalt, MutationQueue};
use clawchat_sync::socket::{SocketEventKind, SocketManager};
use clawchat_sync::status::LinkStatus;
use clawchat_sync::storage::{FileStore, KeyValueStore};
use clawchat_sync::store::{ChatStore, ModuleStore, Notice, Remote};
use clawchat_sync::stream::{StreamEvent, StreamOutcome, StreamTransport};
use clawchat_sync::telemetry::logging;

use cli::{AuthCommand, ChatArgs, Cli, Command, EnqueueArgs, QueueCommand, WatchArgs};

/// Server and token after flags, environment and stored credentials are merged.
struct Session {
    server_url: String,
    token: String,
}

struct App {
    config: ClientConfig,
    storage: Arc<dyn KeyValueStore>,
}

impl App {
    fn new(config: ClientConfig) -> Self {
        let storage: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(config.data_dir.clone()));
        Self { config, storage }
    }

    fn queue(&self) -> Arc<MutationQueue> {
        Arc::new(MutationQueue::new(self.storage.clone()).with_limits(self.config.tuning.queue))
    }

    fn session(&self) -> Result<Session> {
        let stored = StoredCredentials::load(self.storage.as_ref())
            .context("failed to read stored credentials")?;
        let server_url = self
            .config
            .server_url
            .clone()
            .or_else(|| stored.as_ref().map(|creds| creds.server_url.clone()))
            .ok_or_else(|| anyhow!("no server configured; pass --server or run `auth save`"))?;
        let token = self
            .config
            .token
            .clone()
            .or_else(|| {
                stored
                    .filter(|creds| creds.server_url == server_url)
                    .map(|creds| creds.token)
            })
            .unwrap_or_default();
        Ok(Session { server_url, token })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config())?;
    let app = App::new(cli.client_config());

    match cli.command {
        Command::Chat(args) => chat(&app, args).await,
        Command::Watch(args) => watch(&app, args).await,
        Command::Queue(command) => queue(&app, command).await,
        Command::Enqueue(args) => enqueue(&app, args),
        Command::Auth(command) => auth(&app, command, cli.server, cli.token),
    }
}

async fn chat(app: &App, args: ChatArgs) -> Result<()> {
    let session = app.session()?;
    let tuning = &app.config.tuning;
    let transport = StreamTransport::http()
        .with_retry_policy(tuning.stream_retry)
        .with_idle_timeout(tuning.stream_idle_timeout);
    let (notices, notice_rx) = mpsc::unbounded_channel::<Notice>();
    let store = ChatStore::new(
        transport,
        Some(session.server_url),
        session.token,
        Arc::new(notices),
    );

    let (events, mut event_rx) = mpsc::unbounded_channel::<StreamEvent>();
    let handle = store.send_streaming_observed(&args.conversation, &args.text, Some(Arc::new(events)))?;

    let mut stdout = std::io::stdout();
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(StreamEvent::Token(token)) => {
                    write!(stdout, "{token}")?;
                    stdout.flush()?;
                }
                Some(StreamEvent::TitleGenerated(title)) => info!(title = %title, "conversation titled"),
                Some(StreamEvent::Done(_)) | Some(StreamEvent::Error(_)) | None => break,
                Some(StreamEvent::Meta(_)) => {}
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                store.stop_generation(&args.conversation);
            }
        }
    }
    writeln!(stdout)?;
    print_notices(notice_rx);

    match handle.outcome().await {
        StreamOutcome::Failed(err) => Err(err).context("generation failed"),
        StreamOutcome::Salvaged { reason, .. } => {
            warn!(?reason, "reply ended early; partial text kept");
            Ok(())
        }
        StreamOutcome::Completed(_) => Ok(()),
    }
}

fn print_notices(mut rx: mpsc::UnboundedReceiver<Notice>) {
    while let Ok(notice) = rx.try_recv() {
        eprintln!("[{}] {}", notice.level, notice.message);
    }
}

async fn watch(app: &App, args: WatchArgs) -> Result<()> {
    let session = app.session()?;
    let tuning = app.config.tuning;
    let executor = Arc::new(HttpExecutor::new(
        &session.server_url,
        Some(session.token.clone()),
    ));
    let queue = app.queue();
    let link = LinkStatus::default();

    let (notices, mut notice_rx) = mpsc::unbounded_channel::<Notice>();
    let notifier = Arc::new(notices);
    let remote = Remote {
        executor: executor.clone(),
        queue: queue.clone(),
        link: link.clone(),
    };
    let modules = ModuleStore::new(Some(remote.clone()), notifier.clone())
        .with_undo_window(tuning.undo_window);
    let chats = ChatStore::new(
        StreamTransport::http()
            .with_retry_policy(tuning.stream_retry)
            .with_idle_timeout(tuning.stream_idle_timeout),
        Some(session.server_url.clone()),
        session.token.clone(),
        notifier,
    )
    .with_remote(remote);

    let refresh_targets: Vec<Arc<dyn DataRefresh>> =
        vec![Arc::new(modules.clone()), Arc::new(chats.clone())];
    let coordinator = SyncCoordinator::new(
        queue,
        executor,
        Arc::new(RefreshChain::new(refresh_targets)),
        link.clone(),
        true,
    );
    let socket = SocketManager::websocket(tuning.socket);
    let _module_events = modules.attach(&socket);
    let _chat_events = chats.attach(&socket);
    let _status = coordinator.attach_socket(&socket);
    let _printer = socket.on_status_change(|status| eprintln!("[socket] {status}"));
    for kind in SocketEventKind::ALL {
        let _handler = socket.on(kind, |event| match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(err) => warn!(error = %err, "could not print event"),
        });
    }

    let probe = TcpProbe::for_server(&session.server_url)
        .ok_or_else(|| anyhow!("cannot probe {}", session.server_url))?
        .with_interval(Duration::from_secs(args.probe_interval.max(1)));
    info!(probe = probe.target(), "watching reachability");
    let follower = coordinator.spawn(probe.watch());
    let poller = coordinator.spawn_pending_poller(tuning.pending_poll);

    let mut pending = coordinator.subscribe_pending();
    let reporter = tokio::spawn(async move {
        while pending.changed().await.is_ok() {
            let count = *pending.borrow_and_update();
            info!(pending = count, "offline queue size changed");
        }
    });
    let notice_printer = tokio::spawn(async move {
        while let Some(notice) = notice_rx.recv().await {
            eprintln!("[{}] {}", notice.level, notice.message);
        }
    });

    socket.connect(&session.server_url, &session.token)?;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    info!("shutting down");
    socket.disconnect();
    for task in [follower, poller, reporter, notice_printer] {
        task.abort();
    }
    Ok(())
}

async fn queue(app: &App, command: QueueCommand) -> Result<()> {
    let queue = app.queue();
    match command {
        QueueCommand::List => {
            for action in queue.items()? {
                println!("{}", serde_json::to_string(&action)?);
            }
        }
        QueueCommand::Count => println!("{}", queue.count()?),
        QueueCommand::Clear => {
            queue.clear()?;
            eprintln!("offline queue cleared");
        }
        QueueCommand::Flush => {
            let session = app.session()?;
            let executor = HttpExecutor::new(&session.server_url, Some(session.token));
            let report = queue.flush(&executor).await?;
            println!("flushed {} of {}", report.flushed, report.attempted);
            match report.halted {
                None => {}
                Some(FlushHalt::Unauthorized(err)) => {
                    bail!("server rejected the credential: {err}")
                }
                Some(FlushHalt::Failed { id, error }) => {
                    bail!("replay of {id} failed: {error}; it stays queued")
                }
            }
        }
    }
    Ok(())
}

fn enqueue(app: &App, args: EnqueueArgs) -> Result<()> {
    let body = args
        .body
        .as_deref()
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("--body is not valid JSON")?;
    let action = app.queue().enqueue(args.method, args.path, body)?;
    println!("{}", action.id);
    Ok(())
}

fn auth(app: &App, command: AuthCommand, server: Option<String>, token: Option<String>) -> Result<()> {
    let storage = app.storage.as_ref();
    match command {
        AuthCommand::Save(args) => {
            let server = server
                .or_else(|| app.config.server_url.clone())
                .ok_or_else(|| anyhow!("--server is required"))?;
            let token = token
                .or_else(|| app.config.token.clone())
                .ok_or_else(|| anyhow!("--token is required"))?;
            let mut creds = StoredCredentials::new(server, token);
            if let Some(refresh) = args.refresh_token {
                creds = creds.with_refresh_token(refresh);
            }
            creds.save(storage)?;
            eprintln!("credentials saved for {}", creds.server_url);
        }
        AuthCommand::Show => match StoredCredentials::load(storage)? {
            Some(creds) => {
                println!("server:   {}", creds.server_url);
                println!("token:    {}", creds.masked_token());
                println!("refresh:  {}", if creds.refresh_token.is_some() { "yes" } else { "no" });
                println!("saved at: {}", creds.saved_at);
            }
            None => eprintln!("no stored credentials"),
        },
        AuthCommand::Clear => {
            StoredCredentials::clear(storage)?;
            eprintln!("credentials removed");
        }
    }
    Ok(())
}
