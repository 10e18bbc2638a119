use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::event::{self, Event, KeyEventKind};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use agent_herald::analyzer::StateAnalyzer;
use agent_herald::completion::{CompletionSettings, CompletionStore, WaitTimeTracker};
use agent_herald::config::{self, Config};
use agent_herald::monitor::{MonitorContext, MonitorSupervisor, SessionRegistry};
use agent_herald::notify::{ChannelSink, CommandSink, EventSink, FanoutSink, LogSink, Notification};
use agent_herald::quiet::QuietCompletionDetector;
use agent_herald::tmux::TmuxClient;

mod actions;
mod app;

use actions::Action;
use app::{App, SessionView};

const REFRESH_INTERVAL: Duration = Duration::from_millis(1000);
const SUPERVISOR_EXIT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser, Debug)]
#[command(name = "agent-herald", version, about)]
struct Cli {
    /// Config file (default: ~/.agent-herald/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Completion timestamp file, overrides the config
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Run without the dashboard; notifications go to the log and notify command
    #[arg(long)]
    headless: bool,
}

/// Headless mode logs to stderr. The dashboard owns the terminal, so it
/// logs to a file under the app directory instead.
fn init_logging(headless: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    if headless {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(());
    }

    let path = config::default_log_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .init();
    Ok(())
}

struct Monitoring {
    tmux: Arc<TmuxClient>,
    registry: SessionRegistry,
    tracker: Arc<WaitTimeTracker>,
    shutdown: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
}

impl Monitoring {
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        if tokio::time::timeout(SUPERVISOR_EXIT_TIMEOUT, self.supervisor)
            .await
            .is_err()
        {
            warn!("supervisor did not stop in time");
        }
        self.tracker.store().flush().await;
    }
}

async fn start_monitoring(
    config: &Config,
    notifications: Option<mpsc::UnboundedSender<Notification>>,
) -> Result<Monitoring> {
    let tmux = Arc::new(TmuxClient::new(config.monitor.capture_timeout()));
    if !tmux.is_server_running().await {
        warn!("tmux server is not running; waiting for sessions to appear");
    }

    let analyzer = Arc::new(StateAnalyzer::from_config(tmux.clone(), config)?);
    let quiet = Arc::new(QuietCompletionDetector::new(
        analyzer.rules().clone(),
        config.monitor.quiet_polls,
    ));
    let completions_path = config.completions_path();
    info!(path = %completions_path.display(), "completion store");
    let completions = Arc::new(CompletionStore::open(
        completions_path,
        CompletionSettings::from(&config.completion),
    ));

    let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(LogSink)];
    if let Some(command) = config
        .notify
        .command
        .as_deref()
        .and_then(|cmd| CommandSink::new(cmd, config.monitor.delivery_timeout()))
    {
        sinks.push(Arc::new(command));
    }
    if let Some(tx) = notifications {
        sinks.push(Arc::new(ChannelSink::new(tx)));
    }

    let registry = SessionRegistry::new();
    let ctx = Arc::new(MonitorContext {
        analyzer: analyzer.clone(),
        quiet,
        completions: completions.clone(),
        sink: Arc::new(FanoutSink::new(sinks)),
        sessions: registry.clone(),
        settings: config.monitor.clone(),
    });
    let tracker = Arc::new(WaitTimeTracker::new(completions, tmux.clone(), analyzer));

    let (shutdown, shutdown_rx) = watch::channel(false);
    let supervisor = MonitorSupervisor::new(ctx, tmux.clone(), config.supervisor.clone());
    let supervisor = tokio::spawn(supervisor.run(shutdown_rx));

    Ok(Monitoring {
        tmux,
        registry,
        tracker,
        shutdown,
        supervisor,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(config::default_config_path);
    let mut config = config::load(&config_path)?;
    if let Some(state_file) = cli.state_file {
        config.completion.state_file = Some(state_file);
    }

    init_logging(cli.headless)?;
    info!(config = %config_path.display(), headless = cli.headless, "starting agent-herald");

    if cli.headless {
        run_headless(&config).await
    } else {
        run_dashboard(&config).await
    }
}

async fn run_headless(config: &Config) -> Result<()> {
    let monitoring = start_monitoring(config, None).await?;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("interrupted, shutting down");
    monitoring.stop().await;
    Ok(())
}

async fn run_dashboard(config: &Config) -> Result<()> {
    let (note_tx, mut note_rx) = mpsc::unbounded_channel::<Notification>();
    let monitoring = start_monitoring(config, Some(note_tx)).await?;

    // Create event channel
    let (tx, mut rx) = mpsc::unbounded_channel::<Action>();

    // Initialize terminal
    let mut terminal = ratatui::init();

    // Spawn input handler
    let input_tx = tx.clone();
    tokio::spawn(async move {
        loop {
            if event::poll(Duration::from_millis(100)).unwrap_or(false) {
                if let Ok(Event::Key(key)) = event::read() {
                    if key.kind == KeyEventKind::Press
                        && input_tx.send(Action::KeyPress(key)).is_err()
                    {
                        break;
                    }
                }
            }
        }
    });

    // Forward delivered notifications to the panel
    let notify_tx = tx.clone();
    tokio::spawn(async move {
        while let Some(notification) = note_rx.recv().await {
            if notify_tx.send(Action::Notified(notification)).is_err() {
                break;
            }
        }
    });

    // Spawn dashboard refresher
    let refresh_tx = tx.clone();
    let registry = monitoring.registry.clone();
    let tracker = monitoring.tracker.clone();
    let tmux = monitoring.tmux.clone();
    tokio::spawn(async move {
        loop {
            if !tmux.is_server_running().await
                && refresh_tx
                    .send(Action::Error("tmux server is not running".to_string()))
                    .is_err()
            {
                break;
            }
            let mut views = Vec::new();
            for session in registry.snapshot() {
                let wait = tracker.wait_time(&session.id).await;
                views.push(SessionView::new(&session, wait, Instant::now()));
            }
            if refresh_tx.send(Action::SessionsUpdated(views)).is_err() {
                break;
            }
            tokio::time::sleep(REFRESH_INTERVAL).await;
        }
    });

    // Raw mode swallows ctrl-c as a key; this catches the signal from elsewhere
    let signal_tx = tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = signal_tx.send(Action::Quit);
        }
    });

    let mut app = App::new();

    // Main event loop
    let result = loop {
        terminal.draw(|f| app.render(f))?;

        for pending_action in app.take_pending_actions() {
            if let Action::AttachSession(ref session_id) = pending_action {
                // Suspend TUI and attach to session
                ratatui::restore();

                let cmd = monitoring.tmux.attach_command(session_id);
                let status = std::process::Command::new(&cmd[0])
                    .args(&cmd[1..])
                    .stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit())
                    .status();

                // Resume TUI
                terminal = ratatui::init();

                match status {
                    Ok(status) if !status.success() => {
                        app.error_message = Some(format!("tmux attach exited with {status}"));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        app.error_message = Some(format!("Failed to attach: {e}"));
                    }
                }
            }
        }

        let Some(action) = rx.recv().await else {
            break Ok(());
        };
        match app.handle_action(action) {
            Ok(true) => break Ok(()),
            Ok(false) => {}
            Err(e) => break Err(e),
        }
    };

    ratatui::restore();
    monitoring.stop().await;
    result
}
