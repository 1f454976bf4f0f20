use citop::app::{AppConfig, AppState, ExportRequest};
use citop::cache::Cache;
use citop::cli::{self, Cli};
use citop::events::{AppEvent, EventHandler};
use citop::input::{self, Action, InputContext};
use citop::poller::Poller;
use citop::provider::command::CommandProvider;
use citop::provider::Provider;
use citop::tui;

use clap::Parser;
use color_eyre::eyre::{eyre, Result};
use crossterm::execute;
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen, SetTitle};
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

fn setup_verbose_logging() -> Result<()> {
    let state_dir = dirs_next_or_fallback();
    std::fs::create_dir_all(&state_dir)
        .map_err(|e| eyre!("Failed to create log directory {state_dir:?}: {e}"))?;
    let log_path = state_dir.join("debug.log");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| eyre!("Failed to open log file {log_path:?}: {e}"))?;
    tracing_subscriber::fmt()
        .with_writer(file)
        .with_ansi(false)
        .init();
    tracing::info!("citop v{} starting with verbose logging", cli::VERSION);
    Ok(())
}

fn dirs_next_or_fallback() -> std::path::PathBuf {
    if let Some(state) = std::env::var_os("XDG_STATE_HOME") {
        std::path::PathBuf::from(state).join("citop")
    } else if let Some(home) = std::env::var_os("HOME") {
        std::path::PathBuf::from(home)
            .join(".local")
            .join("state")
            .join("citop")
    } else {
        std::path::PathBuf::from("/tmp/citop")
    }
}

fn spawn_monitored(
    tx: mpsc::UnboundedSender<AppEvent>,
    label: &'static str,
    fut: impl Future<Output = ()> + Send + 'static,
) {
    tokio::spawn(async move {
        let handle = tokio::spawn(fut);
        if let Err(join_err) = handle.await {
            let msg = if join_err.is_panic() {
                match join_err.into_panic().downcast::<String>() {
                    Ok(s) => *s,
                    Err(payload) => match payload.downcast::<&str>() {
                        Ok(s) => s.to_string(),
                        Err(_) => "unknown panic".to_string(),
                    },
                }
            } else {
                "task cancelled".to_string()
            };
            tracing::error!("{label} panicked: {msg}");
            if tx
                .send(AppEvent::Error(format!("{label} crashed: {msg}")))
                .is_err()
            {
                tracing::warn!("{label}: channel closed while reporting panic");
            }
        }
    });
}

/// Opens a URL in the user's default browser.
///
/// WSL compiles as `target_os = "linux"` but needs `wslview` instead of `xdg-open`.
fn open_in_browser(url: &str) -> Result<()> {
    use std::process::{Command, Stdio};

    if !url.starts_with("https://") && !url.starts_with("http://") {
        return Err(eyre!("Refusing to open non-HTTP URL: {url}"));
    }

    let cmd = if cfg!(target_os = "macos") {
        "open"
    } else if std::env::var_os("WSL_DISTRO_NAME").is_some() {
        "wslview"
    } else {
        "xdg-open"
    };

    Command::new(cmd)
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(|_| ())
        .map_err(|e| eyre!("Failed to open browser with {cmd}: {e}"))
}

/// Writes the logs of a subtree, then follows running jobs until they complete or the
/// application quits.
async fn export_logs(
    request: ExportRequest,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<AppEvent>,
) {
    let ExportRequest { builds, key, dir } = request;
    let report = |event: AppEvent| {
        if tx.send(event).is_err() {
            tracing::warn!("export: channel closed");
        }
    };

    match builds.write_to_directory(&cancel, &key, &dir).await {
        Ok((paths, streamer)) => {
            report(AppEvent::Exported {
                paths,
                streaming: streamer.is_some(),
            });
            if let Some(streamer) = streamer {
                tracing::debug!("following {} running job(s) of {key}", streamer.job_count());
                if let Err(e) = streamer.stream(&cancel).await {
                    report(AppEvent::Error(format!("Log streaming failed: {e}")));
                }
            }
        }
        Err(e) => report(AppEvent::Error(format!("Log export failed: {e}"))),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Cli::parse();

    if args.verbose {
        setup_verbose_logging()?;
    }

    let repository_url = match args.repo.clone() {
        Some(url) => url,
        None => cli::detect_repository_url().await?,
    };
    cli::validate_repository_url(&repository_url)?;

    let providers: Vec<Arc<dyn Provider>> = args
        .providers
        .iter()
        .map(|spec| {
            let provider: Arc<dyn Provider> = Arc::new(
                CommandProvider::new(spec.account_id.clone(), spec.program.clone())
                    .with_args(spec.args.clone()),
            );
            provider
        })
        .collect();
    let cache = Cache::new(providers);

    // Setup terminal with panic hook
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        if let Err(e) = terminal::disable_raw_mode() {
            eprintln!("Failed to disable raw mode during panic: {e}");
        }
        if let Err(e) = execute!(io::stdout(), LeaveAlternateScreen, SetTitle("")) {
            eprintln!("Failed to leave alternate screen during panic: {e}");
        }
        original_hook(panic_info);
    }));

    terminal::enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(
        stdout,
        EnterAlternateScreen,
        SetTitle(format!("citop {repository_url}"))
    )?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;

    let config = AppConfig {
        log_dir: args.log_dir(),
        version_string: format!("citop v{}", cli::VERSION),
        base_interval: args.interval,
    };
    let mut state = AppState::new(config, cache.new_repository_builds(&repository_url));
    state.set_height(tui::render::table_height(terminal.size()?.height));

    let events = EventHandler::new(Duration::from_millis(100));
    let tx = events.sender();
    let cancel = CancellationToken::new();

    // Adaptive polling interval channel
    let (interval_tx, interval_rx) = watch::channel(args.interval);
    let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();

    let poller = Poller::new(
        cache,
        repository_url,
        args.limit,
        tx.clone(),
        interval_rx,
        refresh_rx,
        cancel.clone(),
    );
    spawn_monitored(tx.clone(), "poller", poller.run());

    let result = run_app(
        &mut terminal,
        &mut state,
        events,
        &tx,
        &interval_tx,
        &refresh_tx,
        &cancel,
    )
    .await;

    // Stops the poller and every log stream
    cancel.cancel();

    // Restore terminal
    terminal::disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, SetTitle(""))?;
    terminal.show_cursor()?;

    result
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    state: &mut AppState,
    mut events: EventHandler,
    tx: &mpsc::UnboundedSender<AppEvent>,
    interval_tx: &watch::Sender<u64>,
    refresh_tx: &mpsc::UnboundedSender<()>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut last_tick = Instant::now();

    loop {
        terminal.draw(|f| tui::render::render(f, state))?;

        state.prune_notifications();
        state.prune_error();

        let Some(event) = events.next().await else {
            return Ok(());
        };
        match event {
            AppEvent::Key(key) => {
                let ctx = InputContext {
                    has_error: state.error.is_some(),
                    is_loading: state.loading,
                    searching: state.is_searching(),
                };
                match input::map_key(key, &ctx) {
                    Action::Quit => state.should_quit = true,
                    Action::DismissError => state.clear_error(),
                    Action::MoveUp => state.move_cursor_up(),
                    Action::MoveDown => state.move_cursor_down(),
                    Action::PageUp => state.page_up(),
                    Action::PageDown => state.page_down(),
                    Action::GoTop => state.go_top(),
                    Action::GoBottom => state.go_bottom(),
                    Action::Expand => state.expand_current(),
                    Action::Collapse => state.collapse_current(),
                    Action::ExpandAll => state.expand_all(),
                    Action::CollapseAll => state.collapse_all(),
                    Action::Toggle => state.toggle_expand(),
                    Action::StartSearch => state.start_search(),
                    Action::SearchInput(c) => state.search_input(c),
                    Action::SearchBackspace => state.search_backspace(),
                    Action::SearchSubmit => state.submit_search(),
                    Action::SearchCancel => state.cancel_search(),
                    Action::NextMatch => state.find(true),
                    Action::PreviousMatch => state.find(false),
                    Action::ExportLogs => {
                        if let Some(request) = state.export_request() {
                            spawn_monitored(
                                tx.clone(),
                                "export",
                                export_logs(request, cancel.clone(), tx.clone()),
                            );
                        }
                    }
                    Action::OpenBrowser => {
                        if let Some(url) = state.active_url() {
                            if let Err(e) = open_in_browser(url) {
                                state.set_error(format!("{e}"));
                            }
                        }
                    }
                    Action::Refresh => {
                        state.loading = true;
                        if refresh_tx.send(()).is_err() {
                            state.set_error("Poller stopped".to_string());
                        }
                    }
                    Action::None => {}
                }
            }
            AppEvent::Tick => {
                if last_tick.elapsed() >= Duration::from_millis(100) {
                    state.advance_spinner();
                    last_tick = Instant::now();
                }
                let new_interval = state.desired_interval();
                if new_interval != state.poll_interval {
                    state.poll_interval = new_interval;
                    if interval_tx.send(new_interval).is_err() {
                        tracing::warn!("poller stopped, interval change dropped");
                    }
                }
            }
            AppEvent::Resize => {
                let height = terminal.size()?.height;
                state.set_height(tui::render::table_height(height));
            }
            AppEvent::CacheUpdated(_) => state.refresh_rows(),
            AppEvent::Refreshed(at) => {
                state.loading = false;
                state.last_refresh = Some(at);
                state.clear_error();
                state.refresh_rows();
            }
            AppEvent::Exported { paths, streaming } => state.on_exported(&paths, streaming),
            AppEvent::Error(e) => {
                state.loading = false;
                state.set_error(e);
            }
        }

        if state.should_quit {
            events.stop();
            return Ok(());
        }
    }
}
