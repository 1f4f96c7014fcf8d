use std::{io, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::event::{self, Event};
use gpumon::{
    app::App, cli::Cli, config::Config, logger, monitor::Monitor, nvidia, nvidia::Commands,
    store::HistoryStore, ui,
};
use ratatui::{backend::CrosstermBackend, Terminal};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logger::init_logging(&cli.log_path());

    let config = cli.into_config().context("Invalid configuration")?;
    let commands = Commands::for_config(&config);

    // Fatal problems are reported before the terminal is taken over
    nvidia::preflight(&commands, &config)
        .await
        .context("Cannot start GPU monitoring")?;

    let monitor = Monitor::start(&config, commands);

    {
        let token = monitor.token();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("Termination signal received");
            token.cancel();
        });
    }

    let ui_result = {
        let store = monitor.store();
        let token = monitor.token();
        let config = config.clone();
        tokio::task::spawn_blocking(move || run_tui(&config, store, token))
            .await
            .context("UI thread panicked")
    };

    monitor.shutdown().await;
    ui_result?
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn run_tui(config: &Config, store: Arc<HistoryStore>, token: CancellationToken) -> Result<()> {
    crossterm::terminal::enable_raw_mode()?;
    crossterm::execute!(io::stdout(), crossterm::terminal::EnterAlternateScreen)?;

    let result = Terminal::new(CrosstermBackend::new(io::stdout()))
        .map_err(anyhow::Error::from)
        .and_then(|mut terminal| event_loop(&mut terminal, App::new(store, config), config, &token));

    // Restore the terminal even if drawing failed
    crossterm::execute!(io::stdout(), crossterm::terminal::LeaveAlternateScreen)?;
    crossterm::terminal::disable_raw_mode()?;

    // Quitting from the UI stops the samplers too
    token.cancel();
    result
}

fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    mut app: App,
    config: &Config,
    token: &CancellationToken,
) -> Result<()> {
    let poll_timeout = config.refresh_rate.min(Duration::from_millis(100));

    while !app.should_quit && !token.is_cancelled() {
        app.tick();
        terminal.draw(|f| ui::render(f, &app))?;

        // Drain input until the next redraw is due
        let deadline = std::time::Instant::now() + config.refresh_rate;
        while std::time::Instant::now() < deadline && !app.should_quit {
            if event::poll(poll_timeout)? {
                if let Event::Key(key) = event::read()? {
                    app.handle_key(key);
                }
            }
        }
    }

    Ok(())
}
