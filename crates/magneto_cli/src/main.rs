use std::{io::Write, sync::Arc, time::Duration};

use clap::Parser;
use magneto::{
    config::Config,
    torrent::{DownloadSession, Mode, Progress, SessionState},
    utils::{progress_bar, to_human_readable},
};
use tokio::{select, spawn, time::interval};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::{args::Args, error::Error};

mod args;
mod error;
mod player;

const RULE: &str = "============================================================";

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("\n\n❌ Error: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Error> {
    let mut config = Config::load().await?;
    args.apply(&mut config);
    config.validate()?;

    let _guard = init_tracing(&args.log_level).await?;

    let magnet = args.magnet()?;
    let torrent = args.torrent.clone().ok_or(Error::MissingMetadata)?;
    let mode = args.mode();

    match mode {
        Mode::Download => println!("\n{RULE}\n📥 DOWNLOAD MODE\n{RULE}\n"),
        Mode::Stream { .. } => println!("\n{RULE}\n🎬 STREAM MODE\n{RULE}\n"),
    }

    let mut builder = DownloadSession::builder(config.clone())
        .torrent_file(torrent)
        .peers(args.peers.clone())
        .mode(mode);

    if let Some(magnet) = magnet {
        builder = builder.magnet(magnet);
    }

    let session = Arc::new(builder.build()?);

    println!("🔍 Fetching metadata...");
    session.start().await?;

    let ctrl_c = session.clone();
    spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, cancelling");
            let _ = ctrl_c.cancel().await;
        }
    });

    if let Some(meta) = session.metadata() {
        println!("\n📦 Torrent: {}", meta.name);
        println!("📊 Size: {}", to_human_readable(meta.total_length));
        println!("📁 Files: {}", meta.files.len());
        println!("💾 Saving to: {}\n", config.download_dir.display());
    }

    let last = match mode {
        Mode::Download => {
            show_progress(&session, |p| p.state == SessionState::Completed).await
        }
        Mode::Stream { .. } => stream(&session, &config, args.no_player).await?,
    };

    match last.state {
        SessionState::Cancelled => println!("\n\n⏹️  Stopped by user"),
        SessionState::Failed(e) => println!("\n\n❌ Download failed: {e}"),
        _ => println!("\n\n✅ Download complete!"),
    }

    session.cancel().await?;
    println!("\n👋 Goodbye!\n");

    Ok(())
}

async fn stream(
    session: &DownloadSession,
    config: &Config,
    no_player: bool,
) -> Result<Progress, Error> {
    let file = session.target_file().cloned().ok_or(Error::NoTargetFile)?;
    let path = config.download_dir.join(&file.path);

    println!("🎥 Main file: {}", file.path.display());
    println!("📁 Full path: {}", path.display());
    println!("\n⏳ Buffering for streaming...\n");

    let last = show_progress(session, |p| p.buffer_ready).await;
    if !last.buffer_ready {
        return Ok(last);
    }

    println!("\n\n✅ Ready to stream!");

    if !no_player {
        match player::find_player() {
            Some((player, bin)) => {
                println!("\n🎬 Opening media player...");
                match player::launch(player, &bin, &path) {
                    Ok(_) => println!("✓ Opened with {}", player.name),
                    Err(e) => {
                        warn!("{e}");
                        println!("⚠️  {e}");
                        println!("\n💡 Try opening manually: mpv '{}'", path.display());
                    }
                }
            }
            None => {
                println!("\n⚠️  No media player found.");
                println!("Install MPV (recommended for streaming) or VLC.");
            }
        }
    }

    println!("\n⬇️  Continuing download in background...");
    println!("Press Ctrl+C to stop\n");

    Ok(show_progress(session, |p| p.verified_pieces == p.total_pieces).await)
}

/// Print the progress line every second until `done`, or until the session
/// stops.
async fn show_progress(
    session: &DownloadSession,
    done: impl Fn(&Progress) -> bool,
) -> Progress {
    let mut rx = session.subscribe();
    let mut ticker = interval(Duration::from_secs(1));

    loop {
        select! {
            _ = ticker.tick() => print_progress(&session.progress()),
            r = rx.changed() => {
                if r.is_err() {
                    return session.progress();
                }
            }
        }

        let progress = session.progress();
        if done(&progress) || progress.state.is_terminal() {
            print_progress(&progress);
            return progress;
        }
    }
}

fn print_progress(p: &Progress) {
    let stalled = if p.stalled { " | waiting for peers" } else { "" };

    print!(
        "\r[{}] {:.1}% | ↓ {}/s | ↑ {}/s | 👥 {}{stalled}   ",
        progress_bar(p.fraction, 40),
        p.fraction * 100.0,
        to_human_readable(p.download_rate),
        to_human_readable(p.upload_rate),
        p.peers,
    );
    let _ = std::io::stdout().flush();
}

/// Log to a daily file, the terminal is taken by the progress line.
async fn init_tracing(filter: &str) -> Result<WorkerGuard, Error> {
    let dir = Config::log_dir()?;
    tokio::fs::create_dir_all(&dir).await?;

    let appender = tracing_appender::rolling::daily(&dir, "magneto.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Ok(guard)
}
