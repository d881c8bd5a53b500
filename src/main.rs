use clap::Parser;
use colored::*;
use lyricist::cache::CacheReconciler;
use lyricist::client::{ConnectionStatus, OpenAiClient};
use lyricist::controller::TranslationController;
use lyricist::events::{EventBus, TranslationEvent};
use lyricist::main_helper::*;
use lyricist::models::ModelCatalog;
use lyricist::settings::TranslationSettings;
use lyricist::types::*;
use std::sync::Arc;
use std::time::Duration;

fn exit_with(message: &str) -> ! {
    eprintln!("{} {}", "error:".red().bold(), message);
    std::process::exit(1);
}

/// Prints task events as they arrive until the bus closes.
fn spawn_event_printer(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(TranslationEvent::TaskNew { task_id, song_name, .. }) => {
                    eprintln!("{} {} ({})", "task".green().bold(), song_name, task_id.short());
                }
                Ok(TranslationEvent::TaskProgress { progress, .. }) => {
                    eprintln!("  {:>5.1}%", progress);
                }
                Ok(TranslationEvent::TaskDone { task_id }) => {
                    eprintln!("{} {}", "done".green().bold(), task_id.short());
                }
                Ok(TranslationEvent::TaskError { error, .. }) => {
                    eprintln!("{} {}", "failed".red().bold(), error);
                }
                Ok(TranslationEvent::GenerateAvailable { available: true }) => {
                    eprintln!("{}", "Translation can be (re)generated with --generate".yellow());
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Event printer skipped {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let _guard = lyricist::logging::init_tracing(&args.log_dir);
    lyricist::logging::setup_panic_hook();

    let settings = match load_settings(&args) {
        Ok(s) => s,
        Err(e) => exit_with(&e.inner.to_string()),
    };
    let client = match OpenAiClient::with_timeouts(Duration::from_secs(args.connect_timeout_secs)) {
        Ok(c) => c,
        Err(e) => exit_with(&format!("Failed to build HTTP client: {}", e.inner)),
    };
    let current = TranslationSettings::load(settings.as_ref());

    if args.list_models {
        let catalog = ModelCatalog::new(Arc::new(client.clone())).with_debounce(Duration::ZERO);
        match catalog.refresh_debounced(&current.api_endpoint, &current.api_key).await {
            Some(models) if !models.is_empty() => {
                for model in models {
                    println!("{}", model);
                }
            }
            _ => eprintln!("{}", "No models reported by the endpoint".yellow()),
        }
        return;
    }

    if args.test_connection {
        match client
            .test_connection(&current.api_endpoint, &current.api_key, &current.model)
            .await
        {
            ConnectionStatus::Ok => println!("{}", "Connection OK".green().bold()),
            ConnectionStatus::Failed(reason) => exit_with(&reason),
        }
        return;
    }

    let lyrics_path = match &args.lyrics {
        Some(p) => p.clone(),
        None => exit_with("a lyrics file is required"),
    };
    let lines = match read_lyrics(&lyrics_path) {
        Ok(l) => l,
        Err(e) => exit_with(&format!("Could not read {:?}: {}", lyrics_path, e.inner)),
    };
    let hash = content_hash(&lines);

    let store = match open_cache_store(&args).await {
        Ok(s) => s,
        Err(e) => exit_with(&format!("Failed to open cache: {}", e.inner)),
    };

    let bus = EventBus::default();
    let printer = spawn_event_printer(&bus);
    let controller = TranslationController::new(
        Arc::new(client),
        CacheReconciler::new(store),
        settings,
        bus,
    );

    let song_name = match &args.song_name {
        Some(n) => n.clone(),
        None => lyrics_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default(),
    };
    let song = SongInfo {
        id: SongId::from(args.song_id.clone().unwrap_or_else(|| hash.short().to_string())),
        name: song_name,
    };
    tracing::info!("Loaded {} lines for {} ({})", lines.len(), song.name, hash.short());

    controller
        .on_lyrics_updated(LyricsUpdate {
            lyrics: LyricSet::from_lines(hash, lines),
            song,
        })
        .await;

    if args.generate && controller.can_generate() {
        controller.generate().await;
    }
    controller.wait_for_upgrades().await;

    if let Some(overlay) = controller.overlay() {
        print!("{}", render_lyrics(&overlay));
    }

    drop(controller);
    if let Err(e) = printer.await {
        tracing::warn!("Event printer ended abnormally: {}", e);
    }
}
