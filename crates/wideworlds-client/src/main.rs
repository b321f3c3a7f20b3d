mod commands;
mod config;
mod input;
mod io;
mod materials;
mod models;
mod net;
mod runtime;

use anyhow::Context;
use config::ClientConfig;
use input::MovementController;
use models::BoxModelProvider;
use net::{HttpWorldClient, WorldServer};
use runtime::WorldRuntime;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::{error, info};
use wideworlds_cache::ChunkCache;
use wideworlds_types::DEFAULT_CHUNK_SIDE;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting WideWorlds client...");

    let config = ClientConfig::load(Path::new("config/client.toml"))?;
    let password = std::env::var("WIDEWORLDS_PASSWORD").unwrap_or_default();

    // Sequence archives are parsed by the asset pipeline; none is wired
    // into this binary yet, so every sequence resolves as missing.
    let mut client = HttpWorldClient::new(config.server_url.clone(), |_bytes, _file| None);
    let session = client
        .login(&config.username, &password)
        .await
        .context("login failed")?;
    info!(user = session.id, "logged in");

    let worlds = client.worlds().await?;
    let world = worlds.first().context("no worlds on this server")?;
    let descriptor = client.world(world.id).await?;
    let avatars = client.avatars(&descriptor.path_base).await.unwrap_or_default();
    info!(world = %descriptor.name, avatars = avatars.len(), "world descriptor loaded");

    let cache = ChunkCache::open(PathBuf::from(&config.cache_dir))?;

    let (io_tx, io_rx) = mpsc::unbounded_channel();
    let (completion_tx, completion_rx) = mpsc::unbounded_channel();

    // Key events come from the UI layer; the controller still owns the
    // binding table and the per-frame integration.
    let controller = MovementController::new(config.controls.key_bindings.clone());

    let mut runtime = WorldRuntime::new(
        config,
        descriptor.clone(),
        session.id,
        Box::new(BoxModelProvider::new()),
        io_tx,
        completion_rx,
    );
    runtime.set_avatars(avatars);

    // The session transport feeds `ingest_entity_states` and
    // `apply_world_update` from its state and update channels; both are
    // outside this binary.
    tokio::select! {
        _ = frame_loop(&mut runtime, controller) => {
            info!("Client shut down cleanly");
        }
        _ = io::run_io_task(
            client,
            world.id,
            DEFAULT_CHUNK_SIDE,
            descriptor.path_base.clone(),
            cache,
            io_rx,
            completion_tx,
        ) => {
            error!("I/O task exited unexpectedly");
        }
    }

    Ok(())
}

/// The per-frame tick plus the chat prompt on stdin.
async fn frame_loop(runtime: &mut WorldRuntime, controller: MovementController) {
    let mut ticker = tokio::time::interval(Duration::from_millis(16));
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut last = Instant::now();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let delta = last.elapsed().as_secs_f32();
                last = Instant::now();
                runtime.set_movement_direction(controller.direction(runtime.user().yaw));
                let position = controller.integrate(runtime.user(), runtime.last_probe(), delta);
                runtime.update(position, delta);
                for message in runtime.feed_mut().drain() {
                    info!(kind = ?message.kind, "{}", message.text);
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !runtime.handle_chat_input(&line) {
                            info!("(chat) {}", line);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => error!("stdin error: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                runtime.unload();
                return;
            }
        }
    }
}
