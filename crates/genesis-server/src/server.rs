//! Headless server loop: generates the spawn area, ticks the world, and
//! flushes everything on shutdown.

use crate::config::ServerConfig;
use crate::generator::{FlatContent, FlatGenerator};
use anyhow::{Context, Result};
use futures::future::join_all;
use genesis_common::CellPos;
use genesis_world::{
    ContentTable, FileCellStorage, ImmediateLighting, ObserverDelivery, PipelineExecutor,
    StageChain, SubEntity, SubEntityKinds, SubEntityTicker, TickContext, TickError, TicketSink,
    World,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Observes every cell within `radius` of spawn.
#[derive(Debug)]
struct SpawnObserver {
    spawn: CellPos,
    radius: u32,
}

impl ObserverDelivery for SpawnObserver {
    fn is_observed(&self, pos: CellPos) -> bool {
        pos.chebyshev_distance(self.spawn) <= self.radius
    }

    fn on_send_ready(&self, pos: CellPos) {
        debug!("Cell {pos} ready to send");
    }
}

/// Accepts every escalation and logs it.
#[derive(Debug)]
struct LoggingTickets;

impl TicketSink for LoggingTickets {
    fn wants_ticking(&self, _pos: CellPos) -> bool {
        true
    }

    fn escalate(&self, pos: CellPos) {
        debug!("Cell {pos} entered the ticking tier");
    }
}

/// Counts burn time in the first byte of the furnace's data.
fn furnace_ticker() -> Arc<dyn SubEntityTicker> {
    Arc::new(|entity: &mut SubEntity, _ctx: &TickContext| -> Result<(), TickError> {
        let data = entity.data_mut();
        match data.first_mut() {
            Some(burn) => *burn = burn.wrapping_add(1),
            None => data.push(1),
        }
        Ok(())
    })
}

/// Runs the server until the configured tick count or Ctrl-C.
pub async fn run(config: ServerConfig) -> Result<()> {
    let mut table = ContentTable::new();
    let content = FlatContent::register(&mut table).context("registering content")?;
    let mut kinds = SubEntityKinds::new();
    kinds.register(content.furnace_kind.clone(), Some(furnace_ticker()));

    let generator = Arc::new(FlatGenerator::new(content));
    let chain = StageChain::standard(generator, &config.world.distance_table)
        .context("building the stage chain")?;
    info!(
        "Stage chain has {} stages, ticket distances up to {}",
        chain.len(),
        chain.max_distance()
    );

    let storage = Arc::new(FileCellStorage::new(&config.save_dir));
    info!("Saving cells to {}", storage.dir().display());
    let (pipeline, events) = PipelineExecutor::new(
        Arc::new(chain),
        config.world.clone(),
        Arc::new(table),
        storage,
        Arc::new(ImmediateLighting),
        Handle::current(),
    );

    let spawn = CellPos::new(0, 0);
    let mut world = World::new(
        Arc::clone(&pipeline),
        events,
        Arc::new(kinds),
        Arc::new(SpawnObserver {
            spawn,
            radius: config.spawn_radius,
        }),
        Arc::new(LoggingTickets),
    );

    let started = Instant::now();
    let full = pipeline.chain().final_stage();
    let results = join_all(
        spawn
            .square(config.spawn_radius)
            .map(|pos| pipeline.request(pos, full)),
    )
    .await;
    let failed = results.iter().filter(|r| r.is_err()).count();
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        warn!("Spawn generation failed: {err}");
    }
    world.run_pending();
    info!(
        "Spawn area ready in {:.2?}: {} cells full, {} failed, {} resident",
        started.elapsed(),
        world.live_count(),
        failed,
        pipeline.holder_count()
    );

    tick_loop(&mut world, &config).await?;
    shutdown(&mut world).await
}

async fn tick_loop(world: &mut World, config: &ServerConfig) -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_millis(config.tick_interval_ms));
    loop {
        tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                return Ok(());
            }
            _ = interval.tick() => {}
        }

        let report = world.tick();
        if report.ticker_errors > 0 {
            warn!("{} tickers failed at tick {}", report.ticker_errors, report.game_time);
        }
        debug!("Tick {report:?}");

        if config.autosave_interval > 0 && report.game_time % config.autosave_interval == 0 {
            autosave(world.pipeline()).await?;
        }
        if config.ticks > 0 && report.game_time >= config.ticks {
            info!("Ran {} ticks", report.game_time);
            return Ok(());
        }
    }
}

async fn autosave(pipeline: &Arc<PipelineExecutor>) -> Result<()> {
    let pipeline = Arc::clone(pipeline);
    let saved = tokio::task::spawn_blocking(move || pipeline.save_all())
        .await
        .context("autosave task panicked")?;
    match saved {
        Ok(count) => debug!("Autosaved {count} cells"),
        Err(e) => warn!("Autosave incomplete: {e}"),
    }
    Ok(())
}

async fn shutdown(world: &mut World) -> Result<()> {
    let positions = world.pipeline().positions();
    let flushes: Vec<_> = positions
        .into_iter()
        .filter_map(|pos| world.unload_cell(pos))
        .collect();
    let total = flushes.len();
    let mut written = 0;
    let mut failed = 0;
    for result in join_all(flushes).await {
        match result {
            Ok(true) => written += 1,
            Ok(false) => {},
            Err(e) => {
                warn!("Failed to flush cell: {e}");
                failed += 1;
            },
        }
    }
    info!("Unloaded {total} cells, wrote {written}");
    if failed > 0 {
        anyhow::bail!("{failed} cells could not be written");
    }
    Ok(())
}
