//! World scenarios: attaching promoted cells, readiness thresholds,
//! ticking, and unloading.

use futures::future::join_all;
use genesis_common::{BlockPos, CellPos, ContentId, Identifier};
use genesis_world::prelude::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Observers {
    observed: AtomicBool,
    sent: Mutex<Vec<CellPos>>,
}

impl ObserverDelivery for Observers {
    fn is_observed(&self, _pos: CellPos) -> bool {
        self.observed.load(Ordering::SeqCst)
    }

    fn on_send_ready(&self, pos: CellPos) {
        self.sent.lock().push(pos);
    }
}

#[derive(Default)]
struct Tickets {
    escalated: Mutex<Vec<CellPos>>,
}

impl TicketSink for Tickets {
    fn wants_ticking(&self, _pos: CellPos) -> bool {
        true
    }

    fn escalate(&self, pos: CellPos) {
        self.escalated.lock().push(pos);
    }
}

#[derive(Default)]
struct CountingHooks {
    post_processed: Mutex<Vec<BlockPos>>,
    scheduled: AtomicUsize,
}

impl WorldHooks for CountingHooks {
    fn post_process(&self, _cell: &mut Cell, pos: BlockPos) {
        self.post_processed.lock().push(pos);
    }

    fn scheduled_tick(&self, _cell: &mut Cell, _tick: &ScheduledTick, _fluid: bool) {
        self.scheduled.fetch_add(1, Ordering::SeqCst);
    }
}

fn furnace_spot(pos: CellPos) -> BlockPos {
    pos.block(8, 0, 8)
}

struct Harness {
    world: World,
    observers: Arc<Observers>,
    tickets: Arc<Tickets>,
    hooks: Arc<CountingHooks>,
    storage: Arc<MemoryCellStorage>,
    stone: ContentId,
    beacon: ContentId,
    beacon_kind: Identifier,
}

impl Harness {
    /// `empty → full`, where full places a ticking furnace, a queued
    /// post-processing position, and a scheduled tick in every cell.
    fn new() -> Self {
        let furnace_kind = Identifier::genesis("furnace").expect("valid");
        let mut content = ContentTable::new();
        let stone = content.register(ContentProps {
            name: Identifier::genesis("stone").expect("valid"),
            flags: ContentFlags::SOLID | ContentFlags::BLOCKS_MOTION,
            sub_entity: None,
        });
        let furnace = content.register(ContentProps {
            name: Identifier::genesis("furnace").expect("valid"),
            flags: ContentFlags::SOLID | ContentFlags::BLOCKS_MOTION,
            sub_entity: Some(furnace_kind.clone()),
        });
        let beacon_kind = Identifier::genesis("beacon").expect("valid");
        let beacon = content.register(ContentProps {
            name: Identifier::genesis("beacon").expect("valid"),
            flags: ContentFlags::SOLID,
            sub_entity: Some(beacon_kind.clone()),
        });

        let kind = furnace_kind.clone();
        let place: Arc<dyn StageTask> = Arc::new(SimpleTask::new(
            move |_: &StageContext, cell: &mut Cell, _: &NeighborView<'_>| {
                let at = furnace_spot(cell.pos());
                cell.set_content(at, furnace);
                cell.add_pending_sub_entity(SubEntityPayload {
                    pos: at,
                    kind: kind.clone(),
                    data: Vec::new(),
                });
                cell.mark_for_post_processing(cell.pos().block(1, 1, 1));
                cell.block_ticks_mut()
                    .schedule(at, furnace, 2, TickPriority::Normal);
                Ok(())
            },
        ));

        let mut builder = StageChain::builder();
        builder
            .register(StageDef {
                name: Identifier::genesis("empty").expect("valid"),
                parent: None,
                neighbor_radius: 0,
                heightmaps: HeightmapSet::PRE_FEATURES,
                kind: StageKind::Intermediate,
                task: Arc::new(PassthroughTask),
            })
            .expect("empty");
        builder
            .register(StageDef {
                name: Identifier::genesis("full").expect("valid"),
                parent: builder.tail(),
                neighbor_radius: 0,
                heightmaps: HeightmapSet::POST_FEATURES,
                kind: StageKind::Final,
                task: place,
            })
            .expect("full");
        let chain = Arc::new(builder.build_with_names(&["full"]).expect("valid chain"));

        let storage = Arc::new(MemoryCellStorage::new());
        let (pipeline, events) = PipelineExecutor::new(
            chain,
            WorldConfig::default(),
            Arc::new(content),
            storage.clone(),
            Arc::new(ImmediateLighting),
            Handle::current(),
        );

        let mut kinds = SubEntityKinds::new();
        let ticker: Arc<dyn SubEntityTicker> =
            Arc::new(|entity: &mut SubEntity, _: &TickContext| -> Result<(), TickError> {
                entity.data_mut().push(1);
                Ok(())
            });
        kinds.register(furnace_kind, Some(ticker));
        let pulse: Arc<dyn SubEntityTicker> =
            Arc::new(|entity: &mut SubEntity, _: &TickContext| -> Result<(), TickError> {
                entity.data_mut().push(2);
                Ok(())
            });
        kinds.register(beacon_kind.clone(), Some(pulse));

        let observers = Arc::new(Observers::default());
        let tickets = Arc::new(Tickets::default());
        let hooks = Arc::new(CountingHooks::default());
        let world = World::new(
            pipeline,
            events,
            Arc::new(kinds),
            observers.clone(),
            tickets.clone(),
        )
        .with_hooks(hooks.clone());

        Self {
            world,
            observers,
            tickets,
            hooks,
            storage,
            stone,
            beacon,
            beacon_kind,
        }
    }

    async fn generate(&mut self, center: CellPos, radius: u32) {
        let pipeline = Arc::clone(self.world.pipeline());
        let full = pipeline.chain().final_stage();
        let requests = center.square(radius).map(|pos| pipeline.request(pos, full));
        let results = timeout(WAIT, join_all(requests)).await.expect("no hang");
        assert!(results.iter().all(Result::is_ok));
        self.world.run_pending();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_ready_waits_for_observer_and_runs_once() {
    let mut h = Harness::new();
    let center = CellPos::new(0, 0);
    h.generate(center, 1).await;
    assert_eq!(h.world.live_count(), 9);
    assert!(h.observers.sent.lock().is_empty());
    assert!(h.hooks.post_processed.lock().is_empty());

    h.observers.observed.store(true, Ordering::SeqCst);
    h.world.notify_observed(center);
    h.world.run_pending();
    assert_eq!(*h.observers.sent.lock(), vec![center]);
    assert_eq!(*h.hooks.post_processed.lock(), vec![center.block(1, 1, 1)]);
    assert!(h.world.is_send_ready(center));

    // Firing again changes nothing.
    h.world.notify_observed(center);
    h.world.notify_observed(CellPos::new(1, 0));
    h.world.run_pending();
    assert_eq!(h.observers.sent.lock().len(), 1);
    assert_eq!(h.hooks.post_processed.lock().len(), 1);
    assert!(!h.world.is_send_ready(CellPos::new(1, 0)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_escalation_follows_threshold() {
    let mut h = Harness::new();
    let center = CellPos::new(10, -10);
    h.observers.observed.store(true, Ordering::SeqCst);
    h.generate(center, 2).await;

    assert_eq!(*h.tickets.escalated.lock(), vec![center]);
    assert!(h.world.is_escalated(center));
    assert_eq!(h.observers.sent.lock().len(), 9);
    assert!(h.world.tracker().find_asymmetry().is_none());

    let corner = center.offset(2, 2);
    let flush = h.world.unload_cell(corner).expect("resident");
    assert!(timeout(WAIT, flush).await.expect("no hang").expect("flushed"));
    assert!(h.storage.contains(corner));
    h.world.run_pending();
    assert!(!h.world.is_escalated(center));
    assert!(!h.world.tracker().is_resident(corner));
    assert!(h.world.tracker().find_asymmetry().is_none());

    // Coming back from storage raises the threshold again.
    h.generate(corner, 0).await;
    assert_eq!(h.world.cell(corner).map(|c| c.origin()), Some(CellOrigin::Loaded));
    assert!(h.world.is_escalated(center));
    assert_eq!(h.tickets.escalated.lock().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tickers_follow_eligibility_and_content() {
    let mut h = Harness::new();
    let center = CellPos::new(0, 0);
    h.generate(center, 2).await;
    assert_eq!(h.world.tickers().bound_count(), 25);

    let report = h.world.tick();
    assert_eq!(report.game_time, 1);
    assert_eq!(report.tickers_run, 1);
    assert_eq!(report.tickers_skipped, 24);
    assert_eq!(report.block_ticks, 0);
    let at = furnace_spot(center);
    assert_eq!(h.world.sub_entity_mut(at, |e| e.data().len()), Some(1));

    let report = h.world.tick();
    assert_eq!(report.block_ticks, 1);
    assert_eq!(h.hooks.scheduled.load(Ordering::SeqCst), 1);

    // Replacing the furnace leaves a stale ticker that is skipped.
    h.world
        .cell(center)
        .expect("attached")
        .write()
        .set_content(at, h.stone);
    let report = h.world.tick();
    assert_eq!(report.tickers_run, 0);
    assert_eq!(report.tickers_skipped, 25);
    assert_eq!(report.ticker_errors, 0);

    let flush = h.world.unload_cell(center).expect("resident");
    assert!(timeout(WAIT, flush).await.expect("no hang").expect("flushed"));
    assert_eq!(h.world.tickers().bound_count(), 24);
    assert_eq!(h.world.tickers().occupied_slots(), 25);
    h.world.tick();
    assert_eq!(h.world.tickers().occupied_slots(), 24);
    assert!(!h.world.is_ticking(center));
    assert!(!h.world.is_ticking(center.offset(1, 0)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sub_entity_access_binds_ticker() {
    let mut h = Harness::new();
    let center = CellPos::new(0, 0);
    h.generate(center, 0).await;

    let at = furnace_spot(center);
    assert!(h.world.tickers().handle_at(center, at).is_some());
    assert!(h.world.sub_entity_mut(center.block(0, 0, 0), |_| ()).is_none());
    assert!(h
        .world
        .sub_entity_mut(BlockPos::new(1000, 0, 1000), |_| ())
        .is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_content_change_rebinds_ticker_in_place() {
    let mut h = Harness::new();
    let center = CellPos::new(0, 0);
    h.generate(center, 0).await;
    let at = furnace_spot(center);
    assert!(h.world.sub_entity_mut(at, |_| ()).is_some());
    let handle = h.world.tickers().handle_at(center, at).expect("bound");

    assert!(h.world.set_content(at, h.beacon).is_some());
    assert_eq!(h.world.tickers().handle_at(center, at), Some(handle));
    assert!(matches!(
        h.world.tickers().state(handle),
        Some(TickerState::Active(t)) if *t.kind() == h.beacon_kind
    ));
    let kind = h
        .world
        .cell(center)
        .and_then(|c| c.read().sub_entity(at).map(|e| e.kind().clone()));
    assert_eq!(kind, Some(h.beacon_kind.clone()));

    // Setting the same kind directly keeps the slot too.
    assert!(h.world.set_sub_entity(SubEntity::new(at, h.beacon_kind.clone(), vec![7])));
    assert_eq!(h.world.tickers().handle_at(center, at), Some(handle));
    assert_eq!(h.world.tickers().bound_count(), 1);

    // Content with no sub-entity removes it and unbinds.
    assert!(h.world.set_content(at, h.stone).is_some());
    assert!(h.world.tickers().handle_at(center, at).is_none());
    assert_eq!(h.world.tickers().state(handle), Some(&TickerState::Removed));
    assert!(h
        .world
        .cell(center)
        .is_some_and(|c| c.read().sub_entity(at).is_none()));
    assert!(h.world.set_content(center.offset(5, 0).block(0, 0, 0), h.stone).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remove_sub_entity_unbinds_only_its_slot() {
    let mut h = Harness::new();
    let center = CellPos::new(3, 3);
    h.generate(center, 0).await;
    let furnace = furnace_spot(center);
    assert!(h.world.sub_entity_mut(furnace, |_| ()).is_some());
    let kept = h.world.tickers().handle_at(center, furnace).expect("bound");

    let beacon = center.block(2, 0, 2);
    h.world.set_content(beacon, h.beacon);
    assert!(h.world.tickers().handle_at(center, beacon).is_none());
    assert!(h.world.set_sub_entity(SubEntity::new(beacon, h.beacon_kind.clone(), Vec::new())));
    let removed_handle = h.world.tickers().handle_at(center, beacon).expect("bound");
    assert_ne!(removed_handle, kept);
    assert_eq!(h.world.tickers().bound_count(), 2);

    let removed = h.world.remove_sub_entity(beacon).expect("present");
    assert_eq!(removed.kind(), &h.beacon_kind);
    assert!(removed.is_removed());
    assert!(h.world.tickers().handle_at(center, beacon).is_none());
    assert_eq!(h.world.tickers().state(removed_handle), Some(&TickerState::Removed));
    assert_eq!(h.world.tickers().handle_at(center, furnace), Some(kept));
    assert!(matches!(h.world.tickers().state(kept), Some(TickerState::Active(_))));
    assert_eq!(h.world.tickers().bound_count(), 1);
    assert!(h.world.remove_sub_entity(beacon).is_none());
}
