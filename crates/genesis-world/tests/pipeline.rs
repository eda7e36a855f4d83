//! Pipeline executor scenarios: dependency windows, shared stage futures,
//! residency loss, storage round trips.

use futures::future::join_all;
use futures::FutureExt;
use genesis_common::{CellPos, Identifier, StorageResult};
use genesis_world::prelude::*;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

/// Blocks one task until released.
#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
    entered: AtomicBool,
}

impl Gate {
    fn pass(&self) {
        self.entered.store(true, Ordering::SeqCst);
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
    }

    fn release(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }

    async fn wait_entered(&self) {
        while !self.entered.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

#[derive(Default)]
struct Recorder {
    generated: Mutex<Vec<(String, CellPos)>>,
    loaded: Mutex<Vec<(String, CellPos)>>,
    in_flight: Mutex<Vec<(String, CellPos)>>,
    overlaps: AtomicUsize,
    violations: AtomicUsize,
    forced: AtomicUsize,
}

impl Recorder {
    fn count(&self, stage: &str, pos: CellPos) -> usize {
        self.generated
            .lock()
            .iter()
            .filter(|(s, p)| s == stage && *p == pos)
            .count()
    }

    fn count_stage(&self, stage: &str) -> usize {
        self.generated.lock().iter().filter(|(s, _)| s == stage).count()
    }
}

/// Counts a violation for every neighbor missing from the window or short
/// of its dependency stage.
fn check_window(recorder: &Recorder, ctx: &StageContext, cell: &Cell, view: &NeighborView<'_>) {
    let radius = ctx.chain.get(ctx.stage).neighbor_radius();
    let expected = ((2 * radius + 1) * (2 * radius + 1) - 1) as usize;
    if !ctx.forced && view.iter().count() != expected {
        recorder.violations.fetch_add(1, Ordering::SeqCst);
    }
    for neighbor in view.iter() {
        let distance = cell.pos().chebyshev_distance(neighbor.pos());
        let needed = ctx.chain.dependency_stage(ctx.stage, distance);
        if distance > radius || !neighbor.stage().is_at_least(needed) {
            recorder.violations.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Records every run and checks the dependency window it was given.
struct RecordingTask {
    recorder: Arc<Recorder>,
    delay: Duration,
    gate: Option<(&'static str, CellPos, Arc<Gate>)>,
    fail_first: Option<(&'static str, CellPos, Arc<AtomicBool>)>,
}

impl RecordingTask {
    fn new(recorder: &Arc<Recorder>) -> Self {
        Self {
            recorder: Arc::clone(recorder),
            delay: Duration::ZERO,
            gate: None,
            fail_first: None,
        }
    }
}

impl StageTask for RecordingTask {
    fn run_generation(&self, ctx: StageContext, region: GenerationRegion) -> TaskFuture {
        let recorder = Arc::clone(&self.recorder);
        let delay = self.delay;
        let gate = self.gate.clone();
        let fail_first = self.fail_first.clone();
        async move {
            tokio::task::spawn_blocking(move || {
                region.with_cells(|cell, view| {
                    let stage = ctx.chain.get(ctx.stage).name().path().to_owned();
                    let key = (stage.clone(), cell.pos());
                    {
                        let mut in_flight = recorder.in_flight.lock();
                        if in_flight.contains(&key) {
                            recorder.overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        in_flight.push(key.clone());
                    }
                    if let Some((gated, pos, gate)) = &gate {
                        if *gated == stage && *pos == cell.pos() {
                            gate.pass();
                        }
                    }
                    std::thread::sleep(delay);

                    check_window(&recorder, &ctx, cell, view);
                    if ctx.forced {
                        recorder.forced.fetch_add(1, Ordering::SeqCst);
                    }

                    recorder.in_flight.lock().retain(|k| *k != key);
                    if let Some((failing, pos, failed)) = &fail_first {
                        let targeted = *failing == stage && *pos == cell.pos();
                        if targeted && !failed.swap(true, Ordering::SeqCst) {
                            return Err(TaskError::Failed("first attempt fails".into()));
                        }
                    }
                    recorder.generated.lock().push(key);
                    Ok(())
                })
            })
            .await
            .map_err(|e| TaskError::Panicked(e.to_string()))?
        }
        .boxed()
    }

    fn run_load(&self, ctx: StageContext, region: GenerationRegion) -> TaskFuture {
        let recorder = Arc::clone(&self.recorder);
        async move {
            tokio::task::spawn_blocking(move || {
                region.with_cells(|cell, view| {
                    check_window(&recorder, &ctx, cell, view);
                    let stage = ctx.chain.get(ctx.stage).name().path().to_owned();
                    recorder.loaded.lock().push((stage, cell.pos()));
                });
            })
            .await
            .map_err(|e| TaskError::Panicked(e.to_string()))
        }
        .boxed()
    }
}

fn build_chain(stages: &[(&str, u32)], table: &[&str], task: RecordingTask) -> Arc<StageChain> {
    let task: Arc<dyn StageTask> = Arc::new(task);
    let mut builder = StageChain::builder();
    let last = stages.len() - 1;
    for (index, &(name, radius)) in stages.iter().enumerate() {
        builder
            .register(StageDef {
                name: Identifier::genesis(name).expect("valid name"),
                parent: builder.tail(),
                neighbor_radius: radius,
                heightmaps: HeightmapSet::EMPTY,
                kind: if index == last {
                    StageKind::Final
                } else {
                    StageKind::Intermediate
                },
                task: Arc::clone(&task),
            })
            .expect("valid stage");
    }
    Arc::new(builder.build_with_names(table).expect("valid chain"))
}

/// `empty → decorate → full(1)`: full needs the 3×3 ring at decorate.
fn ring_chain(task: RecordingTask) -> Arc<StageChain> {
    build_chain(
        &[("empty", 0), ("decorate", 0), ("full", 1)],
        &["full", "decorate"],
        task,
    )
}

/// Memory storage whose writes take a while.
struct SlowStorage {
    inner: MemoryCellStorage,
    delay: Duration,
}

impl CellStorage for SlowStorage {
    fn read(&self, pos: CellPos) -> StorageResult<Option<PersistedCell>> {
        self.inner.read(pos)
    }

    fn write(&self, record: &PersistedCell) -> StorageResult<()> {
        std::thread::sleep(self.delay);
        self.inner.write(record)
    }
}

fn executor(
    chain: Arc<StageChain>,
    config: WorldConfig,
    storage: Arc<dyn CellStorage>,
) -> (Arc<PipelineExecutor>, crossbeam_channel::Receiver<PipelineEvent>) {
    PipelineExecutor::new(
        chain,
        config,
        Arc::new(ContentTable::new()),
        storage,
        Arc::new(ImmediateLighting),
        Handle::current(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_final_runs_only_on_center() {
    let recorder = Arc::new(Recorder::default());
    let chain = ring_chain(RecordingTask::new(&recorder));
    let full = chain.final_stage();
    let (pipeline, events) = executor(chain, WorldConfig::default(), Arc::new(MemoryCellStorage::new()));
    let center = CellPos::new(4, -2);

    let holder = timeout(WAIT, pipeline.request(center, full))
        .await
        .expect("no hang")
        .expect("generates");
    assert_eq!(holder.stage(), full);
    assert!(holder.read().is_full());

    for pos in center.square(1) {
        assert_eq!(recorder.count("decorate", pos), 1, "decorate on {pos}");
        let neighbor = pipeline.get_if_present(pos).expect("resident");
        assert!(neighbor.stage().is_at_least(full) == (pos == center));
    }
    assert_eq!(recorder.count_stage("full"), 1);
    assert_eq!(recorder.count_stage("decorate"), 9);
    assert_eq!(pipeline.holder_count(), 9);
    assert_eq!(recorder.violations.load(Ordering::SeqCst), 0);

    // Asking again attaches to the finished future.
    let again = timeout(WAIT, pipeline.request(center, full))
        .await
        .expect("no hang")
        .expect("still generated");
    assert!(Arc::ptr_eq(&holder, &again));
    assert_eq!(recorder.count_stage("full"), 1);
    assert_eq!(recorder.count_stage("decorate"), 9);

    let promoted: Vec<_> = events.try_iter().collect();
    assert_eq!(promoted.len(), 1);
    let PipelineEvent::Promoted(cell) = &promoted[0];
    assert_eq!(cell.pos(), center);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_share_one_task() {
    let recorder = Arc::new(Recorder::default());
    let mut task = RecordingTask::new(&recorder);
    task.delay = Duration::from_millis(5);
    let chain = build_chain(
        &[("empty", 0), ("shape", 1), ("decorate", 1), ("full", 1)],
        &["full", "decorate", "shape", "empty"],
        task,
    );
    let full = chain.final_stage();
    let (pipeline, _events) = executor(chain, WorldConfig::default(), Arc::new(MemoryCellStorage::new()));

    let center = CellPos::new(0, 0);
    let requests = (0..8).map(|i| {
        let pos = if i % 2 == 0 { center } else { center.offset(1, 0) };
        pipeline.request(pos, full)
    });
    let results = timeout(WAIT, join_all(requests)).await.expect("no hang");
    assert!(results.iter().all(Result::is_ok));

    assert_eq!(recorder.overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(recorder.violations.load(Ordering::SeqCst), 0);
    let runs = recorder.generated.lock().clone();
    for run in &runs {
        assert_eq!(runs.iter().filter(|r| *r == run).count(), 1, "{run:?} ran twice");
    }
    assert_eq!(recorder.count_stage("full"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_monotonic_stages() {
    let recorder = Arc::new(Recorder::default());
    let chain = build_chain(
        &[("empty", 0), ("shape", 1), ("decorate", 1), ("full", 1)],
        &["full", "decorate", "shape", "empty"],
        RecordingTask::new(&recorder),
    );
    let shape = chain.by_name("shape").expect("shape");
    let full = chain.final_stage();
    let (pipeline, _events) = executor(chain, WorldConfig::default(), Arc::new(MemoryCellStorage::new()));
    let pos = CellPos::new(0, 0);

    timeout(WAIT, pipeline.request(pos, full))
        .await
        .expect("no hang")
        .expect("generates");
    let holder = timeout(WAIT, pipeline.request(pos, shape))
        .await
        .expect("no hang")
        .expect("already past shape");
    assert_eq!(holder.stage(), full);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unloading_dependency_fails_neighbor() {
    let recorder = Arc::new(Recorder::default());
    let gate = Arc::new(Gate::default());
    let c = CellPos::new(1, 0);
    let n = CellPos::new(0, 0);
    let mut task = RecordingTask::new(&recorder);
    task.gate = Some(("decorate", c, Arc::clone(&gate)));
    let chain = ring_chain(task);
    let full = chain.final_stage();
    let storage = Arc::new(MemoryCellStorage::new());
    let (pipeline, _events) = executor(chain, WorldConfig::default(), storage.clone());

    let request = tokio::spawn(pipeline.request(n, full));
    timeout(WAIT, gate.wait_entered()).await.expect("gated task started");

    let flush = pipeline.unload(c).expect("c was resident");
    let err = timeout(WAIT, request)
        .await
        .expect("no hang")
        .expect("request task")
        .expect_err("dependency unloaded");
    match &err {
        PipelineError::Dependency { pos, neighbor, .. } => {
            assert_eq!(*pos, n);
            assert_eq!(*neighbor, c);
        },
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(err.root_cause(), &PipelineError::Unloaded(c));
    assert!(pipeline.get_if_present(n).is_some_and(|h| !h.stage().is_at_least(full)));

    gate.release();
    timeout(WAIT, flush).await.expect("no hang").expect("flushed");
    assert!(pipeline.get_if_present(c).is_none());
    // The gated task finished after the unload; its commit was discarded.
    assert_eq!(recorder.count("decorate", c), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_future_is_replaced_on_next_request() {
    let recorder = Arc::new(Recorder::default());
    let broken = CellPos::new(1, 1);
    let mut task = RecordingTask::new(&recorder);
    task.fail_first = Some(("decorate", broken, Arc::new(AtomicBool::new(false))));
    let chain = ring_chain(task);
    let full = chain.final_stage();
    let (pipeline, _events) = executor(chain, WorldConfig::default(), Arc::new(MemoryCellStorage::new()));
    let center = CellPos::new(0, 0);

    let err = timeout(WAIT, pipeline.request(center, full))
        .await
        .expect("no hang")
        .expect_err("neighbor fails");
    assert!(matches!(
        err.root_cause(),
        PipelineError::TaskFailed { pos, .. } if *pos == broken
    ));
    assert_eq!(pipeline.get_if_present(center).map(|h| h.stage() == full), Some(false));

    let holder = timeout(WAIT, pipeline.request(center, full))
        .await
        .expect("no hang")
        .expect("retry succeeds");
    assert_eq!(holder.stage(), full);
    assert_eq!(recorder.count("decorate", broken), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_out_of_bounds() {
    let recorder = Arc::new(Recorder::default());
    let chain = ring_chain(RecordingTask::new(&recorder));
    let full = chain.final_stage();
    let config = WorldConfig {
        max_cell_coordinate: 1,
        ..WorldConfig::default()
    };
    let (pipeline, _events) = executor(chain, config, Arc::new(MemoryCellStorage::new()));

    let err = pipeline
        .request(CellPos::new(2, 0), full)
        .await
        .expect_err("outside");
    assert_eq!(err, PipelineError::OutOfBounds(CellPos::new(2, 0)));

    let err = timeout(WAIT, pipeline.request(CellPos::new(1, 0), full))
        .await
        .expect("no hang")
        .expect_err("ring leaves the world");
    assert!(matches!(err.root_cause(), PipelineError::OutOfBounds(p) if p.x == 2));
    assert_eq!(recorder.count_stage("full"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stored_cell_uses_load_path() {
    let storage = Arc::new(MemoryCellStorage::new());
    let pos = CellPos::new(-7, 3);

    let first = Arc::new(Recorder::default());
    let chain = ring_chain(RecordingTask::new(&first));
    let full = chain.final_stage();
    {
        let (pipeline, _events) = executor(chain, WorldConfig::default(), storage.clone());
        timeout(WAIT, pipeline.request(pos, full))
            .await
            .expect("no hang")
            .expect("generates");
        assert_eq!(pipeline.save_all().expect("saves"), 9);
        assert_eq!(pipeline.save_all().expect("nothing new"), 0);
    }
    assert!(storage.contains(pos));

    let second = Arc::new(Recorder::default());
    let chain = ring_chain(RecordingTask::new(&second));
    let (pipeline, events) = executor(chain, WorldConfig::default(), storage.clone());
    let holder = timeout(WAIT, pipeline.request(pos, full))
        .await
        .expect("no hang")
        .expect("loads");
    assert_eq!(holder.origin(), CellOrigin::Loaded);
    assert_eq!(holder.stage(), full);
    assert!(second.generated.lock().is_empty());
    assert_eq!(second.violations.load(Ordering::SeqCst), 0);

    // The full load task still gets its ring, itself loaded at decorate.
    let decorate = pipeline.chain().get(full).parent();
    assert_eq!(pipeline.holder_count(), 9);
    for neighbor in pos.square(1).filter(|p| *p != pos) {
        let ring = pipeline.get_if_present(neighbor).expect("ring resident");
        assert_eq!(ring.origin(), CellOrigin::Loaded);
        assert!(ring.stage().is_at_least(decorate));
    }
    let loaded = second.loaded.lock();
    assert_eq!(loaded.iter().filter(|(_, p)| *p == pos).count(), 3);
    assert_eq!(loaded.len(), 3 + 8 * 2);
    drop(loaded);
    assert_eq!(events.try_iter().count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_request_during_flush_loads_flushed_cell() {
    let mut table = ContentTable::new();
    let stone = table.register(ContentProps {
        name: Identifier::genesis("stone").expect("valid name"),
        flags: ContentFlags::SOLID,
        sub_entity: None,
    });
    let recorder = Arc::new(Recorder::default());
    let chain = build_chain(&[("empty", 0), ("full", 0)], &["full"], RecordingTask::new(&recorder));
    let full = chain.final_stage();
    let storage = Arc::new(SlowStorage {
        inner: MemoryCellStorage::new(),
        delay: Duration::from_millis(300),
    });
    let (pipeline, _events) = PipelineExecutor::new(
        chain,
        WorldConfig::default(),
        Arc::new(table),
        storage,
        Arc::new(ImmediateLighting),
        Handle::current(),
    );
    let pos = CellPos::new(4, -2);
    let spot = pos.block(3, 10, 3);

    let holder = timeout(WAIT, pipeline.request(pos, full))
        .await
        .expect("no hang")
        .expect("generates");
    holder.write().set_content(spot, stone).expect("in range");
    let flush = pipeline.unload(pos).expect("resident");
    assert_eq!(pipeline.pending_flushes(), 1);

    // Re-requested while the write is still sleeping.
    let again = timeout(WAIT, pipeline.request(pos, full))
        .await
        .expect("no hang")
        .expect("reloads");
    assert!(!Arc::ptr_eq(&holder, &again));
    assert_eq!(again.origin(), CellOrigin::Loaded);
    assert_eq!(again.read().content(spot), stone);
    assert!(timeout(WAIT, flush).await.expect("no hang").expect("flushed"));
    assert_eq!(pipeline.pending_flushes(), 0);
    assert_eq!(recorder.count("full", pos), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stale_stage_is_discarded() {
    let storage = Arc::new(MemoryCellStorage::new());
    let recorder = Arc::new(Recorder::default());
    let chain = ring_chain(RecordingTask::new(&recorder));
    let full = chain.final_stage();
    let pos = CellPos::new(0, 0);

    let layout = CellLayout::new(-4, 24, Arc::new(ContentTable::new()));
    let mut record = Cell::new(pos, chain.first(), layout).to_record(&chain);
    record.stage = "genesis:retired".into();
    storage.write(&record).expect("write");

    let (pipeline, _events) = executor(chain, WorldConfig::default(), storage.clone());
    let holder = timeout(WAIT, pipeline.request(pos, full))
        .await
        .expect("no hang")
        .expect("regenerates");
    assert_eq!(holder.origin(), CellOrigin::Fresh);
    assert_eq!(recorder.count("full", pos), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_regenerate_forces_task() {
    let recorder = Arc::new(Recorder::default());
    let chain = ring_chain(RecordingTask::new(&recorder));
    let decorate = chain.by_name("decorate").expect("decorate");
    let full = chain.final_stage();
    let (pipeline, _events) = executor(chain, WorldConfig::default(), Arc::new(MemoryCellStorage::new()));
    let pos = CellPos::new(0, 0);

    timeout(WAIT, pipeline.request(pos, full))
        .await
        .expect("no hang")
        .expect("generates");
    timeout(WAIT, pipeline.regenerate(pos, decorate))
        .await
        .expect("no hang")
        .expect("reruns");
    assert_eq!(recorder.forced.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.count("decorate", pos), 2);

    let err = pipeline
        .regenerate(CellPos::new(40, 40), decorate)
        .await
        .expect_err("not resident");
    assert_eq!(err, PipelineError::Unloaded(CellPos::new(40, 40)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_for_ticket() {
    let recorder = Arc::new(Recorder::default());
    let chain = ring_chain(RecordingTask::new(&recorder));
    let decorate = chain.by_name("decorate").expect("decorate");
    let (pipeline, _events) = executor(chain, WorldConfig::default(), Arc::new(MemoryCellStorage::new()));
    let pos = CellPos::new(3, 3);

    assert!(pipeline.request_for_ticket(pos, 2).is_none());
    let holder = timeout(WAIT, pipeline.request_for_ticket(pos, 1).expect("in range"))
        .await
        .expect("no hang")
        .expect("generates");
    assert_eq!(holder.stage(), decorate);
}
