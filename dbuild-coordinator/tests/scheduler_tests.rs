use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use common::{Id, Job, JobResult, JobSpec, WorkerId};
use dbuild_coordinator::scheduler::{Config, JobPhase, Scheduler};

fn job(name: &str) -> JobSpec {
    JobSpec::new(Job {
        id: Id::of(name),
        name: name.to_owned(),
        deps: vec![],
        cmds: vec![],
    })
}

/// A job with a single dependency whose artifact lives on `worker`.
fn job_near(name: &str, dep: &str, worker: &WorkerId) -> JobSpec {
    let mut spec = job(name);
    let dep = Id::of(dep);
    spec.job.deps.push(dep);
    spec.artifacts.insert(dep, worker.clone());
    spec
}

fn ok(id: Id) -> JobResult {
    JobResult::success(id)
}

#[tokio::test(start_paused = true)]
async fn unplaced_job_falls_back_to_global_queue() {
    let scheduler = Scheduler::new(Config::default());
    let start = Instant::now();

    let pending = scheduler.schedule_job(job("a"));
    tokio::time::sleep(scheduler.config().deps_timeout).await;

    let w = WorkerId::from("w");
    scheduler.register_worker(&w);
    let picked = scheduler
        .pick_job(&CancellationToken::new(), &w)
        .await
        .unwrap();

    assert_eq!(picked.id(), pending.id());
    assert!(start.elapsed() >= scheduler.config().deps_timeout);
}

#[tokio::test(start_paused = true)]
async fn cached_result_is_offered_without_waiting() {
    let scheduler = Scheduler::new(Config::default());
    let w = WorkerId::from("w");
    scheduler.register_worker(&w);

    let b = job("b");
    // Nothing was assigned, so the report is stale, but it still counts.
    assert!(!scheduler.on_job_complete(&w, b.id(), ok(b.id())));
    assert_eq!(scheduler.placement(&b.id()), vec![w.clone()]);

    let start = Instant::now();
    let pending = scheduler.schedule_job(b);
    assert_eq!(scheduler.phase(&pending), JobPhase::AwaitingCache);

    let picked = scheduler
        .pick_job(&CancellationToken::new(), &w)
        .await
        .unwrap();
    assert_eq!(picked.key(), pending.key());
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn dependency_locality_is_honored_before_cache_timeout() {
    let scheduler = Scheduler::new(Config::default());
    let x = WorkerId::from("x");

    let pending = scheduler.schedule_job(job_near("c", "c-dep", &x));
    scheduler.register_worker(&x);

    let start = Instant::now();
    let picked = scheduler
        .pick_job(&CancellationToken::new(), &x)
        .await
        .unwrap();
    assert_eq!(picked.key(), pending.key());
    assert!(start.elapsed() < scheduler.config().cache_timeout);

    // Nobody else sees it, not even after it would have gone global.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(scheduler.try_pick_job(&WorkerId::from("y")).is_none());
}

#[tokio::test(start_paused = true)]
async fn cache_timeout_widens_to_locality_tier() {
    let scheduler = Scheduler::new(Config::default());
    let holder = WorkerId::from("holder");
    let x = WorkerId::from("x");

    let spec = job_near("d", "d-dep", &x);
    scheduler.on_job_complete(&holder, spec.id(), ok(spec.id()));

    let pending = scheduler.schedule_job(spec);
    assert!(scheduler.try_pick_job(&x).is_none());

    tokio::time::sleep(scheduler.config().cache_timeout + Duration::from_millis(1)).await;
    assert_eq!(scheduler.phase(&pending), JobPhase::AwaitingLocality);
    let picked = scheduler.try_pick_job(&x).unwrap();
    assert_eq!(picked.key(), pending.key());

    // The stale cache-tier offer is skipped.
    assert!(scheduler.try_pick_job(&holder).is_none());
}

#[tokio::test(start_paused = true)]
async fn completion_fires_exactly_once() {
    let scheduler = Scheduler::new(Config::default());
    let w = WorkerId::from("w");
    let pending = scheduler.schedule_job(job_near("e", "e-dep", &w));
    let picked = scheduler.try_pick_job(&w).unwrap();
    let id = pending.id();

    assert!(scheduler.on_job_complete(&w, id, ok(id)));
    assert_eq!(pending.wait().await, &ok(id));
    assert_eq!(picked.wait().await, &ok(id));

    let different = JobResult {
        exit_code: 2,
        ..ok(id)
    };
    assert!(!scheduler.on_job_complete(&w, id, different.clone()));
    assert!(!scheduler.on_job_complete(&w, id, ok(id)));
    assert_eq!(pending.result(), Some(&ok(id)));
    assert_eq!(picked.result(), Some(&ok(id)));

    // Placement only grows, without duplicates.
    assert_eq!(scheduler.placement(&id), vec![w]);
    assert_eq!(scheduler.phase(&pending), JobPhase::Done);
}

#[tokio::test(start_paused = true)]
async fn cancelled_pick_consumes_nothing() {
    let scheduler = Scheduler::new(Config::default());
    let w = WorkerId::from("w");
    let pending = scheduler.schedule_job(job_near("f", "f-dep", &w));

    let expired = CancellationToken::new();
    expired.cancel();
    assert!(scheduler.pick_job(&expired, &w).await.is_none());

    let picked = scheduler
        .pick_job(&CancellationToken::new(), &w)
        .await
        .unwrap();
    assert_eq!(picked.key(), pending.key());
}

#[tokio::test(start_paused = true)]
async fn waiting_pick_can_be_cancelled() {
    let scheduler = Scheduler::new(Config::default());
    let w = WorkerId::from("w");
    scheduler.register_worker(&w);

    let ctx = CancellationToken::new();
    let waiter = {
        let scheduler = scheduler.clone();
        let ctx = ctx.clone();
        let w = w.clone();
        tokio::spawn(async move { scheduler.pick_job(&ctx, &w).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    ctx.cancel();
    assert!(waiter.await.unwrap().is_none());

    let pending = scheduler.schedule_job(job_near("g", "g-dep", &w));
    assert_eq!(scheduler.try_pick_job(&w).unwrap().key(), pending.key());
}

#[tokio::test(start_paused = true)]
async fn disjoint_jobs_on_idle_workers_do_not_deadlock() {
    for reversed in [false, true] {
        let scheduler = Scheduler::new(Config::default());
        let w1 = WorkerId::from("w1");
        let w2 = WorkerId::from("w2");
        scheduler.register_worker(&w1);
        scheduler.register_worker(&w2);

        let mut pickers = Vec::new();
        for w in [&w1, &w2] {
            let scheduler = scheduler.clone();
            let w = w.clone();
            pickers.push(tokio::spawn(async move {
                scheduler.pick_job(&CancellationToken::new(), &w).await
            }));
        }

        let mut specs = vec![job_near("h1", "h1-dep", &w1), job_near("h2", "h2-dep", &w2)];
        if reversed {
            specs.reverse();
        }
        let pending: Vec<_> = specs.into_iter().map(|s| scheduler.schedule_job(s)).collect();

        let mut picked = Vec::new();
        for picker in pickers {
            picked.push(picker.await.unwrap().unwrap().key());
        }
        picked.sort();
        let mut expected: Vec<_> = pending.iter().map(|p| p.key()).collect();
        expected.sort();
        assert_eq!(picked, expected);
    }
}

#[tokio::test(start_paused = true)]
async fn offer_to_unregistered_worker_does_not_block() {
    let scheduler = Scheduler::new(Config::default());
    let ghost = WorkerId::from("ghost");
    let w = WorkerId::from("w");
    scheduler.register_worker(&w);

    let pending = scheduler.schedule_job(job_near("i", "i-dep", &ghost));
    let picked = scheduler
        .pick_job(&CancellationToken::new(), &w)
        .await
        .unwrap();
    assert_eq!(picked.key(), pending.key());
    assert_eq!(scheduler.phase(&pending), JobPhase::Assigned);
}

#[tokio::test(start_paused = true)]
async fn timers_are_inert_after_completion() {
    let scheduler = Scheduler::new(Config::default());
    let w = WorkerId::from("w");
    let other = WorkerId::from("other");

    let pending = scheduler.schedule_job(job_near("j", "j-dep", &w));
    scheduler.try_pick_job(&w).unwrap();
    assert!(scheduler.on_job_complete(&w, pending.id(), ok(pending.id())));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(scheduler.try_pick_job(&w).is_none());
    assert!(scheduler.try_pick_job(&other).is_none());
    assert_eq!(scheduler.phase(&pending), JobPhase::Done);
}

#[tokio::test(start_paused = true)]
async fn stop_closes_global_queue_only() {
    let scheduler = Scheduler::new(Config::default());
    let w = WorkerId::from("w");
    let x = WorkerId::from("x");
    scheduler.register_worker(&w);

    let waiter = {
        let scheduler = scheduler.clone();
        let w = w.clone();
        tokio::spawn(async move { scheduler.pick_job(&CancellationToken::new(), &w).await })
    };
    tokio::task::yield_now().await;

    let global = scheduler.schedule_job(job("k"));
    let local = scheduler.schedule_job(job_near("l", "l-dep", &x));
    scheduler.stop();

    assert!(waiter.await.unwrap().is_none());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(scheduler.try_pick_job(&w).is_none());
    assert_eq!(scheduler.phase(&global), JobPhase::AwaitingLocality);

    // Per-worker queues are not drained.
    let picked = scheduler
        .pick_job(&CancellationToken::new(), &x)
        .await
        .unwrap();
    assert_eq!(picked.key(), local.key());
}

#[tokio::test(start_paused = true)]
async fn locate_artifact_follows_last_assignment() {
    let scheduler = Scheduler::new(Config::default());
    let w = WorkerId::from("w");
    let spec = job_near("m", "m-dep", &w);
    let id = spec.id();

    assert!(scheduler.locate_artifact(&id).is_none());
    scheduler.schedule_job(spec);
    scheduler.try_pick_job(&w).unwrap();
    assert_eq!(scheduler.locate_artifact(&id), Some(w));
}
