use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use newswire_storage::SinkStatsSnapshot;
use newswire_sync::{maybe_build_cron_scheduler, ScheduleConfig, ScrapePass, ScrapeRunSummary, Scheduler};
use uuid::Uuid;

#[derive(Default)]
struct CountingPass {
    calls: AtomicUsize,
    fail: bool,
    panic: bool,
}

#[async_trait]
impl ScrapePass for CountingPass {
    async fn run_pass(&self) -> Result<ScrapeRunSummary> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic {
            panic!("pass exploded");
        }
        if self.fail {
            bail!("database unreachable");
        }
        let now = Utc::now();
        Ok(ScrapeRunSummary {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            sources_attempted: 0,
            sources_succeeded: 0,
            errors: 0,
            outcomes: Vec::new(),
            social: None,
            sink: SinkStatsSnapshot::default(),
        })
    }
}

fn config() -> ScheduleConfig {
    ScheduleConfig {
        interval: Duration::from_secs(10),
        tick: Duration::from_secs(1),
        failure_cooldown: Duration::from_secs(60),
        run_on_start: false,
    }
}

#[tokio::test(start_paused = true)]
async fn first_pass_waits_one_interval_then_repeats() {
    let pass = Arc::new(CountingPass::default());
    let handle = Scheduler::spawn(pass.clone(), config());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(pass.calls.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(35_500)).await;
    let stats = handle.stats();
    assert!(stats.passes_started >= 3 && stats.passes_started <= 4, "{stats:?}");
    assert_eq!(stats.passes_failed, 0);
    assert_eq!(stats.passes_succeeded, pass.calls.load(Ordering::SeqCst));
    handle.shutdown();
}

#[tokio::test(start_paused = true)]
async fn failing_passes_never_stop_the_scheduler() {
    let pass = Arc::new(CountingPass {
        fail: true,
        ..Default::default()
    });
    let handle = Scheduler::spawn(pass.clone(), config());

    tokio::time::sleep(Duration::from_secs(400)).await;
    let stats = handle.stats();
    assert!(handle.is_running());
    assert!(stats.passes_started >= 5, "{stats:?}");
    assert_eq!(stats.passes_failed, stats.passes_started);
    assert_eq!(pass.calls.load(Ordering::SeqCst), stats.passes_started);
    handle.shutdown();
}

#[tokio::test(start_paused = true)]
async fn panicking_passes_are_counted_as_failures() {
    let pass = Arc::new(CountingPass {
        panic: true,
        ..Default::default()
    });
    let handle = Scheduler::spawn(
        pass.clone(),
        ScheduleConfig {
            run_on_start: true,
            ..config()
        },
    );

    tokio::time::sleep(Duration::from_secs(130)).await;
    let stats = handle.stats();
    assert!(handle.is_running());
    assert!(stats.passes_started >= 2, "{stats:?}");
    assert_eq!(stats.passes_failed, stats.passes_started);
    handle.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn cron_mode_is_opt_in() {
    let pass: Arc<dyn ScrapePass> = Arc::new(CountingPass::default());
    assert!(maybe_build_cron_scheduler(pass.clone(), &[]).await.unwrap().is_none());
    assert!(maybe_build_cron_scheduler(pass.clone(), &["0 */10 * * * *".to_string()])
        .await
        .unwrap()
        .is_some());
    assert!(maybe_build_cron_scheduler(pass, &["every ten minutes".to_string()])
        .await
        .is_err());
}

#[derive(Default)]
struct SlowPass {
    started: AtomicUsize,
    finished: AtomicUsize,
}

#[async_trait]
impl ScrapePass for SlowPass {
    async fn run_pass(&self) -> Result<ScrapeRunSummary> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        bail!("should have been aborted")
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_aborts_the_pass_in_flight() {
    let pass = Arc::new(SlowPass::default());
    let handle = Scheduler::spawn(
        pass.clone(),
        ScheduleConfig {
            run_on_start: true,
            ..config()
        },
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(pass.started.load(Ordering::SeqCst), 1);
    handle.shutdown();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(pass.finished.load(Ordering::SeqCst), 0);
}
