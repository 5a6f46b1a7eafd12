use crate::candidate_store::CandidateStore;
use crate::probe::Probe;
use crate::publisher::StatusPublisher;
use crate::selection::select;
use crate::types::{Candidate, ProbeResult, Snapshot};
use chrono::Local;
use futures_util::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct ScheduleSettings {
    /// Idle time between the end of one cycle and the start of the next.
    pub interval: Duration,
    /// Ceiling for a successful probe to be eligible as best.
    pub max_delay_ms: u64,
    /// How many probes may be in flight at once; 1 probes serially.
    pub max_parallel_probes: usize,
    /// Re-read the candidate list at the start of every cycle.
    pub reload_candidates: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Running,
    Idle,
}

/// Drives probe, select and publish cycles at a fixed interval until shutdown.
pub struct Scheduler<P> {
    store: CandidateStore,
    candidates: Vec<Candidate>,
    prober: Arc<P>,
    publisher: StatusPublisher,
    settings: ScheduleSettings,
    state: SchedulerState,
}

impl<P: Probe + 'static> Scheduler<P> {
    /// `candidates` is the list already loaded from `store` at startup.
    pub fn new(
        store: CandidateStore,
        candidates: Vec<Candidate>,
        prober: Arc<P>,
        publisher: StatusPublisher,
        settings: ScheduleSettings,
    ) -> Self {
        Self {
            store,
            candidates,
            prober,
            publisher,
            settings,
            state: SchedulerState::Running,
        }
    }

    #[cfg(test)]
    fn state(&self) -> SchedulerState {
        self.state
    }

    #[cfg(test)]
    fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// Run one full cycle and publish its snapshot.
    ///
    /// A publish failure is logged and otherwise ignored; the snapshot is
    /// returned either way.
    pub async fn run_cycle(&mut self) -> Snapshot {
        self.transition(SchedulerState::Running);
        if self.settings.reload_candidates {
            self.reload();
        }

        info!("Probing {} candidates", self.candidates.len());
        let results = probe_all(&self.prober, &self.candidates, self.settings.max_parallel_probes).await;
        let snapshot = build_snapshot(results, self.settings.max_delay_ms);

        let successes = snapshot.results.iter().filter(|r| r.is_success()).count();
        match &snapshot.best {
            Some(best) => info!(
                "Best proxy: {} ({}ms), {}/{} candidates usable",
                best.candidate,
                best.delay_ms.unwrap_or_default(),
                successes,
                snapshot.results.len()
            ),
            None => warn!("No usable proxy this cycle ({} candidates)", snapshot.results.len()),
        }

        if let Err(e) = self.publisher.publish(&snapshot) {
            error!("Failed to publish status: {}", e);
        }
        snapshot
    }

    /// Run a single cycle unless `interrupt` resolves first.
    ///
    /// Returns `None` when interrupted; nothing is published in that case.
    pub async fn run_once(&mut self, interrupt: impl Future<Output = ()>) -> Option<Snapshot> {
        tokio::select! {
            snapshot = self.run_cycle() => Some(snapshot),
            _ = interrupt => {
                warn!("Cycle interrupted before it finished");
                None
            }
        }
    }

    /// Loop until `shutdown` is notified. Shutdown is observed between cycles;
    /// the scheduler is handed back idle.
    pub async fn run(mut self, shutdown: Arc<Notify>) -> Self {
        info!(
            "Scheduler started: {} candidates, interval {}s, publishing to '{}'",
            self.candidates.len(),
            self.settings.interval.as_secs(),
            self.publisher.path().display()
        );

        // Registered before the first cycle so a notification that arrives
        // while probing is not lost.
        let notified = shutdown.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        loop {
            self.run_cycle().await;
            self.transition(SchedulerState::Idle);

            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval) => {}
                _ = notified.as_mut() => {
                    info!("Scheduler: shutdown signal received");
                    break;
                }
            }
        }

        info!("Scheduler exited");
        self
    }

    fn reload(&mut self) {
        match self.store.load() {
            Ok(candidates) => self.candidates = candidates,
            Err(e) => warn!("Keeping previous candidate list: {}", e),
        }
    }

    fn transition(&mut self, next: SchedulerState) {
        if self.state != next {
            debug!("Scheduler: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

/// Probe every candidate with at most `max_parallel` probes in flight.
///
/// Results come back in candidate order regardless of completion order. A
/// probe that panics yields a `Failure` instead of taking the cycle down.
pub async fn probe_all<P: Probe + 'static>(
    prober: &Arc<P>,
    candidates: &[Candidate],
    max_parallel: usize,
) -> Vec<ProbeResult> {
    stream::iter(candidates.iter().cloned())
        .map(|candidate| {
            let prober = prober.clone();
            async move {
                let task = tokio::spawn({
                    let candidate = candidate.clone();
                    async move { prober.probe(&candidate).await }
                });
                match task.await {
                    Ok(result) => result,
                    Err(e) => ProbeResult::failure(candidate, None, format!("unexpected error: {}", e)),
                }
            }
        })
        .buffered(max_parallel.max(1))
        .collect()
        .await
}

pub fn build_snapshot(results: Vec<ProbeResult>, max_delay_ms: u64) -> Snapshot {
    let best = select(&results, max_delay_ms).cloned();
    Snapshot::new(results, best, Local::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::read_status;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    enum Scripted {
        Success(u64),
        Failure(&'static str),
        Panic,
    }

    /// Answers from a script instead of the network, after `latency`.
    struct ScriptedProbe {
        script: HashMap<&'static str, Scripted>,
        latency: Duration,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedProbe {
        fn new(script: Vec<(&'static str, Scripted)>) -> Self {
            Self {
                script: script.into_iter().collect(),
                latency: Duration::ZERO,
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                calls: Mutex::new(vec![]),
            }
        }

        fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn probe(&self, candidate: &Candidate) -> ProbeResult {
            self.calls.lock().unwrap().push(candidate.to_string());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match self.script.get(candidate.as_str()) {
                Some(Scripted::Success(delay)) => ProbeResult::success(candidate.clone(), *delay),
                Some(Scripted::Failure(error)) => ProbeResult::failure(candidate.clone(), None, *error),
                Some(Scripted::Panic) => panic!("probe blew up"),
                None => ProbeResult::failure(candidate.clone(), None, "unscripted"),
            }
        }
    }

    fn settings(max_parallel_probes: usize) -> ScheduleSettings {
        ScheduleSettings {
            interval: Duration::from_secs(3600),
            max_delay_ms: 10_000,
            max_parallel_probes,
            reload_candidates: false,
        }
    }

    fn candidates(addresses: &[&str]) -> Vec<Candidate> {
        addresses.iter().map(|a| Candidate::from(*a)).collect()
    }

    fn scheduler(
        dir: &tempfile::TempDir,
        addresses: &[&str],
        probe: ScriptedProbe,
        settings: ScheduleSettings,
    ) -> Scheduler<ScriptedProbe> {
        Scheduler::new(
            CandidateStore::new(dir.path().join("proxies.json")),
            candidates(addresses),
            Arc::new(probe),
            StatusPublisher::new(dir.path().join("proxy_status.json")),
            settings,
        )
    }

    #[tokio::test]
    async fn test_cycle_publishes_fastest_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let probe = ScriptedProbe::new(vec![
            ("A", Scripted::Success(120)),
            ("B", Scripted::Failure("operation timed out")),
            ("C", Scripted::Success(80)),
        ]);
        let mut scheduler = scheduler(&dir, &["A", "B", "C"], probe, settings(1));

        let snapshot = scheduler.run_cycle().await;
        assert_eq!(snapshot.best.as_ref().unwrap().candidate.as_str(), "C");

        let published = read_status(&dir.path().join("proxy_status.json")).unwrap();
        assert_eq!(published["best_proxy"]["url"], "C");
        assert_eq!(published["best_proxy"]["delay"], 80);
        let urls: Vec<_> = published["all_results"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["url"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(urls, vec!["A", "B", "C"]);
        assert_eq!(published["all_results"][1]["status"], "failed");
    }

    #[tokio::test]
    async fn test_empty_candidates_publish_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = scheduler(&dir, &[], ScriptedProbe::new(vec![]), settings(1));

        let snapshot = scheduler.run_cycle().await;
        assert!(snapshot.best.is_none());
        assert!(snapshot.results.is_empty());

        let published = read_status(&dir.path().join("proxy_status.json")).unwrap();
        assert!(published["best_proxy"].is_null());
        assert_eq!(published["all_results"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_slow_success_is_not_selected() {
        let dir = tempfile::tempdir().unwrap();
        let probe = ScriptedProbe::new(vec![("A", Scripted::Success(15_000))]);
        let mut scheduler = scheduler(&dir, &["A"], probe, settings(1));

        let snapshot = scheduler.run_cycle().await;
        assert!(snapshot.best.is_none());
        assert!(snapshot.results[0].is_success());
    }

    #[tokio::test]
    async fn test_panicking_probe_becomes_failure() {
        let dir = tempfile::tempdir().unwrap();
        let probe = ScriptedProbe::new(vec![
            ("A", Scripted::Panic),
            ("B", Scripted::Success(40)),
        ]);
        let mut scheduler = scheduler(&dir, &["A", "B"], probe, settings(1));

        let snapshot = scheduler.run_cycle().await;
        assert_eq!(snapshot.results.len(), 2);
        assert!(!snapshot.results[0].is_success());
        assert!(snapshot.results[0]
            .error
            .as_deref()
            .unwrap()
            .starts_with("unexpected error"));
        assert_eq!(snapshot.best.unwrap().candidate.as_str(), "B");
    }

    #[tokio::test]
    async fn test_serial_by_default() {
        let probe = Arc::new(
            ScriptedProbe::new(vec![]).with_latency(Duration::from_millis(20)),
        );
        let list = candidates(&["A", "B", "C", "D"]);

        probe_all(&probe, &list, 1).await;

        assert_eq!(probe.peak_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(*probe.calls.lock().unwrap(), vec!["A", "B", "C", "D"]);
    }

    #[tokio::test]
    async fn test_parallel_probes_are_bounded_and_ordered() {
        let probe = Arc::new(
            ScriptedProbe::new(vec![
                ("A", Scripted::Success(10)),
                ("B", Scripted::Success(20)),
                ("C", Scripted::Success(30)),
                ("D", Scripted::Success(40)),
                ("E", Scripted::Success(50)),
            ])
            .with_latency(Duration::from_millis(50)),
        );
        let list = candidates(&["A", "B", "C", "D", "E"]);

        let results = probe_all(&probe, &list, 2).await;

        assert!(probe.peak_in_flight.load(Ordering::SeqCst) <= 2);
        let order: Vec<_> = results.iter().map(|r| r.candidate.to_string()).collect();
        assert_eq!(order, vec!["A", "B", "C", "D", "E"]);
    }

    #[tokio::test]
    async fn test_reload_picks_up_new_candidates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("proxies.json"), r#"["A"]"#).unwrap();
        let probe = ScriptedProbe::new(vec![("A", Scripted::Success(10)), ("B", Scripted::Success(5))]);
        let mut settings = settings(1);
        settings.reload_candidates = true;
        let mut scheduler = scheduler(&dir, &["A"], probe, settings);

        std::fs::write(dir.path().join("proxies.json"), r#"["A", "B"]"#).unwrap();
        let snapshot = scheduler.run_cycle().await;
        assert_eq!(snapshot.results.len(), 2);
        assert_eq!(snapshot.best.unwrap().candidate.as_str(), "B");
        assert_eq!(scheduler.candidates(), candidates(&["A", "B"]).as_slice());

        std::fs::write(dir.path().join("proxies.json"), "not json").unwrap();
        let snapshot = scheduler.run_cycle().await;
        assert_eq!(snapshot.results.len(), 2);
    }

    #[tokio::test]
    async fn test_static_list_ignores_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let probe = ScriptedProbe::new(vec![("A", Scripted::Success(10))]);
        let mut scheduler = scheduler(&dir, &["A"], probe, settings(1));

        std::fs::write(dir.path().join("proxies.json"), r#"["A", "B"]"#).unwrap();
        let snapshot = scheduler.run_cycle().await;
        assert_eq!(snapshot.results.len(), 1);
        assert_eq!(scheduler.candidates(), candidates(&["A"]).as_slice());
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let status_path = dir.path().join("proxy_status.json");
        let probe = ScriptedProbe::new(vec![("A", Scripted::Success(10))]);
        let scheduler = scheduler(&dir, &["A"], probe, settings(1));
        assert_eq!(scheduler.state(), SchedulerState::Running);
        let shutdown = Arc::new(Notify::new());

        let handle = tokio::spawn(scheduler.run(shutdown.clone()));
        while !status_path.exists() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.notify_waiters();

        let scheduler = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_shutdown_during_cycle_finishes_and_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let status_path = dir.path().join("proxy_status.json");
        let probe = ScriptedProbe::new(vec![("A", Scripted::Success(10)), ("B", Scripted::Success(20))])
            .with_latency(Duration::from_millis(200));
        let scheduler = scheduler(&dir, &["A", "B"], probe, settings(1));
        let shutdown = Arc::new(Notify::new());

        let handle = tokio::spawn(scheduler.run(shutdown.clone()));
        // Land the notification while candidate A is still in flight.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!status_path.exists());
        shutdown.notify_waiters();

        let scheduler = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("shutdown sent mid-cycle was lost")
            .unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        let published = read_status(&status_path).unwrap();
        assert_eq!(published["all_results"].as_array().unwrap().len(), 2);
        assert_eq!(published["best_proxy"]["url"], "A");
    }

    #[tokio::test]
    async fn test_run_once_completes_without_interrupt() {
        let dir = tempfile::tempdir().unwrap();
        let probe = ScriptedProbe::new(vec![("A", Scripted::Success(10))]);
        let mut scheduler = scheduler(&dir, &["A"], probe, settings(1));

        let snapshot = scheduler.run_once(std::future::pending()).await.unwrap();
        assert_eq!(snapshot.best.unwrap().candidate.as_str(), "A");
        assert!(dir.path().join("proxy_status.json").exists());
    }

    #[tokio::test]
    async fn test_run_once_stops_on_interrupt() {
        let dir = tempfile::tempdir().unwrap();
        let probe = ScriptedProbe::new(vec![("A", Scripted::Success(10))])
            .with_latency(Duration::from_secs(3600));
        let mut scheduler = scheduler(&dir, &["A"], probe, settings(1));

        let interrupted = tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.run_once(tokio::time::sleep(Duration::from_millis(20))),
        )
        .await
        .expect("interrupt did not cut the cycle short");
        assert!(interrupted.is_none());
        assert!(!dir.path().join("proxy_status.json").exists());
    }
}
