
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use crate::os::{PlatformFamily, Requirement};
    use crate::registry::MemoryStore;

    type Events = Arc<Mutex<Vec<String>>>;

    struct ScriptedController {
        running: Mutex<VecDeque<Result<bool, DaemonError>>>,
        outcome: DaemonizeOutcome,
        reloads: AtomicUsize,
        owner: Option<u32>,
        wake: Arc<Notify>,
        events: Events,
    }

    impl ScriptedController {
        fn new(script: Vec<Result<bool, DaemonError>>, events: Events) -> Self {
            Self {
                running: Mutex::new(script.into()),
                outcome: DaemonizeOutcome::Daemon,
                reloads: AtomicUsize::new(0),
                owner: None,
                wake: Arc::new(Notify::new()),
                events,
            }
        }

        fn running_for(ticks: usize, events: Events) -> Self {
            Self::new((0..ticks).map(|_| Ok(true)).collect(), events)
        }
    }

    #[async_trait]
    impl ProcessController for ScriptedController {
        fn family(&self) -> PlatformFamily {
            PlatformFamily::Posix
        }

        async fn preflight(&self, _descriptor: &DaemonDescriptor) -> Result<(), DaemonError> {
            match self.owner {
                Some(pid) => Err(DaemonError::AlreadyRunning {
                    path: "daemon_cac_test.pid".into(),
                    pid,
                }),
                None => Ok(()),
            }
        }

        async fn daemonize(
            &self,
            _descriptor: &DaemonDescriptor,
        ) -> Result<DaemonizeOutcome, DaemonError> {
            self.events.lock().push("daemonize".to_string());
            Ok(self.outcome)
        }

        async fn is_running(&self, _descriptor: &DaemonDescriptor) -> Result<bool, DaemonError> {
            self.running.lock().pop_front().unwrap_or(Ok(false))
        }

        async fn start(&self, _descriptor: &DaemonDescriptor) -> Result<Option<u32>, DaemonError> {
            Ok(None)
        }

        async fn stop(&self, _descriptor: &DaemonDescriptor) -> Result<(), DaemonError> {
            Ok(())
        }

        async fn die_daemon(&self, _descriptor: &DaemonDescriptor) -> Result<(), DaemonError> {
            self.events.lock().push("die".to_string());
            Ok(())
        }

        async fn is_alive(&self, _descriptor: &DaemonDescriptor) -> Result<bool, DaemonError> {
            Ok(true)
        }

        fn requirements(&self) -> Vec<Requirement> {
            Vec::new()
        }

        async fn stop_requested(&self) {
            self.wake.notified().await
        }

        fn take_reload(&self) -> bool {
            self.reloads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    type Step = Box<dyn FnMut(&mut TickContext<'_>) -> anyhow::Result<()> + Send + Sync>;

    struct RecordingProgram {
        descriptor: DaemonDescriptor,
        defaults: DaemonConfiguration,
        events: Events,
        step: Step,
    }

    impl RecordingProgram {
        fn new(defaults: DaemonConfiguration, events: Events) -> Self {
            Self {
                descriptor: DaemonDescriptor::new("daemon:cac:test", "recording"),
                defaults,
                events,
                step: Box::new(|_| Ok(())),
            }
        }

        fn with_step<F>(mut self, step: F) -> Self
        where
            F: FnMut(&mut TickContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
        {
            self.step = Box::new(step);
            self
        }
    }

    #[async_trait]
    impl DaemonProgram for RecordingProgram {
        fn descriptor(&self) -> &DaemonDescriptor {
            &self.descriptor
        }

        fn default_configuration(&self) -> DaemonConfiguration {
            self.defaults.clone()
        }

        async fn execute(&mut self, ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
            self.events.lock().push(format!("work {}", ctx.tick()));
            (self.step)(ctx)
        }
    }

    fn every(seconds: f64) -> DaemonConfiguration {
        DaemonConfiguration {
            interval: Some(seconds),
            max_interval: Some(seconds * 30.0),
            ..Default::default()
        }
    }

    fn night_window() -> DaemonConfiguration {
        DaemonConfiguration {
            run_start: Some("20:00".to_string()),
            run_end: Some("06:00".to_string()),
            ..every(1.0)
        }
    }

    struct Harness {
        events: Events,
        store: Arc<MemoryStore>,
        registry: DaemonRegistry,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            Self {
                events: Arc::default(),
                registry: DaemonRegistry::new(store.clone()),
                store,
            }
        }

        fn builder(
            &self,
            program: RecordingProgram,
            controller: ScriptedController,
        ) -> DaemonLoopBuilder {
            DaemonLoopBuilder::new(
                Box::new(program),
                Arc::new(controller),
                self.registry.clone(),
            )
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }

        fn works(&self) -> usize {
            self.events().iter().filter(|e| e.starts_with("work")).count()
        }
    }

    const FULL_LIFECYCLE: [LoopState; 6] = [
        LoopState::Registering,
        LoopState::Daemonizing,
        LoopState::Running,
        LoopState::ShuttingDown,
        LoopState::Unregistering,
        LoopState::Terminated,
    ];

    #[tokio::test(start_paused = true)]
    async fn test_runs_until_stop_requested() {
        let h = Harness::new();
        let program = RecordingProgram::new(every(1.0), h.events.clone());
        let controller = ScriptedController::running_for(2, h.events.clone());

        let mut daemon = h.builder(program, controller).bootstrap().await.unwrap();
        let outcome = daemon.run().await.unwrap();

        assert_eq!(
            outcome,
            LoopOutcome::Terminated {
                reason: StopReason::Requested,
                ticks: 2
            }
        );
        assert_eq!(h.events(), vec!["daemonize", "work 1", "work 2", "die"]);
        assert_eq!(daemon.history(), FULL_LIFECYCLE);
        assert_eq!(daemon.state(), LoopState::Terminated);

        let record = h.store.record("daemon:cac:test").unwrap();
        assert!(record.started.is_none());
        assert!(record.heartbeat.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_detaches_after_daemonize() {
        let h = Harness::new();
        let program = RecordingProgram::new(every(1.0), h.events.clone());
        let mut controller = ScriptedController::running_for(5, h.events.clone());
        controller.outcome = DaemonizeOutcome::Parent { child_pid: 4242 };

        let mut daemon = h.builder(program, controller).bootstrap().await.unwrap();
        let outcome = daemon.run().await.unwrap();

        assert_eq!(outcome, LoopOutcome::Detached { child_pid: 4242 });
        assert_eq!(h.events(), vec!["daemonize"]);
        assert_eq!(
            daemon.history(),
            [LoopState::Registering, LoopState::Daemonizing]
        );
        assert!(h.store.record("daemon:cac:test").unwrap().started.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_state_stops_and_cleans_up() {
        let h = Harness::new();
        let program = RecordingProgram::new(every(1.0), h.events.clone());
        let controller = ScriptedController::new(
            vec![
                Ok(true),
                Err(DaemonError::StaleState("Daemon not responding (PID 7)".into())),
            ],
            h.events.clone(),
        );

        let mut daemon = h.builder(program, controller).bootstrap().await.unwrap();
        let outcome = daemon.run().await.unwrap();

        assert_eq!(
            outcome,
            LoopOutcome::Terminated {
                reason: StopReason::Stale,
                ticks: 1
            }
        );
        assert_eq!(h.events(), vec!["daemonize", "work 1", "die"]);
        assert_eq!(daemon.history(), FULL_LIFECYCLE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_stops() {
        let h = Harness::new();
        let program = RecordingProgram::new(every(1.0), h.events.clone());
        let controller = ScriptedController::new(
            vec![Err(DaemonError::ProcessControl("probe".into()))],
            h.events.clone(),
        );

        let mut daemon = h.builder(program, controller).bootstrap().await.unwrap();
        let outcome = daemon.run().await.unwrap();

        assert_eq!(
            outcome,
            LoopOutcome::Terminated {
                reason: StopReason::ProbeFailed,
                ticks: 0
            }
        );
        assert_eq!(h.works(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_work_failure_continues_by_default() {
        let h = Harness::new();
        let program = RecordingProgram::new(every(1.0), h.events.clone()).with_step(|ctx| {
            if ctx.tick() == 1 {
                anyhow::bail!("upstream unavailable");
            }
            Ok(())
        });
        let controller = ScriptedController::running_for(3, h.events.clone());

        let mut daemon = h.builder(program, controller).bootstrap().await.unwrap();
        let outcome = daemon.run().await.unwrap();

        assert!(matches!(outcome, LoopOutcome::Terminated { ticks: 3, .. }));
        assert_eq!(h.works(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_work_failure_terminates_under_policy() {
        let h = Harness::new();
        let program = RecordingProgram::new(every(1.0), h.events.clone())
            .with_step(|_| anyhow::bail!("upstream unavailable"));
        let controller = ScriptedController::running_for(3, h.events.clone());

        let mut daemon = h
            .builder(program, controller)
            .on_work_error(WorkErrorPolicy::Terminate)
            .bootstrap()
            .await
            .unwrap();
        let err = daemon.run().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Work);
        assert!(err.to_string().contains("upstream unavailable"));
        assert_eq!(h.events(), vec!["daemonize", "work 1", "die"]);
        assert_eq!(daemon.history(), FULL_LIFECYCLE);
        assert!(h.store.record("daemon:cac:test").unwrap().started.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_outside_window_skips_work_but_ticks() {
        let h = Harness::new();
        let program = RecordingProgram::new(night_window(), h.events.clone());
        let controller = ScriptedController::running_for(2, h.events.clone());

        let mut daemon = h
            .builder(program, controller)
            .clock(|| NaiveTime::from_hms_opt(10, 0, 0).unwrap())
            .bootstrap()
            .await
            .unwrap();
        let outcome = daemon.run().await.unwrap();

        assert!(matches!(outcome, LoopOutcome::Terminated { ticks: 2, .. }));
        assert_eq!(h.works(), 0);
        assert!(daemon.window().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inside_window_runs_work() {
        let h = Harness::new();
        let program = RecordingProgram::new(night_window(), h.events.clone());
        let controller = ScriptedController::running_for(2, h.events.clone());

        let mut daemon = h
            .builder(program, controller)
            .clock(|| NaiveTime::from_hms_opt(2, 0, 0).unwrap())
            .bootstrap()
            .await
            .unwrap();
        daemon.run().await.unwrap();

        assert_eq!(h.works(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeps_for_floor_of_current_interval() {
        let h = Harness::new();
        let program = RecordingProgram::new(every(10.0), h.events.clone()).with_step(|ctx| {
            ctx.slow_down();
            Ok(())
        });
        let controller = ScriptedController::running_for(2, h.events.clone());

        let mut daemon = h.builder(program, controller).bootstrap().await.unwrap();
        let started = tokio::time::Instant::now();
        daemon.run().await.unwrap();

        // 13.0 then 16.9, floored
        let elapsed = started.elapsed();
        assert!(elapsed >= std::time::Duration::from_secs(29));
        assert!(elapsed < std::time::Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_request_cuts_sleep_short() {
        let h = Harness::new();
        let program = RecordingProgram::new(every(300.0), h.events.clone());
        let controller = ScriptedController::running_for(1, h.events.clone());
        let wake = controller.wake.clone();

        let mut daemon = h.builder(program, controller).bootstrap().await.unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            wake.notify_one();
        });
        let started = tokio::time::Instant::now();
        let outcome = daemon.run().await.unwrap();

        assert!(matches!(
            outcome,
            LoopOutcome::Terminated {
                reason: StopReason::Requested,
                ticks: 1
            }
        ));
        let elapsed = started.elapsed();
        assert!(elapsed >= std::time::Duration::from_secs(5));
        assert!(elapsed < std::time::Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_owner_blocks_registration() {
        let h = Harness::new();
        h.registry
            .register("daemon:cac:test", &every(1.0))
            .await
            .unwrap();
        let before = h.store.record("daemon:cac:test").unwrap();

        let program = RecordingProgram::new(every(1.0), h.events.clone());
        let mut controller = ScriptedController::running_for(2, h.events.clone());
        controller.owner = Some(4242);

        let mut daemon = h.builder(program, controller).bootstrap().await.unwrap();
        let err = daemon.run().await.unwrap_err();

        assert!(matches!(err, DaemonError::AlreadyRunning { pid: 4242, .. }));
        assert_eq!(h.store.record("daemon:cac:test").unwrap(), before);
        assert!(h.events().is_empty());
        assert_eq!(daemon.history(), [LoopState::Registering]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_failure_does_not_stop_loop() {
        let h = Harness::new();
        let store = h.store.clone();
        let program = RecordingProgram::new(every(1.0), h.events.clone()).with_step(move |ctx| {
            if ctx.tick() == 1 {
                store.fail_next(2);
            }
            Ok(())
        });
        let controller = ScriptedController::running_for(2, h.events.clone());

        let mut daemon = h.builder(program, controller).bootstrap().await.unwrap();
        let outcome = daemon.run().await.unwrap();

        assert!(matches!(outcome, LoopOutcome::Terminated { ticks: 2, .. }));
        assert_eq!(h.works(), 2);
        assert_eq!(h.store.reconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_failure_is_fatal() {
        let h = Harness::new();
        let program = RecordingProgram::new(every(1.0), h.events.clone());
        let controller = ScriptedController::running_for(2, h.events.clone());

        let mut daemon = h.builder(program, controller).bootstrap().await.unwrap();
        h.store.fail_next(2);
        let err = daemon.run().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Persistence);
        assert!(h.events().is_empty());
        assert_eq!(daemon.history(), [LoopState::Registering]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_only_once() {
        let h = Harness::new();
        let program = RecordingProgram::new(every(1.0), h.events.clone());
        let controller = ScriptedController::running_for(0, h.events.clone());

        let mut daemon = h.builder(program, controller).bootstrap().await.unwrap();
        daemon.run().await.unwrap();
        assert!(daemon.run().await.is_err());
    }

    #[tokio::test]
    async fn test_bootstrap_layers_configuration() {
        let h = Harness::new();
        let mut config = lifeline_config::Config::default();
        config.daemons.insert(
            "daemon:cac:test".to_string(),
            DaemonConfiguration {
                interval: Some(5.0),
                max_interval: Some(50.0),
                ..Default::default()
            },
        );
        h.registry
            .store_configuration(
                "daemon:cac:test",
                &DaemonConfiguration {
                    max_interval: Some(20.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let program = RecordingProgram::new(every(10.0), h.events.clone());
        let controller = ScriptedController::running_for(0, h.events.clone());
        let daemon = h
            .builder(program, controller)
            .provider(Arc::new(config))
            .bootstrap()
            .await
            .unwrap();

        assert_eq!(daemon.configuration().interval, Some(5.0));
        assert_eq!(daemon.configuration().max_interval, Some(20.0));
        assert_eq!(daemon.scheduler().base(), 5.0);
        assert_eq!(daemon.scheduler().max(), 20.0);
    }

    #[tokio::test]
    async fn test_bootstrap_rejects_invalid_configuration() {
        let h = Harness::new();
        let program = RecordingProgram::new(every(-1.0), h.events.clone());
        let controller = ScriptedController::running_for(0, h.events.clone());

        let result = h.builder(program, controller).bootstrap().await;
        assert!(matches!(
            result,
            Err(DaemonError::InvalidConfiguration { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_picks_up_stored_configuration() {
        let h = Harness::new();
        let program = RecordingProgram::new(every(10.0), h.events.clone());
        let controller = ScriptedController::running_for(1, h.events.clone());
        controller.reloads.store(1, Ordering::SeqCst);

        let mut daemon = h.builder(program, controller).bootstrap().await.unwrap();
        assert_eq!(daemon.scheduler().base(), 10.0);

        h.registry
            .store_configuration("daemon:cac:test", &every(2.0))
            .await
            .unwrap();
        daemon.run().await.unwrap();

        assert_eq!(daemon.scheduler().base(), 2.0);
        assert_eq!(daemon.configuration().max_interval, Some(60.0));
    }
