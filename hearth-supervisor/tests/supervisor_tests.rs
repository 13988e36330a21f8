//! End-to-end supervisor tests against real processes
//!
//! Each test installs a small `/bin/sh` script under the Valheim executable
//! name and drives it through the public supervisor API.

#[cfg(unix)]
mod tests {
    use async_trait::async_trait;
    use hearth_core::catalog::GameType;
    use hearth_core::config::HearthConfig;
    use hearth_core::error::{HearthError, Result};
    use hearth_core::events::WorkerEvent;
    use hearth_core::output::LogStream;
    use hearth_core::registry::ProcessRegistry;
    use hearth_core::store::InMemoryStore;
    use hearth_core::worker::{Worker, WorkerConfig, WorkerStatus};
    use hearth_supervisor::{Monitor, NoopMonitor, ProcessSupervisor, WorkerSupervisor};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::{Arc, Mutex, RwLock};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Writing an executable while another test thread forks can leave the
    /// write descriptor open in the child and fail exec with ETXTBSY.
    static EXEC_LOCK: RwLock<()> = RwLock::new(());

    const EXECUTABLE: &str = "valheim_server.x86_64";

    fn install_script(dir: &Path, body: &str) {
        let _guard = EXEC_LOCK.write().unwrap();
        let path = dir.join(EXECUTABLE);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn test_config() -> HearthConfig {
        let mut config = HearthConfig::default();
        config.supervisor.shutdown_timeout = Duration::from_secs(2);
        config.supervisor.kill_timeout = Duration::from_secs(2);
        config
    }

    fn supervisor_with(monitor: Arc<dyn Monitor>) -> ProcessSupervisor {
        let registry = ProcessRegistry::new(Arc::new(InMemoryStore::new()));
        ProcessSupervisor::new(test_config(), registry, monitor)
    }

    fn supervisor() -> ProcessSupervisor {
        supervisor_with(Arc::new(NoopMonitor))
    }

    async fn deploy(sup: &ProcessSupervisor, dir: &TempDir, script: &str) -> Worker {
        install_script(dir.path(), script);
        sup.deploy(WorkerConfig {
            game_type: GameType::Valheim,
            name: "Integration".to_string(),
            install_path: dir.path().to_path_buf(),
            port: 2456,
            max_players: None,
            password: String::new(),
            world_name: None,
        })
        .await
        .expect("deploy should succeed")
    }

    async fn start(sup: &ProcessSupervisor, id: &str) -> Result<Worker> {
        let _guard = EXEC_LOCK.read().unwrap();
        sup.start(id).await
    }

    async fn wait_until<F>(sup: &ProcessSupervisor, id: &str, what: &str, check: F) -> Worker
    where
        F: Fn(&Worker) -> bool,
    {
        for _ in 0..200 {
            let worker = sup.get_worker(id).await.unwrap();
            if check(&worker) {
                return worker;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for {what}");
    }

    async fn wait_for_log(sup: &ProcessSupervisor, id: &str, needle: &str) {
        for _ in 0..200 {
            let logs = sup.get_logs(id, 1000).await.unwrap();
            if logs.iter().any(|e| e.message.contains(needle)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("log line containing {needle:?} never arrived");
    }

    fn is_running(pid: u32) -> bool {
        use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
            true,
            ProcessRefreshKind::new(),
        );
        system
            .process(Pid::from_u32(pid))
            .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
    }

    #[derive(Default)]
    struct RecordingMonitor {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Monitor for RecordingMonitor {
        async fn start_monitoring(&self, worker_id: &str, pid: u32, worker: &Worker) -> Result<()> {
            assert_eq!(worker.id, worker_id);
            self.calls.lock().unwrap().push(format!("start:{worker_id}:{pid}"));
            Ok(())
        }

        async fn stop_monitoring(&self, worker_id: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("stop:{worker_id}"));
            // Failures must not affect reconciliation.
            Err(HearthError::Other("monitor backend unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_clean_exit_reconciles_to_stopped() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        let worker = deploy(&sup, &dir, "echo booting\nexit 0").await;
        assert_eq!(worker.port, 2456);
        assert_eq!(worker.status, WorkerStatus::Stopped);

        let started = start(&sup, &worker.id).await.unwrap();
        assert_eq!(started.status, WorkerStatus::Running);
        assert!(started.pid.is_some());
        assert!(started.last_started.is_some());

        let exited = wait_until(&sup, &worker.id, "stopped", |w| w.status == WorkerStatus::Stopped).await;
        assert_eq!(exited.current_players, 0);
        assert_eq!(exited.pid, None);

        wait_for_log(&sup, &worker.id, "Server exited with code 0").await;
        let logs = sup.get_logs(&worker.id, 100).await.unwrap();
        assert!(logs
            .iter()
            .any(|e| e.stream == LogStream::Stdout && e.message == "booting"));

        let files = sup.list_log_files(&worker.id).await.unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].name.ends_with(".log"));
    }

    #[tokio::test]
    async fn test_exit_settles_while_descendant_holds_output() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        // The backgrounded sleep keeps stdout open after the server itself exits.
        let worker = deploy(&sup, &dir, "sleep 3 &\necho up\nexit 0").await;

        let started_at = std::time::Instant::now();
        let started = start(&sup, &worker.id).await.unwrap();
        assert!(started.pid.is_some());

        let exited = wait_until(&sup, &worker.id, "stopped", |w| w.status == WorkerStatus::Stopped).await;
        assert_eq!(exited.pid, None);
        assert!(
            started_at.elapsed() < Duration::from_millis(900),
            "exit took {:?} to reconcile",
            started_at.elapsed()
        );

        // The reaped process no longer blocks a fresh start.
        start(&sup, &worker.id).await.unwrap();
        wait_until(&sup, &worker.id, "stopped again", |w| w.status == WorkerStatus::Stopped).await;
        wait_for_log(&sup, &worker.id, "Server exited with code 0").await;
    }

    #[tokio::test]
    async fn test_start_without_executable_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        let worker = deploy(&sup, &dir, "exit 0").await;
        std::fs::remove_file(dir.path().join(EXECUTABLE)).unwrap();

        let err = start(&sup, &worker.id).await.unwrap_err();
        assert!(matches!(err, HearthError::Spawn { .. }), "got {err:?}");
        assert_eq!(sup.get_status(&worker.id).await.unwrap(), WorkerStatus::Error);

        // Error is re-enterable once the binary is back.
        install_script(dir.path(), "exit 0");
        let restarted = start(&sup, &worker.id).await.unwrap();
        assert_eq!(restarted.status, WorkerStatus::Running);
        wait_until(&sup, &worker.id, "stopped", |w| w.status == WorkerStatus::Stopped).await;
    }

    #[tokio::test]
    async fn test_concurrent_starts_yield_one_process() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        let worker = deploy(&sup, &dir, "sleep 30").await;

        let results = {
            let _guard = EXEC_LOCK.read().unwrap();
            futures::future::join_all((0..5).map(|_| sup.start(&worker.id))).await
        };
        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok, 1);
        for err in results.iter().filter_map(|r| r.as_ref().err()) {
            assert!(matches!(err, HearthError::InvalidState { .. }), "got {err:?}");
        }

        let stopped = sup.stop(&worker.id).await.unwrap();
        assert_eq!(stopped.status, WorkerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        let worker = deploy(&sup, &dir, "sleep 30").await;
        start(&sup, &worker.id).await.unwrap();

        for _ in 0..3 {
            let stopped = sup.stop(&worker.id).await.unwrap();
            assert_eq!(stopped.status, WorkerStatus::Stopped);
            assert_eq!(stopped.current_players, 0);
        }
    }

    #[tokio::test]
    async fn test_stop_terminates_whole_tree() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        let worker = deploy(&sup, &dir, "sleep 30 &\nsleep 30 &\nwait").await;
        let started = start(&sup, &worker.id).await.unwrap();
        let root = started.pid.unwrap();

        let mut children = Vec::new();
        for _ in 0..100 {
            children = tokio::task::spawn_blocking(move || hearth_supervisor::descendants(root))
                .await
                .unwrap();
            if children.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(children.len() >= 2, "children never appeared: {children:?}");

        let stopped = sup.stop(&worker.id).await.unwrap();
        assert_eq!(stopped.status, WorkerStatus::Stopped);

        tokio::time::sleep(Duration::from_millis(200)).await;
        for pid in children {
            let alive = tokio::task::spawn_blocking(move || is_running(pid)).await.unwrap();
            assert!(!alive, "orphan {pid} survived stop");
        }
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config();
        config.supervisor.shutdown_timeout = Duration::from_millis(300);
        let registry = ProcessRegistry::new(Arc::new(InMemoryStore::new()));
        let sup = ProcessSupervisor::new(config, registry, Arc::new(NoopMonitor));
        let worker = deploy(&sup, &dir, "trap '' TERM\nwhile true; do sleep 1; done").await;
        start(&sup, &worker.id).await.unwrap();

        let stopped = sup.stop(&worker.id).await.unwrap();
        assert_eq!(stopped.status, WorkerStatus::Stopped);
        wait_for_log(&sup, &worker.id, "terminated by signal 9").await;
    }

    #[tokio::test]
    async fn test_send_command_reaches_console() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        let worker = deploy(&sup, &dir, "while read line; do echo \"got: $line\"; done").await;
        start(&sup, &worker.id).await.unwrap();

        sup.send_command(&worker.id, "save").await.unwrap();
        wait_for_log(&sup, &worker.id, "got: save").await;

        let logs = sup.get_logs(&worker.id, 100).await.unwrap();
        assert!(logs
            .iter()
            .any(|e| e.stream == LogStream::System && e.message == "> save"));

        sup.stop(&worker.id).await.unwrap();
        let err = sup.send_command(&worker.id, "save").await.unwrap_err();
        assert!(matches!(err, HearthError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_player_count_from_output() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        let mut events = sup.subscribe();
        let worker = deploy(
            &sup,
            &dir,
            "echo 'Game server connected'\necho 'Players: 3/10'\nsleep 30",
        )
        .await;
        start(&sup, &worker.id).await.unwrap();

        let updated = wait_until(&sup, &worker.id, "player count", |w| w.current_players == 3).await;
        assert_eq!(updated.max_players, 10);
        assert_eq!(updated.status, WorkerStatus::Running);

        let mut saw_ready = false;
        let mut saw_players = false;
        while let Ok(event) = events.try_recv() {
            match event {
                WorkerEvent::Ready { .. } => saw_ready = true,
                WorkerEvent::PlayersChanged { current: 3, max: 10, .. } => saw_players = true,
                _ => {}
            }
        }
        assert!(saw_ready);
        assert!(saw_players);

        let stopped = sup.stop(&worker.id).await.unwrap();
        assert_eq!(stopped.current_players, 0);
    }

    #[tokio::test]
    async fn test_monitor_notified_on_start_and_exit() {
        let dir = TempDir::new().unwrap();
        let monitor = Arc::new(RecordingMonitor::default());
        let sup = supervisor_with(monitor.clone());
        let worker = deploy(&sup, &dir, "sleep 30").await;

        let started = start(&sup, &worker.id).await.unwrap();
        let stopped = sup.stop(&worker.id).await.unwrap();
        assert_eq!(stopped.status, WorkerStatus::Stopped);

        let calls = monitor.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                format!("start:{}:{}", worker.id, started.pid.unwrap()),
                format!("stop:{}", worker.id),
            ]
        );
    }

    #[tokio::test]
    async fn test_restart_replaces_process() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        let worker = deploy(&sup, &dir, "sleep 30").await;

        let first = start(&sup, &worker.id).await.unwrap();
        let second = {
            let _guard = EXEC_LOCK.read().unwrap();
            sup.restart(&worker.id).await.unwrap()
        };
        assert_eq!(second.status, WorkerStatus::Running);
        assert_ne!(first.pid, second.pid);

        sup.shutdown().await;
        assert_eq!(sup.get_status(&worker.id).await.unwrap(), WorkerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_delete_running_worker_stops_it() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        let worker = deploy(&sup, &dir, "sleep 30").await;
        let started = start(&sup, &worker.id).await.unwrap();

        let removed = sup.delete_worker(&worker.id).await.unwrap();
        assert_eq!(removed.id, worker.id);
        assert!(matches!(
            sup.get_worker(&worker.id).await,
            Err(HearthError::NotFound { .. })
        ));
        assert!(sup.list_workers().await.is_empty());

        let pid = started.pid.unwrap();
        let alive = tokio::task::spawn_blocking(move || is_running(pid)).await.unwrap();
        assert!(!alive);
    }

    #[tokio::test]
    async fn test_backup_and_restore_worlds() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        let worker = deploy(&sup, &dir, "exit 0").await;
        std::fs::create_dir_all(dir.path().join("worlds")).unwrap();
        std::fs::write(dir.path().join("worlds/Dedicated.db"), b"seed-42").unwrap();

        let backup = sup.create_backup(&worker.id, None).await.unwrap();
        assert!(backup.item_paths.iter().any(|p| p == "worlds"));
        let copied = dir
            .path()
            .join("backups")
            .join(&backup.name)
            .join("worlds/Dedicated.db");
        assert_eq!(std::fs::read(&copied).unwrap(), b"seed-42");

        let listed = sup.list_backups(&worker.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, backup.name);

        std::fs::write(dir.path().join("worlds/Dedicated.db"), b"griefed").unwrap();
        let restored = sup.restore_backup(&worker.id, &backup.name).await.unwrap();
        assert!(restored.iter().any(|p| p == "worlds"));
        assert_eq!(
            std::fs::read(dir.path().join("worlds/Dedicated.db")).unwrap(),
            b"seed-42"
        );
    }

    #[tokio::test]
    async fn test_config_access_is_confined() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        let worker = deploy(&sup, &dir, "exit 0").await;

        let err = sup
            .read_config_file(&worker.id, "../../etc/passwd")
            .await
            .unwrap_err();
        assert!(matches!(err, HearthError::AccessDenied { .. }), "got {err:?}");

        let err = sup
            .write_config_file(&worker.id, "/etc/hosts", "127.0.0.1 evil")
            .await
            .unwrap_err();
        assert!(matches!(err, HearthError::AccessDenied { .. }), "got {err:?}");

        let written = sup
            .write_config_file(&worker.id, "saves/adminlist.txt", "76561198000000000\n")
            .await
            .unwrap();
        assert!(written.backup.is_none());
        let listed = sup.list_config_files(&worker.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].relative_path, "saves/adminlist.txt");
        assert_eq!(
            sup.read_config_file(&worker.id, "saves/adminlist.txt").await.unwrap(),
            "76561198000000000\n"
        );
    }
}
