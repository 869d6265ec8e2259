use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use loopcast_session::{Destination, SessionState, SessionStatus, SlotId};
use tokio::sync::Mutex;

use crate::encoder::{EncoderProcess, ProcessController};
use crate::error::SessionError;
use crate::logs::{LogBuffer, LogSink};

const MAX_LOG_TAIL: usize = 1000;

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub slot_id: SlotId,
    pub source: PathBuf,
    pub destination: Destination,
    pub cleanup_source: bool,
}

#[derive(Debug)]
struct StreamSession {
    slot_id: SlotId,
    process: EncoderProcess,
    source: PathBuf,
    destination: Destination,
    state: SessionState,
    started_at_unix_ms: u64,
    cleanup_source: bool,
    logs: Arc<Mutex<LogBuffer>>,
}

impl StreamSession {
    fn status(&self) -> SessionStatus {
        SessionStatus {
            slot_id: self.slot_id.clone(),
            state: self.state,
            pid: self.process.pid(),
            source: self.source.display().to_string(),
            destination: self.destination.redacted(),
            started_at_unix_ms: self.started_at_unix_ms,
            exit_code: self.process.exit_code(),
        }
    }
}

#[derive(Debug, Default)]
struct Sessions {
    map: HashMap<SlotId, StreamSession>,
    // Set once by the shutdown supervisor; later starts are refused.
    closed: bool,
}

impl Sessions {
    fn reap_exited(&mut self) -> Vec<StreamSession> {
        let dead: Vec<SlotId> = self
            .map
            .iter_mut()
            .filter_map(|(slot, s)| {
                if s.process.is_alive() {
                    None
                } else {
                    s.state = SessionState::Exited;
                    Some(slot.clone())
                }
            })
            .collect();

        dead.iter()
            .filter_map(|slot| self.map.remove(slot))
            .inspect(|s| {
                tracing::warn!(
                    slot_id = %s.slot_id,
                    pid = ?s.process.pid(),
                    exit_code = ?s.process.exit_code(),
                    "encoder exited on its own; session removed"
                );
            })
            .collect()
    }
}

fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

async fn ensure_readable_file(path: &Path) -> Result<(), SessionError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|_| SessionError::NotFound(format!("source file not found: {}", path.display())))?;
    if !meta.is_file() {
        return Err(SessionError::NotFound(format!(
            "source is not a regular file: {}",
            path.display()
        )));
    }
    tokio::fs::File::open(path).await.map_err(|e| {
        SessionError::NotFound(format!("source file not readable: {} ({e})", path.display()))
    })?;
    Ok(())
}

async fn remove_source(slot_id: &SlotId, path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::info!(%slot_id, path = %path.display(), "source file removed"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(%slot_id, path = %path.display(), %err, "failed to remove source file")
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionRegistry {
    inner: Arc<Mutex<Sessions>>,
    controller: Arc<ProcessController>,
    log_max_lines: usize,
}

impl SessionRegistry {
    pub fn new(controller: ProcessController, log_max_lines: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Sessions::default())),
            controller: Arc::new(controller),
            log_max_lines,
        }
    }

    pub fn controller(&self) -> &ProcessController {
        &self.controller
    }

    pub async fn start(&self, req: StartRequest) -> Result<SessionStatus, SessionError> {
        let StartRequest {
            slot_id,
            source,
            destination,
            cleanup_source,
        } = req;

        if slot_id.as_str().trim().is_empty() {
            return Err(SessionError::Validation("slotID must be non-empty".to_string()));
        }
        if source.as_os_str().is_empty() {
            return Err(SessionError::Validation("source path must be non-empty".to_string()));
        }
        ensure_readable_file(&source).await?;

        // Busy-check, spawn and insert under one guard: two starts for the
        // same slot can never both pass the check.
        let (started, stale) = {
            let mut sessions = self.inner.lock().await;
            if sessions.closed {
                return Err(SessionError::process_msg("relay is shutting down"));
            }

            let mut stale = None;
            if let Some(existing) = sessions.map.get_mut(&slot_id) {
                if existing.process.is_alive() {
                    tracing::info!(%slot_id, "start rejected: slot busy");
                    return Err(SessionError::Conflict(slot_id));
                }
                existing.state = SessionState::Exited;
                // The new session may be reusing the old one's file.
                if existing.source == source {
                    existing.cleanup_source = false;
                }
                stale = sessions.map.remove(&slot_id);
            }

            let sink = LogSink::new(slot_id.clone(), self.log_max_lines);
            let logs = sink.buffer();
            let started = self
                .controller
                .spawn(&source, &destination, sink)
                .map(|process| {
                    let session = StreamSession {
                        slot_id: slot_id.clone(),
                        process,
                        source,
                        destination,
                        state: SessionState::Running,
                        started_at_unix_ms: now_unix_ms(),
                        cleanup_source,
                        logs,
                    };
                    let status = session.status();
                    sessions.map.insert(slot_id.clone(), session);
                    status
                });
            (started, stale)
        };

        // The stale record is gone from the map either way; its file must go too.
        if let Some(old) = stale {
            self.release_exited(old).await;
        }

        let status = started.map_err(|e| {
            tracing::error!(%slot_id, err = %e, "start failed: encoder spawn");
            e
        })?;
        tracing::info!(slot_id = %status.slot_id, pid = ?status.pid, "stream started");
        Ok(status)
    }

    pub async fn stop(&self, slot_id: &SlotId) -> Result<SessionStatus, SessionError> {
        let mut session = {
            let mut sessions = self.inner.lock().await;
            sessions.map.remove(slot_id).ok_or_else(|| {
                tracing::info!(%slot_id, "stop rejected: slot not active");
                SessionError::slot_not_active(slot_id)
            })?
        };
        session.state = SessionState::Stopping;
        tracing::info!(%slot_id, pid = ?session.process.pid(), "stopping stream");

        let outcome = self
            .controller
            .terminate(&mut session.process)
            .await
            .map_err(|e| {
                tracing::error!(%slot_id, err = %e, "stop failed: encoder termination");
                e
            })?;
        session.state = SessionState::Exited;

        if session.cleanup_source {
            remove_source(slot_id, &session.source).await;
        }

        tracing::info!(%slot_id, ?outcome, "stream stopped");
        Ok(session.status())
    }

    // Reconciles first: a crashed encoder is never reported as active.
    pub async fn status(&self) -> Vec<SlotId> {
        let (mut active, reaped) = {
            let mut sessions = self.inner.lock().await;
            let reaped = sessions.reap_exited();
            let active: Vec<SlotId> = sessions
                .map
                .values()
                .filter(|s| s.state == SessionState::Running)
                .map(|s| s.slot_id.clone())
                .collect();
            (active, reaped)
        };
        self.release_all_exited(reaped).await;
        active.sort();
        active
    }

    pub async fn sessions(&self) -> Vec<SessionStatus> {
        let (mut out, reaped) = {
            let mut sessions = self.inner.lock().await;
            let reaped = sessions.reap_exited();
            let out: Vec<SessionStatus> = sessions.map.values().map(StreamSession::status).collect();
            (out, reaped)
        };
        self.release_all_exited(reaped).await;
        out.sort_by(|a, b| a.slot_id.cmp(&b.slot_id));
        out
    }

    pub async fn reconcile(&self) -> Vec<SlotId> {
        let reaped = {
            let mut sessions = self.inner.lock().await;
            sessions.reap_exited()
        };
        let slots = reaped.iter().map(|s| s.slot_id.clone()).collect();
        self.release_all_exited(reaped).await;
        slots
    }

    pub async fn logs(
        &self,
        slot_id: &SlotId,
        cursor: u64,
        limit: usize,
    ) -> Result<(Vec<String>, u64), SessionError> {
        let logs = {
            let sessions = self.inner.lock().await;
            sessions
                .map
                .get(slot_id)
                .map(|s| s.logs.clone())
                .ok_or_else(|| SessionError::slot_not_active(slot_id))?
        };
        let guard = logs.lock().await;
        Ok(guard.tail_after(cursor, limit.clamp(1, MAX_LOG_TAIL)))
    }

    pub async fn close(&self) -> Vec<SlotId> {
        let mut sessions = self.inner.lock().await;
        sessions.closed = true;
        let mut slots: Vec<SlotId> = sessions.map.keys().cloned().collect();
        slots.sort();
        slots
    }

    async fn release_all_exited(&self, sessions: Vec<StreamSession>) {
        for s in sessions {
            self.release_exited(s).await;
        }
    }

    // The encoder is already reaped here; only the owned source file is left.
    async fn release_exited(&self, session: StreamSession) {
        if session.cleanup_source {
            remove_source(&session.slot_id, &session.source).await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::encoder::tests::sh_controller;

    fn slot(s: &str) -> SlotId {
        SlotId(s.to_string())
    }

    fn dest() -> Destination {
        Destination::resolve("rtmp://127.0.0.1/live", "key").unwrap()
    }

    fn video(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let p = dir.path().join(name);
        std::fs::write(&p, b"not really a video").unwrap();
        p
    }

    fn registry(script: &str) -> SessionRegistry {
        SessionRegistry::new(sh_controller(script, Duration::from_secs(5)), 100)
    }

    fn req(slot_id: &str, source: PathBuf) -> StartRequest {
        StartRequest {
            slot_id: slot(slot_id),
            source,
            destination: dest(),
            cleanup_source: false,
        }
    }

    #[tokio::test]
    async fn second_start_on_busy_slot_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry("exec sleep 30");

        let first = reg.start(req("s1", video(&dir, "a.mp4"))).await.unwrap();
        let err = reg.start(req("s1", video(&dir, "b.mp4"))).await.unwrap_err();
        assert!(matches!(err, SessionError::Conflict(_)));

        let sessions = reg.sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].pid, first.pid);
        assert!(sessions[0].source.ends_with("a.mp4"));

        reg.stop(&slot("s1")).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_starts_on_one_slot_admit_exactly_one() {
        let dir = tempfile::tempdir().unwrap();
        let src = video(&dir, "a.mp4");
        let reg = registry("exec sleep 30");

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let reg = reg.clone();
            let src = src.clone();
            tasks.push(tokio::spawn(async move { reg.start(req("s1", src)).await }));
        }

        let mut ok = 0;
        let mut conflicts = 0;
        for t in tasks {
            match t.await.unwrap() {
                Ok(_) => ok += 1,
                Err(SessionError::Conflict(_)) => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(conflicts, 7);
        assert_eq!(reg.status().await, vec![slot("s1")]);

        reg.stop(&slot("s1")).await.unwrap();
    }

    #[tokio::test]
    async fn stop_unknown_slot_is_not_found() {
        let reg = registry("exec sleep 30");
        let err = reg.stop(&slot("nope")).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
        assert!(reg.status().await.is_empty());
    }

    #[tokio::test]
    async fn stop_twice_second_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry("exec sleep 30");
        reg.start(req("s1", video(&dir, "a.mp4"))).await.unwrap();

        let stopped = reg.stop(&slot("s1")).await.unwrap();
        assert_eq!(stopped.state, SessionState::Exited);

        let err = reg.stop(&slot("s1")).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn stop_kills_process_and_removes_owned_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = video(&dir, "owned.mp4");
        let reg = registry("exec sleep 30");
        let mut r = req("s1", src.clone());
        r.cleanup_source = true;
        let started = reg.start(r).await.unwrap();
        let pid = started.pid.unwrap() as i32;

        reg.stop(&slot("s1")).await.unwrap();
        assert!(!src.exists());
        // Reaped: the pid no longer exists.
        let rc = unsafe { libc::kill(pid, 0) };
        assert_eq!(rc, -1);
    }

    #[tokio::test]
    async fn stop_keeps_unowned_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = video(&dir, "library.mp4");
        let reg = registry("exec sleep 30");
        reg.start(req("s1", src.clone())).await.unwrap();
        reg.stop(&slot("s1")).await.unwrap();
        assert!(src.exists());
    }

    #[tokio::test]
    async fn crashed_encoder_is_reconciled_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry("sleep 0.2; exit 1");
        reg.start(req("s1", video(&dir, "a.mp4"))).await.unwrap();
        assert_eq!(reg.status().await, vec![slot("s1")]);

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(reg.status().await.is_empty());

        let err = reg.stop(&slot("s1")).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn exited_slot_can_be_started_again() {
        let dir = tempfile::tempdir().unwrap();
        let src = video(&dir, "a.mp4");
        let reg = registry("sleep 0.2");
        reg.start(req("s1", src.clone())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;

        // No status query in between: start reconciles the stale record itself.
        reg.start(req("s1", src)).await.unwrap();
        assert_eq!(reg.status().await, vec![slot("s1")]);
    }

    #[tokio::test]
    async fn missing_source_is_not_found_and_leaves_no_state() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry("exec sleep 30");
        let err = reg
            .start(req("s1", dir.path().join("missing.mp4")))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
        assert!(reg.status().await.is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_leaves_no_state() {
        let dir = tempfile::tempdir().unwrap();
        let reg = SessionRegistry::new(
            ProcessController::new("/nonexistent/encoder", vec![], Duration::from_secs(1)),
            100,
        );
        let err = reg.start(req("s1", video(&dir, "a.mp4"))).await.unwrap_err();
        assert!(matches!(err, SessionError::Process { .. }));
        assert!(reg.sessions().await.is_empty());
    }

    #[tokio::test]
    async fn closed_registry_refuses_new_starts() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry("exec sleep 30");
        assert!(reg.close().await.is_empty());
        let err = reg.start(req("s1", video(&dir, "a.mp4"))).await.unwrap_err();
        assert!(matches!(err, SessionError::Process { .. }));
    }

    #[tokio::test]
    async fn logs_tail_encoder_output() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry("echo hello; exec sleep 30");
        reg.start(req("s1", video(&dir, "a.mp4"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let (lines, cursor) = reg.logs(&slot("s1"), 0, 50).await.unwrap();
        assert_eq!(lines, vec!["[stdout] hello"]);
        assert_eq!(cursor, 1);

        reg.stop(&slot("s1")).await.unwrap();
        assert!(matches!(
            reg.logs(&slot("s1"), 0, 50).await.unwrap_err(),
            SessionError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn empty_slot_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry("exec sleep 30");
        for raw in ["", "   "] {
            let err = reg
                .start(req(raw, video(&dir, "a.mp4")))
                .await
                .unwrap_err();
            assert!(matches!(err, SessionError::Validation(_)));
        }
        assert!(reg.status().await.is_empty());
    }

    #[tokio::test]
    async fn failed_restart_still_removes_stale_owned_source() {
        let dir = tempfile::tempdir().unwrap();
        // A symlinked encoder that can be pulled out from under the registry.
        let encoder = dir.path().join("encoder");
        std::os::unix::fs::symlink("/bin/sh", &encoder).unwrap();
        let reg = SessionRegistry::new(
            ProcessController::new(
                encoder.display().to_string(),
                vec!["-c".to_string(), "exit 0".to_string()],
                Duration::from_secs(1),
            ),
            100,
        );

        let owned = video(&dir, "owned.mp4");
        let mut r = req("s1", owned.clone());
        r.cleanup_source = true;
        reg.start(r).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        std::fs::remove_file(&encoder).unwrap();
        let err = reg
            .start(req("s1", video(&dir, "next.mp4")))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Process { .. }));
        assert!(reg.sessions().await.is_empty());
        assert!(!owned.exists());
    }

    #[tokio::test]
    async fn stop_racing_start_never_orphans_an_encoder() {
        let dir = tempfile::tempdir().unwrap();
        let src = video(&dir, "a.mp4");
        let reg = registry("exec sleep 30");

        for _ in 0..5 {
            let start = {
                let reg = reg.clone();
                let src = src.clone();
                tokio::spawn(async move { reg.start(req("s1", src)).await })
            };
            let stop = {
                let reg = reg.clone();
                tokio::spawn(async move { reg.stop(&slot("s1")).await })
            };
            let started = start.await.unwrap().unwrap();
            let pid = started.pid.unwrap() as i32;

            match stop.await.unwrap() {
                // Stop won the race after the insert: it tore this session down.
                Ok(stopped) => {
                    assert_eq!(stopped.pid, started.pid);
                    assert!(reg.status().await.is_empty());
                }
                // Stop ran first: the session is registered and still stoppable.
                Err(SessionError::NotFound(_)) => {
                    assert_eq!(reg.status().await, vec![slot("s1")]);
                    reg.stop(&slot("s1")).await.unwrap();
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
            assert_eq!(unsafe { libc::kill(pid, 0) }, -1);
        }
    }
}
