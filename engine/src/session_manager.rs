use load_governor::{
    launch, start_session_on, ControlConfig, GovernorError, Result, SessionHandle, SessionParts, SessionSpec,
    StateSnapshot, Target,
};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::info;

/// Finished sessions kept around for inspection.
const KEEP_FINISHED: usize = 16;

/// Live and recently finished sessions, oldest first.
pub struct SessionRegistry {
    sessions: Mutex<Vec<SessionHandle>>,
    runtime: Handle,
    config: ControlConfig,
}

impl SessionRegistry {
    pub fn new(runtime: Handle, config: ControlConfig) -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
            runtime,
            config,
        }
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn start(&self, spec: SessionSpec) -> Result<SessionHandle> {
        let session = start_session_on(&self.runtime, spec, &self.config)?;
        self.register(session.clone());
        Ok(session)
    }

    /// Starts a session around caller-provided parts, e.g. a simulated plant.
    pub fn start_with(&self, spec: SessionSpec, parts: SessionParts) -> Result<SessionHandle> {
        let session = launch(&self.runtime, spec, &self.config, parts)?;
        self.register(session.clone());
        Ok(session)
    }

    fn register(&self, session: SessionHandle) {
        let mut sessions = self.sessions.lock();
        sessions.push(session);
        let finished = sessions.iter().filter(|s| s.state().state.is_terminal()).count();
        let mut excess = finished.saturating_sub(KEEP_FINISHED);
        sessions.retain(|s| {
            if excess > 0 && s.state().state.is_terminal() {
                excess -= 1;
                false
            } else {
                true
            }
        });
        info!(total = sessions.len(), "session registered");
    }

    pub fn get(&self, id: &str) -> Result<SessionHandle> {
        self.sessions
            .lock()
            .iter()
            .find(|s| s.id() == id)
            .cloned()
            .ok_or_else(|| GovernorError::SessionNotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<StateSnapshot> {
        self.sessions.lock().iter().map(SessionHandle::state).collect()
    }

    pub fn set_target(&self, id: &str, target: Target) -> Result<StateSnapshot> {
        let session = self.get(id)?;
        session.set_target(target)?;
        Ok(session.state())
    }

    pub fn stop(&self, id: &str) -> Result<StateSnapshot> {
        let session = self.get(id)?;
        session.stop();
        Ok(session.state())
    }

    pub fn emergency_stop(&self, id: &str) -> Result<StateSnapshot> {
        let session = self.get(id)?;
        session.emergency_stop();
        Ok(session.state())
    }

    /// Stops every session and waits for each to finish.
    pub async fn shutdown(&self) {
        let sessions: Vec<SessionHandle> = self.sessions.lock().clone();
        for session in sessions {
            let last = session.stop_and_wait().await;
            info!(session = session.id(), state = ?last.state, "session closed on shutdown");
        }
    }
}
