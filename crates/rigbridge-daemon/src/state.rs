//! Application state management

use anyhow::Result;
use chrono::{DateTime, Utc};
use rigbridge_core::protocol::{Inbound, Reply, Session, SessionState};
use rigbridge_core::{DeviceService, Retargeter};
use rigbridge_device::SimulatedDevice;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;

/// Retargeter driving whichever device the daemon was started with
pub type DeviceRetargeter = Retargeter<Box<dyn DeviceService>>;

/// Flag suspending the pose loop while a session operation runs
#[derive(Debug, Default)]
pub struct UpdateGate {
    holds: AtomicUsize,
}

impl UpdateGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend pose updates until the returned guard is dropped.
    pub fn suspend(&self) -> UpdateSuspension<'_> {
        self.holds.fetch_add(1, Ordering::SeqCst);
        UpdateSuspension { gate: self }
    }

    pub fn is_suspended(&self) -> bool {
        self.holds.load(Ordering::SeqCst) > 0
    }
}

/// Guard returned by [`UpdateGate::suspend`]
pub struct UpdateSuspension<'a> {
    gate: &'a UpdateGate,
}

impl Drop for UpdateSuspension<'_> {
    fn drop(&mut self) {
        self.gate.holds.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Snapshot served by `/api/status`
#[derive(Debug, Serialize)]
pub struct Status {
    pub instance: Uuid,
    pub state: String,
    pub mapping_done: bool,
    pub user_rig: bool,
    pub nodes: usize,
    pub template_bones: usize,
    pub connections: usize,
    pub updates_suspended: bool,
    pub started_at: DateTime<Utc>,
}

/// Shared application state
pub struct AppState {
    /// Device, template, rig and mapping
    pub retargeter: Mutex<DeviceRetargeter>,
    /// Protocol state of the single client session
    pub session: Arc<Mutex<Session>>,
    /// Last known session state, readable while a client holds the session
    pub session_state: RwLock<SessionState>,
    /// Pose loop suspension
    pub gate: UpdateGate,
    /// Configuration
    pub config: Config,
    pub instance: Uuid,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Create application state backed by the simulated device
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let device: Box<dyn DeviceService> = Box::new(SimulatedDevice::new(config.device.inputs));
        info!(version = %device.version()?, inputs = config.device.inputs, "Device ready");
        Self::with_device(config, device)
    }

    pub fn with_device(config: Config, device: Box<dyn DeviceService>) -> Result<Arc<Self>> {
        let mut retargeter = Retargeter::new(device, config.scale.offsets());
        retargeter.start(config.device.standard_rig)?;

        if config.mapping.load_on_start {
            match &config.mapping.path {
                Some(path) if path.exists() => {
                    if let Err(e) = retargeter.load_from_file(path) {
                        warn!(path = %path.display(), error = %e, "Could not apply saved mapping");
                    }
                }
                Some(path) => debug!(path = %path.display(), "No saved mapping to load"),
                None => warn!("mapping.load_on_start is set without mapping.path"),
            }
        }

        Ok(Arc::new(Self {
            retargeter: Mutex::new(retargeter),
            session: Arc::new(Mutex::new(Session::new())),
            session_state: RwLock::new(SessionState::Idle),
            gate: UpdateGate::new(),
            config,
            instance: Uuid::new_v4(),
            started_at: Utc::now(),
        }))
    }

    /// Handle one inbound session frame, suspending pose updates when needed.
    pub async fn handle_frame(&self, session: &mut Session, inbound: Inbound<'_>) -> Option<Reply> {
        let _suspension = Session::suspends_updates(inbound).then(|| self.gate.suspend());
        let mut retargeter = self.retargeter.lock().await;
        let reply = session.handle(&mut *retargeter, inbound);

        if let Some(Reply::Mapping(_)) = &reply {
            self.autosave(&retargeter);
        }
        *self.session_state.write().await = session.state();
        reply
    }

    fn autosave(&self, retargeter: &DeviceRetargeter) {
        if !self.config.mapping.autosave {
            return;
        }
        let Some(path) = &self.config.mapping.path else {
            warn!("mapping.autosave is set without mapping.path");
            return;
        };
        if let Err(e) = retargeter.save_to_file(path) {
            warn!(path = %path.display(), error = %e, "Mapping autosave failed");
        }
    }

    /// Run one pose tick unless updates are suspended or the state is busy.
    ///
    /// Returns true when the skeleton pose was updated.
    pub fn tick(&self) -> bool {
        if self.gate.is_suspended() {
            return false;
        }
        let Ok(mut retargeter) = self.retargeter.try_lock() else {
            return false;
        };
        match retargeter.update() {
            Ok(updated) => updated,
            Err(e) => {
                warn!(error = %e, "Pose update failed");
                false
            }
        }
    }

    pub async fn status(&self) -> Status {
        let retargeter = self.retargeter.lock().await;
        Status {
            instance: self.instance,
            state: self.session_state.read().await.to_string(),
            mapping_done: retargeter.mapping_done(),
            user_rig: retargeter.has_user_rig(),
            nodes: retargeter.skeleton().len(),
            template_bones: retargeter.template().len(),
            connections: retargeter.connections().len(),
            updates_suspended: self.gate.is_suspended(),
            started_at: self.started_at,
        }
    }
}
