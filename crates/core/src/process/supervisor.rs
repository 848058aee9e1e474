//! Supervisor state machine
//!
//! ```text
//! Stopped --start--> Running --stop--> WaitingForManualStop --engine exits--> Stopped
//!                    Running --force_stop--> Stopped
//!                    Running --engine exits--> Stopped (crash handler called)
//! ```
//!
//! All state lives behind one mutex. Launching and the crash handler run
//! outside of it, so the handler may call `start()` again.

use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::error::{LaunchStage, SupervisorError};
use super::launcher::{EngineEpisode, EngineExit, EngineLauncher};
use super::monitor::{self, classify_exit, CrashReport, ExitClass, DEFAULT_EARLY_FAILURE_THRESHOLD};
use crate::launch_spec::LaunchSpec;

/// Lifecycle state of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Running,
    /// Interrupt requested, waiting for the engine to exit on its own
    WaitingForManualStop,
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    /// Engine lifetimes below this are reported as early failures
    pub early_failure_threshold: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            early_failure_threshold: DEFAULT_EARLY_FAILURE_THRESHOLD,
        }
    }
}

type CrashHandler = Arc<dyn Fn(CrashReport) + Send + Sync>;

struct ActiveEpisode {
    id: u64,
    episode: Box<dyn EngineEpisode>,
}

struct Inner {
    spec: LaunchSpec,
    state: SupervisorState,
    episode: Option<ActiveEpisode>,
    /// Container of an early failure, kept so its console can still be shown
    retained: Option<Box<dyn EngineEpisode>>,
    last_episode_id: u64,
    starting: bool,
}

struct Shared {
    launcher: Box<dyn EngineLauncher>,
    config: SupervisorConfig,
    inner: Mutex<Inner>,
    crash_handler: RwLock<Option<CrashHandler>>,
}

/// Owns the engine lifecycle. Cloning yields another handle to the same supervisor.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    pub fn new(launcher: Box<dyn EngineLauncher>, spec: LaunchSpec, config: SupervisorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                launcher,
                config,
                inner: Mutex::new(Inner {
                    spec,
                    state: SupervisorState::Stopped,
                    episode: None,
                    retained: None,
                    last_episode_id: 0,
                    starting: false,
                }),
                crash_handler: RwLock::new(None),
            }),
        }
    }

    /// Called on every early failure or runtime crash, never on manual stop
    pub fn set_crash_handler<F>(&self, handler: F)
    where
        F: Fn(CrashReport) + Send + Sync + 'static,
    {
        *self.shared.crash_handler.write() = Some(Arc::new(handler));
    }

    /// Start the engine and return its process id.
    ///
    /// Blocks until the helper reports ready or exits.
    pub fn start(&self) -> Result<u32, SupervisorError> {
        let (spec, episode_id, stale) = {
            let mut inner = self.shared.inner.lock();
            if inner.state != SupervisorState::Stopped || inner.starting {
                tracing::warn!("Start rejected: engine is {:?}", inner.state);
                return Err(SupervisorError::AlreadyRunning);
            }
            inner.starting = true;
            inner.last_episode_id += 1;
            (inner.spec.clone(), inner.last_episode_id, inner.retained.take())
        };
        drop(stale);

        tracing::info!(
            "Starting engine {} (episode {})",
            spec.engine_path.display(),
            episode_id
        );

        let launched = self.shared.launcher.launch(&spec).and_then(|episode| {
            let watcher = episode.exit_watcher()?;
            Ok((episode, watcher))
        });

        let mut inner = self.shared.inner.lock();
        inner.starting = false;

        let (episode, watcher) = match launched {
            Ok(launched) => launched,
            Err(e) => {
                tracing::error!("Engine failed to start: {}", e);
                return Err(e);
            }
        };

        let process_id = episode.process_id();
        inner.state = SupervisorState::Running;
        inner.episode = Some(ActiveEpisode {
            id: episode_id,
            episode,
        });
        drop(inner);

        let weak = Arc::downgrade(&self.shared);
        let spawned = monitor::spawn(episode_id, watcher, move |exit| {
            on_engine_exit(&weak, episode_id, exit);
        });

        if let Err(e) = spawned {
            let orphan = {
                let mut inner = self.shared.inner.lock();
                inner.state = SupervisorState::Stopped;
                inner.episode.take()
            };
            drop(orphan);
            tracing::error!("Failed to start engine monitor: {}", e);
            return Err(SupervisorError::setup(LaunchStage::WatchEngine, e));
        }

        tracing::info!("Engine running (pid {})", process_id);
        Ok(process_id)
    }

    /// Ask the engine to shut down. Completion is observed by the monitor.
    pub fn stop(&self) -> bool {
        let mut inner = self.shared.inner.lock();
        if inner.state != SupervisorState::Running {
            return false;
        }
        let Some(active) = inner.episode.as_ref() else {
            return false;
        };

        match active.episode.request_interrupt() {
            Ok(()) => {
                inner.state = SupervisorState::WaitingForManualStop;
                tracing::info!("Engine interrupt requested");
                true
            }
            Err(e) => {
                tracing::error!("Failed to request engine stop: {}", e);
                false
            }
        }
    }

    /// Kill the whole process tree now. Safe to call in any state.
    pub fn force_stop(&self) {
        let (episode, retained) = {
            let mut inner = self.shared.inner.lock();
            if inner.state != SupervisorState::Stopped {
                tracing::info!("Force stopping engine from {:?}", inner.state);
            }
            inner.state = SupervisorState::Stopped;
            (inner.episode.take(), inner.retained.take())
        };
        drop(episode);
        drop(retained);
    }

    /// Close the container kept alive after an early failure
    pub fn dismiss_console(&self) {
        let retained = self.shared.inner.lock().retained.take();
        if retained.is_some() {
            tracing::debug!("Closing retained early-failure console");
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.shared.inner.lock().state
    }

    pub fn engine_process_id(&self) -> Option<u32> {
        self.shared
            .inner
            .lock()
            .episode
            .as_ref()
            .map(|active| active.episode.process_id())
    }

    /// Takes effect on the next start
    pub fn set_config_file(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        tracing::info!("Config file set to {}", path.display());
        self.shared.inner.lock().spec.config_file = path;
    }

    pub fn launch_spec(&self) -> LaunchSpec {
        self.shared.inner.lock().spec.clone()
    }

    /// Show or hide the helper console of the current or retained episode
    pub fn set_console_visible(&self, visible: bool) -> Result<(), SupervisorError> {
        let inner = self.shared.inner.lock();
        match console_owner(&inner) {
            Some(episode) => episode.set_console_visible(visible),
            None => Err(SupervisorError::NoConsole),
        }
    }

    pub fn is_console_visible(&self) -> bool {
        let inner = self.shared.inner.lock();
        console_owner(&inner)
            .map(|episode| episode.is_console_visible())
            .unwrap_or(false)
    }
}

fn console_owner(inner: &Inner) -> Option<&dyn EngineEpisode> {
    inner
        .episode
        .as_ref()
        .map(|active| active.episode.as_ref())
        .or(inner.retained.as_deref())
}

fn on_engine_exit(shared: &Weak<Shared>, episode_id: u64, exit: EngineExit) {
    let Some(shared) = shared.upgrade() else {
        return;
    };

    let (class, closing) = {
        let mut inner = shared.inner.lock();
        let current = inner.episode.as_ref().map(|active| active.id);
        if current != Some(episode_id) {
            tracing::debug!("Ignoring exit of finished episode {}", episode_id);
            return;
        }

        let class = classify_exit(
            inner.state,
            exit.lifetime,
            shared.config.early_failure_threshold,
        );
        let episode = inner.episode.take().map(|active| active.episode);
        inner.state = SupervisorState::Stopped;

        if class == ExitClass::EarlyFailure {
            inner.retained = episode;
            (class, None)
        } else {
            (class, episode)
        }
    };
    drop(closing);

    tracing::info!(
        "Engine exited with code {} after {:?}: {:?}",
        exit.exit_code,
        exit.lifetime,
        class
    );

    if class == ExitClass::ManualStop {
        return;
    }

    let handler = shared.crash_handler.read().clone();
    if let Some(handler) = handler {
        handler(CrashReport {
            exit_code: exit.exit_code,
            lifetime: exit.lifetime,
            was_early_failure: class == ExitClass::EarlyFailure,
        });
    }
}
