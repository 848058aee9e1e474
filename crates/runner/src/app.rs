//! Tray controller: Win32 message loop, menu actions and restart policy

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use proxy_tray_core::config::{self, AppConfig};
use proxy_tray_core::control_api::{ControlApi, HttpControlApi, ProxyMode};
use proxy_tray_core::process::{create_launcher, Supervisor, SupervisorState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tray_icon::menu::MenuEvent;
use windows::Win32::UI::WindowsAndMessaging::*;

use crate::engine_events::{
    console_action, crash_action, launch_engine, ConsoleAction, CrashAction, EngineEvent,
    EngineStatus,
};
use crate::tray::TrayManager;

/// Everything the message loop acts on
struct Controller {
    app_config: AppConfig,
    data_dir: PathBuf,
    supervisor: Supervisor,
    api: Arc<dyn ControlApi>,
    engine_tx: Sender<EngineEvent>,
    tray: TrayManager,
    status: EngineStatus,
}

pub fn run() -> Result<()> {
    tracing::info!("ProxyTray starting...");

    let app_config = config::load_config();
    let data_dir = config::get_data_directory()?;
    config::ensure_engine_config_dir(&data_dir).context("Failed to create engine config folder")?;

    let exe_dir = std::env::current_exe()?
        .parent()
        .context("Failed to get executable directory")?
        .to_path_buf();
    let spec = app_config.launch_spec(&exe_dir, &data_dir);
    tracing::info!("Engine: {}", spec.engine_path.display());

    let launcher = create_launcher().context("Failed to create engine launcher")?;
    let supervisor = Supervisor::new(launcher, spec, app_config.supervisor_config());

    let api: Arc<dyn ControlApi> = Arc::new(
        HttpControlApi::new(&app_config.controller_address, &app_config.controller_secret)
            .context("Failed to create control API client")?,
    );

    let (engine_tx, engine_rx) = unbounded::<EngineEvent>();
    let crash_tx = engine_tx.clone();
    supervisor.set_crash_handler(move |report| {
        let _ = crash_tx.send(EngineEvent::Crashed(report));
    });

    let tray = TrayManager::new().context("Failed to create tray manager")?;

    let (menu_tx, menu_rx) = unbounded::<MenuEvent>();
    MenuEvent::set_event_handler(Some(move |event| {
        tracing::debug!("Menu event: {:?}", event);
        let _ = menu_tx.send(event);
    }));

    let mut controller = Controller {
        app_config,
        data_dir,
        supervisor,
        api,
        engine_tx,
        tray,
        status: EngineStatus::Stopped,
    };
    controller.start_engine();

    tracing::info!("Event handlers set, entering message loop");
    let result = controller.message_loop(&menu_rx, &engine_rx);

    controller.supervisor.force_stop();
    tracing::info!("ProxyTray exiting");
    result
}

impl Controller {
    fn message_loop(
        &mut self,
        menu_rx: &Receiver<MenuEvent>,
        engine_rx: &Receiver<EngineEvent>,
    ) -> Result<()> {
        unsafe {
            let mut msg = MSG::default();
            loop {
                // Pump Windows messages (required for tray icon events)
                while PeekMessageW(&mut msg, None, 0, 0, PM_REMOVE).as_bool() {
                    if msg.message == WM_QUIT {
                        tracing::info!("WM_QUIT received, exiting");
                        return Ok(());
                    }
                    TranslateMessage(&msg);
                    DispatchMessageW(&msg);
                }

                while let Ok(event) = menu_rx.try_recv() {
                    if !self.handle_menu(&event) {
                        return Ok(());
                    }
                }

                while let Ok(event) = engine_rx.try_recv() {
                    self.handle_engine_event(event);
                }

                if self.status == EngineStatus::Stopping
                    && self.supervisor.state() == SupervisorState::Stopped
                {
                    self.set_status(EngineStatus::Stopped);
                }

                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }

    fn set_status(&mut self, status: EngineStatus) {
        tracing::info!("Status: {}", status);
        self.tray.set_status(&status);
        self.status = status;
    }

    fn start_engine(&mut self) {
        self.set_status(EngineStatus::Starting);
        launch_engine(
            &self.supervisor,
            Arc::clone(&self.api),
            self.app_config.reachability_policy(),
            self.engine_tx.clone(),
        );
    }

    /// Returns false when the user asked to quit
    fn handle_menu(&mut self, event: &MenuEvent) -> bool {
        let id = &event.id;

        if *id == self.tray.menu_item_quit {
            tracing::info!("Quit menu clicked");
            return false;
        } else if *id == self.tray.menu_item_start {
            if self.supervisor.state() == SupervisorState::Stopped {
                self.start_engine();
            }
        } else if *id == self.tray.menu_item_stop {
            if self.supervisor.stop() {
                self.set_status(EngineStatus::Stopping);
            }
        } else if *id == self.tray.menu_item_console {
            self.toggle_console();
        } else if *id == self.tray.menu_item_dashboard {
            let url = format!("http://{}/ui", self.app_config.controller_address);
            if let Err(e) = open::that(&url) {
                tracing::error!("Failed to open dashboard {}: {}", url, e);
            }
        } else if *id == self.tray.menu_item_config_folder {
            let folder = self.data_dir.join(config::ENGINE_CONFIG_DIR_NAME);
            if let Err(e) = open::that(&folder) {
                tracing::error!("Failed to open {}: {}", folder.display(), e);
            }
        } else if let Some(mode) = self.tray.mode_for(id) {
            self.switch_mode(mode);
        }

        true
    }

    fn toggle_console(&mut self) {
        let visible = self.supervisor.is_console_visible();
        let result = match console_action(self.supervisor.state(), visible) {
            ConsoleAction::Show => self.supervisor.set_console_visible(true),
            ConsoleAction::Hide => self.supervisor.set_console_visible(false),
            ConsoleAction::Dismiss => {
                self.supervisor.dismiss_console();
                if matches!(self.status, EngineStatus::EarlyFailure { .. }) {
                    self.set_status(EngineStatus::Stopped);
                }
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!("Console toggle failed: {}", e);
        }
    }

    fn switch_mode(&self, mode: ProxyMode) {
        tracing::info!("Switching proxy mode to {}", mode);
        if let Err(e) = self.api.update_mode(mode) {
            tracing::error!("Failed to switch mode: {}", e);
        }
        self.refresh_mode();
    }

    fn refresh_mode(&self) {
        match self.api.get_configs() {
            Ok(configs) => self.tray.set_mode(Some(configs.mode)),
            Err(e) => {
                tracing::warn!("Failed to read engine configs: {}", e);
                self.tray.set_mode(None);
            }
        }
    }

    fn handle_engine_event(&mut self, event: EngineEvent) {
        if let Some(process_id) = event.process_id() {
            if self.supervisor.engine_process_id() != Some(process_id) {
                tracing::debug!("Ignoring {:?} for finished engine {}", event, process_id);
                return;
            }
        }

        match event {
            EngineEvent::Online { version, .. } => {
                self.set_status(EngineStatus::Online(version.version));
                self.refresh_mode();
            }
            EngineEvent::Superseded { process_id } => {
                tracing::debug!("Reachability check for engine {} abandoned", process_id);
            }
            EngineEvent::Unreachable { attempts, .. } => {
                tracing::error!(
                    "Engine started but the control API did not answer after {} attempts; \
                     check external-controller is {} in the engine config",
                    attempts,
                    self.app_config.controller_address
                );
                self.set_status(EngineStatus::Unreachable);
            }
            EngineEvent::StartFailed(reason) => {
                tracing::error!("Failed to start engine: {}", reason);
                self.set_status(EngineStatus::StartFailed);
            }
            EngineEvent::Crashed(report) => {
                tracing::error!(
                    "Engine crashed with exit code {} after {:?}",
                    report.exit_code,
                    report.lifetime
                );
                self.tray.set_mode(None);
                match crash_action(&report, self.app_config.auto_restart_on_crash) {
                    CrashAction::Restart => self.start_engine(),
                    CrashAction::ShowConsole => {
                        if let Err(e) = self.supervisor.set_console_visible(true) {
                            tracing::warn!("Cannot show engine console: {}", e);
                        }
                        self.set_status(EngineStatus::EarlyFailure {
                            exit_code: report.exit_code,
                        });
                    }
                    CrashAction::StayStopped => self.set_status(EngineStatus::Stopped),
                }
            }
        }
    }
}

/// Show a fatal startup error; the tray process has no console
pub fn report_fatal(error: &anyhow::Error) {
    use windows::core::HSTRING;

    let text = HSTRING::from(format!("{:#}", error));
    unsafe {
        MessageBoxW(None, &text, &HSTRING::from("ProxyTray"), MB_OK | MB_ICONERROR);
    }
}
