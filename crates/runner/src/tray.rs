/// System tray icon and context menu for the tray process
///
/// Only builds the icon/menu and reflects engine status. Actions are
/// dispatched by the message loop in `app`.
use anyhow::{anyhow, Result};
use proxy_tray_core::control_api::ProxyMode;
use tray_icon::menu::{
    CheckMenuItem, IsMenuItem, Menu, MenuId, MenuItem, PredefinedMenuItem, Submenu,
};
use tray_icon::{Icon, TrayIcon, TrayIconBuilder};

use crate::engine_events::EngineStatus;

const APP_NAME: &str = "ProxyTray";

/// Load the application icon next to the executable, or a solid fallback
fn load_app_icon(online: bool) -> Result<Icon> {
    let icon_path = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.join("ProxyTray.ico")));

    if let Some(path) = icon_path.filter(|p| p.exists()) {
        let icon_data =
            std::fs::read(&path).map_err(|e| anyhow!("Failed to read {}: {}", path.display(), e))?;

        let img = image::load_from_memory(&icon_data)
            .map_err(|e| anyhow!("Failed to decode icon: {}", e))?;
        let img = img.resize_exact(16, 16, image::imageops::FilterType::Lanczos3);
        let rgba = img.to_rgba8();

        return Icon::from_rgba(rgba.into_raw(), 16, 16)
            .map_err(|e| anyhow!("Failed to create icon from image: {:?}", e));
    }

    // Fallback: green square when online, grey otherwise
    let pixel = if online {
        [0x00, 0xAA, 0x00, 0xFF]
    } else {
        [0x80, 0x80, 0x80, 0xFF]
    };
    let icon_rgba: Vec<u8> = (0..16 * 16).flat_map(|_| pixel).collect();
    Icon::from_rgba(icon_rgba, 16, 16).map_err(|e| anyhow!("Failed to create fallback icon: {:?}", e))
}

pub struct TrayManager {
    tray_icon: TrayIcon,
    status_item: MenuItem,
    start_item: MenuItem,
    stop_item: MenuItem,
    mode_items: Vec<(ProxyMode, CheckMenuItem)>,
    pub menu_item_start: MenuId,
    pub menu_item_stop: MenuId,
    pub menu_item_console: MenuId,
    pub menu_item_dashboard: MenuId,
    pub menu_item_config_folder: MenuId,
    pub menu_item_quit: MenuId,
}

impl TrayManager {
    pub fn new() -> Result<Self> {
        tracing::info!("Creating tray icon");

        let menu = Menu::new();
        let status_item = MenuItem::new(EngineStatus::Stopped.to_string(), false, None);
        let start_item = MenuItem::new("Start engine", true, None);
        let stop_item = MenuItem::new("Stop engine", false, None);

        let mode_menu = Submenu::new("Proxy mode", true);
        let mode_items: Vec<(ProxyMode, CheckMenuItem)> =
            [ProxyMode::Global, ProxyMode::Rule, ProxyMode::Direct]
                .into_iter()
                .map(|mode| (mode, CheckMenuItem::new(mode.to_string(), true, false, None)))
                .collect();
        for (_, item) in &mode_items {
            mode_menu
                .append(item)
                .map_err(|e| anyhow!("Failed to add mode item: {}", e))?;
        }

        let console_item = MenuItem::new("Show / hide console", true, None);
        let dashboard_item = MenuItem::new("Open dashboard", true, None);
        let config_item = MenuItem::new("Open config folder", true, None);
        let quit_item = MenuItem::new("Quit", true, None);

        let separators = [
            PredefinedMenuItem::separator(),
            PredefinedMenuItem::separator(),
            PredefinedMenuItem::separator(),
        ];
        let items: [&dyn IsMenuItem; 11] = [
            &status_item,
            &separators[0],
            &start_item,
            &stop_item,
            &mode_menu,
            &separators[1],
            &console_item,
            &dashboard_item,
            &config_item,
            &separators[2],
            &quit_item,
        ];
        for item in items {
            menu.append(item)
                .map_err(|e| anyhow!("Failed to build tray menu: {}", e))?;
        }

        let tray_icon = TrayIconBuilder::new()
            .with_tooltip(format!("{} - {}", APP_NAME, EngineStatus::Stopped))
            .with_icon(load_app_icon(false)?)
            .with_menu(Box::new(menu))
            .build()
            .map_err(|e| anyhow!("Failed to create tray icon: {}", e))?;

        tracing::info!("Tray icon created successfully with context menu");

        Ok(Self {
            menu_item_start: start_item.id().clone(),
            menu_item_stop: stop_item.id().clone(),
            menu_item_console: console_item.id().clone(),
            menu_item_dashboard: dashboard_item.id().clone(),
            menu_item_config_folder: config_item.id().clone(),
            menu_item_quit: quit_item.id().clone(),
            tray_icon,
            status_item,
            start_item,
            stop_item,
            mode_items,
        })
    }

    /// Reflect engine status in tooltip, status line, icon and Start/Stop items
    pub fn set_status(&self, status: &EngineStatus) {
        let text = status.to_string();
        self.status_item.set_text(&text);
        let _ = self
            .tray_icon
            .set_tooltip(Some(format!("{} - {}", APP_NAME, text)));

        let online = matches!(status, EngineStatus::Online(_));
        match load_app_icon(online) {
            Ok(icon) => {
                let _ = self.tray_icon.set_icon(Some(icon));
            }
            Err(e) => tracing::warn!("Failed to update tray icon: {}", e),
        }

        let running = matches!(
            status,
            EngineStatus::Online(_) | EngineStatus::Unreachable | EngineStatus::Starting
        );
        self.start_item.set_enabled(!running && *status != EngineStatus::Stopping);
        self.stop_item.set_enabled(running);
    }

    /// Which proxy mode a menu id selects, if any
    pub fn mode_for(&self, id: &MenuId) -> Option<ProxyMode> {
        self.mode_items
            .iter()
            .find(|(_, item)| item.id() == id)
            .map(|(mode, _)| *mode)
    }

    /// Check exactly the current mode
    pub fn set_mode(&self, current: Option<ProxyMode>) {
        for (mode, item) in &self.mode_items {
            item.set_checked(Some(*mode) == current);
        }
    }
}
