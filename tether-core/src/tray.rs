pub const TRAY_MENU_OPEN: &str = "tray_open";
pub const TRAY_MENU_DISCONNECT: &str = "tray_disconnect";
pub const TRAY_MENU_QUIT: &str = "tray_quit";

pub const TRAY_TOOLTIP: &str = "Tether";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrayAction {
    Open,
    Disconnect,
    Quit,
}

impl TrayAction {
    pub fn menu_id(&self) -> &'static str {
        match self {
            Self::Open => TRAY_MENU_OPEN,
            Self::Disconnect => TRAY_MENU_DISCONNECT,
            Self::Quit => TRAY_MENU_QUIT,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::Disconnect => "Disconnect",
            Self::Quit => "Quit",
        }
    }
}

/// Menu entries in display order.
pub const TRAY_MENU: [TrayAction; 3] = [TrayAction::Open, TrayAction::Disconnect, TrayAction::Quit];

pub fn action_from_menu_id(menu_id: &str) -> Option<TrayAction> {
    match menu_id {
        TRAY_MENU_OPEN => Some(TrayAction::Open),
        TRAY_MENU_DISCONNECT => Some(TrayAction::Disconnect),
        TRAY_MENU_QUIT => Some(TrayAction::Quit),
        _ => None,
    }
}
