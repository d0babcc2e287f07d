pub mod config;
pub mod controller;
pub mod gateway;
pub mod key;
pub mod manifest;
pub mod model;
pub mod ports;
pub mod retry;

// Presentation helpers
pub mod links;
pub mod tray;
