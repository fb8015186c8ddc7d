// src/lib.rs - Host control process between user interfaces and the firmware
pub mod channel;
pub mod command;
pub mod config;
pub mod diagnostics;
pub mod dispatch;
pub mod files;
pub mod firmware;
pub mod handler;
pub mod job;
pub mod lifecycle;
pub mod model;
pub mod plugins;
pub mod web;
