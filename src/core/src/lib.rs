//! A bastion that bridges operator terminals to backend assets while recording every command
//! and the raw terminal replay.

pub mod authorization;
pub mod configuration;
pub mod controller;
pub mod data_capture;
pub mod error_handling;
pub mod network;
pub mod session_management;
pub mod web_interface;

pub use controller::Controller;
pub use session_management::{Session, SessionManager, SessionState};
