//! Vibeshine - low-latency game streaming host
//!
//! This crate provides the host side of a Moonlight-compatible game
//! streaming server: pairing, app supervision, display reconfiguration,
//! the capture/encode pipeline, and the authenticated config API.

pub mod apps;
pub mod auth;
pub mod capture;
pub mod config;
pub mod crypto;
pub mod display;
pub mod error;
pub mod logging;
pub mod lossless;
pub mod pairing;
pub mod playnite;
pub mod proc;
pub mod session;
pub mod state;
pub mod utils;
pub mod web;
pub mod webrtc;

pub use error::{AppError, Result};
