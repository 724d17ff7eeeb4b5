//! Controllers
//!
//! A controller wires a reflector, an event router, a work queue and a pool
//! of workers around one reconciler.

mod controller;
mod deployment_controller;
pub mod worker;

pub use controller::{Controller, Settings, State};
pub use deployment_controller::{build as build_deployment_controller, run as run_deployment_controller};
