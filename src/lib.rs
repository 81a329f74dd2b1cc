// Library exports for the warden process supervisor

pub mod config;
pub mod error;
pub mod process;

pub use config::{AppSpec, EcosystemFile};
pub use error::{Result, WardenError};
pub use process::AppSupervisor;
