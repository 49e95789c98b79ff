//! Configuration loading for Carewise.
//!
//! Values resolve in the order environment (`CAREWISE_*`, optionally seeded
//! from a `.env` file) > configuration file > built-in defaults. The server
//! binary layers its command line flags on top. Every resolved config passes
//! through [`validation::apply_guard_rails`] before it is handed out.

pub mod loader;
pub mod models;
pub mod util;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{
    CollaboratorsConfig, Config, ConfigMetadata, CorsConfig, ServerConfig,
    sources::{EnvConfig, FileConfig},
};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
