//! Configuration module for forms2xml.
//!
//! Handles the TOML settings file, environment variable expansion, and the
//! conversion of settings into the explicit configuration values taken by the
//! worker pool, the rewrite engine and the pipeline.

mod settings;

pub use settings::{
    expand_env_vars, parse_duration, PipelineSettings, RemoteSettings, RewriteSettings, Settings,
    SettingsError, WorkerSettings,
};
