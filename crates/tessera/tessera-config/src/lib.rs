mod config;

pub use config::{ConfigError, TesseraConfig};
