//! CLI command implementations.

pub mod simulate;

use anyhow::Result;
use buildit_config::load_master_config;

pub fn validate(path: &str) -> Result<()> {
    match load_master_config(path) {
        Ok(config) => {
            println!(
                "Configuration is valid: {} lock(s), {} builder(s)",
                config.locks.len(),
                config.builders.len()
            );
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}
