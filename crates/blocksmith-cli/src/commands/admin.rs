use crate::ConfigCmd;
use crate::output::{print_json, redact_config_for_display};
use anyhow::Result;
use blocksmith_core::AppConfig;
use serde_json::json;
use std::path::Path;

pub(crate) fn run_config(cwd: &Path, cmd: ConfigCmd, json_mode: bool) -> Result<bool> {
    match cmd {
        ConfigCmd::Show => {
            let display_cfg = redact_config_for_display(&AppConfig::load(cwd)?)?;
            if json_mode {
                print_json(&display_cfg)?;
            } else {
                println!("{}", serde_json::to_string_pretty(&display_cfg)?);
            }
        }
        ConfigCmd::Init => {
            AppConfig::ensure(cwd)?;
            let path = AppConfig::project_settings_path(cwd);
            if json_mode {
                print_json(&json!({"settings": path.display().to_string()}))?;
            } else {
                println!("settings: {}", path.display());
            }
        }
    }
    Ok(true)
}
