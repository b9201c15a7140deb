/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

use std::time::Duration;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::message::RedeliveryPolicy;

/// Runtime settings for brokerlink.
///
/// These tune the machinery around the agent document (poll intervals, guard
/// defaults, log files) and are loaded from TOML files in XDG-compliant
/// directories. Every section falls back to its defaults when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerlinkSettings {
    /// Timeout configuration
    pub timeouts: TimeoutSettings,
    /// Processing agent tuning
    pub agent: AgentSettings,
    /// Proxy defaults
    pub proxy: ProxySettings,
    /// Log file configuration
    pub logging: LoggingSettings,
    /// Redelivery policy applied when the agent document does not set one
    pub redelivery: RedeliveryPolicy,
}

/// Timeout-related configuration values
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Interval between warnings while shutdown waits on a busy processor worker
    pub processor_stop_warn_ms: u64,
}

/// Processing agent tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Sleep between worker iterations, in microseconds
    pub process_sleep_us: u64,
    /// Tick of the agent main loop, in milliseconds
    pub main_loop_tick_ms: u64,
    /// Guard period used when the agent document omits `guard_period`
    pub guard_period_secs: u64,
    /// Restart count above which the guard warns about a proxy
    pub restart_warn_threshold: u32,
}

/// Proxy defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Leading part of generated subscription ids
    pub subscription_prefix: String,
    /// Prefetch limit used by passive mode when none is given
    pub default_prefetch: u32,
    /// Whether listener proxies wrap each message in a transaction
    pub use_transaction: bool,
}

/// Log file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Directory for log files
    pub directory: String,
    /// Log file name (prefix when rotating)
    pub file_name: String,
    /// `never`, `hourly` or `daily`
    pub rotation: String,
    /// Filter directive used when `RUST_LOG` is unset
    pub default_directive: String,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            processor_stop_warn_ms: 10_000,
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            process_sleep_us: 100,
            main_loop_tick_ms: 10,
            guard_period_secs: 300,
            restart_warn_threshold: 10,
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            subscription_prefix: "brokerlink".to_string(),
            default_prefetch: 100,
            use_transaction: true,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            directory: "logs".to_string(),
            file_name: "brokerlink.log".to_string(),
            rotation: "never".to_string(),
            default_directive: "info".to_string(),
        }
    }
}

impl BrokerlinkSettings {
    /// Sleep between worker iterations.
    pub const fn process_sleep(&self) -> Duration {
        Duration::from_micros(self.agent.process_sleep_us)
    }

    /// Tick of the agent main loop.
    pub const fn main_loop_tick(&self) -> Duration {
        Duration::from_millis(self.agent.main_loop_tick_ms)
    }

    /// Default guard period.
    pub const fn guard_period(&self) -> Duration {
        Duration::from_secs(self.agent.guard_period_secs)
    }

    /// How often shutdown warns about a worker still finishing its iteration.
    pub const fn processor_stop_warning(&self) -> Duration {
        Duration::from_millis(self.timeouts.processor_stop_warn_ms)
    }

    /// Parse settings from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns the TOML error when the text is malformed.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Load settings from XDG-compliant locations
    ///
    /// Looks for `brokerlink/config.toml` under the XDG config directories
    /// (`$XDG_CONFIG_HOME`, then `~/.config` and the system dirs).
    ///
    /// If no file is found, returns the defaults.
    /// If a file exists but is malformed, logs an error and uses defaults.
    pub fn load() -> Self {
        use tracing::{error, info};

        let xdg_dirs = match xdg::BaseDirectories::with_prefix("brokerlink") {
            Ok(dirs) => dirs,
            Err(e) => {
                error!("Failed to initialize XDG directories: {}", e);
                return Self::default();
            }
        };

        let Some(path) = xdg_dirs.find_config_file("config.toml") else {
            info!("No brokerlink settings file found, using defaults");
            return Self::default();
        };

        info!("Loading brokerlink settings from: {}", path.display());
        match std::fs::read_to_string(&path) {
            Ok(text) => match Self::from_toml(&text) {
                Ok(settings) => settings,
                Err(e) => {
                    error!("Failed to parse settings file {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                error!("Failed to read settings file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }
}

lazy_static! {
    /// Process-wide settings loaded from XDG-compliant locations
    pub static ref SETTINGS: BrokerlinkSettings = BrokerlinkSettings::load();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = BrokerlinkSettings::default();
        assert_eq!(settings.agent.guard_period_secs, 300);
        assert_eq!(settings.agent.restart_warn_threshold, 10);
        assert_eq!(settings.proxy.default_prefetch, 100);
        assert_eq!(settings.process_sleep(), Duration::from_micros(100));
        assert!(settings.redelivery.max_deliveries.is_none());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let settings = BrokerlinkSettings::from_toml(
            r#"
            [agent]
            guard_period_secs = 5

            [redelivery]
            max_deliveries = 3
            "#,
        )
        .unwrap();
        assert_eq!(settings.guard_period(), Duration::from_secs(5));
        assert_eq!(settings.agent.restart_warn_threshold, 10);
        assert_eq!(settings.redelivery.max_deliveries, Some(3));
        assert_eq!(settings.logging.file_name, "brokerlink.log");
    }
}
