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

//! Tracing subscriber installation and the identity tokens attached to log events.

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::common::LoggingSettings;

/// Installs a compact `fmt` subscriber writing to a rolling log file.
///
/// The filter comes from `RUST_LOG` when set, otherwise from
/// `settings.default_directive`. Keep the returned guard alive for as long as
/// logs should be flushed. When a global subscriber already exists the call
/// leaves it in place and still returns a guard for the new writer.
///
/// # Errors
///
/// Fails when the log directory cannot be created.
pub fn init_tracing(settings: &LoggingSettings) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(&settings.directory)
        .with_context(|| format!("could not create log directory {}", settings.directory))?;

    let rotation = match settings.rotation.as_str() {
        "hourly" => Rotation::HOURLY,
        "daily" => Rotation::DAILY,
        _ => Rotation::NEVER,
    };
    let file_appender =
        RollingFileAppender::new(rotation, &settings.directory, &settings.file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.default_directive));

    let subscriber = FmtSubscriber::builder()
        .with_span_events(FmtSpan::NONE)
        .compact()
        .with_line_number(true)
        .with_target(true)
        .with_ansi(false)
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("global tracing subscriber already installed; keeping it");
    }
    Ok(guard)
}

/// Host name of this machine, or `localhost` when it cannot be read.
pub(crate) fn local_hostname() -> String {
    dns_lookup::get_hostname().unwrap_or_else(|_| "localhost".to_string())
}

/// `{hostname}_{pid}`, used as the agent's log token.
pub fn host_pid_token() -> String {
    format!("{}_{}", local_hostname(), std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_pid_token_ends_with_pid() {
        let token = host_pid_token();
        assert!(token.ends_with(&format!("_{}", std::process::id())));
    }

    #[test]
    fn init_tracing_creates_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let settings = LoggingSettings {
            directory: dir.path().join("nested").display().to_string(),
            ..LoggingSettings::default()
        };
        let _guard = init_tracing(&settings).unwrap();
        assert!(dir.path().join("nested").is_dir());
    }
}
