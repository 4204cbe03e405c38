/*
 * Copyright (C) 2024 The Fleetctl Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */


//! Line-oriented structured logging for fleetctl components.
//!
//! Every record carries the service, component, pid and, inside a traced
//! future, the active trace and span ids. Records render as `key=value` text
//! or as one JSON object per line depending on `FLEETCTL_LOG_FORMAT`.

use crate::fleetctl::config::{Config, ConfigError};
use crate::fleetctl::observability::tracing;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
#[cfg(not(test))]
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(test)]
use std::sync::{Mutex, OnceLock};

const SERVICE_NAME: &str = "fleetctl";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(ConfigError::Invalid {
                variable: Config::LogFormat.env_var(),
                value: other.to_string(),
                reason: "expected 'text' or 'json'".to_string(),
            }),
        }
    }
}

static JSON_OUTPUT: AtomicBool = AtomicBool::new(false);

pub fn set_log_format(format: LogFormat) {
    JSON_OUTPUT.store(format == LogFormat::Json, Ordering::Relaxed);
}

fn log_format() -> LogFormat {
    if JSON_OUTPUT.load(Ordering::Relaxed) {
        LogFormat::Json
    } else {
        LogFormat::Text
    }
}

/// Applies `FLEETCTL_LOG_FORMAT` and installs the tracing subscriber.
pub fn init_from_env() -> Result<(), ConfigError> {
    let format = Config::LogFormat.value().parse::<LogFormat>()?;
    set_log_format(format);
    tracing::init();
    Ok(())
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Ordered fields of one log line. Empty metadata keys are dropped.
struct Record {
    fields: Vec<(String, String)>,
}

impl Record {
    fn new(level: LogLevel, component: &str, message: &str, metadata: &[(&str, &str)]) -> Self {
        let mut fields = vec![
            (
                "ts".to_string(),
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
            ("level".to_string(), level.as_str().to_string()),
            ("service".to_string(), SERVICE_NAME.to_string()),
            ("component".to_string(), component.to_string()),
            ("pid".to_string(), std::process::id().to_string()),
            ("msg".to_string(), message.to_string()),
        ];
        if let Some(ctx) = tracing::current_context() {
            fields.push(("trace_id".to_string(), ctx.trace_id().to_string()));
            fields.push(("span_id".to_string(), ctx.span_id().to_string()));
        }
        fields.extend(
            metadata
                .iter()
                .filter(|(key, _)| !key.is_empty())
                .map(|(key, value)| (key.to_string(), value.to_string())),
        );
        Self { fields }
    }

    fn render(&self, format: LogFormat) -> String {
        match format {
            LogFormat::Text => self
                .fields
                .iter()
                .map(|(key, value)| format!("{}={}", key, text_value(value)))
                .collect::<Vec<_>>()
                .join(" "),
            LogFormat::Json => Value::Object(
                self.fields
                    .iter()
                    .map(|(key, value)| (key.clone(), Value::String(value.clone())))
                    .collect::<Map<String, Value>>(),
            )
            .to_string(),
        }
    }
}

/// Bare values pass through; anything that would break `key=value` parsing
/// is written as a JSON string literal.
fn text_value(value: &str) -> String {
    let plain = !value.is_empty()
        && !value
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || "\"\\=[]{},".contains(c));
    if plain {
        value.to_string()
    } else {
        Value::String(value.to_string()).to_string()
    }
}

fn emit(level: LogLevel, component: &str, message: &str, metadata: &[(&str, &str)]) {
    let line = Record::new(level, component, message, metadata).render(log_format());
    write_line(level, &line);
}

pub fn log_debug(component: &str, message: &str, metadata: &[(&str, &str)]) {
    emit(LogLevel::Debug, component, message, metadata);
}

pub fn log_info(component: &str, message: &str, metadata: &[(&str, &str)]) {
    emit(LogLevel::Info, component, message, metadata);
}

pub fn log_warn(component: &str, message: &str, metadata: &[(&str, &str)]) {
    emit(LogLevel::Warn, component, message, metadata);
}

pub fn log_error(component: &str, message: &str, metadata: &[(&str, &str)]) {
    emit(LogLevel::Error, component, message, metadata);
}

// Warnings and errors go to stderr; a failed write is dropped.
#[cfg(not(test))]
fn write_line(level: LogLevel, line: &str) {
    let _ = match level {
        LogLevel::Warn | LogLevel::Error => writeln!(io::stderr().lock(), "{}", line),
        LogLevel::Debug | LogLevel::Info => writeln!(io::stdout().lock(), "{}", line),
    };
}

#[cfg(test)]
fn write_line(level: LogLevel, line: &str) {
    captured()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push((level, line.to_string()));
}

#[cfg(test)]
fn captured() -> &'static Mutex<Vec<(LogLevel, String)>> {
    static LINES: OnceLock<Mutex<Vec<(LogLevel, String)>>> = OnceLock::new();
    LINES.get_or_init(|| Mutex::new(Vec::new()))
}

/// Returns captured lines that contain `needle`, leaving the buffer intact.
/// Tests across modules share the buffer, so callers filter on a marker that
/// is unique to their case.
#[cfg(test)]
pub(crate) fn captured_logs(needle: &str) -> Vec<(LogLevel, String)> {
    captured()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .iter()
        .filter(|(_, line)| line.contains(needle))
        .cloned()
        .collect()
}
