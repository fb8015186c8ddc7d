// src/handler/settings.rs - M98 R, M409, M505, M550, M551, M586, M929
use super::{CommandHandler, Handled};
use crate::command::{Command, Message};
use crate::files::FileDirectory;
use crate::model::LogLevel;
use serde_json::json;

/// Object model namespaces the host answers for itself.
const LOCAL_MODEL_KEYS: [&str; 2] = ["network", "volumes"];

const MAX_MACHINE_NAME: usize = 40;

pub fn is_local_model_key(key: &str) -> bool {
    LOCAL_MODEL_KEYS.iter().any(|prefix| {
        key.strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('.') || rest.starts_with('['))
    })
}

/// M98 with `R`: marks the running macro as (not) pausable. A macro call
/// with `P` is run by the firmware.
pub(super) async fn macro_pausable(handler: &CommandHandler, command: &mut Command) -> Handled {
    if command.has_parameter('P') || !command.has_parameter('R') {
        return Ok(None);
    }
    let pausable = try_message!(command.bool_or('R', false));
    handler.flush(command, false).await?;
    handler
        .firmware_call(command, handler.firmware.set_macro_pausable(command.channel, pausable))
        .await?;
    Ok(Some(Message::ok()))
}

pub(super) async fn query_model(handler: &CommandHandler, command: &mut Command) -> Handled {
    let key = command.string_or('K', "");
    if !is_local_model_key(&key) {
        return Ok(None);
    }
    handler.flush(command, false).await?;
    let flags = command.string_or('F', "");
    let result = handler.model.read().await.query(&key).unwrap_or(serde_json::Value::Null);
    Ok(Some(Message::success(json!({ "key": key, "flags": flags, "result": result }).to_string())))
}

/// M505: points the system directory elsewhere. The directory must exist.
pub(super) async fn system_directory(handler: &CommandHandler, command: &mut Command) -> Handled {
    let Some(directory) = command.parameter('P').map(|p| p.value.clone()) else {
        let current = handler.model.read().await.directories.system.clone();
        return Ok(Some(Message::success(format!("Sys file path is {}", current))));
    };
    handler.flush(command, false).await?;
    let _motion = handler
        .firmware_call(command, handler.firmware.lock_all_motion_and_wait_for_standstill(command.channel))
        .await?;

    let physical = try_message!(handler.physical_path(&directory, FileDirectory::System).await);
    if !tokio::fs::metadata(&physical).await.is_ok_and(|m| m.is_dir()) {
        return Ok(Some(Message::error(format!("Directory {} does not exist", directory))));
    }
    let virtual_path = handler.resolver.to_virtual(&physical).unwrap_or(directory);
    tracing::info!("System directory is now {}", virtual_path);
    handler.model.write().await.directories.system = virtual_path;
    Ok(Some(Message::ok()))
}

fn level_name(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Off => "off",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
    }
}

fn alphanumeric(name: &str) -> String {
    name.chars().filter(char::is_ascii_alphanumeric).collect()
}

/// M550 with `P`: the machine name must spell the host name, ignoring case
/// and anything that is not a letter or digit.
pub(super) async fn machine_name(handler: &CommandHandler, command: &mut Command) -> Handled {
    let Some(name) = command.parameter('P').map(|p| p.value.clone()) else {
        return Ok(None);
    };
    handler.flush(command, false).await?;
    if name.len() > MAX_MACHINE_NAME {
        return Ok(Some(Message::error(format!(
            "Machine name is too long (max {} characters)",
            MAX_MACHINE_NAME
        ))));
    }
    let hostname = handler.config.hostname();
    if !alphanumeric(&name).eq_ignore_ascii_case(&alphanumeric(&hostname)) {
        return Ok(Some(Message::error(format!(
            "Machine name must match the hostname '{}' apart from case and punctuation",
            hostname
        ))));
    }
    let mut model = handler.model.write().await;
    model.network.name = name;
    model.network.hostname = hostname;
    Ok(None)
}

pub(super) async fn password(handler: &CommandHandler, command: &mut Command) -> Handled {
    let password = try_message!(command.required('P')).value.clone();
    handler.flush(command, false).await?;
    handler.model.write().await.network.password = if password.is_empty() { None } else { Some(password) };
    Ok(Some(Message::ok()))
}

/// M586: `C` sets the CORS site here; protocol settings are forwarded.
pub(super) async fn cors(handler: &CommandHandler, command: &mut Command) -> Handled {
    let Some(site) = command.parameter('C').map(|p| p.value.clone()) else {
        return Ok(None);
    };
    handler.flush(command, false).await?;
    handler.model.write().await.network.cors_site = if site.is_empty() { None } else { Some(site) };
    if command.parameters().any(|p| p.letter != 'C') {
        return Ok(None);
    }
    Ok(Some(Message::ok()))
}

/// M929: `S0` stops logging, `S1`..`S3` start it at warn/info/debug into
/// the `P` file.
pub(super) async fn logging(handler: &CommandHandler, command: &mut Command) -> Handled {
    handler.flush(command, false).await?;
    let mut model = handler.model.write().await;
    let Some(level) = command.parameter('S') else {
        let text = match (&model.state.log_file, model.state.log_level) {
            (Some(file), level) if level != LogLevel::Off => {
                format!("Event logging is enabled at level {} to file {}", level_name(level), file)
            }
            _ => "Event logging is disabled".to_string(),
        };
        return Ok(Some(Message::success(text)));
    };
    let level = try_message!(level.as_i64());
    let Some(level) = LogLevel::from_code(level) else {
        return Ok(Some(Message::error(format!("Invalid log level {}", level))));
    };
    if level == LogLevel::Off {
        model.state.log_level = LogLevel::Off;
        model.state.log_file = None;
        return Ok(Some(Message::ok()));
    }
    let file = match command.parameter('P') {
        Some(p) if !p.value.is_empty() => p.value.clone(),
        _ => format!("{}/eventlog.txt", model.directories.system.trim_end_matches('/')),
    };
    tracing::info!("Event logging at level {} to {}", level_name(level), file);
    model.state.log_level = level;
    model.state.log_file = Some(file);
    Ok(Some(Message::ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::handler::tests_support::handler_with_root;

    async fn run(handler: &CommandHandler, line: &str) -> Option<Message> {
        let mut command = Command::parse(line, Channel::Http).unwrap();
        handler.process(&mut command).await.unwrap()
    }

    #[test]
    fn local_keys_are_whole_namespaces() {
        assert!(is_local_model_key("network"));
        assert!(is_local_model_key("network.name"));
        assert!(is_local_model_key("volumes[0]"));
        assert!(!is_local_model_key("networking"));
        assert!(!is_local_model_key("move.axes"));
        assert!(!is_local_model_key(""));
    }

    #[tokio::test]
    async fn query_serves_network_locally() {
        let (handler, _dir) = handler_with_root();
        handler.model().write().await.network.name = "gantry-01".to_string();
        let reply = run(&handler, "M409 K\"network.name\"").await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&reply.text).unwrap();
        assert_eq!(json["result"], "gantry-01");
        assert_eq!(run(&handler, "M409 K\"heat\"").await, None);
    }

    #[tokio::test]
    async fn machine_name_must_match_hostname() {
        let (handler, _dir) = handler_with_root();
        assert!(run(&handler, "M550 P\"Other\"").await.unwrap().is_error());
        assert_eq!(run(&handler, "M550 P\"Gantry 01\"").await, None);
        assert_eq!(handler.model().read().await.network.name, "Gantry 01");
        let long = format!("M550 P\"{}\"", "g".repeat(41));
        assert!(run(&handler, &long).await.unwrap().is_error());
        assert_eq!(run(&handler, "M550").await, None);
    }

    #[tokio::test]
    async fn cors_is_local_unless_other_settings_come_along() {
        let (handler, _dir) = handler_with_root();
        assert!(run(&handler, "M586 C\"*\"").await.unwrap().is_success());
        assert_eq!(handler.model().read().await.network.cors_site.as_deref(), Some("*"));
        assert_eq!(run(&handler, "M586 P0 S1 C\"\"").await, None);
        assert!(handler.model().read().await.network.cors_site.is_none());
        assert_eq!(run(&handler, "M586 P0 S1").await, None);
    }

    #[tokio::test]
    async fn logging_settings_live_in_the_model() {
        let (handler, _dir) = handler_with_root();
        assert_eq!(run(&handler, "M929").await.unwrap().text, "Event logging is disabled");
        assert!(run(&handler, "M929 S3").await.unwrap().is_success());
        let model = handler.model().snapshot().await;
        assert_eq!(model.state.log_level, LogLevel::Debug);
        assert_eq!(model.state.log_file.as_deref(), Some("0:/sys/eventlog.txt"));
        assert!(run(&handler, "M929 S7").await.unwrap().is_error());
        assert!(run(&handler, "M929 S0").await.unwrap().is_success());
        assert!(handler.model().read().await.state.log_file.is_none());
    }

    #[tokio::test]
    async fn system_directory_must_exist() {
        let (handler, dir) = handler_with_root();
        assert_eq!(run(&handler, "M505").await.unwrap().text, "Sys file path is 0:/sys");
        assert!(run(&handler, "M551 P\"pw\"").await.unwrap().is_success());
        std::fs::create_dir_all(dir.path().join("sys2")).unwrap();
        // moving the system directory holds motion, which needs the firmware
        let mut command = Command::parse("M505 P\"0:/sys2\"", Channel::Http).unwrap();
        assert!(handler.process(&mut command).await.is_err());
        assert_eq!(handler.model().read().await.directories.system, "0:/sys");
    }
}
