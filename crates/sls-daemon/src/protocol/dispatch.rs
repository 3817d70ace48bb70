//! Command handlers.
//!
//! Every handler validates its arguments and returns a [`Reply`]; nothing
//! here fails the connection. Configuration writes are persisted before the
//! reply is sent, and a failed save is reported as `UnknownError`.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};
use sls_core::config::ConfigStore;
use sls_core::helpers::MethodError;
use sls_core::ipc::{Command, Reply, ReplyStatus, helper_object_path};
use sls_core::util::camel_case;
use sls_core::{Helper, HelperResult};
use tracing::{debug, error, info, warn};

use crate::state::{CycleOutcome, SharedState};

/// Keys accepted by `set-steam-info`.
pub const STEAM_KEYS: [&str; 3] = ["account_name", "account_id", "deck_serial"];

/// Handles one command.
pub async fn dispatch(state: &SharedState, command: Command) -> Reply {
    debug!(command = %command.command, "dispatching");
    match command.command.as_str() {
        "shutdown" => handle_shutdown(state),
        "list" => Reply::ok_with(json!(state.registry().names())),
        "log-level" => handle_log_level(state, &command),
        "status" => Reply::ok_with(json!({ "enabled": state.is_enabled() })),
        "helper-status" => handle_helper_status(state, &command),
        "enable" => handle_enable(state, &command),
        "enable-helpers" => handle_enable_helpers(state, &command),
        "inhibit" => handle_inhibit(state, &command),
        "set-steam-info" => handle_set_steam_info(state, &command),
        "trigger" => handle_trigger(state, &command).await,
        "call" => handle_call(state, &command).await,
        "list-objects" => Reply::ok_with(json!(object_paths(state))),
        other => {
            info!(command = other, "unknown command");
            Reply::error(ReplyStatus::InvalidCommand)
        },
    }
}

fn invalid(message: &str) -> Reply {
    Reply::error_with(ReplyStatus::InvalidArguments, json!({ "message": message }))
}

fn bool_arg(command: &Command, name: &str) -> Result<bool, Reply> {
    command
        .arg(name)
        .and_then(Value::as_bool)
        .ok_or_else(|| invalid(&format!("{name} must be a boolean")))
}

/// Applies `update` to the configuration and saves it.
fn update_config(state: &SharedState, update: impl FnOnce(&mut ConfigStore)) -> Reply {
    let saved = state.with_config(|config| {
        update(config);
        config.save()
    });
    match saved {
        Ok(()) => Reply::ok(),
        Err(e) => {
            error!("failed to save configuration: {e}");
            Reply::error(ReplyStatus::UnknownError)
        },
    }
}

/// Flushes state; the connection handler stops the server after replying.
fn handle_shutdown(state: &SharedState) -> Reply {
    state.flush();
    Reply::ok()
}

fn handle_log_level(state: &SharedState, command: &Command) -> Reply {
    let Some(level) = command.arg("level") else {
        return Reply::ok_with(Value::String(state.log_level()));
    };
    let Some(level) = level.as_str() else {
        return invalid("level must be a string");
    };
    match state.set_log_level(level) {
        Ok(()) => {
            let level = level.to_ascii_uppercase();
            update_config(state, |config| config.set("logging", "level", level))
        },
        Err(e) => invalid(&e.to_string()),
    }
}

fn helper_switches(config: &ConfigStore, name: &str) -> Value {
    let section = format!("helpers.{name}");
    json!({
        "enabled": config.get_bool(&section, "enable", true),
        "collection": config.get_bool(&section, "collect", true),
        "submission": config.get_bool(&section, "submit", true),
    })
}

fn handle_helper_status(state: &SharedState, command: &Command) -> Reply {
    let names: Vec<String> = match command.arg("helpers") {
        None | Some(Value::Null) => state
            .registry()
            .names()
            .into_iter()
            .map(String::from)
            .collect(),
        Some(Value::Array(items)) => {
            let mut names = Vec::new();
            let mut unknown = Vec::new();
            for item in items {
                match item.as_str() {
                    Some(name) if state.registry().contains(name) => names.push(name.to_string()),
                    _ => unknown.push(item.clone()),
                }
            }
            if !unknown.is_empty() {
                return Reply::error_with(
                    ReplyStatus::InvalidArguments,
                    json!({ "invalid-helper": unknown }),
                );
            }
            names
        },
        Some(_) => return invalid("helpers must be a list"),
    };
    let status: BTreeMap<String, Value> = state.with_config(|config| {
        names
            .into_iter()
            .map(|name| {
                let switches = helper_switches(config, &name);
                (name, switches)
            })
            .collect()
    });
    Reply::ok_with(json!(status))
}

fn handle_enable(state: &SharedState, command: &Command) -> Reply {
    let enable = match bool_arg(command, "state") {
        Ok(enable) => enable,
        Err(reply) => return reply,
    };
    info!(enable, "setting submission state");
    update_config(state, |config| config.set_bool("sls", "enable", enable))
}

fn handle_enable_helpers(state: &SharedState, command: &Command) -> Reply {
    let Some(Value::Object(requested)) = command.arg("helpers") else {
        return invalid("helpers must be an object");
    };
    let mut invalid_helper = Vec::new();
    let mut invalid_state = Vec::new();
    let mut changes = Vec::new();
    for (name, value) in requested {
        if !state.registry().contains(name) {
            invalid_helper.push(name.clone());
            continue;
        }
        match value.as_bool() {
            Some(enable) => changes.push((name.clone(), enable)),
            None => invalid_state.push(name.clone()),
        }
    }
    if !invalid_helper.is_empty() || !invalid_state.is_empty() {
        return Reply::error_with(
            ReplyStatus::InvalidArguments,
            json!({ "invalid-helper": invalid_helper, "invalid-state": invalid_state }),
        );
    }
    update_config(state, |config| {
        for (name, enable) in changes {
            info!(helper = %name, enable, "setting helper state");
            config.set_bool(&format!("helpers.{name}"), "enable", enable);
        }
    })
}

fn handle_inhibit(state: &SharedState, command: &Command) -> Reply {
    let inhibit = match bool_arg(command, "state") {
        Ok(inhibit) => inhibit,
        Err(reply) => return reply,
    };
    info!(inhibit, "setting inhibit state");
    state.set_inhibited(inhibit);
    Reply::ok()
}

fn handle_set_steam_info(state: &SharedState, command: &Command) -> Reply {
    let Some(key) = command.arg("key").and_then(Value::as_str) else {
        return invalid("key must be a string");
    };
    if !STEAM_KEYS.contains(&key) {
        return Reply::error_with(ReplyStatus::InvalidArguments, json!({ "invalid-key": key }));
    }
    let value = match (key, command.arg("value")) {
        ("account_id", Some(Value::Number(n))) if n.is_u64() || n.is_i64() => n.to_string(),
        ("account_id", _) => return invalid("account_id must be an integer"),
        (_, Some(Value::String(s))) => s.clone(),
        (_, Some(Value::Number(n))) => n.to_string(),
        _ => return invalid("value must be a string"),
    };
    debug!(key, "updating Steam account info");
    update_config(state, |config| config.set("steam", key, value))
}

async fn handle_trigger(state: &SharedState, command: &Command) -> Reply {
    let wait = match command.arg("wait") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(wait)) => *wait,
        Some(_) => return invalid("wait must be a boolean"),
    };
    if wait {
        if let CycleOutcome::Ran(summary) = state.run_cycle().await {
            state.reanchor();
            debug!(?summary, "triggered cycle finished");
        }
    } else {
        state.spawn_cycle();
    }
    Reply::ok()
}

fn object_paths(state: &SharedState) -> Vec<String> {
    state
        .registry()
        .iter()
        .filter(|helper| !helper.methods().is_empty())
        .map(|helper| helper_object_path(&camel_case(helper.name())))
        .collect()
}

fn find_object(state: &SharedState, path: &str) -> Option<std::sync::Arc<dyn Helper>> {
    state
        .registry()
        .iter()
        .find(|helper| {
            !helper.methods().is_empty() && helper_object_path(&camel_case(helper.name())) == path
        })
        .cloned()
}

async fn handle_call(state: &SharedState, command: &Command) -> Reply {
    let Some(object) = command.arg("object").and_then(Value::as_str) else {
        return invalid("object must be a string");
    };
    let Some(method) = command.arg("method").and_then(Value::as_str) else {
        return invalid("method must be a string");
    };
    let args = match command.arg("args") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(args)) => args.clone(),
        Some(_) => return invalid("args must be a list"),
    };
    let Some(helper) = find_object(state, object) else {
        return Reply::error_with(ReplyStatus::InvalidArguments, json!({ "invalid-object": object }));
    };
    if !helper.methods().contains(&method) {
        return Reply::error_with(ReplyStatus::InvalidCommand, json!({ "invalid-method": method }));
    }

    let ctx = state.services().context(helper.name());
    match helper.call(&ctx, method, &args).await {
        Ok(Value::Null) => Reply::ok(),
        Ok(value) => Reply::ok_with(value),
        Err(e) => {
            warn!(helper = helper.name(), method, "method failed: {e}");
            method_error_reply(&e)
        },
    }
}

/// Maps a helper method failure onto a typed reply.
#[must_use]
pub fn method_error_reply(error: &MethodError) -> Reply {
    let mut data = Map::new();
    data.insert(String::from("message"), Value::String(error.to_string()));
    let status = match error {
        MethodError::UnknownMethod(_) => ReplyStatus::InvalidCommand,
        MethodError::InvalidArguments(_) => ReplyStatus::InvalidArguments,
        MethodError::FileNotFound(path) => {
            data.insert(
                String::from("path"),
                Value::String(path.display().to_string()),
            );
            ReplyStatus::FileNotFound
        },
        MethodError::Submission(HelperResult::TransientError | HelperResult::ClassError) => {
            ReplyStatus::TransientError
        },
        MethodError::Submission(HelperResult::PermanentError) => ReplyStatus::PermanentError,
        MethodError::Submission(HelperResult::Ok) | MethodError::Failed(_) => ReplyStatus::Failed,
    };
    Reply::error_with(status, Value::Object(data))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::state::testing::Fixture;

    fn command(name: &str, args: Value) -> Command {
        Command::with_args(name, args)
    }

    #[tokio::test]
    async fn list_and_status() {
        let fixture = Fixture::new();
        let reply = dispatch(&fixture.state, Command::new("list")).await;
        let names = reply.data.unwrap();
        assert!(names.as_array().unwrap().contains(&json!("minidump")));

        let reply = dispatch(&fixture.state, Command::new("status")).await;
        assert_eq!(reply.data, Some(json!({ "enabled": false })));

        let reply = dispatch(&fixture.state, command("enable", json!({ "state": true }))).await;
        assert_eq!(reply.status, ReplyStatus::Ok);
        let reply = dispatch(&fixture.state, Command::new("status")).await;
        assert_eq!(reply.data, Some(json!({ "enabled": true })));
        let saved = std::fs::read_to_string(fixture.dir.path().join("local.toml")).unwrap();
        assert!(saved.contains("enable = \"on\""));
    }

    #[tokio::test]
    async fn unknown_command() {
        let fixture = Fixture::new();
        let reply = dispatch(&fixture.state, Command::new("frobnicate")).await;
        assert_eq!(reply.status, ReplyStatus::InvalidCommand);
    }

    #[tokio::test]
    async fn enable_requires_bool() {
        let fixture = Fixture::new();
        let reply = dispatch(&fixture.state, command("enable", json!({ "state": "yes" }))).await;
        assert_eq!(reply.status, ReplyStatus::InvalidArguments);
        let reply = dispatch(&fixture.state, Command::new("enable")).await;
        assert_eq!(reply.status, ReplyStatus::InvalidArguments);
    }

    #[tokio::test]
    async fn helper_status_reports_invalid_names() {
        let fixture = Fixture::new();
        let reply = dispatch(
            &fixture.state,
            command("helper-status", json!({ "helpers": ["gpu", "bogus"] })),
        )
        .await;
        assert_eq!(reply.status, ReplyStatus::InvalidArguments);
        assert_eq!(reply.data, Some(json!({ "invalid-helper": ["bogus"] })));

        fixture
            .state
            .with_config(|c| c.set_bool("helpers.gpu", "submit", false));
        let reply = dispatch(
            &fixture.state,
            command("helper-status", json!({ "helpers": ["gpu"] })),
        )
        .await;
        assert_eq!(
            reply.data,
            Some(json!({ "gpu": { "enabled": true, "collection": true, "submission": false } }))
        );
    }

    #[tokio::test]
    async fn enable_helpers_validates_everything() {
        let fixture = Fixture::new();
        let reply = dispatch(
            &fixture.state,
            command(
                "enable-helpers",
                json!({ "helpers": { "gpu": false, "bogus": true, "kdump": "off" } }),
            ),
        )
        .await;
        assert_eq!(reply.status, ReplyStatus::InvalidArguments);
        assert_eq!(
            reply.data,
            Some(json!({ "invalid-helper": ["bogus"], "invalid-state": ["kdump"] }))
        );
        assert!(fixture.state.with_config(|c| c.get_bool("helpers.gpu", "enable", true)));

        let reply = dispatch(
            &fixture.state,
            command("enable-helpers", json!({ "helpers": { "gpu": false } })),
        )
        .await;
        assert_eq!(reply.status, ReplyStatus::Ok);
        assert!(!fixture.state.with_config(|c| c.get_bool("helpers.gpu", "enable", true)));
    }

    #[tokio::test]
    async fn steam_info() {
        let fixture = Fixture::new();
        let set = |key: &str, value: Value| command("set-steam-info", json!({ "key": key, "value": value }));

        let reply = dispatch(&fixture.state, set("account_id", json!(1234))).await;
        assert_eq!(reply.status, ReplyStatus::Ok);
        let reply = dispatch(&fixture.state, set("account_id", json!("1234"))).await;
        assert_eq!(reply.status, ReplyStatus::InvalidArguments);
        let reply = dispatch(&fixture.state, set("account_name", json!("gaben"))).await;
        assert_eq!(reply.status, ReplyStatus::Ok);
        let reply = dispatch(&fixture.state, set("password", json!("hunter2"))).await;
        assert_eq!(reply.status, ReplyStatus::InvalidArguments);

        fixture.state.with_config(|c| {
            assert_eq!(c.get("steam", "account_id").as_deref(), Some("1234"));
            assert_eq!(c.get("steam", "account_name").as_deref(), Some("gaben"));
        });
    }

    #[tokio::test]
    async fn log_level_round_trip() {
        let fixture = Fixture::new();
        let reply = dispatch(&fixture.state, Command::new("log-level")).await;
        assert_eq!(reply.data, Some(json!("INFO")));

        let reply = dispatch(&fixture.state, command("log-level", json!({ "level": "LOUD" }))).await;
        assert_eq!(reply.status, ReplyStatus::InvalidArguments);

        let reply = dispatch(&fixture.state, command("log-level", json!({ "level": "debug" }))).await;
        assert_eq!(reply.status, ReplyStatus::Ok);
        let reply = dispatch(&fixture.state, Command::new("log-level")).await;
        assert_eq!(reply.data, Some(json!("DEBUG")));
    }

    #[tokio::test]
    async fn inhibited_trigger_does_not_run() {
        let fixture = Fixture::new();
        fixture.state.with_config(|c| c.set_bool("sls", "enable", true));
        let reply = dispatch(&fixture.state, command("inhibit", json!({ "state": true }))).await;
        assert_eq!(reply.status, ReplyStatus::Ok);

        let reply = dispatch(&fixture.state, command("trigger", json!({ "wait": true }))).await;
        assert_eq!(reply.status, ReplyStatus::Ok);
        assert!(fixture.state.daemon_data().get_f64("last_trigger").is_none());

        dispatch(&fixture.state, command("inhibit", json!({ "state": false }))).await;
        dispatch(&fixture.state, command("trigger", json!({ "wait": true }))).await;
        assert!(fixture.state.daemon_data().get_f64("last_trigger").is_some());
    }

    #[tokio::test]
    async fn inhibit_does_not_survive_a_restart() {
        let fixture = Fixture::new();
        dispatch(&fixture.state, command("inhibit", json!({ "state": true }))).await;
        let reply = dispatch(&fixture.state, command("enable", json!({ "state": true }))).await;
        assert_eq!(reply.status, ReplyStatus::Ok);
        assert!(fixture.state.is_inhibited());

        let reloaded =
            ConfigStore::from_paths(None, None, Some(&fixture.dir.path().join("local.toml")));
        assert!(reloaded.get_bool("sls", "enable", false));
        assert!(!reloaded.get_bool("sls", "inhibit", false));
        assert_eq!(reloaded.get("sls", "inhibit"), None);
    }

    #[tokio::test]
    async fn objects_are_listed_and_callable() {
        let fixture = Fixture::new();
        let reply = dispatch(&fixture.state, Command::new("list-objects")).await;
        let paths = reply.data.unwrap();
        let paths = paths.as_array().unwrap();
        assert!(paths.contains(&json!(
            "/com/valvesoftware/SteamOSLogSubmitter/helpers/Sysreport"
        )));
        assert!(!paths.contains(&json!(
            "/com/valvesoftware/SteamOSLogSubmitter/helpers/Kdump"
        )));

        let reply = dispatch(
            &fixture.state,
            command(
                "call",
                json!({
                    "object": "/com/valvesoftware/SteamOSLogSubmitter/helpers/Sysreport",
                    "method": "SendReport",
                    "args": ["/nonexistent/report.zip"],
                }),
            ),
        )
        .await;
        assert_eq!(reply.status, ReplyStatus::FileNotFound);

        let reply = dispatch(
            &fixture.state,
            command(
                "call",
                json!({
                    "object": "/com/valvesoftware/SteamOSLogSubmitter/helpers/Sysreport",
                    "method": "Explode",
                }),
            ),
        )
        .await;
        assert_eq!(reply.status, ReplyStatus::InvalidCommand);

        let reply = dispatch(
            &fixture.state,
            command("call", json!({ "object": "/nowhere", "method": "SendReport" })),
        )
        .await;
        assert_eq!(reply.status, ReplyStatus::InvalidArguments);
    }

    #[test]
    fn method_errors_map_to_statuses() {
        let cases = [
            (
                MethodError::FileNotFound(PathBuf::from("/x")),
                ReplyStatus::FileNotFound,
            ),
            (
                MethodError::Submission(HelperResult::TransientError),
                ReplyStatus::TransientError,
            ),
            (
                MethodError::Submission(HelperResult::PermanentError),
                ReplyStatus::PermanentError,
            ),
            (
                MethodError::Failed(String::from("boom")),
                ReplyStatus::Failed,
            ),
            (
                MethodError::InvalidArguments(String::from("no")),
                ReplyStatus::InvalidArguments,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(method_error_reply(&error).status, status);
        }
    }
}
