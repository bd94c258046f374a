//! Control protocol requests and replies.
//!
//! Messages are NUL-terminated UTF-8 JSON. A request is either a bare
//! string naming a command, or an array `[command, token, ...args]` where
//! the token is an opaque value echoed in the reply. Every reply is an
//! array `[command, token, payload]`.

use entropyd_core::registry;
use serde_json::{Value, json};

/// Decode one framed message (without its NUL) and produce the reply
/// value.
pub fn handle_message(raw: &[u8]) -> Value {
    let text = match std::str::from_utf8(raw) {
        Ok(t) => t,
        Err(e) => return bad_request(raw, &format!("invalid utf-8: {e}")),
    };
    let request: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return bad_request(raw, &e.to_string()),
    };

    let (command, token, args): (String, Value, Vec<Value>) = match &request {
        Value::String(cmd) => (cmd.clone(), json!(0), Vec::new()),
        Value::Array(items) => {
            let Some(Value::String(cmd)) = items.first() else {
                return bad_request(raw, "command must be a string");
            };
            let token = items.get(1).cloned().unwrap_or_else(|| json!(0));
            let args = items.get(2..).unwrap_or(&[]).to_vec();
            (cmd.clone(), token, args)
        }
        _ => return bad_request(raw, "request must be a string or an array"),
    };

    dispatch(&command, token, &args, &request)
}

/// Serialize a reply with its NUL terminator.
pub fn encode(reply: &Value) -> Vec<u8> {
    let mut out = serde_json::to_vec(reply).unwrap_or_default();
    out.push(0);
    out
}

fn dispatch(command: &str, token: Value, args: &[Value], request: &Value) -> Value {
    match command {
        "GetIDs" => json!([command, token, registry::ids()]),
        "ReportStats" => {
            let id = args.first().and_then(Value::as_str);
            json!([command, token, collect(id, |m| m.stats())])
        }
        "GetRawData" => {
            let id = args.first().and_then(Value::as_str);
            json!([command, token, collect(id, |m| m.raw_data())])
        }
        "SetLogVerbosity" => match args.first().and_then(Value::as_u64) {
            Some(n) => {
                let level = level_for(n);
                log::set_max_level(level);
                log::info!(target: "entropyd::control", "log verbosity set to {level}");
                json!([command, token, n])
            }
            // With no argument this reports the current verbosity.
            None => json!([command, token, level_number(log::max_level())]),
        },
        _ => json!(["UnknownRequest", token, request]),
    }
}

/// Gather one monitor (or all of them) into an `{id: payload}` object.
fn collect(
    id: Option<&str>,
    view: impl Fn(&entropyd_core::HealthMonitor) -> Value,
) -> Value {
    let mut out = serde_json::Map::new();
    match id {
        Some(id) => {
            if let Some(m) = registry::get(id) {
                out.insert(id.to_string(), view(&m));
            }
        }
        None => {
            for (id, m) in registry::all() {
                out.insert(id, view(&m));
            }
        }
    }
    Value::Object(out)
}

fn bad_request(raw: &[u8], error: &str) -> Value {
    json!([
        "BadRequest",
        0,
        {
            "Error": error,
            "Request": String::from_utf8_lossy(raw),
        }
    ])
}

fn level_for(n: u64) -> log::LevelFilter {
    match n {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

fn level_number(level: log::LevelFilter) -> u64 {
    match level {
        log::LevelFilter::Off | log::LevelFilter::Error => 0,
        log::LevelFilter::Warn => 1,
        log::LevelFilter::Info => 2,
        log::LevelFilter::Debug => 3,
        log::LevelFilter::Trace => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entropyd_core::HealthMonitor;

    #[test]
    fn get_ids_bare_string() {
        let _m = HealthMonitor::new("proto-ids-a", true);
        let reply = handle_message(b"\"GetIDs\"");
        assert_eq!(reply[0], "GetIDs");
        assert_eq!(reply[1], 0);
        let ids = reply[2].as_array().unwrap();
        assert!(ids.iter().any(|v| v == "proto-ids-a"));
    }

    #[test]
    fn token_is_echoed() {
        let reply = handle_message(b"[\"GetIDs\", 42]");
        assert_eq!(reply[0], "GetIDs");
        assert_eq!(reply[1], 42);
    }

    #[test]
    fn report_stats_filters_by_id() {
        let _m = HealthMonitor::new("proto-stats-a", true);
        let _other = HealthMonitor::new("proto-stats-b", true);
        let reply = handle_message(b"[\"ReportStats\", 1, \"proto-stats-a\"]");
        let payload = reply[2].as_object().unwrap();
        assert!(payload.contains_key("proto-stats-a"));
        assert!(!payload.contains_key("proto-stats-b"));
        assert!(payload["proto-stats-a"].get("QA").is_some());
        assert!(payload["proto-stats-a"].get("FIPS").is_some());
    }

    #[test]
    fn raw_data_carries_accumulators() {
        let m = HealthMonitor::new("proto-raw-a", true);
        m.check(&[0xA7; 64]);
        let reply = handle_message(b"[\"GetRawData\", 2, \"proto-raw-a\"]");
        let ent8 = &reply[2]["proto-raw-a"]["Ent8"];
        assert_eq!(ent8["Samples"], 0, "no flush yet: short counters hold the bytes");
        assert_eq!(ent8["Short"]["Samples"], 64);
    }

    #[test]
    fn unknown_command_echoes_request() {
        let reply = handle_message(b"[\"Frobnicate\", 9, 1, 2]");
        assert_eq!(reply[0], "UnknownRequest");
        assert_eq!(reply[1], 9);
        assert_eq!(reply[2][0], "Frobnicate");
    }

    #[test]
    fn malformed_json_is_bad_request() {
        let reply = handle_message(b"{nope");
        assert_eq!(reply[0], "BadRequest");
        assert_eq!(reply[1], 0);
        assert!(reply[2].get("Error").is_some());
        assert_eq!(reply[2]["Request"], "{nope");
    }

    #[test]
    fn non_string_command_is_bad_request() {
        let reply = handle_message(b"[17, 3]");
        assert_eq!(reply[0], "BadRequest");
        let reply = handle_message(b"17");
        assert_eq!(reply[0], "BadRequest");
    }

    #[test]
    fn set_log_verbosity_round_trips() {
        let reply = handle_message(b"[\"SetLogVerbosity\", 5, 2]");
        assert_eq!(reply[0], "SetLogVerbosity");
        assert_eq!(reply[1], 5);
        assert_eq!(reply[2], 2);
        assert_eq!(log::max_level(), log::LevelFilter::Info);

        // Without an argument the command reads back the current level.
        let reply = handle_message(b"[\"SetLogVerbosity\", 6]");
        assert_eq!(reply[2], 2);
    }

    #[test]
    fn encode_appends_nul() {
        let out = encode(&json!(["GetIDs", 0, []]));
        assert_eq!(*out.last().unwrap(), 0);
        assert!(!out[..out.len() - 1].contains(&0));
    }
}
