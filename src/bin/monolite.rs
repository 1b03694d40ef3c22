#![forbid(unsafe_code)]

//! A thin command-line front end: opens a database file and runs a
//! single JSON command document against it, printing the BSON reply
//! back as JSON. Intended for scripting and manual poking, not as the
//! wire-protocol server (there is none yet — see `command::CommandRouter`).

use std::path::PathBuf;
use std::process::ExitCode;

use monolite::bson::{Document, Value};
use monolite::config::Config;
use monolite::Database;

fn usage() -> ExitCode {
    eprintln!("usage: monolite <data-file> <database-name> <command-json>");
    eprintln!("example: monolite data.monodb test '{{\"ping\": 1}}'");
    ExitCode::FAILURE
}

fn json_to_bson(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i32::try_from(i).is_ok() {
                    Value::Int32(i as i32)
                } else {
                    Value::Int64(i)
                }
            } else {
                Value::Double(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => Value::Array(items.iter().map(json_to_bson).collect()),
        serde_json::Value::Object(map) => {
            let mut doc = Document::new();
            for (k, v) in map {
                doc.insert(k.clone(), json_to_bson(v));
            }
            Value::Document(doc)
        }
    }
}

fn bson_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null | Value::MinKey | Value::MaxKey => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Int32(i) => serde_json::Value::from(*i),
        Value::Int64(i) => serde_json::Value::from(*i),
        Value::Double(d) => serde_json::json!(d),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::DateTime(ms) => serde_json::Value::from(*ms),
        Value::ObjectId(oid) => serde_json::Value::String(oid.to_hex()),
        Value::Binary(_, bytes) => serde_json::Value::Array(bytes.iter().map(|b| serde_json::Value::from(*b)).collect()),
        Value::Regex { pattern, options } => serde_json::json!({ "$regex": pattern, "$options": options }),
        Value::Timestamp { seconds, ordinal } => serde_json::json!({ "seconds": seconds, "ordinal": ordinal }),
        Value::Decimal128(d) => serde_json::json!(d.to_f64()),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(bson_to_json).collect()),
        Value::Document(doc) => {
            let mut map = serde_json::Map::new();
            for (k, v) in doc.iter() {
                map.insert(k.to_string(), bson_to_json(v));
            }
            serde_json::Value::Object(map)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let [data_file, db_name, command_json] = &args[..] else { return usage() };

    let config = Config { data_path: PathBuf::from(data_file), ..Config::default() };
    let db = match Database::open_with_config(&config) {
        Ok(db) => db,
        Err(err) => {
            eprintln!("failed to open {data_file}: {err}");
            return ExitCode::FAILURE;
        }
    };

    let parsed: serde_json::Value = match serde_json::from_str(command_json) {
        Ok(v) => v,
        Err(err) => {
            eprintln!("invalid command JSON: {err}");
            return ExitCode::FAILURE;
        }
    };
    let Value::Document(command) = json_to_bson(&parsed) else {
        eprintln!("command must be a JSON object");
        return ExitCode::FAILURE;
    };

    let reply = db.run_command(db_name, &command).await;
    println!("{}", bson_to_json(&Value::Document(reply)));
    let _ = db.flush();
    ExitCode::SUCCESS
}
