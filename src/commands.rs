//! In-band command interpreter.
//!
//! Commands are ordinary chat messages prefixed with `!`, intercepted
//! before anything reaches the upstream. The interpreter is
//! session-stateful: `!set` / `!get` operate on a per-`session_id`
//! parameter map (bounded, oldest session evicted), while `!help`,
//! `!status`, and `!dlglog` are stateless provider-level commands.

use std::num::NonZeroUsize;

use lru::LruCache;
use serde_json::{json, Value};

use crate::config::RetryConfig;
use crate::observe::DialogLogger;

pub const COMMAND_PREFIX: char = '!';
const MAX_SESSIONS: usize = 1000;

/// True when a trimmed message triggers the interpreter: prefix `!`,
/// more than the bare prefix, and no space right after it.
pub fn is_command(content: &str) -> bool {
    let trimmed = content.trim();
    let mut chars = trimmed.chars();
    chars.next() == Some(COMMAND_PREFIX) && matches!(chars.next(), Some(c) if c != ' ')
}

/// Split a command message into `(command, args)`. The command is
/// lower-cased; args keep their case.
pub fn extract_command(content: &str) -> (String, Vec<String>) {
    let body = content.trim().trim_start_matches(COMMAND_PREFIX);
    let mut parts = body.split_whitespace();
    let command = parts.next().unwrap_or_default().to_lowercase();
    (command, parts.map(String::from).collect())
}

/// Per-session overridable request parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionParams {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

/// Insertion-ordered, bounded map of session parameters. Access moves a
/// session to the back; the oldest session is evicted at capacity.
pub struct SessionStore {
    cache: LruCache<String, SessionParams>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_capacity(MAX_SESSIONS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(capacity.max(1)).expect("capacity >= 1")),
        }
    }

    pub fn params_mut(&mut self, session_id: &str) -> &mut SessionParams {
        if !self.cache.contains(session_id) {
            self.cache.push(session_id.to_string(), SessionParams::default());
        }
        self.cache.get_mut(session_id).expect("session just inserted")
    }

    pub fn count(&self) -> usize {
        self.cache.len()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.cache.contains(session_id)
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Provider-side facts a command may read or mutate.
pub struct CommandEnv<'a> {
    pub provider_name: &'a str,
    pub connected: bool,
    pub default_model: String,
    pub available_models: Vec<String>,
    pub dialog: &'a DialogLogger,
    pub retry: &'a RetryConfig,
    pub rate_limit_hits: usize,
}

/// Execute one command. Always returns a result map, never an error —
/// problems are reported inside the map.
pub fn execute_command(
    command: &str,
    args: &[String],
    env: &CommandEnv<'_>,
    params: &mut SessionParams,
) -> Value {
    match command {
        "help" => json!({
            "commands": [
                "!status               — provider status",
                "!dlglog on|off        — toggle dialog logging",
                "!set key=value        — set a parameter (model, temperature, max_tokens)",
                "!get key              — read a parameter",
                "!help                 — this list",
            ],
            "examples": [
                "!set model=gpt-4o-mini",
                "!set temperature=0.7",
                "!set max_tokens=512",
                "!get temperature",
                "!dlglog off",
            ],
            "note": "commands never reach the upstream model",
        }),

        "status" => json!({
            "provider": env.provider_name,
            "connected": env.connected,
            "model": params.model.clone().unwrap_or_else(|| env.default_model.clone()),
            "default_model": env.default_model,
            "available_models": env.available_models,
            "dialog_logging": env.dialog.enabled(),
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
            "retry_config": serde_json::to_value(env.retry).unwrap_or_default(),
            "rate_limit_hits": env.rate_limit_hits,
        }),

        "dlglog" => match args.first().map(|a| a.to_lowercase()).as_deref() {
            None => json!({
                "error": "syntax: !dlglog on|off",
                "current": env.dialog.enabled(),
            }),
            Some("on") => {
                env.dialog.set_enabled(true);
                json!({ "ok": true, "dialog_logging": true })
            }
            Some("off") => {
                env.dialog.set_enabled(false);
                json!({ "ok": true, "dialog_logging": false })
            }
            Some(other) => json!({
                "error": format!("unknown value '{other}'. Expected: on|off"),
            }),
        },

        "set" => execute_set(args, env, params),

        "get" => match args.first().map(|a| a.to_lowercase()).as_deref() {
            None => json!({
                "model": params.model.clone().unwrap_or_else(|| env.default_model.clone()),
                "temperature": params.temperature,
                "max_tokens": params.max_tokens,
            }),
            Some("model") => json!({
                "model": params.model.clone().unwrap_or_else(|| env.default_model.clone()),
            }),
            Some("temperature") => json!({ "temperature": params.temperature }),
            Some("max_tokens") => json!({ "max_tokens": params.max_tokens }),
            Some("dialog_logging") => json!({ "dialog_logging": env.dialog.enabled() }),
            Some(other) => json!({
                "error": format!("unknown parameter '{other}'"),
                "gettable": ["model", "temperature", "max_tokens", "dialog_logging"],
            }),
        },

        other => json!({
            "error": format!("unknown command '!{other}'"),
            "hint": "!help for a list",
        }),
    }
}

fn execute_set(args: &[String], env: &CommandEnv<'_>, params: &mut SessionParams) -> Value {
    let Some(arg) = args.first() else {
        return json!({
            "error": "syntax: !set key=value",
            "settable": ["model", "temperature", "max_tokens"],
        });
    };
    let Some((key, value)) = arg.split_once('=') else {
        return json!({ "error": format!("syntax: !set key=value (no '=' in '{arg}')") });
    };
    let key = key.trim().to_lowercase();
    let value = value.trim();

    match key.as_str() {
        "temperature" => match value.parse::<f64>() {
            Ok(v) if (0.0..=2.0).contains(&v) => {
                params.temperature = Some(v);
                json!({ "ok": true, "temperature": v })
            }
            Ok(_) => json!({ "error": "temperature must be between 0.0 and 2.0" }),
            Err(_) => json!({ "error": format!("invalid value: {value}") }),
        },
        "max_tokens" => match value.parse::<u64>() {
            Ok(v) if v >= 1 => {
                params.max_tokens = Some(v);
                json!({ "ok": true, "max_tokens": v })
            }
            Ok(_) => json!({ "error": "max_tokens must be >= 1" }),
            Err(_) => json!({ "error": format!("invalid value: {value}") }),
        },
        "model" => {
            if env.available_models.iter().any(|m| m == value) {
                params.model = Some(value.to_string());
                json!({ "ok": true, "model": value })
            } else {
                json!({
                    "error": format!("unknown model '{value}'"),
                    "available": env.available_models,
                })
            }
        }
        other => json!({
            "error": format!("unknown parameter '{other}'"),
            "settable": ["model", "temperature", "max_tokens"],
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use tempfile::TempDir;

    #[rstest]
    #[case("!status", true)]
    #[case("!x", true)]
    #[case("  !help  ", true)]
    #[case("!set model=gpt-4o", true)]
    #[case("!", false)]
    #[case("! x", false)]
    #[case("/x", false)]
    #[case("//x", false)]
    #[case("", false)]
    #[case("   ", false)]
    #[case("hello !world", false)]
    fn command_detection(#[case] input: &str, #[case] expected: bool) {
        assert_eq!(is_command(input), expected);
    }

    #[test]
    fn extraction_lowercases_command_and_keeps_args() {
        let (cmd, args) = extract_command("!SET Temperature=0.7");
        assert_eq!(cmd, "set");
        assert_eq!(args, vec!["Temperature=0.7"]);

        let (cmd, args) = extract_command("  !dlglog off  ");
        assert_eq!(cmd, "dlglog");
        assert_eq!(args, vec!["off"]);
    }

    struct TestEnv {
        dialog: DialogLogger,
        retry: RetryConfig,
        _dir: TempDir,
    }

    impl TestEnv {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            Self {
                dialog: DialogLogger::new("openai", dir.path(), true),
                retry: RetryConfig::default(),
                _dir: dir,
            }
        }

        fn env(&self) -> CommandEnv<'_> {
            CommandEnv {
                provider_name: "openai",
                connected: true,
                default_model: "gpt-4o".into(),
                available_models: vec!["gpt-4o".into(), "gpt-4o-mini".into()],
                dialog: &self.dialog,
                retry: &self.retry,
                rate_limit_hits: 2,
            }
        }
    }

    #[test]
    fn status_reports_provider_snapshot() {
        let test = TestEnv::new();
        let mut params = SessionParams::default();
        let result = execute_command("status", &[], &test.env(), &mut params);
        assert_eq!(result["provider"], "openai");
        assert_eq!(result["connected"], true);
        assert_eq!(result["model"], "gpt-4o");
        assert_eq!(result["dialog_logging"], true);
        assert_eq!(result["rate_limit_hits"], 2);
        assert_eq!(result["retry_config"]["max_retries"], 3);
    }

    #[test]
    fn dlglog_toggles_and_validates() {
        let test = TestEnv::new();
        let mut params = SessionParams::default();

        let off = execute_command("dlglog", &["off".into()], &test.env(), &mut params);
        assert_eq!(off["ok"], true);
        assert!(!test.dialog.enabled());

        let on = execute_command("dlglog", &["on".into()], &test.env(), &mut params);
        assert_eq!(on["dialog_logging"], true);
        assert!(test.dialog.enabled());

        let missing = execute_command("dlglog", &[], &test.env(), &mut params);
        assert!(missing["error"].as_str().unwrap().contains("on|off"));
        assert_eq!(missing["current"], true);

        let bogus = execute_command("dlglog", &["maybe".into()], &test.env(), &mut params);
        assert!(bogus["error"].as_str().unwrap().contains("maybe"));
    }

    #[test]
    fn set_validates_each_parameter() {
        let test = TestEnv::new();
        let mut params = SessionParams::default();
        let env = test.env();

        let ok = execute_command("set", &["temperature=0.7".into()], &env, &mut params);
        assert_eq!(ok["ok"], true);
        assert_eq!(params.temperature, Some(0.7));

        let high = execute_command("set", &["temperature=3.0".into()], &env, &mut params);
        assert!(high["error"].as_str().unwrap().contains("2.0"));
        assert_eq!(params.temperature, Some(0.7));

        let tokens = execute_command("set", &["max_tokens=512".into()], &env, &mut params);
        assert_eq!(tokens["max_tokens"], 512);

        let zero = execute_command("set", &["max_tokens=0".into()], &env, &mut params);
        assert!(zero["error"].as_str().unwrap().contains(">= 1"));

        let model = execute_command("set", &["model=gpt-4o-mini".into()], &env, &mut params);
        assert_eq!(model["ok"], true);
        assert_eq!(params.model.as_deref(), Some("gpt-4o-mini"));

        let unknown_model = execute_command("set", &["model=claude-3".into()], &env, &mut params);
        assert!(unknown_model["error"].as_str().unwrap().contains("claude-3"));
        assert_eq!(unknown_model["available"][0], "gpt-4o");

        let no_eq = execute_command("set", &["temperature".into()], &env, &mut params);
        assert!(no_eq["error"].as_str().unwrap().contains("key=value"));
    }

    #[test]
    fn get_returns_single_or_all() {
        let test = TestEnv::new();
        let mut params = SessionParams {
            temperature: Some(0.5),
            ..Default::default()
        };
        let env = test.env();

        let all = execute_command("get", &[], &env, &mut params);
        assert_eq!(all["model"], "gpt-4o");
        assert_eq!(all["temperature"], 0.5);
        assert_eq!(all["max_tokens"], Value::Null);

        let single = execute_command("get", &["temperature".into()], &env, &mut params);
        assert_eq!(single, json!({ "temperature": 0.5 }));

        let logging = execute_command("get", &["dialog_logging".into()], &env, &mut params);
        assert_eq!(logging["dialog_logging"], true);
    }

    #[test]
    fn unknown_command_gets_a_hint() {
        let test = TestEnv::new();
        let mut params = SessionParams::default();
        let result = execute_command("frobnicate", &[], &test.env(), &mut params);
        assert!(result["error"].as_str().unwrap().contains("frobnicate"));
        assert!(result["hint"].as_str().unwrap().contains("!help"));
    }

    #[test]
    fn session_store_evicts_oldest_at_capacity() {
        let mut store = SessionStore::with_capacity(2);
        store.params_mut("a").model = Some("m1".into());
        store.params_mut("b").model = Some("m2".into());

        // touching `a` makes `b` the eviction candidate
        assert_eq!(store.params_mut("a").model.as_deref(), Some("m1"));
        store.params_mut("c");

        assert_eq!(store.count(), 2);
        assert!(store.contains("a"));
        assert!(!store.contains("b"));
        assert!(store.contains("c"));
    }
}
