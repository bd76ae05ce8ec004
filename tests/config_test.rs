//! Tests for `src/config.rs`: defaults, parsing and validation.

use std::fs;

use moltbot_watcher::classifier::{AlertPolicy, DEFAULT_SUSPICIOUS_PATTERNS};
use moltbot_watcher::config::{load_config, Config};

fn parse(toml_text: &str) -> Config {
    toml::from_str(toml_text).expect("config should parse")
}

#[test]
fn minimal_config_only_needs_chat_id() {
    let config = parse("[telegram]\nchat_id = 42\n");
    config.validate().expect("minimal config is valid");

    assert_eq!(config.telegram.bot_token_env, "MOLTBOT_WATCHER_TELEGRAM_TOKEN");
    assert_eq!(config.telegram.allowed_senders(), vec!["42".to_owned()]);
    assert_eq!(
        config.watch.paths,
        vec!["~/.moltbot/agents/*/sessions/*.jsonl".to_owned()]
    );
    assert_eq!(config.watch.alert_level, AlertPolicy::NewSender);
    assert_eq!(config.watch.poll_interval_secs, 2);
    assert!(config.watch.use_notify);
    assert!(!config.watch.replay_from_start);
    assert_eq!(config.mute.default_minutes, 30);
    assert_eq!(config.moltbot.stop_command, "moltbot gateway stop");
    assert_eq!(config.moltbot.process_pattern, "moltbot gateway");
    assert!(config.state.persist_senders);

    let rules = config.patterns.rules().expect("default rules compile");
    assert_eq!(rules.len(), DEFAULT_SUSPICIOUS_PATTERNS.len());
}

#[test]
fn missing_chat_id_is_rejected() {
    let config = parse("");
    let err = config.validate().expect_err("chat id required");
    assert!(err.to_string().contains("chat_id"));
}

#[test]
fn full_config_parses() {
    let config = parse(
        r#"
[telegram]
bot_token_env = "MY_TOKEN"
chat_id = -100123
allowed_senders = [1, 2]

[watch]
paths = ["/var/log/moltbot/*.jsonl"]
alert_level = "digest"
digest_interval_minutes = 5
replay_from_start = true
use_notify = false

[patterns]
suspicious = ["jailbreak"]
rules = [{ id = "exfil", regex = "curl .*\\|" }]
blocked_senders = ["spam-bot"]

[mute]
default_minutes = 10
max_minutes = 60

[moltbot]
start_command = "systemctl --user start moltbot"
stop_command = "systemctl --user stop moltbot"
pid_file = "~/.moltbot/moltbot.pid"
command_timeout_secs = 20

[state]
persist_senders = false
"#,
    );
    config.validate().expect("full config is valid");

    assert_eq!(config.telegram.allowed_senders(), vec!["1", "2"]);
    assert_eq!(config.watch.alert_level, AlertPolicy::Digest);
    assert_eq!(config.watch.expanded_paths(), vec!["/var/log/moltbot/*.jsonl"]);

    let ids: Vec<String> = config
        .patterns
        .rules()
        .expect("rules compile")
        .iter()
        .map(|r| r.id().to_owned())
        .collect();
    assert_eq!(ids, vec!["jailbreak", "exfil"]);
    assert_eq!(config.patterns.blocked_senders, vec!["spam-bot"]);
}

#[test]
fn unknown_alert_level_fails_to_parse() {
    let result: Result<Config, _> = toml::from_str("[watch]\nalert_level = \"loud\"\n");
    assert!(result.is_err());
}

#[test]
fn invalid_values_are_rejected() {
    let cases = [
        ("[telegram]\nchat_id = 1\n[watch]\npaths = []\n", "watch.paths"),
        ("[telegram]\nchat_id = 1\n[watch]\npoll_interval_secs = 0\n", "poll_interval_secs"),
        ("[telegram]\nchat_id = 1\n[mute]\ndefault_minutes = 60\nmax_minutes = 30\n", "max_minutes"),
        ("[telegram]\nchat_id = 1\n[moltbot]\ncommand_timeout_secs = 0\n", "command_timeout_secs"),
        ("[telegram]\nchat_id = 1\n[moltbot]\nprocess_pattern = \"(gateway\"\n", "process_pattern"),
        ("[telegram]\nchat_id = 1\n[patterns]\nsuspicious = [\"(bad\"]\n", "patterns"),
        (
            "[telegram]\nchat_id = 1\n[patterns]\nsuspicious = [\"x\"]\nrules = [{ id = \"x\", regex = \"y\" }]\n",
            "patterns",
        ),
    ];
    for (text, needle) in cases {
        let err = parse(text).validate().expect_err(needle);
        assert!(format!("{err:#}").contains(needle), "{needle}: {err:#}");
    }
}

#[test]
fn load_config_reads_and_validates_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("config.toml");

    fs::write(&path, "[telegram]\nchat_id = 7\n").expect("write config");
    let config = load_config(&path).expect("load config");
    assert_eq!(config.telegram.chat_id, 7);

    fs::write(&path, "[telegram]\n").expect("write config");
    assert!(load_config(&path).is_err());

    assert!(load_config(&dir.path().join("missing.toml")).is_err());
}
