use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::classify::ClassifierConfig;
use crate::controller::ControllerSettings;
use crate::ledger::mqtt::{
    parse_mqtt_endpoint, validate_loopback_addr, validate_topic_prefix, MqttSettings,
    DEFAULT_CLIENT_ID, DEFAULT_TOPIC_PREFIX,
};
use crate::policy::{PolicyConfig, SeverityWeights};
use crate::{Severity, ViolationKind, DEVTOOLS_THRESHOLD_PX, MAX_WARNINGS};

const DEFAULT_DB_PATH: &str = "proctor_ledger.db";

#[derive(Debug, Deserialize, Default)]
struct ProctorConfigFile {
    mandatory_media: Option<bool>,
    policy: Option<PolicyConfigFile>,
    classifier: Option<ClassifierConfigFile>,
    ledger: Option<LedgerConfigFile>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct PolicyConfigFile {
    max_warnings: Option<u32>,
    warning_weight: Option<u32>,
    critical_weight: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ClassifierConfigFile {
    devtools_threshold_px: Option<u32>,
    media_denied_critical_after: Option<u32>,
    severity_overrides: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize, Default)]
struct LedgerConfigFile {
    db_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker: Option<String>,
    topic_prefix: Option<String>,
    client_id: Option<String>,
    allow_remote: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProctorConfig {
    pub controller: ControllerSettings,
    pub ledger_db_path: String,
    /// MQTT push is off unless a broker is configured.
    pub mqtt_broker: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_client_id: String,
    pub mqtt_allow_remote: bool,
}

impl Default for ProctorConfig {
    fn default() -> Self {
        Self {
            controller: ControllerSettings::default(),
            ledger_db_path: DEFAULT_DB_PATH.to_string(),
            mqtt_broker: None,
            mqtt_topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            mqtt_client_id: DEFAULT_CLIENT_ID.to_string(),
            mqtt_allow_remote: false,
        }
    }
}

impl ProctorConfig {
    /// Defaults, then the file named by `PROCTOR_CONFIG`, then `PROCTOR_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PROCTOR_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty());
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ProctorConfigFile) -> Result<Self> {
        let defaults = Self::default();
        let policy_file = file.policy.unwrap_or_default();
        let classifier_file = file.classifier.unwrap_or_default();
        let mqtt_file = file.mqtt.unwrap_or_default();

        let policy = PolicyConfig {
            max_warnings: policy_file.max_warnings.unwrap_or(MAX_WARNINGS),
            weights: SeverityWeights {
                warning: policy_file
                    .warning_weight
                    .unwrap_or(SeverityWeights::default().warning),
                critical: policy_file
                    .critical_weight
                    .unwrap_or(SeverityWeights::default().critical),
            },
        };
        let classifier = ClassifierConfig {
            devtools_threshold_px: classifier_file
                .devtools_threshold_px
                .unwrap_or(DEVTOOLS_THRESHOLD_PX),
            media_denied_critical_after: classifier_file.media_denied_critical_after,
            severity_overrides: parse_overrides(
                classifier_file.severity_overrides.unwrap_or_default(),
            )?,
        };

        Ok(Self {
            controller: ControllerSettings {
                policy,
                classifier,
                mandatory_media: file
                    .mandatory_media
                    .unwrap_or(defaults.controller.mandatory_media),
            },
            ledger_db_path: file
                .ledger
                .and_then(|ledger| ledger.db_path)
                .unwrap_or(defaults.ledger_db_path),
            mqtt_broker: mqtt_file.broker.filter(|b| !b.trim().is_empty()),
            mqtt_topic_prefix: mqtt_file
                .topic_prefix
                .unwrap_or(defaults.mqtt_topic_prefix),
            mqtt_client_id: mqtt_file.client_id.unwrap_or(defaults.mqtt_client_id),
            mqtt_allow_remote: mqtt_file.allow_remote.unwrap_or(false),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(value) = env_u32("PROCTOR_MAX_WARNINGS")? {
            self.controller.policy.max_warnings = value;
        }
        if let Some(value) = env_u32("PROCTOR_CRITICAL_WEIGHT")? {
            self.controller.policy.weights.critical = value;
        }
        if let Some(value) = env_u32("PROCTOR_DEVTOOLS_THRESHOLD_PX")? {
            self.controller.classifier.devtools_threshold_px = value;
        }
        if let Some(raw) = env_value("PROCTOR_MEDIA_DENIED_CRITICAL_AFTER") {
            self.controller.classifier.media_denied_critical_after =
                match raw.to_ascii_lowercase().as_str() {
                    "off" | "none" => None,
                    _ => Some(raw.parse().map_err(|_| {
                        anyhow!(
                            "PROCTOR_MEDIA_DENIED_CRITICAL_AFTER must be a positive integer or 'off'"
                        )
                    })?),
                };
        }
        if let Some(raw) = env_value("PROCTOR_MANDATORY_MEDIA") {
            self.controller.mandatory_media = parse_bool("PROCTOR_MANDATORY_MEDIA", &raw)?;
        }
        if let Some(path) = env_value("PROCTOR_LEDGER_DB") {
            self.ledger_db_path = path;
        }
        if let Some(broker) = env_value("PROCTOR_MQTT_BROKER") {
            self.mqtt_broker = Some(broker);
        }
        if let Some(prefix) = env_value("PROCTOR_MQTT_TOPIC_PREFIX") {
            self.mqtt_topic_prefix = prefix;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let policy = &self.controller.policy;
        if policy.max_warnings == 0 {
            return Err(anyhow!("max_warnings must be greater than zero"));
        }
        if policy.weights.warning == 0 || policy.weights.critical == 0 {
            return Err(anyhow!("severity weights must be greater than zero"));
        }
        if policy.weights.critical < policy.weights.warning {
            return Err(anyhow!(
                "critical_weight ({}) must not be below warning_weight ({})",
                policy.weights.critical,
                policy.weights.warning
            ));
        }

        let classifier = &self.controller.classifier;
        if classifier.devtools_threshold_px == 0 {
            return Err(anyhow!("devtools_threshold_px must be greater than zero"));
        }
        if classifier.media_denied_critical_after == Some(0) {
            return Err(anyhow!(
                "media_denied_critical_after must be greater than zero when set"
            ));
        }

        if self.ledger_db_path.trim().is_empty() {
            return Err(anyhow!("ledger db_path must not be empty"));
        }

        validate_topic_prefix(&self.mqtt_topic_prefix)?;
        if self.mqtt_client_id.trim().is_empty() {
            return Err(anyhow!("mqtt client_id must not be empty"));
        }
        if let Some(broker) = &self.mqtt_broker {
            let endpoint = parse_mqtt_endpoint(broker)?;
            if !self.mqtt_allow_remote {
                validate_loopback_addr(&endpoint, broker)?;
            }
        }
        Ok(())
    }

    pub fn mqtt_settings(&self) -> Option<MqttSettings> {
        self.mqtt_broker.as_ref().map(|broker| MqttSettings {
            broker: broker.clone(),
            topic_prefix: self.mqtt_topic_prefix.clone(),
            client_id: self.mqtt_client_id.clone(),
            allow_remote: self.mqtt_allow_remote,
        })
    }
}

fn read_config_file(path: &Path) -> Result<ProctorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_overrides(raw: BTreeMap<String, String>) -> Result<BTreeMap<ViolationKind, Severity>> {
    raw.into_iter()
        .map(|(kind, severity)| {
            let kind: ViolationKind = kind
                .parse()
                .map_err(|e| anyhow!("invalid severity_overrides entry: {}", e))?;
            let severity: Severity = severity
                .parse()
                .map_err(|e| anyhow!("invalid severity_overrides.{}: {}", kind, e))?;
            Ok((kind, severity))
        })
        .collect()
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u32(name: &str) -> Result<Option<u32>> {
    env_value(name)
        .map(|raw| {
            raw.parse()
                .map_err(|_| anyhow!("{} must be a non-negative integer", name))
        })
        .transpose()
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("{} must be true or false (got {:?})", name, raw)),
    }
}
