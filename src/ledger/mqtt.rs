//! Realtime push of ledger commands over MQTT.
//!
//! Topics, under a configurable prefix:
//! - `<prefix>/sessions/<session_id>/violations`: one message per violation (QoS 1)
//! - `<prefix>/sessions/<session_id>/violation_count`: retained running count
//! - `<prefix>/sessions/<session_id>/status`: retained session status
//! - `<prefix>/engine/status`: retained `online`, last will `offline`

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use rumqttc::Transport;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;

use super::sqlite::{EXAM_COMPLETED, EXAM_IN_PROGRESS, STATUS_ACTIVE, STATUS_DISQUALIFIED};
use super::{IntegrityLedger, ViolationRecord};
use crate::{now_s, SessionId};

pub const DEFAULT_TOPIC_PREFIX: &str = "proctor";
pub const DEFAULT_CLIENT_ID: &str = "proctor-kernel";
const PAYLOAD_ONLINE: &str = "online";
const PAYLOAD_OFFLINE: &str = "offline";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttSettings {
    pub broker: String,
    pub topic_prefix: String,
    pub client_id: String,
    pub allow_remote: bool,
}

impl MqttSettings {
    pub fn new(broker: &str) -> Self {
        Self {
            broker: broker.to_string(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            allow_remote: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Accepts `host:port`, `[ipv6]:port` and the `mqtt://`, `tcp://`, `mqtts://`, `ssl://`
/// schemes.
pub fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut use_tls = false;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid MQTT port in {}", addr))?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    Ok((host.to_string(), port))
}

pub fn validate_loopback_addr(endpoint: &MqttEndpoint, original: &str) -> Result<()> {
    let host = endpoint.host.as_str();
    if host == "localhost" {
        return Ok(());
    }
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        if ip.is_loopback() {
            return Ok(());
        }
    }
    Err(anyhow!(
        "MQTT broker must be loopback: {} (set mqtt.allow_remote = true to override)",
        original
    ))
}

/// Prefixes are published verbatim, so wildcards and whitespace are refused.
pub fn validate_topic_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        return Err(anyhow!("MQTT topic prefix must not be empty"));
    }
    if prefix.starts_with('/') || prefix.ends_with('/') {
        return Err(anyhow!(
            "MQTT topic prefix must not start or end with '/': {:?}",
            prefix
        ));
    }
    if prefix
        .chars()
        .any(|c| c == '+' || c == '#' || c.is_whitespace() || c == '\0')
    {
        return Err(anyhow!(
            "MQTT topic prefix must not contain wildcards or whitespace: {:?}",
            prefix
        ));
    }
    Ok(())
}

pub fn session_topic(prefix: &str, session_id: &SessionId, leaf: &str) -> String {
    format!("{}/sessions/{}/{}", prefix, session_id, leaf)
}

pub fn engine_status_topic(prefix: &str) -> String {
    format!("{}/engine/status", prefix)
}

#[derive(Serialize)]
struct CountPayload<'a> {
    session_id: &'a str,
    violation_count: u32,
    updated_at: u64,
}

#[derive(Serialize)]
struct StatusPayload<'a> {
    session_id: &'a str,
    proctoring_status: &'a str,
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed_at: Option<u64>,
}

pub fn violation_payload(record: &ViolationRecord) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(record)?)
}

pub fn count_payload(session_id: &SessionId, count: u32, updated_at: u64) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&CountPayload {
        session_id: session_id.as_str(),
        violation_count: count,
        updated_at,
    })?)
}

pub fn active_status_payload(session_id: &SessionId) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&StatusPayload {
        session_id: session_id.as_str(),
        proctoring_status: STATUS_ACTIVE,
        status: EXAM_IN_PROGRESS,
        reason: None,
        completed_at: None,
    })?)
}

pub fn disqualified_status_payload(
    session_id: &SessionId,
    reason: &str,
    completed_at: u64,
) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&StatusPayload {
        session_id: session_id.as_str(),
        proctoring_status: STATUS_DISQUALIFIED,
        status: EXAM_COMPLETED,
        reason: Some(reason),
        completed_at: Some(completed_at),
    })?)
}

struct MqttRuntime {
    client: Client,
    connection_handle: Option<std::thread::JoinHandle<()>>,
}

impl MqttRuntime {
    fn new(client: Client, mut connection: Connection) -> Self {
        let handle = std::thread::spawn(move || {
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        log::warn!("MQTT connection error: {}", e);
                        break;
                    }
                }
            }
        });

        Self {
            client,
            connection_handle: Some(handle),
        }
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .map_err(|e| anyhow!("MQTT publish to {} failed: {}", topic, e))
    }

    fn disconnect(&mut self) {
        if let Err(e) = self.client.disconnect() {
            log::debug!("MQTT disconnect: {}", e);
        }
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Publishes ledger commands to an MQTT broker. Delivery is QoS 1 but nothing is
/// buffered across a lost connection.
pub struct MqttLedger {
    runtime: MqttRuntime,
    prefix: String,
    /// In-progress status published, final status not yet.
    open_sessions: HashSet<SessionId>,
}

impl MqttLedger {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        validate_topic_prefix(&settings.topic_prefix)?;
        let endpoint = parse_mqtt_endpoint(&settings.broker)?;
        if settings.allow_remote {
            log::warn!("remote MQTT enabled - ensure broker is in a trusted network");
        } else {
            validate_loopback_addr(&endpoint, &settings.broker)?;
        }

        let will_topic = engine_status_topic(&settings.topic_prefix);
        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        let will = rumqttc::v5::mqttbytes::v5::LastWill::new(
            will_topic.clone(),
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        );
        options.set_last_will(will);
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        } else {
            options.set_transport(Transport::tcp());
        }

        let (client, connection) = Client::new(options, 10);
        let runtime = MqttRuntime::new(client, connection);
        runtime.publish(&will_topic, PAYLOAD_ONLINE.as_bytes().to_vec(), true)?;
        log::info!(
            "MQTT ledger publishing to {}:{} under {} (TLS: {})",
            endpoint.host,
            endpoint.port,
            settings.topic_prefix,
            endpoint.use_tls
        );
        Ok(Self {
            runtime,
            prefix: settings.topic_prefix.clone(),
            open_sessions: HashSet::new(),
        })
    }

    fn announce(&mut self, session_id: &SessionId) -> Result<()> {
        if self.open_sessions.contains(session_id) {
            return Ok(());
        }
        self.runtime.publish(
            &session_topic(&self.prefix, session_id, "status"),
            active_status_payload(session_id)?,
            true,
        )?;
        self.open_sessions.insert(session_id.clone());
        Ok(())
    }
}

impl IntegrityLedger for MqttLedger {
    fn append_violation(&mut self, record: &ViolationRecord) -> Result<()> {
        self.announce(&record.session_id)?;
        self.runtime.publish(
            &session_topic(&self.prefix, &record.session_id, "violations"),
            violation_payload(record)?,
            false,
        )
    }

    fn update_session_violation_count(
        &mut self,
        session_id: &SessionId,
        count: u32,
    ) -> Result<()> {
        self.runtime.publish(
            &session_topic(&self.prefix, session_id, "violation_count"),
            count_payload(session_id, count, now_s()?)?,
            true,
        )
    }

    fn mark_disqualified(
        &mut self,
        session_id: &SessionId,
        reason: &str,
        completed_at: u64,
    ) -> Result<()> {
        // Final status; nothing else is published for this session.
        self.open_sessions.remove(session_id);
        self.runtime.publish(
            &session_topic(&self.prefix, session_id, "status"),
            disqualified_status_payload(session_id, reason, completed_at)?,
            true,
        )
    }
}

impl Drop for MqttLedger {
    fn drop(&mut self) {
        let topic = engine_status_topic(&self.prefix);
        if let Err(e) = self
            .runtime
            .publish(&topic, PAYLOAD_OFFLINE.as_bytes().to_vec(), true)
        {
            log::debug!("{}", e);
        }
        self.runtime.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Severity, UserId, Violation, ViolationKind};

    #[test]
    fn parse_endpoint_variants() {
        let ep = parse_mqtt_endpoint("127.0.0.1:1883").unwrap();
        assert_eq!((ep.host.as_str(), ep.port, ep.use_tls), ("127.0.0.1", 1883, false));

        let ep = parse_mqtt_endpoint("mqtts://localhost:8883").unwrap();
        assert!(ep.use_tls);
        assert_eq!(ep.port, 8883);

        let ep = parse_mqtt_endpoint("[::1]:1883").unwrap();
        assert_eq!(ep.host, "::1");

        assert!(parse_mqtt_endpoint("ws://localhost:80").is_err());
        assert!(parse_mqtt_endpoint("localhost").is_err());
        assert!(parse_mqtt_endpoint(":1883").is_err());
    }

    #[test]
    fn loopback_only_by_default() {
        for addr in ["localhost:1883", "127.0.0.1:1883", "[::1]:1883"] {
            let ep = parse_mqtt_endpoint(addr).unwrap();
            assert!(validate_loopback_addr(&ep, addr).is_ok(), "{}", addr);
        }
        let ep = parse_mqtt_endpoint("192.168.1.10:1883").unwrap();
        assert!(validate_loopback_addr(&ep, "192.168.1.10:1883").is_err());
    }

    #[test]
    fn topic_prefix_rules() {
        assert!(validate_topic_prefix("proctor").is_ok());
        assert!(validate_topic_prefix("campus/exams").is_ok());
        for bad in ["", "a/+", "#", "with space", "/lead", "trail/"] {
            assert!(validate_topic_prefix(bad).is_err(), "{:?}", bad);
        }
    }

    /// A ledger whose client only queues; nothing is sent while `_connection` lives.
    fn offline_ledger() -> (MqttLedger, Connection) {
        let options = MqttOptions::new("proctor-test", "localhost", 1883);
        let (client, connection) = Client::new(options, 10);
        let ledger = MqttLedger {
            runtime: MqttRuntime {
                client,
                connection_handle: None,
            },
            prefix: "proctor".to_string(),
            open_sessions: HashSet::new(),
        };
        (ledger, connection)
    }

    #[test]
    fn final_status_closes_the_session() {
        let (mut ledger, _connection) = offline_ledger();
        let session = SessionId::new("exam-7").unwrap();
        let record = ViolationRecord::new(
            &session,
            &UserId::new("user-1").unwrap(),
            &Violation::new(ViolationKind::WindowBlur, Severity::Warning, "Window lost focus"),
            1,
            10,
        );

        ledger.append_violation(&record).unwrap();
        ledger.append_violation(&record).unwrap();
        assert_eq!(ledger.open_sessions.len(), 1);

        ledger
            .mark_disqualified(&session, "Maximum violations exceeded", 20)
            .unwrap();
        assert!(ledger.open_sessions.is_empty());
    }

    #[test]
    fn topics_and_payloads() {
        let session = SessionId::new("exam-9").unwrap();
        assert_eq!(
            session_topic("proctor", &session, "violation_count"),
            "proctor/sessions/exam-9/violation_count"
        );
        assert_eq!(engine_status_topic("proctor"), "proctor/engine/status");

        let record = ViolationRecord::new(
            &session,
            &UserId::new("user-1").unwrap(),
            &Violation::new(
                ViolationKind::FullscreenExit,
                Severity::Critical,
                "Exited fullscreen mode",
            ),
            2,
            50,
        );
        let value: serde_json::Value =
            serde_json::from_slice(&violation_payload(&record).unwrap()).unwrap();
        assert_eq!(value["kind"], "fullscreen_exit");
        assert_eq!(value["severity"], "critical");
        assert_eq!(value["weight"], 2);

        let value: serde_json::Value =
            serde_json::from_slice(&disqualified_status_payload(&session, "x", 60).unwrap())
                .unwrap();
        assert_eq!(value["proctoring_status"], "disqualified");
        assert_eq!(value["status"], "completed");
        assert_eq!(value["completed_at"], 60);

        let value: serde_json::Value =
            serde_json::from_slice(&active_status_payload(&session).unwrap()).unwrap();
        assert!(value.get("reason").is_none());
        assert_eq!(value["status"], "in_progress");
    }
}
