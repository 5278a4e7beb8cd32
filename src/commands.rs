//! Display commands
//!
//! Operator-issued commands that adjust every display at once, published as
//! JSON on per-command subjects under `tspi.cmd.display.*`. Commands are
//! last-write-wins: consumers apply the latest and the archive keeps only the
//! newest per command name.

use std::collections::HashMap;

use anyhow::{bail, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::broker::Broker;
use crate::subjects::{COMMAND_SUBJECT_PREFIX, MSG_ID_HEADER};

pub const UNITS_COMMAND: &str = "units";
pub const MARKER_COLOR_COMMAND: &str = "marker_color";

/// A display command as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub cmd_id: String,
    pub name: String,
    pub ts: DateTime<Utc>,
    pub sender: String,
    pub payload: Value,
}

impl CommandPayload {
    pub fn new(name: impl Into<String>, sender: impl Into<String>, payload: Value) -> Self {
        Self {
            cmd_id: Uuid::new_v4().to_string(),
            name: name.into(),
            ts: Utc::now(),
            sender: sender.into(),
            payload,
        }
    }

    pub fn subject(&self) -> String {
        format!("{COMMAND_SUBJECT_PREFIX}.{}", self.name)
    }
}

/// Publishes display commands.
pub struct CommandSender {
    broker: Broker,
    sender: String,
}

impl CommandSender {
    pub fn new(broker: Broker, sender: impl Into<String>) -> Self {
        Self {
            broker,
            sender: sender.into(),
        }
    }

    fn publish(&self, command: &CommandPayload) -> Result<()> {
        let payload = Bytes::from(serde_json::to_vec(command)?);
        let headers = HashMap::from([(MSG_ID_HEADER.to_string(), command.cmd_id.clone())]);
        self.broker.publish(&command.subject(), payload, headers);
        info!(command = %command.name, cmd_id = %command.cmd_id, "Display command sent");
        Ok(())
    }

    /// Switch every display between metric and imperial units.
    pub fn send_units(&self, units: &str) -> Result<CommandPayload> {
        if units != "metric" && units != "imperial" {
            bail!("unknown unit system: {units}");
        }
        let command = CommandPayload::new(
            UNITS_COMMAND,
            self.sender.clone(),
            serde_json::json!({ "units": units }),
        );
        self.publish(&command)?;
        Ok(command)
    }

    /// Set the track marker color on every display.
    pub fn send_marker_color(&self, color: &str) -> Result<CommandPayload> {
        let command = CommandPayload::new(
            MARKER_COLOR_COMMAND,
            self.sender.clone(),
            serde_json::json!({ "color": color }),
        );
        self.publish(&command)?;
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn units_command_rides_its_own_subject() {
        let broker = Broker::new(16);
        let mut sub = broker.subscribe(["tspi.cmd.display.>"]);
        let sender = CommandSender::new(broker.clone(), "console");

        let sent = sender.send_units("imperial").unwrap();
        let message = sub.recv().await.unwrap();

        assert_eq!(message.subject, "tspi.cmd.display.units");
        assert_eq!(message.msg_id(), Some(sent.cmd_id.as_str()));
        let decoded: CommandPayload = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(decoded, sent);
        assert_eq!(decoded.payload["units"], "imperial");
    }

    #[test]
    fn invalid_unit_system_is_rejected() {
        let broker = Broker::new(16);
        let sender = CommandSender::new(broker, "console");
        assert!(sender.send_units("furlongs").is_err());
    }

    #[tokio::test]
    async fn marker_color_command_carries_color() {
        let broker = Broker::new(16);
        let mut sub = broker.subscribe(["tspi.cmd.display.marker_color"]);
        let sender = CommandSender::new(broker.clone(), "console");

        sender.send_marker_color("orange").unwrap();
        let message = sub.recv().await.unwrap();
        let decoded: CommandPayload = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(decoded.payload["color"], "orange");
        assert_eq!(decoded.sender, "console");
    }
}
