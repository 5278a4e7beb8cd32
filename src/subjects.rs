//! Broker subject names and wildcard matching
//!
//! Subjects are exact, case-sensitive strings. `*` matches one token and `>`
//! matches the rest of the subject, NATS-style.

use crate::datagram::TspiFrame;

/// Primary stream that contains live telemetry.
pub const TSPI_STREAM: &str = "TSPI";
/// Short-retention stream used for advertising replay channels.
pub const TSPI_REPLAY_STREAM: &str = "TSPI_REPLAY";

/// Live channel delivery.
pub const LIVESTREAM_SUBJECT: &str = "tspi.channel.livestream";
/// Prefix for group replay channel subjects.
pub const REPLAY_SUBJECT_PREFIX: &str = "tspi.channel.replay";
/// Prefix for private client replay channel subjects.
pub const CLIENT_SUBJECT_PREFIX: &str = "tspi.channel.client";
/// Operator control channel (`GroupReplayStart`/`GroupReplayStop`).
pub const CONTROL_SUBJECT: &str = "tspi.ops.ctrl";
/// Client status heartbeat channel.
pub const STATUS_SUBJECT: &str = "tspi.ops.status";
/// Channel discovery request subject.
pub const LIST_REQUEST_SUBJECT: &str = "tspi.channel.list.req";
/// Tag broadcast subject.
pub const TAG_BROADCAST_SUBJECT: &str = "tags.broadcast";
/// Prefix for display command subjects.
pub const COMMAND_SUBJECT_PREFIX: &str = "tspi.cmd.display";

/// Header carrying the broker-level dedup message id.
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";
/// Header naming the subject a discovery response should be published to.
pub const REPLY_TO_HEADER: &str = "Reply-To";
/// Header marking replayed messages.
pub const REPLAY_ORIGIN_HEADER: &str = "X-Replay-Origin";

/// Ingest subject for a parsed frame: `tspi.<kind>.<sensor_id>`.
pub fn telemetry_subject(frame: &TspiFrame) -> String {
    format!("tspi.{}.{}", frame.kind(), frame.sensor_id)
}

/// True when `subject` matches `pattern` under NATS wildcard rules.
pub fn matches(subject: &str, pattern: &str) -> bool {
    if pattern == ">" {
        return true;
    }
    let mut subject_tokens = subject.split('.');
    let mut pattern_tokens = pattern.split('.');

    loop {
        match (subject_tokens.next(), pattern_tokens.next()) {
            // `>` swallows the rest, but there must be a rest.
            (Some(_), Some(">")) => return true,
            (None, Some(">")) => return false,
            (Some(s), Some(p)) => {
                if p != "*" && p != s {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}
