//! Session channel messages

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{ProtoError, Result, WireMessage};

/// Every message that may appear on the session channel, in either direction.
///
/// The worker sends `Hello`, `Idle`, `Built`, `Sent` and `Bye`; the
/// coordinator sends `Ack`, `Sleep`, `Build`, `Send`, `Done` and `Bye`.
/// Receivers must reject variants that are not valid in their direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", content = "args", rename_all = "UPPERCASE")]
pub enum SessionMessage {
    /// Worker greeting: build timeout and the build-target tags it serves
    Hello {
        timeout_secs: u64,
        impl_tag: String,
        abi_tag: String,
        platform_tag: String,
    },

    /// Coordinator acknowledgment of `Hello`
    Ack { worker_id: u32, index_url: String },

    /// Worker is ready for work
    Idle,

    /// Nothing to do; ask again later
    Sleep,

    /// Build `package` at `version`
    Build { package: String, version: String },

    /// Outcome of a build
    Built(BuildReport),

    /// Transfer the named artifact over the transfer channel
    Send { filename: String },

    /// The requested transfer finished
    Sent,

    /// All artifacts received; the build may be discarded
    Done,

    /// Terminate the session
    Bye,
}

/// Full report of a build attempt, carried by `BUILT`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub package: String,
    pub version: String,
    pub success: bool,
    /// Wall-clock build time in seconds
    pub duration_secs: f64,
    /// Build tool log, plus any supervision error
    pub log: String,
    pub artifacts: Vec<ArtifactSummary>,
}

/// Identity of one produced wheel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub filename: String,
    pub filesize: u64,
    /// Lower-case hex SHA-256 of the file
    pub filehash: String,
    pub package_tag: String,
    pub version_tag: String,
    pub py_version_tag: String,
    pub abi_tag: String,
    pub platform_tag: String,
    /// Resolution method ("apt", or "" for unresolved) to sorted providers
    pub dependencies: BTreeMap<String, Vec<String>>,
}

impl WireMessage for SessionMessage {
    fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProtoError::Encode {
            tag: self.tag(),
            reason: e.to_string(),
        })
    }

    fn decode(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| ProtoError::Decode(e.to_string()))
    }

    fn tag(&self) -> &'static str {
        match self {
            SessionMessage::Hello { .. } => "HELLO",
            SessionMessage::Ack { .. } => "ACK",
            SessionMessage::Idle => "IDLE",
            SessionMessage::Sleep => "SLEEP",
            SessionMessage::Build { .. } => "BUILD",
            SessionMessage::Built(_) => "BUILT",
            SessionMessage::Send { .. } => "SEND",
            SessionMessage::Sent => "SENT",
            SessionMessage::Done => "DONE",
            SessionMessage::Bye => "BYE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_messages_use_bare_tag() {
        let body = SessionMessage::Idle.encode().unwrap();
        assert_eq!(body, br#"{"msg":"IDLE"}"#);
        assert_eq!(
            SessionMessage::decode(br#"{"msg":"SLEEP"}"#).unwrap(),
            SessionMessage::Sleep
        );
    }

    #[test]
    fn test_build_request_decodes() {
        let msg = SessionMessage::decode(
            br#"{"msg":"BUILD","args":{"package":"foo","version":"1.0"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            SessionMessage::Build {
                package: "foo".to_string(),
                version: "1.0".to_string(),
            }
        );
        assert_eq!(msg.tag(), "BUILD");
    }

    #[test]
    fn test_unknown_tag_is_a_decode_error() {
        let err = SessionMessage::decode(br#"{"msg":"FOO"}"#).unwrap_err();
        assert!(matches!(err, ProtoError::Decode(_)));
    }

    #[test]
    fn test_built_report_carries_dependencies() {
        let mut dependencies = BTreeMap::new();
        dependencies.insert("apt".to_string(), vec!["libc6".to_string()]);
        let report = BuildReport {
            package: "foo".to_string(),
            version: "0.1".to_string(),
            success: true,
            duration_secs: 1.5,
            log: "ok".to_string(),
            artifacts: vec![ArtifactSummary {
                filename: "foo-0.1-cp34-cp34m-linux_armv7l.whl".to_string(),
                filesize: 123,
                filehash: "ab".repeat(32),
                package_tag: "foo".to_string(),
                version_tag: "0.1".to_string(),
                py_version_tag: "cp34".to_string(),
                abi_tag: "cp34m".to_string(),
                platform_tag: "linux_armv7l".to_string(),
                dependencies,
            }],
        };

        let body = SessionMessage::Built(report.clone()).encode().unwrap();
        let text = String::from_utf8(body.clone()).unwrap();
        assert!(text.starts_with(r#"{"msg":"BUILT""#));
        assert_eq!(
            SessionMessage::decode(&body).unwrap(),
            SessionMessage::Built(report)
        );
    }
}
