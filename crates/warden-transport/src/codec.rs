//! ---
//! warden_section: "02-messaging-transport"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Change-command codec, transport contract and consumers."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use warden_model::Command;

use crate::Result;

/// Wire version written into every envelope.
pub const ENVELOPE_VERSION: u16 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u16,
    #[serde(flatten)]
    command: Command,
}

/// One delivered message with its position in the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Partitioning key; the resource id of the command.
    pub key: String,
    pub payload: Vec<u8>,
    pub partition: usize,
    pub offset: u64,
}

pub fn encode_command(command: &Command) -> Result<Vec<u8>> {
    let envelope = Envelope {
        version: ENVELOPE_VERSION,
        command: command.clone(),
    };
    Ok(serde_json::to_vec(&envelope)?)
}

pub fn decode_command(payload: &[u8]) -> Result<Command> {
    let envelope: Envelope = serde_json::from_slice(payload)?;
    Ok(envelope.command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_model::{PermissionBits, ResourcePermissions};

    #[test]
    fn envelope_is_flat_json() {
        let permissions = ResourcePermissions::new().with_user("u1", PermissionBits::all());
        let command = Command::rights("dev-1", permissions, 7);
        let bytes = encode_command(&command).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["kind"], "RIGHTS");
        assert_eq!(json["resource_id"], "dev-1");
        assert_eq!(json["permissions"]["users"]["u1"]["administrate"], true);
        assert_eq!(decode_command(&bytes).unwrap(), command);
    }

    #[test]
    fn garbage_is_a_codec_error() {
        assert!(decode_command(b"{\"kind\":\"NOPE\"}").is_err());
        assert!(decode_command(b"not json").is_err());
    }
}
