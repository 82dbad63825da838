use serde::{Deserialize, Serialize};

pub type NodeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Tagged log command. `ReplicateFile` carries file bytes base64-encoded on
/// the wire (the original sent raw file contents through a JSON string by
/// decoding them as UTF-8, which corrupts any non-text payload); in memory
/// both variants are always a plain owned buffer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    SetLeader {
        leader_id: NodeId,
    },
    ReplicateFile {
        filename: String,
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub term: u64,
    pub command: Command,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replicate_file_round_trips_arbitrary_bytes() {
        let cmd = Command::ReplicateFile {
            filename: "toyota_corolla_ottawa.csv".to_string(),
            bytes: vec![0, 159, 146, 150, 255, b'a', b'\n'],
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"type\":\"replicate_file\""));
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(cmd, back);
    }

    #[test]
    fn set_leader_tag_matches_wire_protocol() {
        let cmd = Command::SetLeader { leader_id: 888 };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "set_leader");
        assert_eq!(json["leader_id"], 888);
    }
}
