//! User roster returned by the users-listing endpoint.

use serde::{Deserialize, Serialize};

use crate::codec::ProtocolError;
use crate::frames::{status_or_offline, string_or_number, UserStatus};

/// One user in a roster poll response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// Missing, null, or unrecognized values resolve to `Offline`.
    #[serde(default, deserialize_with = "status_or_offline")]
    pub online_status: UserStatus,
}

impl RosterEntry {
    #[must_use]
    pub fn new(id: impl Into<String>, online_status: UserStatus) -> Self {
        Self {
            id: id.into(),
            online_status,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RosterBody {
    List(Vec<RosterEntry>),
    Wrapped { users: Vec<RosterEntry> },
}

/// Parse a roster response body.
///
/// Accepts either a bare JSON array or an object with a `users` array.
/// Entry order is preserved.
///
/// # Errors
///
/// Returns an error if the body is neither shape.
pub fn parse_roster(body: &[u8]) -> Result<Vec<RosterEntry>, ProtocolError> {
    let parsed: RosterBody = serde_json::from_slice(body)?;
    Ok(match parsed {
        RosterBody::List(users) | RosterBody::Wrapped { users } => users,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_list() {
        let body = br#"[
            {"id": 1, "online_status": "online"},
            {"id": "2", "online_status": "away"},
            {"id": 3}
        ]"#;

        let roster = parse_roster(body).unwrap();
        assert_eq!(
            roster,
            vec![
                RosterEntry::new("1", UserStatus::Online),
                RosterEntry::new("2", UserStatus::Away),
                RosterEntry::new("3", UserStatus::Offline),
            ]
        );
    }

    #[test]
    fn test_parse_wrapped_list() {
        let body = br#"{"users": [{"id": "a", "online_status": null}, {"id": "b", "online_status": "invisible"}]}"#;

        let roster = parse_roster(body).unwrap();
        assert_eq!(roster[0].online_status, UserStatus::Offline);
        assert_eq!(roster[1].online_status, UserStatus::Offline);
    }

    #[test]
    fn test_parse_rejects_other_shapes() {
        assert!(parse_roster(br#"{"data": []}"#).is_err());
        assert!(parse_roster(b"not json").is_err());
    }
}
