use serde_json::Value;

use crate::protocol::required_fields;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractViolation {
    UnknownEvent(String),
    NotAnObject { event: String },
    MissingField { event: String, field: &'static str },
}

/// Checks an outbound event against the allow-list. Advisory: callers log the
/// result and send anyway.
pub fn validate(event: &str, payload: &Value) -> Vec<ContractViolation> {
    let Some(fields) = required_fields(event) else {
        return vec![ContractViolation::UnknownEvent(event.to_string())];
    };
    let Some(object) = payload.as_object() else {
        return vec![ContractViolation::NotAnObject {
            event: event.to_string(),
        }];
    };
    fields
        .iter()
        .filter(|field| object.get(**field).is_none_or(Value::is_null))
        .map(|field| ContractViolation::MissingField {
            event: event.to_string(),
            field: *field,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EVENT_JOIN_ROOM, EVENT_SEND_RECORD};
    use serde_json::json;

    #[test]
    fn well_formed_payload_passes() {
        assert!(validate(EVENT_JOIN_ROOM, &json!({"room_id": "r1"})).is_empty());
    }

    #[test]
    fn reports_unknown_events_and_missing_fields() {
        assert_eq!(
            validate("room:leave", &json!({})),
            vec![ContractViolation::UnknownEvent("room:leave".into())]
        );
        assert_eq!(
            validate(EVENT_SEND_RECORD, &json!({"room_id": "r1", "body": null})),
            vec![
                ContractViolation::MissingField {
                    event: EVENT_SEND_RECORD.into(),
                    field: "local_id"
                },
                ContractViolation::MissingField {
                    event: EVENT_SEND_RECORD.into(),
                    field: "body"
                },
            ]
        );
        assert_eq!(
            validate(EVENT_JOIN_ROOM, &json!("r1")),
            vec![ContractViolation::NotAnObject {
                event: EVENT_JOIN_ROOM.into()
            }]
        );
    }
}
