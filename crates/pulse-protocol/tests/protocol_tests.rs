//! Protocol layer tests: envelope serialization, payload views, error bodies.

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use pulse_protocol::*;
    use serde_json::json;

    // ─────────────────────────────────────────────────────────────────────
    // Envelope
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn data_envelope_is_single_key_object() {
        let env = Envelope::data(json!({"welcome": true}));
        let value: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"data": {"welcome": true}}));
        assert_eq!(value.as_object().unwrap().len(), 1);
    }

    #[test]
    fn null_data_envelope_keeps_the_key() {
        let env = Envelope::data(serde_json::Value::Null);
        assert_eq!(env.to_json().unwrap(), r#"{"data":null}"#);
    }

    #[test]
    fn error_envelope_carries_message_and_stack() {
        let err = HandlerError::msg("boom");
        let env = Envelope::error(&err);
        assert!(env.is_error());
        let value: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"error": {"message": "boom", "stack": "boom"}}));
    }

    #[test]
    fn error_envelope_uses_explicit_stack() {
        let err = HandlerError::msg("bad input").with_stack("parse failed at 3");
        let value = serde_json::to_value(Envelope::error(&err)).unwrap();
        assert_eq!(value["error"]["message"], "bad input");
        assert_eq!(value["error"]["stack"], "parse failed at 3");
    }

    #[test]
    fn envelope_from_handler_result() {
        let ok: HandlerResult = Ok(json!("PING"));
        assert_eq!(Envelope::from(ok), Envelope::Data(json!("PING")));

        let err: HandlerResult = Err("nope".into());
        assert!(Envelope::from(err).is_error());
    }

    #[test]
    fn envelope_deserializes_from_wire_format() {
        let wire = r#"{"error":{"message":"m","stack":"s"}}"#;
        let env: Envelope = serde_json::from_str(wire).unwrap();
        assert_eq!(
            env,
            Envelope::Error(ErrorBody {
                message: "m".into(),
                stack: "s".into(),
            })
        );
    }

    // ─────────────────────────────────────────────────────────────────────
    // HandlerError
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn connect_failure_wraps_source_as_stack() {
        let source = HandlerError::msg("db offline");
        let err = HandlerError::connect_failed(&source);
        assert_eq!(err.kind, ErrorKind::Connect);
        let body = err.to_body();
        assert_eq!(body.message, "onConnect error");
        assert_eq!(body.stack, "db offline");
    }

    #[test]
    fn route_not_configured_is_fatal() {
        let err = HandlerError::route_not_configured("/chat");
        assert_eq!(err.kind, ErrorKind::RouteNotConfigured);
        assert!(err.kind.is_fatal());
        assert!(err.message.contains("/chat"));
        assert!(!ErrorKind::Handler.is_fatal());
    }

    #[test]
    fn serde_errors_convert_to_serialization_kind() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: HandlerError = parse.unwrap_err().into();
        assert_eq!(err.kind, ErrorKind::Serialization);
    }

    #[test]
    fn display_shows_message() {
        assert_eq!(HandlerError::msg("oops").to_string(), "oops");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Payload
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn payload_kinds() {
        assert_eq!(Payload::Empty.kind(), None);
        assert_eq!(Payload::from("hi").kind(), Some(MessageKind::Text));
        assert_eq!(
            Payload::from(Bytes::from_static(b"\x00\x01")).kind(),
            Some(MessageKind::Binary)
        );
    }

    #[test]
    fn binary_payload_text_view_requires_utf8() {
        assert_eq!(Payload::from(b"ping".to_vec()).as_text(), Some("ping"));
        assert_eq!(Payload::from(vec![0xff, 0xfe]).as_text(), None);
        assert_eq!(Payload::Empty.as_text(), None);
    }

    #[test]
    fn payload_decodes_json() {
        #[derive(serde::Deserialize)]
        struct Cmd {
            subscribe: String,
        }
        let cmd: Cmd = Payload::from(r#"{"subscribe":"lobby"}"#).json().unwrap();
        assert_eq!(cmd.subscribe, "lobby");
        assert!(Payload::Empty.json::<Cmd>().is_err());
    }

    #[test]
    fn empty_payload() {
        assert!(Payload::default().is_empty());
        assert!(Payload::from("").is_empty());
        assert!(!Payload::from("x").is_empty());
    }

    // ─────────────────────────────────────────────────────────────────────
    // ConnectionId
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn generated_ids_are_unique() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn connection_id_serializes_as_string() {
        let id = ConnectionId::from("abc");
        assert_eq!(serde_json::to_value(&id).unwrap(), json!("abc"));
        assert_eq!(id.to_string(), "abc");
    }
}
