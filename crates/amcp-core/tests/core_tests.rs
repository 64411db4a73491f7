//! Comprehensive tests for amcp-core: types, wire protocol, config, errors

use amcp_core::*;

// ===========================================================================
// SessionKey
// ===========================================================================

#[test]
fn session_key_new_and_display() {
    let key = SessionKey::new("abc-123");
    assert_eq!(key.as_str(), "abc-123");
    assert_eq!(format!("{}", key), "abc-123");
}

#[test]
fn session_key_clone_is_cheap() {
    let key = SessionKey::new("test");
    let cloned = key.clone();
    assert_eq!(key, cloned);
    assert_eq!(key.as_str(), cloned.as_str());
}

#[test]
fn session_key_from_string() {
    let key: SessionKey = "hello".into();
    assert_eq!(key.as_str(), "hello");
    let key2: SessionKey = String::from("world").into();
    assert_eq!(key2.as_str(), "world");
}

#[test]
fn session_key_equality_and_hash() {
    use std::collections::HashSet;
    let a = SessionKey::new("same");
    let b = SessionKey::new("same");
    let c = SessionKey::new("different");
    assert_eq!(a, b);
    assert_ne!(a, c);
    let mut set = HashSet::new();
    set.insert(a.clone());
    assert!(set.contains(&b));
    assert!(!set.contains(&c));
}

// ===========================================================================
// GatewayConfig
// ===========================================================================

#[test]
fn gateway_config_defaults() {
    let config = GatewayConfig::default();
    assert_eq!(config.port, 18789);
    assert!(matches!(config.bind, BindMode::Loopback));
    assert!(matches!(config.auth.mode, AuthMode::Token));
}

#[test]
fn gateway_config_serde() {
    let config = GatewayConfig::default();
    let json = serde_json::to_string(&config).unwrap();
    let back: GatewayConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back.port, 18789);
}

// ===========================================================================
// BindMode
// ===========================================================================

#[test]
fn bind_mode_to_addr() {
    assert_eq!(BindMode::Loopback.to_addr(), "127.0.0.1");
    assert_eq!(BindMode::Lan.to_addr(), "0.0.0.0");
}

// ===========================================================================
// AuthConfig / AuthMode
// ===========================================================================

#[test]
fn auth_config_defaults() {
    let config = AuthConfig::default();
    assert!(matches!(config.mode, AuthMode::Token));
    assert!(config.token.is_none());
}

// ===========================================================================
// Wire protocol — IncomingFrame
// ===========================================================================

#[test]
fn incoming_frame_parses_auth_shorthand() {
    let json = r#"{"token":"secret"}"#;
    let frame: IncomingFrame = serde_json::from_str(json).unwrap();
    match frame {
        IncomingFrame::Auth { token } => assert_eq!(token.as_deref(), Some("secret")),
        _ => panic!("expected Auth, got {:?}", frame),
    }
}

#[test]
fn incoming_frame_parses_bare_request() {
    let json = r#"{"action":"prompt","session_id":"main","content":"hello"}"#;
    let frame: IncomingFrame = serde_json::from_str(json).unwrap();
    match &frame {
        IncomingFrame::Bare(req) => {
            assert!(matches!(req.action, ClientAction::Prompt));
            assert_eq!(req.session_id.as_deref(), Some("main"));
            assert_eq!(req.content.as_deref(), Some("hello"));
        }
        _ => panic!("expected Bare, got {:?}", frame),
    }
    let (id, req) = frame.request().unwrap();
    assert!(id.is_none());
    assert_eq!(req.session_id.as_deref(), Some("main"));
}

#[test]
fn incoming_frame_parses_enveloped_request() {
    let json = r#"{"type":"request","id":"r1","payload":{"action":"cancel","session_id":"s1"}}"#;
    let frame: IncomingFrame = serde_json::from_str(json).unwrap();
    match &frame {
        IncomingFrame::Enveloped { frame_type, payload, .. } => {
            assert!(matches!(frame_type, FrameType::Request));
            assert!(matches!(payload.action, ClientAction::Cancel));
        }
        _ => panic!("expected Enveloped, got {:?}", frame),
    }
    let (id, req) = frame.request().unwrap();
    assert_eq!(id.as_deref(), Some("r1"));
    assert_eq!(req.session_id.as_deref(), Some("s1"));
}

#[test]
fn incoming_frame_request_returns_none_for_auth() {
    let json = r#"{"token":null}"#;
    let frame: IncomingFrame = serde_json::from_str(json).unwrap();
    assert!(frame.request().is_none());
}

// ===========================================================================
// Wire protocol — WsFrame
// ===========================================================================

#[test]
fn ws_frame_new_carries_payload_and_type() {
    let frame = WsFrame::new(FrameType::Event, None, serde_json::json!({"event": "session.created"}));
    let json = serde_json::to_value(&frame).unwrap();
    assert_eq!(json["type"], "event");
    assert_eq!(json["payload"]["event"], "session.created");
    assert!(json["timestamp"].is_string());
    assert!(json.get("id").is_none());
}

#[test]
fn ws_frame_error_sets_error_type_and_message() {
    let frame = WsFrame::error(Some("r1".to_string()), "bad_request", "bad request");
    let json = serde_json::to_value(&frame).unwrap();
    assert_eq!(json["type"], "error");
    assert_eq!(json["id"], "r1");
    assert_eq!(json["payload"]["code"], "bad_request");
    assert_eq!(json["payload"]["message"], "bad request");
}

#[test]
fn to_ws_frame_roundtrips_through_json() {
    let event = Event::new(EventKind::SessionCreated, "test", serde_json::json!({"id": "s1"}));
    let frame = to_ws_frame(&event);
    let json = serde_json::to_string(&frame).unwrap();
    let back: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(back["payload"]["event"], "session.created");
}

// ===========================================================================
// Config-root discovery
// ===========================================================================

// Both assertions share one `XDG_CONFIG_HOME` mutation so they can't race
// against each other the way two separate env-mutating tests could under
// cargo's default parallel test runner.
#[test]
fn project_amcp_dir_overrides_server_config_and_xdg_sets_the_root() {
    let dir = std::env::temp_dir().join(format!("amcp-core-test-{}", std::process::id()));
    let project_amcp = dir.join(".amcp");
    std::fs::create_dir_all(&project_amcp).unwrap();
    std::fs::write(project_amcp.join("server.yaml"), "port: 4321\nbind: lan\n").unwrap();

    let process_root = dir.join("empty-process-root");
    std::env::set_var("XDG_CONFIG_HOME", &process_root);
    assert_eq!(config_root(), process_root.join("amcp"));

    let config = RootConfig::discover(&dir);
    std::env::remove_var("XDG_CONFIG_HOME");

    assert_eq!(config.server.port, 4321);
    assert!(matches!(config.server.bind, BindMode::Lan));

    std::fs::remove_dir_all(&dir).ok();
}

// ===========================================================================
// Error
// ===========================================================================

#[test]
fn error_auth_failed() {
    let e = Error::auth_failed("bad creds");
    assert!(e.to_string().contains("bad creds"));
    assert!(matches!(e, Error::AuthFailed { .. }));
}

#[test]
fn error_llm_error() {
    let e = Error::llm_error("anthropic", "rate limited");
    assert!(e.to_string().contains("anthropic"));
    assert!(e.to_string().contains("rate limited"));
}

#[test]
fn error_tool_error() {
    let e = Error::tool_error("read", "file not found");
    assert!(e.to_string().contains("read"));
    assert!(e.to_string().contains("file not found"));
}

#[test]
fn error_from_io() {
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    let e: Error = io_err.into();
    assert!(matches!(e, Error::IoError(_)));
}

#[test]
fn error_from_json() {
    let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
    let e: Error = json_err.into();
    assert!(matches!(e, Error::JsonError(_)));
}

#[test]
fn error_display_all_variants() {
    let errors: Vec<Error> = vec![
        Error::AuthFailed { reason: "x".into() },
        Error::ConnectionClosed("x".into()),
        Error::InvalidMessage("x".into()),
        Error::SessionNotFound("x".into()),
        Error::MethodNotFound("x".into()),
        Error::LlmError { provider: "p".into(), message: "m".into() },
        Error::ToolError { name: "n".into(), message: "m".into() },
        Error::ConfigError("x".into()),
        Error::Internal("x".into()),
    ];
    for e in errors {
        let _ = format!("{}", e);
    }
}
