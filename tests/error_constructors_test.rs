use outback_bridge::error::{BridgeError, FailureKind};

#[test]
fn error_constructors_group_1() {
    assert!(matches!(
        BridgeError::config("x"),
        BridgeError::Config { .. }
    ));
    assert!(matches!(BridgeError::link("x"), BridgeError::Link { .. }));
    assert!(matches!(
        BridgeError::link_lost("x"),
        BridgeError::LinkLost { .. }
    ));
    assert!(matches!(
        BridgeError::decode("x"),
        BridgeError::Decode { .. }
    ));
    assert!(matches!(BridgeError::dbus("x"), BridgeError::DBus { .. }));
}

#[test]
fn error_constructors_group_2() {
    let ser = BridgeError::Serialization {
        message: "s".into(),
    };
    assert!(matches!(ser, BridgeError::Serialization { .. }));
    assert!(matches!(BridgeError::io("x"), BridgeError::Io { .. }));
    assert!(matches!(
        BridgeError::validation("f", "m"),
        BridgeError::Validation { .. }
    ));
    assert!(matches!(
        BridgeError::timeout("x"),
        BridgeError::Timeout { .. }
    ));
    assert!(matches!(
        BridgeError::generic("x"),
        BridgeError::Generic { .. }
    ));
}

#[test]
fn failure_kinds() {
    assert_eq!(BridgeError::link_lost("gone").failure_kind(), FailureKind::Hard);
    assert_eq!(
        BridgeError::link("org.bluez.Error.NotConnected: Not Connected").failure_kind(),
        FailureKind::Hard
    );
    assert_eq!(BridgeError::link("ATT error 0x0e").failure_kind(), FailureKind::Soft);
    assert_eq!(BridgeError::decode("short").failure_kind(), FailureKind::Soft);
    assert_eq!(
        BridgeError::timeout("read A11 timed out").failure_kind(),
        FailureKind::Soft
    );
}

#[test]
fn display_messages() {
    let e = BridgeError::validation("field", "bad");
    let s = format!("{}", e);
    assert!(s.contains("Validation error"));
    assert!(s.contains("field"));
}
