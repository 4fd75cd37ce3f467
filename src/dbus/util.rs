use zbus::zvariant::{OwnedValue, Value};

/// Unit suffix for a published path, following the VeDbus text conventions
fn unit_for(path: &str) -> &'static str {
    let leaf = path.rsplit('/').next().unwrap_or_default();
    if path.contains("/Energy/") {
        return " kWh";
    }
    match leaf {
        "Power" | "P" | "PowerLimit" => " W",
        "Voltage" | "V" => " V",
        "Current" | "I" => " A",
        "F" | "Frequency" => " Hz",
        "Soc" => "%",
        _ => "",
    }
}

/// GetText rendering of a value
pub(crate) fn format_text_value(path: &str, val: &serde_json::Value) -> String {
    match val {
        serde_json::Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => format!("{}{}", i, unit_for(path)),
            (None, Some(f)) if path.contains("/Energy/") => format!("{:.3}{}", f, unit_for(path)),
            (None, Some(f)) => format!("{:.1}{}", f, unit_for(path)),
            _ => n.to_string(),
        },
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "---".to_string(),
        _ => val.to_string(),
    }
}

pub(crate) fn text_owned_value(path: &str, val: &serde_json::Value) -> OwnedValue {
    let text = format_text_value(path, val);
    OwnedValue::try_from(Value::from(text.as_str())).unwrap_or_else(|_| OwnedValue::from(0i64))
}
