use serde_json::Value;

use crate::api::TenantId;

/// Claves aceptadas para el tenant, en orden de prioridad.
pub const TENANT_KEYS: [&str; 4] = ["Tenant_ID", "tenant_id", "TenantId", "tenantId"];

/// Deriva el tenant del payload JSON.
///
/// Acepta enteros de 32 bits o strings numéricos. Una clave presente pero
/// inutilizable no corta la búsqueda: se prueba la siguiente. Cualquier
/// payload no conforme cae en `TenantId::DEFAULT`.
pub fn extract_tenant_id(payload: &[u8]) -> TenantId {
    let Ok(Value::Object(root)) = serde_json::from_slice::<Value>(payload) else {
        return TenantId::DEFAULT;
    };

    TENANT_KEYS
        .iter()
        .filter_map(|key| root.get(*key))
        .find_map(tenant_from_value)
        .unwrap_or(TenantId::DEFAULT)
}

fn tenant_from_value(value: &Value) -> Option<TenantId> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .map(TenantId::from),
        Value::String(raw) => raw.trim().parse::<i32>().ok().map(TenantId::from),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(payload: &str) -> i32 {
        extract_tenant_id(payload.as_bytes()).as_i32()
    }

    #[test]
    fn reads_each_key_spelling() {
        assert_eq!(tenant(r#"{"Tenant_ID": 7}"#), 7);
        assert_eq!(tenant(r#"{"tenant_id": 8}"#), 8);
        assert_eq!(tenant(r#"{"TenantId": 9}"#), 9);
        assert_eq!(tenant(r#"{"tenantId": 10}"#), 10);
    }

    #[test]
    fn accepts_numeric_strings() {
        assert_eq!(tenant(r#"{"tenant_id": "42"}"#), 42);
        assert_eq!(tenant(r#"{"tenant_id": " -3 "}"#), -3);
    }

    #[test]
    fn earlier_spelling_wins() {
        assert_eq!(tenant(r#"{"tenantId": 2, "Tenant_ID": 1}"#), 1);
    }

    #[test]
    fn unusable_value_falls_through_to_next_key() {
        assert_eq!(tenant(r#"{"Tenant_ID": "abc", "tenantId": 5}"#), 5);
        assert_eq!(tenant(r#"{"Tenant_ID": 1.5, "TenantId": "6"}"#), 6);
        assert_eq!(tenant(r#"{"Tenant_ID": 99999999999, "tenant_id": 4}"#), 4);
    }

    #[test]
    fn non_conforming_payloads_default_to_zero() {
        assert_eq!(tenant("Synthetic message #1"), 0);
        assert_eq!(tenant("[1, 2, 3]"), 0);
        assert_eq!(tenant(r#"{"tenant": 3}"#), 0);
        assert_eq!(tenant(r#"{"tenant_id": null}"#), 0);
        assert_eq!(extract_tenant_id(&[0xff, 0xfe]).as_i32(), 0);
    }
}
