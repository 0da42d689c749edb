//! Payload and header sanitization
//!
//! Stored copies of provider payloads must not retain PII. Redaction runs
//! before any persistence: webhook log bodies, canonical event
//! `raw_payload`, and issue evidence all pass through here.

use serde_json::{Map, Value};

/// Top-level (or nested-object) keys whose values are replaced wholesale
const REDACTED_FIELDS: [&str; 7] = [
    "customer_email",
    "customer_name",
    "receipt_email",
    "billing_details",
    "shipping",
    "credit_card",
    "card_number",
];

/// Keys redacted inside any object named `customer`
const CUSTOMER_FIELDS: [&str; 4] = ["email", "name", "phone", "address"];

/// Headers preserved on the webhook log row; everything else is dropped
const HEADER_ALLOWLIST: [&str; 8] = [
    "stripe-signature",
    "recurly-signature",
    "x-apple-signature",
    "x-goog-signature",
    "bt-signature",
    "content-type",
    "content-length",
    "user-agent",
];

const REDACTED: &str = "[REDACTED]";

/// Redact PII fields from a provider payload, recursively
pub fn sanitize_payload(value: &Value) -> Value {
    sanitize_inner(value, false)
}

fn sanitize_inner(value: &Value, in_customer: bool) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, child) in map {
                let lowered = key.to_ascii_lowercase();
                if REDACTED_FIELDS.contains(&lowered.as_str())
                    || (in_customer && CUSTOMER_FIELDS.contains(&lowered.as_str()))
                {
                    out.insert(key.clone(), Value::String(REDACTED.to_string()));
                } else {
                    let nested_customer = lowered == "customer";
                    out.insert(key.clone(), sanitize_inner(child, nested_customer));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| sanitize_inner(item, in_customer))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Keep only allowlisted headers, lowercasing names
pub fn sanitize_headers<'a, I>(headers: I) -> Value
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = Map::new();
    for (name, value) in headers {
        let lowered = name.to_ascii_lowercase();
        if HEADER_ALLOWLIST.contains(&lowered.as_str()) {
            out.insert(lowered, Value::String(value.to_string()));
        }
    }
    Value::Object(out)
}

/// Parse raw bytes into JSON for storage; non-JSON bodies are stored as a
/// lossy string so the log row is always written
pub fn body_for_storage(raw: &[u8]) -> Value {
    match serde_json::from_slice::<Value>(raw) {
        Ok(json) => sanitize_payload(&json),
        Err(_) => Value::String(String::from_utf8_lossy(raw).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_redacts_top_level_pii() {
        let payload = json!({
            "id": "evt_1",
            "customer_email": "jane@example.com",
            "amount": 1999
        });
        let clean = sanitize_payload(&payload);
        assert_eq!(clean["customer_email"], json!("[REDACTED]"));
        assert_eq!(clean["amount"], json!(1999));
    }

    #[test]
    fn test_redacts_nested_customer_object() {
        let payload = json!({
            "data": {
                "customer": {
                    "id": "cus_abc",
                    "email": "jane@example.com",
                    "name": "Jane",
                    "phone": "+15550100",
                    "address": {"line1": "1 Main St"}
                }
            }
        });
        let clean = sanitize_payload(&payload);
        let customer = &clean["data"]["customer"];
        assert_eq!(customer["id"], json!("cus_abc"));
        assert_eq!(customer["email"], json!("[REDACTED]"));
        assert_eq!(customer["name"], json!("[REDACTED]"));
        assert_eq!(customer["phone"], json!("[REDACTED]"));
        assert_eq!(customer["address"], json!("[REDACTED]"));
    }

    #[test]
    fn test_redacts_inside_arrays() {
        let payload = json!({
            "charges": [
                {"id": "ch_1", "billing_details": {"name": "Jane"}},
                {"id": "ch_2", "card_number": "4242424242424242"}
            ]
        });
        let clean = sanitize_payload(&payload);
        assert_eq!(clean["charges"][0]["billing_details"], json!("[REDACTED]"));
        assert_eq!(clean["charges"][1]["card_number"], json!("[REDACTED]"));
    }

    #[test]
    fn test_header_allowlist() {
        let headers = vec![
            ("Stripe-Signature", "t=1,v1=abc"),
            ("Content-Type", "application/json"),
            ("Authorization", "Bearer secret"),
            ("X-Internal-Trace", "abc"),
        ];
        let clean = sanitize_headers(headers);
        assert_eq!(clean["stripe-signature"], json!("t=1,v1=abc"));
        assert_eq!(clean["content-type"], json!("application/json"));
        assert!(clean.get("authorization").is_none());
        assert!(clean.get("x-internal-trace").is_none());
    }

    #[test]
    fn test_non_json_body_stored_as_string() {
        let body = body_for_storage(b"plain text payload");
        assert_eq!(body, json!("plain text payload"));
    }
}
