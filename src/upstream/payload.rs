//! Courier tracking envelope and change-detection digest
//!
//! The courier answers `{status, data: [shipment], error}`. Field names drift
//! between API revisions, so each field accepts a handful of aliases and
//! numbers or booleans may arrive as strings.

use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::SyncError;

/// Separates digest fields so `("ab", "c")` and `("a", "bc")` differ
const FIELD_SEPARATOR: char = '\u{1f}';

/// Raw envelope as returned by the courier
#[derive(Debug, Deserialize)]
pub struct TrackingEnvelope {
    #[serde(default, alias = "Status")]
    pub status: Option<String>,

    #[serde(default, alias = "Data")]
    pub data: Option<Value>,

    #[serde(default, alias = "Error", alias = "message")]
    pub error: Option<Value>,
}

/// The fields of one shipment the orchestrator reads
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackingRecord {
    pub awb: Option<String>,
    pub status_code: Option<String>,
    pub status_desc: Option<String>,
    pub status_time: Option<String>,
    pub current_location: Option<String>,
    pub shipper: Option<String>,
    pub origin: Option<String>,
    pub destination: Option<String>,
    pub product_type: Option<String>,
    pub weight: Option<f64>,
    pub is_rto: bool,
    pub scan_count: usize,
}

fn pick<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .find_map(|n| obj.get(*n).filter(|v| !v.is_null()))
}

fn text(obj: &Map<String, Value>, names: &[&str]) -> Option<String> {
    match pick(obj, names)? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn number(obj: &Map<String, Value>, names: &[&str]) -> Option<f64> {
    match pick(obj, names)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn flag(obj: &Map<String, Value>, names: &[&str]) -> bool {
    match pick(obj, names) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|v| v != 0),
        Some(Value::String(s)) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "yes" | "y" | "1"
        ),
        _ => false,
    }
}

impl TrackingRecord {
    /// Extract a record from one element of `data`
    pub fn from_value(value: &Value) -> Result<Self, SyncError> {
        let obj = value
            .as_object()
            .ok_or_else(|| SyncError::MalformedPayload("shipment entry is not an object".into()))?;

        let scan_count = pick(obj, &["scans", "scan_details", "scanDetails", "Scans"])
            .and_then(Value::as_array)
            .map_or(0, Vec::len);

        Ok(Self {
            awb: text(obj, &["awb", "awb_no", "awbNumber", "AWB"]),
            status_code: text(obj, &["status_code", "statusCode", "current_status_code"]),
            status_desc: text(obj, &["status_desc", "statusDesc", "status_description", "status"]),
            status_time: text(obj, &["status_time", "statusTime", "status_date", "last_update"]),
            current_location: text(obj, &["current_location", "currentLocation", "location"]),
            shipper: text(obj, &["shipper", "shipper_name", "consignor"]),
            origin: text(obj, &["origin", "origin_city"]),
            destination: text(obj, &["destination", "destination_city"]),
            product_type: text(obj, &["product_type", "productType", "product"]),
            weight: number(obj, &["weight", "actual_weight"]),
            is_rto: flag(obj, &["is_rto", "isRto", "rto"]),
            scan_count,
        })
    }

    /// SHA-256 hex over the fields that decide whether anything changed
    ///
    /// Descriptive fields and payload ordering do not affect the result.
    pub fn digest(&self) -> String {
        let scans = self.scan_count.to_string();
        let parts = [
            self.status_code.as_deref().unwrap_or(""),
            self.status_time.as_deref().unwrap_or(""),
            self.current_location.as_deref().unwrap_or(""),
            if self.is_rto { "1" } else { "0" },
            scans.as_str(),
        ];

        let mut hasher = Sha256::new();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                let mut buf = [0u8; 4];
                hasher.update(FIELD_SEPARATOR.encode_utf8(&mut buf).as_bytes());
            }
            hasher.update(part.as_bytes());
        }

        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// Validate an envelope for `awb` and pull out its shipment record
pub fn parse_envelope(awb: &str, body: &Value) -> Result<TrackingRecord, SyncError> {
    let envelope: TrackingEnvelope = serde_json::from_value(body.clone())
        .map_err(|e| SyncError::MalformedPayload(e.to_string()))?;

    let succeeded = envelope
        .status
        .as_deref()
        .is_some_and(|s| s.eq_ignore_ascii_case("success"));
    if !succeeded {
        let message = match envelope.error {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => envelope
                .status
                .unwrap_or_else(|| String::from("missing status")),
        };
        return Err(SyncError::UpstreamRejected { message });
    }

    let first = match envelope.data {
        Some(Value::Array(items)) => items.into_iter().next(),
        Some(obj @ Value::Object(_)) => Some(obj),
        _ => None,
    }
    .ok_or_else(|| SyncError::MalformedPayload("no shipment data".into()))?;

    let record = TrackingRecord::from_value(&first)?;

    if let Some(returned) = record.awb.as_deref() {
        let returned: String = returned.chars().filter(char::is_ascii_alphanumeric).collect();
        if !returned.eq_ignore_ascii_case(awb) {
            return Err(SyncError::MalformedPayload(format!(
                "response is for {returned}, expected {awb}"
            )));
        }
    }

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ofd(location: &str) -> Value {
        json!({
            "status": "Success",
            "data": [{
                "awb": "AWB0001",
                "status_code": "OFD",
                "status_desc": "Out for delivery",
                "status_time": "2024-03-01T09:00:00Z",
                "current_location": location,
                "weight": "1.25",
                "is_rto": false,
                "scans": [{"code": "PU"}, {"code": "OFD"}]
            }]
        })
    }

    #[test]
    fn test_parse_success_envelope() {
        let record = parse_envelope("AWB0001", &ofd("Mumbai Hub")).unwrap();
        assert_eq!(record.status_code.as_deref(), Some("OFD"));
        assert_eq!(record.weight, Some(1.25));
        assert_eq!(record.scan_count, 2);
        assert!(!record.is_rto);
    }

    #[test]
    fn test_aliases_accepted() {
        let body = json!({
            "Status": "SUCCESS",
            "Data": [{"awbNumber": "awb0001", "statusCode": "UD", "isRto": "yes", "scanDetails": []}]
        });
        let record = parse_envelope("AWB0001", &body).unwrap();
        assert_eq!(record.status_code.as_deref(), Some("UD"));
        assert!(record.is_rto);
    }

    #[test]
    fn test_failure_status_is_rejected() {
        let body = json!({"status": "Failure", "error": "Invalid AWB"});
        let err = parse_envelope("AWB0001", &body).unwrap_err();
        assert!(matches!(err, SyncError::UpstreamRejected { ref message } if message == "Invalid AWB"));
    }

    #[test]
    fn test_missing_data_is_malformed() {
        let body = json!({"status": "Success", "data": []});
        assert!(matches!(
            parse_envelope("AWB0001", &body),
            Err(SyncError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_mismatched_awb_is_malformed() {
        let body = json!({"status": "Success", "data": [{"awb": "OTHER1"}]});
        assert!(matches!(
            parse_envelope("AWB0001", &body),
            Err(SyncError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_digest_ignores_descriptive_fields() {
        let a = parse_envelope("AWB0001", &ofd("Mumbai Hub")).unwrap();
        let mut body = ofd("Mumbai Hub");
        body["data"][0]["status_desc"] = json!("OUT FOR DELIVERY");
        body["data"][0]["shipper"] = json!("Acme");
        let b = parse_envelope("AWB0001", &body).unwrap();

        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);
    }

    #[test]
    fn test_digest_tracks_relevant_fields() {
        let a = parse_envelope("AWB0001", &ofd("Mumbai Hub")).unwrap();
        let b = parse_envelope("AWB0001", &ofd("Pune Hub")).unwrap();
        assert_ne!(a.digest(), b.digest());

        let mut c = a.clone();
        c.scan_count += 1;
        assert_ne!(a.digest(), c.digest());
    }
}
