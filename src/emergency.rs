//! The emergency contact record served while offline.

use serde::{Deserialize, Serialize};

/// Well-known site path the record is stored under in the ephemeral partition.
pub const EMERGENCY_RECORD_PATH: &str = "/emergency-contact.json";

/// Static business contact data available with zero network access.
///
/// Written once at install time and never mutated afterwards; a new install
/// is the only way to replace it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyRecord {
    /// Display name of the business.
    pub business: String,
    /// Phone number, rendered as a `tel:` link in the offline page.
    pub phone: String,
    /// Contact email.
    pub email: String,
    /// When the line is staffed, e.g. "24/7".
    pub availability: String,
    /// Expected time until someone responds.
    #[serde(alias = "response_time")]
    pub response_time: String,
    /// Services offered on the emergency line.
    pub services: Vec<String>,
}

impl Default for EmergencyRecord {
    fn default() -> Self {
        Self {
            business: "Emergency Service".to_string(),
            phone: "+1-555-010-0000".to_string(),
            email: "help@example.com".to_string(),
            availability: "24/7".to_string(),
            response_time: "within 60 minutes".to_string(),
            services: vec![
                "Emergency callout".to_string(),
                "Remote triage".to_string(),
            ],
        }
    }
}

impl EmergencyRecord {
    /// Serializes the record as the JSON payload served to clients.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Returns the phone number with everything but digits and a leading `+`
    /// stripped, suitable for a `tel:` URI.
    #[must_use]
    pub fn dial_string(&self) -> String {
        self.phone
            .chars()
            .enumerate()
            .filter(|&(i, c)| c.is_ascii_digit() || (i == 0 && c == '+'))
            .map(|(_, c)| c)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_uses_camel_case_fields() {
        let record = EmergencyRecord::default();
        let json: serde_json::Value = serde_json::from_slice(&record.to_json().unwrap()).unwrap();
        assert_eq!(json["responseTime"], "within 60 minutes");
        assert_eq!(json["phone"], "+1-555-010-0000");
        assert!(json["services"].is_array());
    }

    #[test]
    fn dial_string_strips_formatting() {
        let record = EmergencyRecord {
            phone: "+44 (0)20 7946-0018".to_string(),
            ..EmergencyRecord::default()
        };
        assert_eq!(record.dial_string(), "+4402079460018");
    }
}
