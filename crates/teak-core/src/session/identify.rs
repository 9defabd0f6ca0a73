//! Identify-user payload.

use chrono::{Local, Offset};
use serde_json::Value;

use super::Session;
use crate::config::DeviceIdentity;
use crate::request::Payload;

/// Endpoint receiving identify calls for `app_id`.
pub fn identify_endpoint(app_id: &str) -> String {
    format!("/games/{app_id}/users.json")
}

/// Local UTC offset in hours, formatted like `-7.00` or `5.50`.
fn timezone_offset() -> String {
    let seconds = Local::now().offset().fix().local_minus_utc();
    format!("{:.2}", f64::from(seconds) / 3600.0)
}

pub(crate) fn identify_payload(session: &Session, device: &DeviceIdentity, do_not_track_event: bool) -> Payload {
    let mut payload = Payload::new();
    if do_not_track_event {
        payload.insert("do_not_track_event".into(), Value::Bool(true));
    }
    payload.insert("timezone".into(), Value::from(timezone_offset()));
    if let Some(locale) = &device.locale {
        payload.insert("locale".into(), Value::from(locale.as_str()));
    }
    if let Some(ad_id) = &device.advertising_id {
        payload.insert("android_ad_id".into(), Value::from(ad_id.as_str()));
        payload.insert("android_limit_ad_tracking".into(), Value::Bool(device.limit_ad_tracking));
    }
    if let Some(token) = &device.push_token {
        payload.insert("push_token".into(), Value::from(token.as_str()));
    }

    let chain = session.attribution_chain();
    if let Some(latest) = chain.last() {
        payload.insert(latest.payload_key().into(), Value::from(latest.value()));
    }
    if !chain.is_empty() {
        payload.insert(
            "attribution_chain".into(),
            serde_json::to_value(&chain).unwrap_or(Value::Null),
        );
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Attribution;
    use serde_json::json;

    #[test]
    fn test_identify_payload_fields() {
        let session = Session::new();
        session.push_attribution(Attribution::DeepLink("teak1234://store".into()));
        session.push_attribution(Attribution::Notification("99".into()));
        let device = DeviceIdentity {
            advertising_id: Some("ad-1".into()),
            limit_ad_tracking: true,
            push_token: Some("tok".into()),
            locale: Some("en_NZ".into()),
            ..DeviceIdentity::default()
        };

        let payload = identify_payload(&session, &device, true);

        assert_eq!(payload["do_not_track_event"], json!(true));
        assert_eq!(payload["locale"], json!("en_NZ"));
        assert_eq!(payload["android_ad_id"], json!("ad-1"));
        assert_eq!(payload["android_limit_ad_tracking"], json!(true));
        assert_eq!(payload["push_token"], json!("tok"));
        assert_eq!(payload["teak_notif_id"], json!("99"));
        assert!(!payload.contains_key("deep_link"));
        assert_eq!(payload["attribution_chain"].as_array().map(Vec::len), Some(2));
        assert!(payload["timezone"].as_str().unwrap().contains('.'));
    }

    #[test]
    fn test_identify_payload_minimal() {
        let payload = identify_payload(&Session::new(), &DeviceIdentity::default(), false);
        assert!(!payload.contains_key("do_not_track_event"));
        assert!(!payload.contains_key("android_ad_id"));
        assert!(!payload.contains_key("attribution_chain"));
        assert!(payload.contains_key("timezone"));
    }

    #[test]
    fn test_identify_endpoint() {
        assert_eq!(identify_endpoint("1234"), "/games/1234/users.json");
    }
}
