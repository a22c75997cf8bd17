use super::*;
use std::str::FromStr;

#[test]
fn test_as_str_returns_correct_string() {
    assert_eq!(ChannelType::Facebook.as_str(), "facebook");
    assert_eq!(ChannelType::Instagram.as_str(), "instagram");
    assert_eq!(ChannelType::WhatsApp.as_str(), "whatsapp");
    assert_eq!(ChannelType::Web.as_str(), "web");
}

#[test]
fn test_from_str_parses_every_variant() {
    for variant in ChannelType::ALL {
        assert_eq!(ChannelType::from_str(variant.as_str()).unwrap(), variant);
    }
}

#[test]
fn test_from_str_returns_err_for_unknown() {
    let result = ChannelType::from_str("telegram");
    assert!(result.is_err());
    assert_eq!(result.unwrap_err(), "Unknown channel type: telegram");
}

#[test]
fn test_from_str_is_case_sensitive() {
    assert!(ChannelType::from_str("Web").is_err());
}

#[test]
fn test_display_matches_as_str() {
    assert_eq!(format!("{}", ChannelType::WhatsApp), "whatsapp");
    assert_eq!(String::from(ChannelType::Instagram), "instagram");
}

#[test]
fn test_serde_uses_lowercase_names() {
    let json = serde_json::to_string(&ChannelType::WhatsApp).unwrap();
    assert_eq!(json, "\"whatsapp\"");
    let parsed: ChannelType = serde_json::from_str("\"facebook\"").unwrap();
    assert_eq!(parsed, ChannelType::Facebook);
}
