use super::schema::Config;

macro_rules! define_credentials {
    ($( $name:literal, $env:literal => $($path:ident).+ );* $(;)?) => {
        /// All known credential slot names.
        pub const CREDENTIAL_NAMES: &[&str] = &[$($name),*];

        /// (slot name, env var name) pairs.
        pub const CREDENTIAL_ENV_VARS: &[(&str, &str)] = &[$(($name, $env)),*];

        /// Get the current value of a credential field by slot name.
        pub fn get_credential_value<'a>(config: &'a Config, name: &str) -> Option<&'a str> {
            match name {
                $($name => Some(config.$($path).+.as_str()),)*
                _ => None,
            }
        }

        /// Apply environment variable overrides.
        ///
        /// Any `CHATCOALESCE_*` env var that is set and non-empty will overwrite
        /// the corresponding config field, so endpoints and keys can be injected
        /// by the deployment without touching the config file.
        pub fn apply_env_overrides(config: &mut Config) {
            $(
                if let Ok(val) = std::env::var($env) {
                    if !val.is_empty() {
                        config.$($path).+ = val;
                    }
                }
            )*
        }
    };
}

define_credentials! {
    "redis-url",                "CHATCOALESCE_REDIS_URL"                => store.redis_url;
    "webhook-url",              "CHATCOALESCE_WEBHOOK_URL"              => delivery.webhook_url;
    "openai-api-key",           "CHATCOALESCE_OPENAI_API_KEY"           => media.api_key;
    "whatsapp-phone-number-id", "CHATCOALESCE_WHATSAPP_PHONE_NUMBER_ID" => channels.whatsapp_phone_number_id;
}

/// Slots that are set, by name. Used by `chatcoalesce check`.
pub fn configured_credentials(config: &Config) -> Vec<&'static str> {
    CREDENTIAL_NAMES
        .iter()
        .copied()
        .filter(|name| get_credential_value(config, name).is_some_and(|v| !v.is_empty()))
        .collect()
}
