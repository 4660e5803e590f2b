use std::str::FromStr;

/// Get environment variable with PAWBILL_ prefix, falling back to unprefixed version
///
/// Checks `PAWBILL_{key}` first, then `{key}`, so deployments can keep the
/// provider's conventional names (e.g. `STRIPE_SECRET_KEY`).
///
/// # Examples
///
/// ```rust
/// use pawbill::utils::get_env_with_prefix;
///
/// // Checks PAWBILL_WEBHOOK_SECRET first, then WEBHOOK_SECRET
/// let secret = get_env_with_prefix("WEBHOOK_SECRET");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("PAWBILL_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
}

/// Like [`get_env_with_prefix`], parsed into `T`.
///
/// Values that fail to parse are logged and treated as unset.
pub fn parse_env_with_prefix<T: FromStr>(key: &str) -> Option<T> {
    let raw = get_env_with_prefix(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(target: "pawbill::config", key, value = %raw, "Ignoring unparseable environment value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_env_with_prefix() {
        unsafe {
            std::env::set_var("PAWBILL_TEST_VAR", "prefixed_value");
        }
        assert_eq!(get_env_with_prefix("TEST_VAR"), Some("prefixed_value".to_string()));
        unsafe {
            std::env::remove_var("PAWBILL_TEST_VAR");
        }

        unsafe {
            std::env::set_var("FALLBACK_ONLY_VAR_X", "unprefixed_value");
        }
        assert_eq!(
            get_env_with_prefix("FALLBACK_ONLY_VAR_X"),
            Some("unprefixed_value".to_string())
        );
        unsafe {
            std::env::remove_var("FALLBACK_ONLY_VAR_X");
        }

        assert_eq!(get_env_with_prefix("NON_EXISTENT_VAR"), None);
    }

    #[test]
    fn test_parse_env_with_prefix() {
        unsafe {
            std::env::set_var("PAWBILL_PARSE_TEST_NUM", " 42 ");
            std::env::set_var("PAWBILL_PARSE_TEST_BAD", "forty-two");
        }
        assert_eq!(parse_env_with_prefix::<u32>("PARSE_TEST_NUM"), Some(42));
        assert_eq!(parse_env_with_prefix::<u32>("PARSE_TEST_BAD"), None);
        unsafe {
            std::env::remove_var("PAWBILL_PARSE_TEST_NUM");
            std::env::remove_var("PAWBILL_PARSE_TEST_BAD");
        }
    }
}
