//! Logical namespace layout of the metadata store.
//!
//! Each namespace lives in its own Redis database so keyspace notifications
//! can be subscribed per namespace.

/// Database holding application records, keyed by application name.
pub const APPLICATION_DB: u32 = 5;
/// Database holding backend records, keyed by backend name.
pub const BACKEND_DB: u32 = 8;
/// Database mapping application name to the backend serving it.
pub const APP_BACKEND_LINK_DB: u32 = 9;
/// Database holding raw uploaded batches as lists, keyed by data id.
pub const RETRAIN_DATA_DB: u32 = 10;
/// Database linking `<app>,<ts_us>` keys to the data id of that upload.
pub const APP_DATA_LINK_DB: u32 = 11;

/// Separator inside composite keys and inside serialized sample rows.
pub const ITEM_DELIMITER: &str = ",";

/// Composite key for the app-data-link namespace.
pub fn app_data_link_key(app_name: &str, timestamp_us: i64) -> String {
    format!("{app_name}{ITEM_DELIMITER}{timestamp_us}")
}

/// Keyspace-notification channel pattern for a database.
pub fn keyspace_pattern(db: u32) -> String {
    format!("__keyspace@{db}__:*")
}

/// Extracts the key from a keyspace-notification channel name.
pub fn key_from_channel(channel: &str) -> Option<&str> {
    channel.split_once(':').map(|(_, key)| key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_data_link_key_is_comma_separated() {
        assert_eq!(app_data_link_key("digits", 1_000_000), "digits,1000000");
    }

    #[test]
    fn key_from_channel_strips_keyspace_prefix() {
        assert_eq!(
            key_from_channel("__keyspace@9__:digits"),
            Some("digits")
        );
        assert_eq!(key_from_channel("no-colon"), None);
    }
}
