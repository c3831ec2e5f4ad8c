//! TOML parsing of replica protocol parameters, as given on the command
//! line with `--config`.

/// Builds a protocol parameters struct (e.g., `ReplicaConfigPbft`) from its
/// defaults, then overrides the listed fields with values from a TOML
/// string if one is given. Keys outside the listed fields are rejected.
///
/// Example:
/// ```no_run
/// # use quorumkv::{parsed_config, ReplicaConfigPbft, KvError};
/// # fn example(config_str: Option<&str>) -> Result<(), KvError> {
/// let config = parsed_config!(config_str => ReplicaConfigPbft;
///                             checkpoint_interval, audit_enabled)?;
/// # let _ = config;
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, $crate::KvError> {
            let mut config: $config_type = Default::default();
            let Some(config_str) = config_str else {
                return Ok(config);
            };

            let mut table = config_str.parse::<toml::Table>()?;

            // traverse through all given field names
            $({
                // if field name found in table (and removed)
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // leftover keys are not expected hence invalid
            if let Some(key) = table.keys().next() {
                return Err($crate::KvError::msg(format!(
                    "invalid field name '{}' in config",
                    key,
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}
