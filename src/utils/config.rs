//! Configuration parameters struct parsing helper.

use crate::utils::GridError;

/// Parses an optional TOML config string into a key-value table. `None` or
/// a blank string yield an empty table.
#[doc(hidden)]
pub fn config_table(config_str: Option<&str>) -> Result<toml::Table, GridError> {
    match config_str {
        Some(s) if !s.trim().is_empty() => Ok(s.parse::<toml::Table>()?),
        _ => Ok(toml::Table::new()),
    }
}

/// Fails on the first key left in `table` after all known fields were taken
/// out of it.
#[doc(hidden)]
pub fn reject_leftover(
    table: &toml::Table,
    config_type: &str,
) -> Result<(), GridError> {
    match table.keys().next() {
        Some(key) => Err(GridError::msg(format!(
            "invalid field name '{}' in {} config",
            key, config_type
        ))),
        None => Ok(()),
    }
}

/// Composes a configuration struct from its default values, then overwrites
/// the listed fields found in the given optional TOML string. Any key not
/// listed is an error. Evaluates to `Ok(config)` or `Err(GridError)`.
///
/// Example:
/// ```no_compile
/// let config = parsed_config!(config_str => RingConfig; redundancy_level)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, $crate::GridError> {
            let mut config: $config_type = Default::default();
            let mut table = $crate::utils::config_table(config_str)?;
            $(
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into().map_err(|e| {
                        $crate::GridError::msg(format!(
                            "invalid value for '{}': {}",
                            stringify!($field),
                            e
                        ))
                    })?;
                }
            )+
            $crate::utils::reject_leftover(&table, stringify!($config_type))?;
            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::GridError;

    #[derive(Debug, PartialEq)]
    struct SampleConfig {
        retries: u8,
        label: String,
        backoff: f64,
    }

    impl Default for SampleConfig {
        fn default() -> Self {
            SampleConfig {
                retries: 3,
                label: "ring".into(),
                backoff: 0.5,
            }
        }
    }

    #[test]
    fn absent_or_blank_gives_defaults() -> Result<(), GridError> {
        let config =
            parsed_config!(None => SampleConfig; retries, label, backoff)?;
        assert_eq!(config, SampleConfig::default());
        let config =
            parsed_config!(Some("  \n") => SampleConfig; retries, label)?;
        assert_eq!(config.retries, 3);
        assert_eq!(config.label, "ring");
        assert_eq!(config.backoff, 0.5);
        Ok(())
    }

    #[test]
    fn overwrites_listed_fields() -> Result<(), GridError> {
        let config_str = Some("label = 'buddy'\nretries = 9");
        let config =
            parsed_config!(config_str => SampleConfig; retries, label)?;
        assert_eq!(
            config,
            SampleConfig {
                retries: 9,
                label: "buddy".into(),
                backoff: 0.5,
            }
        );
        Ok(())
    }

    #[test]
    fn rejects_unlisted_field() {
        let config_str = Some("backoff = 1.5");
        let err = parsed_config!(config_str => SampleConfig; retries, label)
            .unwrap_err();
        assert!(err.to_string().contains("'backoff'"));
        assert!(err.to_string().contains("SampleConfig"));
    }

    #[test]
    fn rejects_bad_value() {
        let err = parsed_config!(Some("retries = 300") => SampleConfig; retries)
            .unwrap_err();
        assert!(err.to_string().contains("'retries'"));
        assert!(
            parsed_config!(Some("label = [1, 2") => SampleConfig; label).is_err()
        );
    }
}
