//! Channel Addresses
//!
//! The canonical text form of a session's subscription:
//!
//! ```text
//! ds/<datasource uid>/topic=<topic>.useInterval=<bool>.includeSchema=<bool>.interval=<duration>
//! ```
//!
//! The host platform stores this string and hands it back when it opens a
//! stream, so encoding and decoding must be exact inverses.
//!
//! Decoding splits the path on `.` and each segment on its first `=`. A
//! segment without `=` continues the previous value, which keeps dotted
//! topics (`plant.line1`) and fractional durations (`1.5s`) intact. Unknown
//! keys are ignored.

use std::fmt;
use std::str::FromStr;

use super::SubscriptionModel;
use super::duration::{DurationError, parse_duration};

const PREFIX: &str = "ds/";

/// Channel address decode error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    /// Address does not start with `ds/<uid>/`.
    #[error("channel address {0:?} is missing the ds/<uid>/ prefix")]
    MissingPrefix(String),
    /// A boolean option is not a valid boolean literal.
    #[error("invalid boolean {value:?} for {key}")]
    InvalidBool {
        /// Option name.
        key: String,
        /// Offending value.
        value: String,
    },
    /// The interval is not a valid duration literal.
    #[error("invalid interval: {0}")]
    InvalidDuration(#[from] DurationError),
}

/// A datasource-scoped channel address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelAddress {
    /// UID of the datasource instance that owns the stream.
    pub datasource_uid: String,
    /// Subscription carried by the address.
    pub model: SubscriptionModel,
}

impl ChannelAddress {
    /// Create an address for a model under a datasource.
    #[must_use]
    pub fn new(datasource_uid: impl Into<String>, model: SubscriptionModel) -> Self {
        Self {
            datasource_uid: datasource_uid.into(),
            model,
        }
    }

    /// The path part of the address, as passed to stream handlers.
    #[must_use]
    pub fn path(&self) -> String {
        self.model.to_path()
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}/{}", self.datasource_uid, self.model.to_path())
    }
}

impl FromStr for ChannelAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (datasource_uid, path) =
            split_prefix(s).ok_or_else(|| AddressError::MissingPrefix(s.to_string()))?;

        Ok(Self {
            datasource_uid: datasource_uid.to_string(),
            model: decode_fields(path)?,
        })
    }
}

/// Split `ds/<uid>/<path>` into uid and path.
fn split_prefix(address: &str) -> Option<(&str, &str)> {
    let rest = address.strip_prefix(PREFIX)?;
    let (uid, path) = rest.split_once('/')?;
    if uid.is_empty() {
        return None;
    }
    Some((uid, path))
}

/// Decode either a full address or a bare path into a model.
pub(super) fn decode_path(path: &str) -> Result<SubscriptionModel, AddressError> {
    let path = split_prefix(path).map_or(path, |(_, rest)| rest);
    decode_fields(path)
}

fn decode_fields(path: &str) -> Result<SubscriptionModel, AddressError> {
    let mut fields: Vec<(&str, String)> = Vec::new();

    for segment in path.split('.') {
        if let Some((key, value)) = segment.split_once('=') {
            fields.push((key, value.to_string()));
        } else if let Some((_, value)) = fields.last_mut() {
            value.push('.');
            value.push_str(segment);
        }
    }

    let mut model = SubscriptionModel::default();
    for (key, value) in fields {
        match key {
            "topic" => model.topic = value,
            "useInterval" => model.use_interval = parse_bool(key, &value)?,
            "includeSchema" => model.include_schema = parse_bool(key, &value)?,
            "interval" => {
                let interval = parse_duration(&value)?;
                model.interval_millis = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
            }
            _ => {}
        }
    }

    Ok(model)
}

fn parse_bool(key: &str, value: &str) -> Result<bool, AddressError> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(AddressError::InvalidBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn encodes_default_model() {
        let address = ChannelAddress::new("1", SubscriptionModel::new("top"));
        assert_eq!(
            address.to_string(),
            "ds/1/topic=top.useInterval=false.includeSchema=false.interval=0s"
        );
    }

    #[test]
    fn encodes_all_options() {
        let model = SubscriptionModel::new("sensors/+/temp")
            .with_schema(true)
            .with_interval(Duration::from_millis(1_500));
        let address = ChannelAddress::new("abc", model);
        assert_eq!(
            address.to_string(),
            "ds/abc/topic=sensors/+/temp.useInterval=true.includeSchema=true.interval=1.5s"
        );
    }

    #[test]
    fn decodes_full_address() {
        let address: ChannelAddress =
            "ds/uid-7/topic=a/b.useInterval=true.includeSchema=false.interval=500ms"
                .parse()
                .unwrap();
        assert_eq!(address.datasource_uid, "uid-7");
        assert_eq!(address.model.topic, "a/b");
        assert!(address.model.use_interval);
        assert!(!address.model.include_schema);
        assert_eq!(address.model.interval_millis, 500);
    }

    #[test]
    fn decodes_bare_path() {
        let model = SubscriptionModel::from_path(
            "topic=08:08.useInterval=false.includeSchema=true.interval=0s",
        )
        .unwrap();
        assert_eq!(model.topic, "08:08");
        assert!(model.include_schema);
    }

    #[test]
    fn dotted_topic_round_trips() {
        let model = SubscriptionModel::new("plant.line1.temp").with_schema(true);
        let decoded = SubscriptionModel::from_path(&model.to_path()).unwrap();
        assert_eq!(decoded, model);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let model =
            SubscriptionModel::from_path("topic=t.colour=blue.useInterval=true.interval=1s")
                .unwrap();
        assert_eq!(model.topic, "t");
        assert!(model.use_interval);
        assert_eq!(model.interval_millis, 1_000);
    }

    #[test]
    fn accepts_alternate_bool_spellings() {
        let model = SubscriptionModel::from_path("topic=t.useInterval=1.includeSchema=T").unwrap();
        assert!(model.use_interval);
        assert!(model.include_schema);
    }

    #[test]
    fn rejects_malformed_bool() {
        let err = SubscriptionModel::from_path("topic=t.useInterval=yes").unwrap_err();
        assert_eq!(
            err,
            AddressError::InvalidBool {
                key: "useInterval".to_string(),
                value: "yes".to_string()
            }
        );
    }

    #[test]
    fn rejects_malformed_duration() {
        let err = SubscriptionModel::from_path("topic=t.interval=soon").unwrap_err();
        assert!(matches!(err, AddressError::InvalidDuration(_)));
    }

    #[test]
    fn rejects_address_without_prefix() {
        let err = "topic=t.useInterval=false".parse::<ChannelAddress>().unwrap_err();
        assert!(matches!(err, AddressError::MissingPrefix(_)));

        let err = "ds//topic=t".parse::<ChannelAddress>().unwrap_err();
        assert!(matches!(err, AddressError::MissingPrefix(_)));
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(
            uid in "[a-zA-Z0-9_-]{1,12}",
            topic in "[a-zA-Z0-9/_:+#-]{1,16}(\\.[a-zA-Z0-9/_:-]{1,8}){0,2}",
            include_schema in any::<bool>(),
            use_interval in any::<bool>(),
            interval_millis in any::<u64>(),
        ) {
            let model = SubscriptionModel {
                topic,
                include_schema,
                use_interval,
                interval_millis,
            };
            let address = ChannelAddress::new(uid, model);

            let decoded: ChannelAddress = address.to_string().parse().unwrap();
            prop_assert_eq!(&decoded, &address);
            prop_assert_eq!(
                SubscriptionModel::from_path(&address.path()).unwrap(),
                address.model.clone()
            );
        }
    }
}
