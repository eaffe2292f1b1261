use crate::context::RequestContext;
use crate::payload::InboundPayload;
use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, Serializer};

/// How much of the request context a sink wants in its documents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FieldSet {
    /// user agent, referrer and country
    Basic,
    /// `Basic` plus city, continent, coordinates, postal code and region
    Extended,
}

impl FieldSet {
    fn includes(self, other: FieldSet) -> bool {
        self >= other
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    String(String),
    Integer(i64),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// ISO-8601 with millisecond precision and a `Z` suffix.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::String(s) => serializer.serialize_str(s),
            FieldValue::Integer(i) => serializer.serialize_i64(*i),
            FieldValue::Timestamp(ts) => serializer.serialize_str(&format_timestamp(ts)),
        }
    }
}

/// The enriched page view forwarded to a sink. Fields keep insertion order
/// and absent optional values are left out entirely.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewEvent {
    fields: IndexMap<&'static str, FieldValue>,
}

impl ViewEvent {
    pub fn build(
        payload: InboundPayload,
        timezone: String,
        context: &RequestContext,
        field_set: FieldSet,
        default_data_center: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let data_center = context
            .data_center_code
            .clone()
            .unwrap_or_else(|| default_data_center.to_owned());

        let mut fields = IndexMap::from([
            ("hostname", FieldValue::String(payload.hostname)),
            ("pathname", FieldValue::String(payload.pathname)),
            (
                "windowInnerWidth",
                FieldValue::Integer(payload.window_inner_width),
            ),
            ("timezone", FieldValue::String(timezone)),
            ("dataCenterCode", FieldValue::String(data_center)),
            ("timestamp", FieldValue::Timestamp(timestamp)),
        ]);

        let optional = [
            (FieldSet::Basic, "userAgent", context.user_agent.as_deref()),
            (FieldSet::Basic, "referrer", payload.referrer.as_deref()),
            (FieldSet::Basic, "countryCode", context.country_code.as_deref()),
            (FieldSet::Extended, "city", context.city.as_deref()),
            (FieldSet::Extended, "continentCode", context.continent_code.as_deref()),
            (FieldSet::Extended, "latitude", context.latitude.as_deref()),
            (FieldSet::Extended, "longitude", context.longitude.as_deref()),
            (FieldSet::Extended, "postalCode", context.postal_code.as_deref()),
            (FieldSet::Extended, "region", context.region.as_deref()),
            (FieldSet::Extended, "regionCode", context.region_code.as_deref()),
        ];

        for (required_set, name, value) in optional {
            if field_set.includes(required_set)
                && let Some(value) = value.filter(|v| !v.is_empty())
            {
                fields.insert(name, FieldValue::String(value.to_owned()));
            }
        }

        ViewEvent { fields }
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&'static str, &FieldValue)> {
        self.fields.iter().map(|(name, value)| (*name, value))
    }

    pub fn field_names(&self) -> Vec<&'static str> {
        self.fields.keys().copied().collect()
    }
}

impl Serialize for ViewEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}
