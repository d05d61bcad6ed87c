//! Translate structured JSON:API request descriptions into URL query parameters.
//!
//! A [`RequestSpec`] describes one logical API call: an endpoint, an optional
//! reporting name, and any combination of filters, sparse fieldsets, includes and
//! a sort order. [`RequestSpec::build`] serializes it following the JSON:API query
//! convention:
//!
//! ```rust
//! use apiswarm::query::RequestSpec;
//!
//! let request = RequestSpec::new("/schedules")
//!     .set_name("/schedules (heavy rail)")
//!     .set_filter("route", ["Red", "Blue"])
//!     .set_filter("direction_id", 0)
//!     .set_include(["stop", "trip"])
//!     .set_sort("arrival_time")
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(request.param("filter[route]"), Some("Red,Blue"));
//! assert_eq!(request.param("filter[direction_id]"), Some("0"));
//! assert_eq!(request.param("include"), Some("stop,trip"));
//! assert_eq!(request.param("sort"), Some("arrival_time"));
//! ```
//!
//! Building is pure: the same spec always produces the same parameters, in the
//! same order. Parameters that weren't set are never emitted.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::SwarmError;

/// A single filter or field value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarValue {
    Str(String),
    Int(i64),
    Bool(bool),
}
impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ScalarValue::Str(value) => write!(f, "{}", value),
            ScalarValue::Int(value) => write!(f, "{}", value),
            ScalarValue::Bool(value) => write!(f, "{}", value),
        }
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        ScalarValue::Str(value.to_string())
    }
}
impl From<String> for ScalarValue {
    fn from(value: String) -> Self {
        ScalarValue::Str(value)
    }
}
impl From<i64> for ScalarValue {
    fn from(value: i64) -> Self {
        ScalarValue::Int(value)
    }
}
impl From<i32> for ScalarValue {
    fn from(value: i32) -> Self {
        ScalarValue::Int(value.into())
    }
}
impl From<u32> for ScalarValue {
    fn from(value: u32) -> Self {
        ScalarValue::Int(value.into())
    }
}
impl From<bool> for ScalarValue {
    fn from(value: bool) -> Self {
        ScalarValue::Bool(value)
    }
}

/// The value of a `filter[...]` or `fields[...]` entry: one scalar, or an ordered list
/// of scalars joined with `,` when serialized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamValue {
    Scalar(ScalarValue),
    List(Vec<ScalarValue>),
}
impl ParamValue {
    /// Serialize the value as it appears in the query string. An empty list becomes an
    /// empty string.
    pub fn to_query_value(&self) -> String {
        match self {
            ParamValue::Scalar(value) => value.to_string(),
            ParamValue::List(values) => values.iter().join(","),
        }
    }
}

impl From<ScalarValue> for ParamValue {
    fn from(value: ScalarValue) -> Self {
        ParamValue::Scalar(value)
    }
}
impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Scalar(value.into())
    }
}
impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Scalar(value.into())
    }
}
impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Scalar(value.into())
    }
}
impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Scalar(value.into())
    }
}
impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        ParamValue::Scalar(value.into())
    }
}
impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Scalar(value.into())
    }
}
impl From<Vec<ScalarValue>> for ParamValue {
    fn from(values: Vec<ScalarValue>) -> Self {
        ParamValue::List(values)
    }
}
impl From<Vec<&str>> for ParamValue {
    fn from(values: Vec<&str>) -> Self {
        ParamValue::List(values.into_iter().map(ScalarValue::from).collect())
    }
}
impl From<Vec<String>> for ParamValue {
    fn from(values: Vec<String>) -> Self {
        ParamValue::List(values.into_iter().map(ScalarValue::from).collect())
    }
}
impl From<&[&str]> for ParamValue {
    fn from(values: &[&str]) -> Self {
        ParamValue::List(values.iter().map(|value| ScalarValue::from(*value)).collect())
    }
}
impl<const N: usize> From<[&str; N]> for ParamValue {
    fn from(values: [&str; N]) -> Self {
        ParamValue::from(&values[..])
    }
}
impl<const N: usize> From<&[&str; N]> for ParamValue {
    fn from(values: &[&str; N]) -> Self {
        ParamValue::from(&values[..])
    }
}

/// The `include` parameter: a single relationship, or an ordered list of
/// relationships (dot-paths such as `trip.stops` are passed through).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Include {
    One(String),
    Many(Vec<String>),
}
impl Include {
    pub fn to_query_value(&self) -> String {
        match self {
            Include::One(relationship) => relationship.clone(),
            Include::Many(relationships) => relationships.join(","),
        }
    }
}

impl From<&str> for Include {
    fn from(relationship: &str) -> Self {
        Include::One(relationship.to_string())
    }
}
impl From<String> for Include {
    fn from(relationship: String) -> Self {
        Include::One(relationship)
    }
}
impl From<Vec<&str>> for Include {
    fn from(relationships: Vec<&str>) -> Self {
        Include::Many(relationships.into_iter().map(str::to_string).collect())
    }
}
impl From<Vec<String>> for Include {
    fn from(relationships: Vec<String>) -> Self {
        Include::Many(relationships)
    }
}
impl<const N: usize> From<[&str; N]> for Include {
    fn from(relationships: [&str; N]) -> Self {
        Include::Many(relationships.iter().map(|r| r.to_string()).collect())
    }
}

/// Describes one logical API call before serialization.
///
/// Filters and fields keep their insertion order; setting an existing key again
/// replaces its value in place.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSpec {
    /// Path of the resource, for example `/schedules`.
    pub endpoint: String,
    /// Optional reporting name, statistics are grouped by the endpoint if not set.
    pub name: Option<String>,
    /// Emitted as `filter[<key>]`.
    pub filters: Vec<(String, ParamValue)>,
    /// Emitted as `fields[<key>]`.
    pub fields: Vec<(String, ParamValue)>,
    /// Emitted as `include`.
    pub include: Option<Include>,
    /// Emitted as `sort`, a leading `-` requests descending order.
    pub sort: Option<String>,
}
impl RequestSpec {
    pub fn new(endpoint: &str) -> Self {
        RequestSpec {
            endpoint: endpoint.to_string(),
            ..Default::default()
        }
    }

    /// Set the name statistics for this request are grouped under.
    pub fn set_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn set_filter<V: Into<ParamValue>>(mut self, key: &str, value: V) -> Self {
        upsert(&mut self.filters, key, value.into());
        self
    }

    pub fn set_field<V: Into<ParamValue>>(mut self, key: &str, value: V) -> Self {
        upsert(&mut self.fields, key, value.into());
        self
    }

    pub fn set_include<I: Into<Include>>(mut self, include: I) -> Self {
        self.include = Some(include.into());
        self
    }

    pub fn set_sort(mut self, sort: &str) -> Self {
        self.sort = Some(sort.to_string());
        self
    }

    /// The name statistics are grouped under: the explicit name if set, otherwise
    /// the endpoint.
    pub fn reporting_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.endpoint)
    }

    /// Serialize into an [`ApiRequest`].
    ///
    /// Fails if the endpoint or any filter or field key is empty.
    pub fn build(&self) -> Result<ApiRequest, SwarmError> {
        if self.endpoint.is_empty() {
            return Err(self.invalid("endpoint must not be empty"));
        }

        let mut params = Vec::with_capacity(self.filters.len() + self.fields.len() + 2);
        for (key, value) in &self.filters {
            if key.is_empty() {
                return Err(self.invalid("filter keys must not be empty"));
            }
            params.push((format!("filter[{}]", key), value.to_query_value()));
        }
        for (key, value) in &self.fields {
            if key.is_empty() {
                return Err(self.invalid("field keys must not be empty"));
            }
            params.push((format!("fields[{}]", key), value.to_query_value()));
        }
        if let Some(include) = &self.include {
            params.push(("include".to_string(), include.to_query_value()));
        }
        if let Some(sort) = &self.sort {
            params.push(("sort".to_string(), sort.clone()));
        }

        Ok(ApiRequest {
            endpoint: self.endpoint.clone(),
            name: self.reporting_name().to_string(),
            params,
        })
    }

    fn invalid(&self, detail: &str) -> SwarmError {
        SwarmError::InvalidRequest {
            endpoint: self.endpoint.clone(),
            detail: detail.to_string(),
        }
    }
}

fn upsert(entries: &mut Vec<(String, ParamValue)>, key: &str, value: ParamValue) {
    match entries.iter_mut().find(|(existing, _)| existing == key) {
        Some(entry) => entry.1 = value,
        None => entries.push((key.to_string(), value)),
    }
}

/// A serialized request, ready to hand to a [`Transport`](../client/trait.Transport.html).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub endpoint: String,
    /// The name statistics for this request are grouped under.
    pub name: String,
    /// Query parameters in emission order: filters, fields, include, sort.
    pub params: Vec<(String, String)>,
}
impl ApiRequest {
    /// Look up a query parameter by its full key, for example `filter[route]`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}
