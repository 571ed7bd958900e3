//! Published-settings registry.
//!
//! Each job declares a static table of [`SettingSpec`]s. The [`Registry`]
//! holds the current values, remembers which ones changed since the last
//! flush and turns remote `.../set` payloads into typed values. Changes are
//! coalesced: however many times an attribute is written between two
//! flushes, at most one retained publish goes out, and none if the value ends
//! up equal to what was last published.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde_json::{json, Value};

use crate::error::SetError;

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datatype {
    Boolean,
    Float,
    Integer,
    Json,
    String,
}

impl Datatype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Float => "float",
            Self::Integer => "integer",
            Self::Json => "json",
            Self::String => "string",
        }
    }

    /// Whether an in-process value has this type. `Null` is accepted by
    /// every type and means "cleared".
    pub fn accepts(&self, v: &Value) -> bool {
        if v.is_null() {
            return true;
        }
        match self {
            Self::Boolean => v.is_boolean(),
            Self::Float => v.is_number(),
            Self::Integer => v.is_i64() || v.is_u64(),
            Self::Json => true,
            Self::String => v.is_string(),
        }
    }

    /// Parse a wire payload.
    pub fn parse(&self, payload: &str) -> Option<Value> {
        let p = payload.trim();
        match self {
            Self::Boolean => match p.to_ascii_lowercase().as_str() {
                "true" | "1" | "on" => Some(Value::Bool(true)),
                "false" | "0" | "off" => Some(Value::Bool(false)),
                _ => None,
            },
            Self::Float => p
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number)),
            Self::Integer => p.parse::<i64>().ok().map(Value::from),
            Self::Json => serde_json::from_str(p).ok(),
            Self::String => Some(Value::String(payload.to_string())),
        }
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingSpec {
    pub name: &'static str,
    pub datatype: Datatype,
    pub settable: bool,
    pub unit: Option<&'static str>,
}

impl SettingSpec {
    /// Read-only attribute.
    pub const fn new(name: &'static str, datatype: Datatype) -> Self {
        Self {
            name,
            datatype,
            settable: false,
            unit: None,
        }
    }

    pub const fn settable(mut self) -> Self {
        self.settable = true;
        self
    }

    pub const fn with_unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }
}

/// Wire form of a value: strings go out bare, `Null` as an empty payload.
pub fn encode(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Registry {
    specs: &'static [SettingSpec],
    values: BTreeMap<&'static str, Value>,
    published: BTreeMap<&'static str, Value>,
    dirty: BTreeSet<&'static str>,
}

impl Registry {
    pub fn new(specs: &'static [SettingSpec]) -> Self {
        Self {
            specs,
            values: BTreeMap::new(),
            published: BTreeMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    pub fn specs(&self) -> &'static [SettingSpec] {
        self.specs
    }

    pub fn spec(&self, name: &str) -> Option<&'static SettingSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name).filter(|v| !v.is_null())
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    /// Write a value from inside the job. Returns whether it changed.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<bool, SetError> {
        let spec = self
            .spec(name)
            .ok_or_else(|| SetError::Unknown(name.to_string()))?;
        let value = value.into();
        if !spec.datatype.accepts(&value) {
            return Err(SetError::TypeMismatch {
                name: name.to_string(),
                expected: spec.datatype.as_str(),
                got: value.to_string(),
            });
        }
        if self.values.get(spec.name) == Some(&value) {
            return Ok(false);
        }
        self.values.insert(spec.name, value);
        self.dirty.insert(spec.name);
        Ok(true)
    }

    /// Validate a remote `<attr>/set` payload without applying it.
    pub fn coerce(&self, name: &str, payload: &str) -> Result<Value, SetError> {
        let spec = self
            .spec(name)
            .ok_or_else(|| SetError::Unknown(name.to_string()))?;
        if !spec.settable {
            return Err(SetError::ReadOnly(name.to_string()));
        }
        spec.datatype
            .parse(payload)
            .ok_or_else(|| SetError::TypeMismatch {
                name: name.to_string(),
                expected: spec.datatype.as_str(),
                got: payload.to_string(),
            })
    }

    /// Changed attributes since the last flush, as `(name, payload)`.
    pub fn flush(&mut self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        for name in std::mem::take(&mut self.dirty) {
            let Some(v) = self.values.get(name) else {
                continue;
            };
            if self.published.get(name) == Some(v) {
                continue;
            }
            out.push((name, encode(v)));
            self.published.insert(name, v.clone());
        }
        out
    }

    /// Every attribute already on the broker, for announcing again after
    /// the broker lost track of the job.
    pub fn republish(&self) -> Vec<(&'static str, String)> {
        self.published
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (*k, encode(v)))
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Attributes that currently hold a retained value on the broker.
    pub fn clear_topics(&self) -> Vec<&'static str> {
        self.published
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, _)| *k)
            .collect()
    }

    /// Discovery document published retained on `$properties`.
    pub fn properties_document(&self, job: &str) -> Value {
        let props: serde_json::Map<String, Value> = self
            .specs
            .iter()
            .map(|s| {
                let mut p = json!({
                    "datatype": s.datatype.as_str(),
                    "settable": s.settable,
                });
                if let Some(u) = s.unit {
                    p["unit"] = Value::from(u);
                }
                (s.name.to_string(), p)
            })
            .collect();
        json!({ "job": job, "properties": props })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SPECS: &[SettingSpec] = &[
        SettingSpec::new("target_rpm", Datatype::Float)
            .settable()
            .with_unit("RPM"),
        SettingSpec::new("duty_cycle", Datatype::Float).with_unit("%"),
        SettingSpec::new("enabled", Datatype::Boolean).settable(),
        SettingSpec::new("count", Datatype::Integer).settable(),
        SettingSpec::new("automation", Datatype::Json).settable(),
        SettingSpec::new("label", Datatype::String).settable(),
    ];

    fn reg() -> Registry {
        Registry::new(SPECS)
    }

    // -- coalescing -----------------------------------------------------------

    #[test]
    fn many_writes_between_flushes_publish_once() {
        let mut r = reg();
        for v in [10.0, 20.0, 30.0] {
            r.set("duty_cycle", v).unwrap();
        }
        let out = r.flush();
        assert_eq!(out, vec![("duty_cycle", "30.0".to_string())]);
        assert!(r.flush().is_empty());
    }

    #[test]
    fn unchanged_value_is_not_republished() {
        let mut r = reg();
        r.set("duty_cycle", 30.0).unwrap();
        r.flush();
        assert!(!r.set("duty_cycle", 30.0).unwrap());
        assert!(r.flush().is_empty());
    }

    #[test]
    fn change_and_revert_within_a_tick_publishes_nothing() {
        let mut r = reg();
        r.set("duty_cycle", 30.0).unwrap();
        r.flush();
        r.set("duty_cycle", 40.0).unwrap();
        r.set("duty_cycle", 30.0).unwrap();
        assert!(r.flush().is_empty());
    }

    #[test]
    fn one_publish_per_changed_attribute() {
        let mut r = reg();
        r.set("duty_cycle", 30.0).unwrap();
        r.set("target_rpm", 500.0).unwrap();
        let names: Vec<_> = r.flush().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["duty_cycle", "target_rpm"]);
    }

    #[test]
    fn republish_returns_what_the_broker_holds() {
        let mut r = reg();
        r.set("duty_cycle", 30.0).unwrap();
        r.set("target_rpm", 500.0).unwrap();
        r.flush();
        r.set("label", "pending").unwrap();
        assert_eq!(
            r.republish(),
            vec![
                ("duty_cycle", "30.0".to_string()),
                ("target_rpm", "500.0".to_string())
            ]
        );
        // announcing again does not consume pending changes
        assert_eq!(r.flush(), vec![("label", "pending".to_string())]);
    }

    // -- in-process writes ----------------------------------------------------

    #[test]
    fn set_rejects_unknown_and_mistyped() {
        let mut r = reg();
        assert_eq!(
            r.set("nope", 1.0).unwrap_err(),
            SetError::Unknown("nope".into())
        );
        assert!(matches!(
            r.set("enabled", 1.0).unwrap_err(),
            SetError::TypeMismatch { .. }
        ));
    }

    #[test]
    fn typed_getters() {
        let mut r = reg();
        r.set("target_rpm", 500.0).unwrap();
        r.set("enabled", true).unwrap();
        r.set("count", 3).unwrap();
        assert_eq!(r.get_f64("target_rpm"), Some(500.0));
        assert_eq!(r.get_bool("enabled"), Some(true));
        assert_eq!(r.get_i64("count"), Some(3));
        assert_eq!(r.get_f64("duty_cycle"), None);
    }

    // -- remote sets ----------------------------------------------------------

    #[test]
    fn coerce_parses_each_datatype() {
        let r = reg();
        assert_eq!(r.coerce("target_rpm", "450").unwrap(), json!(450.0));
        assert_eq!(r.coerce("enabled", "false").unwrap(), json!(false));
        assert_eq!(r.coerce("count", " 7 ").unwrap(), json!(7));
        assert_eq!(
            r.coerce("automation", r#"{"automation_name":"silent"}"#).unwrap(),
            json!({"automation_name": "silent"})
        );
        assert_eq!(r.coerce("label", "hello").unwrap(), json!("hello"));
    }

    #[test]
    fn coerce_rejects_type_mismatch() {
        let r = reg();
        for (name, payload) in [
            ("target_rpm", "fast"),
            ("target_rpm", "NaN"),
            ("enabled", "maybe"),
            ("count", "1.5"),
            ("automation", "{not json"),
        ] {
            assert!(
                matches!(r.coerce(name, payload), Err(SetError::TypeMismatch { .. })),
                "{name}={payload} should be rejected"
            );
        }
    }

    #[test]
    fn coerce_rejects_read_only_and_unknown() {
        let r = reg();
        assert_eq!(
            r.coerce("duty_cycle", "10").unwrap_err(),
            SetError::ReadOnly("duty_cycle".into())
        );
        assert_eq!(
            r.coerce("ghost", "10").unwrap_err(),
            SetError::Unknown("ghost".into())
        );
    }

    // -- discovery & clearing -------------------------------------------------

    #[test]
    fn properties_document_lists_every_attribute() {
        let doc = reg().properties_document("stirring");
        assert_eq!(doc["job"], "stirring");
        assert_eq!(doc["properties"]["target_rpm"]["datatype"], "float");
        assert_eq!(doc["properties"]["target_rpm"]["settable"], true);
        assert_eq!(doc["properties"]["target_rpm"]["unit"], "RPM");
        assert_eq!(doc["properties"]["duty_cycle"]["settable"], false);
        assert_eq!(doc["properties"].as_object().unwrap().len(), SPECS.len());
    }

    #[test]
    fn clear_topics_lists_only_published() {
        let mut r = reg();
        r.set("duty_cycle", 30.0).unwrap();
        r.set("target_rpm", 400.0).unwrap();
        assert!(r.clear_topics().is_empty());
        r.flush();
        r.set("enabled", true).unwrap();
        assert_eq!(r.clear_topics(), vec!["duty_cycle", "target_rpm"]);
    }

    #[test]
    fn encode_strips_string_quotes_and_clears_null() {
        assert_eq!(encode(&json!("ready")), "ready");
        assert_eq!(encode(&json!(1.5)), "1.5");
        assert_eq!(encode(&Value::Null), "");
        assert_eq!(encode(&json!({"a": 1})), r#"{"a":1}"#);
    }
}
