//! Field-level mutations of a configuration spec and their inverse.
//!
//! A [`ConfigurationChange`] names the fields to set or unset. When it is
//! applied, the prior values are captured so that [`restoration`] can put
//! the spec back exactly as it was. A field that did not exist is recorded as
//! absent at its shallowest missing ancestor: setting `a.b.c` on a spec with
//! no `a.b` creates `a.b`, and restoring removes `a.b` again.
//!
//! [`restoration`]: ConfigurationChange::restoration

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};

use tunecheck_common::{Error, Result};

/// Dotted path into a configuration spec (`hardwareTuning.isolatedCpuFreq`)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Parse a dotted path. Empty paths and empty segments are rejected.
    pub fn parse(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(Error::validation("empty field path"));
        }
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(Error::validation_for_field(
                path,
                format!("empty segment in field path {path:?}"),
            ));
        }
        Ok(Self { segments })
    }

    /// Path segments, outermost first
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Whether `self` is `other` or one of its ancestors
    pub fn is_prefix_of(&self, other: &FieldPath) -> bool {
        other.segments.starts_with(&self.segments)
    }

    fn prefix(&self, len: usize) -> FieldPath {
        FieldPath {
            segments: self.segments[..len].to_vec(),
        }
    }

    /// Value at this path, if every segment resolves
    pub fn lookup<'a>(&self, spec: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(spec, |value, segment| value.get(segment))
    }

    fn set(&self, spec: &mut Value, value: Value) -> Result<()> {
        let (last, parents) = self.split_last()?;
        let mut current = spec;
        for segment in parents {
            let object = self.as_object_mut(current)?;
            current = object
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        self.as_object_mut(current)?.insert(last.clone(), value);
        Ok(())
    }

    fn remove(&self, spec: &mut Value) -> Result<()> {
        let (last, parents) = self.split_last()?;
        let mut current = spec;
        for segment in parents {
            match current.get_mut(segment) {
                Some(next) => current = next,
                None => return Ok(()),
            }
        }
        self.as_object_mut(current)?.remove(last);
        Ok(())
    }

    fn split_last(&self) -> Result<(&String, &[String])> {
        self.segments
            .split_last()
            .ok_or_else(|| Error::validation("empty field path"))
    }

    fn as_object_mut<'a>(&self, value: &'a mut Value) -> Result<&'a mut Map<String, Value>> {
        value.as_object_mut().ok_or_else(|| {
            Error::validation_for_field(
                self.to_string(),
                format!("cannot descend into non-object value along {self}"),
            )
        })
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl FromStr for FieldPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Field values keyed by path. `None` means the field is absent.
pub type FieldValues = BTreeMap<FieldPath, Option<Value>>;

/// A named set of field mutations on a managed configuration object
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigurationChange {
    name: String,
    desired: FieldValues,
    original: Option<FieldValues>,
}

impl ConfigurationChange {
    /// Create an empty change
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            desired: FieldValues::new(),
            original: None,
        }
    }

    /// Set `path` to `value`
    pub fn set(self, path: &str, value: impl Into<Value>) -> Result<Self> {
        self.with_field(FieldPath::parse(path)?, Some(value.into()))
    }

    /// Remove `path`
    pub fn unset(self, path: &str) -> Result<Self> {
        self.with_field(FieldPath::parse(path)?, None)
    }

    fn with_field(mut self, path: FieldPath, value: Option<Value>) -> Result<Self> {
        if let Some(existing) = self
            .desired
            .keys()
            .find(|p| p.is_prefix_of(&path) || path.is_prefix_of(p))
        {
            return Err(Error::validation_for_field(
                path.to_string(),
                format!(
                    "field path {path} overlaps {existing} in change {}",
                    self.name
                ),
            ));
        }
        self.desired.insert(path, value);
        Ok(self)
    }

    /// Name used in logs and errors
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Desired field values
    pub fn desired(&self) -> &FieldValues {
        &self.desired
    }

    /// Values captured before the change was applied, if it has been
    pub fn original(&self) -> Option<&FieldValues> {
        self.original.as_ref()
    }

    /// Whether the change mutates nothing
    pub fn is_empty(&self) -> bool {
        self.desired.is_empty()
    }

    /// Record the current values of every desired field from `spec`.
    ///
    /// Only the first capture counts: re-applying a change must not overwrite
    /// the values it is supposed to restore.
    pub fn capture(&mut self, spec: &Value) -> Result<()> {
        if self.original.is_some() {
            return Ok(());
        }

        let mut original = FieldValues::new();
        for path in self.desired.keys() {
            let (key, value) = captured_value(path, spec)?;
            original.insert(key, value);
        }
        self.original = Some(original);
        Ok(())
    }

    /// Compute the spec that results from applying this change to `spec`
    pub fn apply_to(&self, spec: &Value) -> Result<Value> {
        let mut updated = spec.clone();
        for (path, value) in &self.desired {
            match value {
                Some(v) => path.set(&mut updated, v.clone())?,
                None => path.remove(&mut updated)?,
            }
        }
        Ok(updated)
    }

    /// The change that puts every captured field back
    pub fn restoration(&self) -> Result<ConfigurationChange> {
        let original = self.original.as_ref().ok_or_else(|| {
            Error::validation(format!(
                "change {} has no captured original to restore",
                self.name
            ))
        })?;
        Ok(ConfigurationChange {
            name: format!("{}-restore", self.name),
            desired: original.clone(),
            original: None,
        })
    }
}

/// Walk `path` in `spec`, returning the full path and its value when it
/// resolves, or the shallowest missing ancestor marked absent.
fn captured_value(path: &FieldPath, spec: &Value) -> Result<(FieldPath, Option<Value>)> {
    let mut current = spec;
    for (depth, segment) in path.segments().iter().enumerate() {
        let object = current.as_object().ok_or_else(|| {
            Error::validation_for_field(
                path.to_string(),
                format!(
                    "cannot descend into non-object value at {}",
                    path.prefix(depth)
                ),
            )
        })?;
        match object.get(segment) {
            Some(next) => current = next,
            None => return Ok((path.prefix(depth + 1), None)),
        }
    }
    Ok((path.clone(), Some(current.clone())))
}
