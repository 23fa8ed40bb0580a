//! Per-resource cache policy
//!
//! A [`CacheConfig`] describes one cacheable resource: which URIs it serves,
//! which generators compute its ids and metadata, and which request variables
//! ([`ConfigElement`]s) take part in the cache id, the dependency ids and the
//! invalidation ids. Policies are read once at setup and never change.

use crate::error::{FragmentError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Kind of request variable a [`ConfigElement`] reads
///
/// The numeric codes are part of the configuration format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ElementTypeRepr", into = "u8")]
#[repr(u8)]
pub enum ElementType {
    RequestParameter = 0,
    RequestAttribute = 1,
    SessionParameter = 2,
    Cookie = 3,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ElementTypeRepr {
    Code(u8),
    Name(String),
}

impl TryFrom<ElementTypeRepr> for ElementType {
    type Error = String;

    fn try_from(repr: ElementTypeRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            ElementTypeRepr::Code(code) => ElementType::from_code(code)
                .ok_or_else(|| format!("element type code must be 0-3, got {}", code)),
            ElementTypeRepr::Name(name) => match name.as_str() {
                "request_parameter" | "parameter" => Ok(ElementType::RequestParameter),
                "request_attribute" | "attribute" => Ok(ElementType::RequestAttribute),
                "session_parameter" | "session" => Ok(ElementType::SessionParameter),
                "cookie" => Ok(ElementType::Cookie),
                other => Err(format!("unknown element type '{}'", other)),
            },
        }
    }
}

impl From<ElementType> for u8 {
    fn from(ty: ElementType) -> u8 {
        ty.code()
    }
}

impl ElementType {
    /// Numeric code of this type (0-3)
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Map a numeric code back to its type
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ElementType::RequestParameter),
            1 => Some(ElementType::RequestAttribute),
            2 => Some(ElementType::SessionParameter),
            3 => Some(ElementType::Cookie),
            _ => None,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::RequestParameter => "request_parameter",
            ElementType::RequestAttribute => "request_attribute",
            ElementType::SessionParameter => "session_parameter",
            ElementType::Cookie => "cookie",
        };
        f.write_str(name)
    }
}

/// One request variable taking part in id, dependency or invalidation generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigElement {
    #[serde(rename = "type")]
    element_type: ElementType,
    id: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    data_id: Option<String>,
    #[serde(default)]
    invalidate: Option<String>,
    #[serde(default)]
    exclude: BTreeSet<String>,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    exclude_all: bool,
    #[serde(default)]
    ignore_value: bool,
}

impl ConfigElement {
    /// Create an element reading variable `id` of the given kind
    pub fn new(element_type: ElementType, id: impl Into<String>) -> Self {
        ConfigElement {
            element_type,
            id: id.into(),
            method: None,
            data_id: None,
            invalidate: None,
            exclude: BTreeSet::new(),
            required: false,
            exclude_all: false,
            ignore_value: false,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_data_id(mut self, data_id: impl Into<String>) -> Self {
        self.data_id = Some(data_id.into());
        self
    }

    pub fn with_invalidate(mut self, invalidate: impl Into<String>) -> Self {
        self.invalidate = Some(invalidate.into());
        self
    }

    pub fn with_exclude<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn exclude_all(mut self, exclude_all: bool) -> Self {
        self.exclude_all = exclude_all;
        self
    }

    pub fn ignore_value(mut self, ignore_value: bool) -> Self {
        self.ignore_value = ignore_value;
        self
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn data_id(&self) -> Option<&str> {
        self.data_id.as_deref()
    }

    pub fn invalidate(&self) -> Option<&str> {
        self.invalidate.as_deref()
    }

    pub fn exclude(&self) -> &BTreeSet<String> {
        &self.exclude
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_exclude_all(&self) -> bool {
        self.exclude_all
    }

    pub fn is_ignore_value(&self) -> bool {
        self.ignore_value
    }

    /// Check whether a value is excluded from caching by this element
    pub fn excludes(&self, value: &str) -> bool {
        self.exclude.contains(value)
    }
}

/// Visibility scope of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharingPolicy {
    /// Entry lives only in this process
    #[default]
    NotShared,
    SharedPush,
    SharedPull,
    SharedPushPull,
}

/// Cache policy for one cacheable resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Resource name, used in logs and as the default template
    pub name: String,

    /// Registry name of the id generator (default: "default")
    #[serde(default = "default_generator")]
    pub id_generator: String,

    /// Registry name of the metadata generator (default: "default")
    #[serde(default = "default_generator")]
    pub metadata_generator: String,

    /// URIs served by this resource
    #[serde(default)]
    pub uris: Vec<String>,

    /// Request variables, in declaration order
    #[serde(default)]
    pub elements: Vec<ConfigElement>,

    /// Resource only fires invalidations and is never cached
    #[serde(default)]
    pub invalidate_only: bool,

    /// Eviction priority (default: store default)
    #[serde(default)]
    pub priority: Option<i32>,

    #[serde(default)]
    pub sharing_policy: SharingPolicy,

    /// External cache group entries of this resource are pushed to
    #[serde(default)]
    pub external_cache: Option<String>,

    /// Time limit in seconds (0 = no limit)
    #[serde(default)]
    pub timeout: u64,

    /// Inactivity timeout in seconds (0 = none)
    #[serde(default)]
    pub inactivity: u64,

    /// Replay request attributes set while rendering on every hit
    #[serde(default)]
    pub store_attributes: bool,

    /// Replay cookies set while rendering on every hit
    #[serde(default)]
    pub store_cookies: bool,

    /// Inline the output of nested fragments into this entry
    #[serde(default)]
    pub consume_subfragments: bool,

    /// Do not append the request method to generated ids
    #[serde(default)]
    pub ignore_get_post: bool,
}

fn default_generator() -> String {
    "default".to_string()
}

impl CacheConfig {
    /// Create a policy for `name` serving the given URIs, with default settings
    pub fn new<I, S>(name: impl Into<String>, uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CacheConfig {
            name: name.into(),
            id_generator: default_generator(),
            metadata_generator: default_generator(),
            uris: uris.into_iter().map(Into::into).collect(),
            elements: Vec::new(),
            invalidate_only: false,
            priority: None,
            sharing_policy: SharingPolicy::default(),
            external_cache: None,
            timeout: 0,
            inactivity: 0,
            store_attributes: false,
            store_cookies: false,
            consume_subfragments: false,
            ignore_get_post: false,
        }
    }

    pub fn with_element(mut self, element: ConfigElement) -> Self {
        self.elements.push(element);
        self
    }

    fn elements_of(&self, ty: ElementType) -> Vec<&ConfigElement> {
        self.elements
            .iter()
            .filter(|e| e.element_type() == ty)
            .collect()
    }

    pub fn request_parameters(&self) -> Vec<&ConfigElement> {
        self.elements_of(ElementType::RequestParameter)
    }

    pub fn request_attributes(&self) -> Vec<&ConfigElement> {
        self.elements_of(ElementType::RequestAttribute)
    }

    pub fn session_parameters(&self) -> Vec<&ConfigElement> {
        self.elements_of(ElementType::SessionParameter)
    }

    pub fn cookies(&self) -> Vec<&ConfigElement> {
        self.elements_of(ElementType::Cookie)
    }

    /// Validate the policy
    ///
    /// # Validation Rules
    /// - name must not be empty
    /// - at least one URI, each starting with '/'
    /// - element ids must not be empty
    /// - an element cannot be both `required` and `exclude_all`
    /// - an `invalidate_only` resource must declare an `invalidate` element
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FragmentError::ConfigError(
                "cache entry name must not be empty".to_string(),
            ));
        }

        if self.uris.is_empty() {
            return Err(FragmentError::ConfigError(format!(
                "cache entry '{}' must declare at least one uri",
                self.name
            )));
        }

        if let Some(uri) = self.uris.iter().find(|u| !u.starts_with('/')) {
            return Err(FragmentError::ConfigError(format!(
                "cache entry '{}' has uri '{}' not starting with '/'",
                self.name, uri
            )));
        }

        for element in &self.elements {
            if element.id().trim().is_empty() {
                return Err(FragmentError::ConfigError(format!(
                    "cache entry '{}' has a {} element with an empty id",
                    self.name,
                    element.element_type()
                )));
            }
            if element.is_required() && element.is_exclude_all() {
                return Err(FragmentError::ConfigError(format!(
                    "cache entry '{}': element '{}' cannot be both required and exclude_all",
                    self.name,
                    element.id()
                )));
            }
        }

        if self.invalidate_only && !self.elements.iter().any(|e| e.invalidate().is_some()) {
            return Err(FragmentError::ConfigError(format!(
                "cache entry '{}' is invalidate_only but declares no invalidate element",
                self.name
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_accessors_return_constructed_values() {
        let element = ConfigElement::new(ElementType::Cookie, "lang")
            .with_method("code")
            .with_data_id("language")
            .with_invalidate("language")
            .with_exclude(["xx", "yy"])
            .required(true)
            .ignore_value(true);

        assert_eq!(element.element_type(), ElementType::Cookie);
        assert_eq!(element.element_type().code(), 3);
        assert_eq!(element.id(), "lang");
        assert_eq!(element.method(), Some("code"));
        assert_eq!(element.data_id(), Some("language"));
        assert_eq!(element.invalidate(), Some("language"));
        assert!(element.excludes("xx"));
        assert!(!element.excludes("en"));
        assert!(element.is_required());
        assert!(!element.is_exclude_all());
        assert!(element.is_ignore_value());
    }

    #[test]
    fn test_element_type_codes() {
        for code in 0u8..4 {
            let ty = ElementType::from_code(code).unwrap();
            assert_eq!(ty.code(), code);
        }
        assert!(ElementType::from_code(4).is_none());
    }

    #[test]
    fn test_element_type_from_yaml_code_and_name() {
        let by_code: ConfigElement = serde_yaml::from_str("type: 2\nid: user").unwrap();
        assert_eq!(by_code.element_type(), ElementType::SessionParameter);

        let by_name: ConfigElement = serde_yaml::from_str("type: attribute\nid: user").unwrap();
        assert_eq!(by_name.element_type(), ElementType::RequestAttribute);

        let bad: std::result::Result<ConfigElement, _> = serde_yaml::from_str("type: 7\nid: user");
        assert!(bad.is_err());
    }

    #[test]
    fn test_elements_grouped_by_type() {
        let config = CacheConfig::new("weather", ["/weather"])
            .with_element(ConfigElement::new(ElementType::RequestParameter, "city"))
            .with_element(ConfigElement::new(ElementType::Cookie, "units"))
            .with_element(ConfigElement::new(ElementType::RequestParameter, "day"));

        let params: Vec<&str> = config.request_parameters().iter().map(|e| e.id()).collect();
        assert_eq!(params, vec!["city", "day"]);
        assert_eq!(config.cookies().len(), 1);
        assert!(config.session_parameters().is_empty());
        assert!(config.request_attributes().is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_policies() {
        assert!(CacheConfig::new("", ["/a"]).validate().is_err());
        assert!(CacheConfig::new("a", Vec::<String>::new()).validate().is_err());
        assert!(CacheConfig::new("a", ["a"]).validate().is_err());

        let conflicting = CacheConfig::new("a", ["/a"]).with_element(
            ConfigElement::new(ElementType::RequestParameter, "p")
                .required(true)
                .exclude_all(true),
        );
        assert!(conflicting.validate().is_err());

        let mut invalidator = CacheConfig::new("a", ["/a"]);
        invalidator.invalidate_only = true;
        assert!(invalidator.validate().is_err());

        let invalidator = invalidator.with_element(
            ConfigElement::new(ElementType::RequestParameter, "city").with_invalidate("city"),
        );
        assert!(invalidator.validate().is_ok());
    }
}
