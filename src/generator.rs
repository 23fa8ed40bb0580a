//! Cache id and metadata generation
//!
//! One [`IdGenerator`] and one [`MetaDataGenerator`] exist per cacheable
//! resource and are shared by every request for that resource, on every
//! worker thread. They are initialized once through `&mut self` and then
//! frozen behind an `Arc`, so all per-request state lives on the
//! [`CacheRequest`].

use crate::cache_config::{CacheConfig, ConfigElement, ElementType};
use crate::error::{FragmentError, Result};
use crate::request::CacheRequest;
use crate::response::CacheResponse;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Computes the cache id of a request
pub trait IdGenerator: Send + Sync {
    /// Prepare the generator for one resource; called once at registration
    fn initialize(&mut self, config: &CacheConfig) -> Result<()>;

    /// Cache id for this request, or `None` when the response must not be cached
    ///
    /// Implementations reading the body must wrap the read in
    /// `set_generating_id(true)` / `set_generating_id(false)`.
    fn get_id(&self, request: &mut CacheRequest) -> Option<String>;
}

/// Fills in the metadata of a newly built entry
pub trait MetaDataGenerator: Send + Sync {
    /// Prepare the generator for one resource; called once at registration
    fn initialize(&mut self, config: &CacheConfig) -> Result<()>;

    /// Populate the request's [`FragmentInfo`](crate::FragmentInfo)
    ///
    /// Called once per cache miss that builds an entry, never on a hit.
    fn set_metadata(&self, request: &mut CacheRequest, response: &CacheResponse) -> Result<()>;
}

/// Value of the request variable an element refers to
pub fn element_value(request: &CacheRequest, element: &ConfigElement) -> Option<String> {
    match element.element_type() {
        ElementType::RequestParameter => {
            let values = request.parameter_values(element.id());
            if values.is_empty() {
                None
            } else {
                Some(values.join(","))
            }
        }
        ElementType::RequestAttribute => {
            let value = request.attribute(element.id())?;
            let value = match element.method() {
                Some(field) => value.get(field)?,
                None => value,
            };
            render_value(value)
        }
        ElementType::SessionParameter => request.session_attribute(element.id()).map(String::from),
        ElementType::Cookie => request.cookie(element.id()).map(String::from),
    }
}

fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn keyed_ids<'a>(
    config: &'a CacheConfig,
    request: &CacheRequest,
    prefix: impl Fn(&'a ConfigElement) -> Option<&'a str>,
) -> Vec<String> {
    let mut ids = Vec::new();
    for element in &config.elements {
        let Some(key) = prefix(element) else {
            continue;
        };
        let id = if element.is_ignore_value() {
            key.to_string()
        } else {
            match element_value(request, element) {
                Some(value) => format!("{}:{}", key, value),
                None => continue,
            }
        };
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

/// Dependency ids (`data_id:value`) an entry built for this request depends on
pub fn dependency_ids(config: &CacheConfig, request: &CacheRequest) -> Vec<String> {
    keyed_ids(config, request, ConfigElement::data_id)
}

/// Invalidation ids (`invalidate:value`) this request fires
pub fn invalidation_ids(config: &CacheConfig, request: &CacheRequest) -> Vec<String> {
    keyed_ids(config, request, ConfigElement::invalidate)
}

/// Id generator driven by the resource's [`ConfigElement`]s
///
/// Ids have the shape `/uri:city=paris:units:requestType=GET`.
#[derive(Debug, Default)]
pub struct DefaultIdGenerator {
    config: Option<Arc<CacheConfig>>,
}

impl DefaultIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for DefaultIdGenerator {
    fn initialize(&mut self, config: &CacheConfig) -> Result<()> {
        config.validate()?;
        self.config = Some(Arc::new(config.clone()));
        Ok(())
    }

    fn get_id(&self, request: &mut CacheRequest) -> Option<String> {
        let Some(config) = &self.config else {
            warn!("Id generator used before initialization for {}", request.uri());
            return None;
        };

        let mut id = String::from(request.uri());
        for element in &config.elements {
            match element_value(request, element) {
                None if element.is_required() => {
                    debug!(
                        "Required {} '{}' missing, not caching {}",
                        element.element_type(),
                        element.id(),
                        request.uri()
                    );
                    return None;
                }
                None => {}
                Some(_) if element.is_exclude_all() => return None,
                Some(value) if element.excludes(&value) => return None,
                Some(_) if element.is_ignore_value() => {
                    id.push(':');
                    id.push_str(element.id());
                }
                Some(value) => {
                    id.push(':');
                    id.push_str(element.id());
                    id.push('=');
                    id.push_str(&value);
                }
            }
        }

        if !config.ignore_get_post {
            id.push_str(":requestType=");
            id.push_str(request.method().as_str());
        }

        Some(id)
    }
}

/// Metadata generator applying the resource's policy to every new entry
#[derive(Debug, Default)]
pub struct DefaultMetaDataGenerator {
    config: Option<Arc<CacheConfig>>,
}

impl DefaultMetaDataGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetaDataGenerator for DefaultMetaDataGenerator {
    fn initialize(&mut self, config: &CacheConfig) -> Result<()> {
        config.validate()?;
        self.config = Some(Arc::new(config.clone()));
        Ok(())
    }

    fn set_metadata(&self, request: &mut CacheRequest, _response: &CacheResponse) -> Result<()> {
        let config = self.config.as_ref().ok_or_else(|| {
            FragmentError::InternalError("metadata generator used before initialization".into())
        })?;

        let data_ids = dependency_ids(config, request);
        let uri = request.uri().to_string();
        let info = request.fragment_info_mut().ok_or_else(|| {
            FragmentError::InternalError(format!("no fragment under construction for {}", uri))
        })?;

        if config.timeout > 0 {
            info.set_time_limit(Duration::from_secs(config.timeout))?;
        }
        if config.inactivity > 0 {
            info.set_inactivity(Duration::from_secs(config.inactivity))?;
        }
        if let Some(priority) = config.priority {
            info.set_priority(priority)?;
        }
        info.set_sharing_policy(config.sharing_policy)?;
        if let Some(group) = &config.external_cache {
            info.set_external_cache_group_id(Some(group.clone()))?;
        }
        info.set_store_attributes(config.store_attributes)?;
        info.set_store_cookies(config.store_cookies)?;
        info.set_consume_subfragments(config.consume_subfragments)?;
        info.set_ignore_get_post(config.ignore_get_post)?;
        for data_id in data_ids {
            info.add_data_id(data_id)?;
        }
        Ok(())
    }
}

type IdGeneratorFactory = Arc<dyn Fn() -> Box<dyn IdGenerator> + Send + Sync>;
type MetaDataGeneratorFactory = Arc<dyn Fn() -> Box<dyn MetaDataGenerator> + Send + Sync>;

/// Named generator implementations a [`CacheConfig`] can refer to
#[derive(Clone)]
pub struct GeneratorRegistry {
    id_generators: HashMap<String, IdGeneratorFactory>,
    metadata_generators: HashMap<String, MetaDataGeneratorFactory>,
}

impl std::fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratorRegistry")
            .field("id_generators", &self.id_generators.keys().collect::<Vec<_>>())
            .field(
                "metadata_generators",
                &self.metadata_generators.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Default for GeneratorRegistry {
    fn default() -> Self {
        let mut registry = GeneratorRegistry {
            id_generators: HashMap::new(),
            metadata_generators: HashMap::new(),
        };
        registry.register_id_generator("default", || Box::new(DefaultIdGenerator::new()));
        registry.register_metadata_generator("default", || {
            Box::new(DefaultMetaDataGenerator::new())
        });
        registry
    }
}

impl GeneratorRegistry {
    /// Registry holding the `"default"` generators
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_id_generator<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn IdGenerator> + Send + Sync + 'static,
    {
        self.id_generators.insert(name.into(), Arc::new(factory));
    }

    pub fn register_metadata_generator<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn MetaDataGenerator> + Send + Sync + 'static,
    {
        self.metadata_generators.insert(name.into(), Arc::new(factory));
    }

    /// Create and initialize the id generator named by `config`
    pub fn id_generator_for(&self, config: &CacheConfig) -> Result<Arc<dyn IdGenerator>> {
        let factory = self.id_generators.get(&config.id_generator).ok_or_else(|| {
            FragmentError::UnknownGenerator {
                name: config.id_generator.clone(),
                resource: config.name.clone(),
            }
        })?;
        let mut generator = factory();
        generator.initialize(config)?;
        Ok(Arc::from(generator))
    }

    /// Create and initialize the metadata generator named by `config`
    pub fn metadata_generator_for(
        &self,
        config: &CacheConfig,
    ) -> Result<Arc<dyn MetaDataGenerator>> {
        let factory = self
            .metadata_generators
            .get(&config.metadata_generator)
            .ok_or_else(|| FragmentError::UnknownGenerator {
                name: config.metadata_generator.clone(),
                resource: config.name.clone(),
            })?;
        let mut generator = factory();
        generator.initialize(config)?;
        Ok(Arc::from(generator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment_info::FragmentInfo;
    use http::Method;
    use serde_json::json;

    fn weather_config() -> CacheConfig {
        CacheConfig::new("weather", ["/weather"])
            .with_element(
                ConfigElement::new(ElementType::RequestParameter, "city")
                    .required(true)
                    .with_data_id("city")
                    .with_exclude(["nowhere"]),
            )
            .with_element(ConfigElement::new(ElementType::Cookie, "units"))
    }

    fn generator(config: &CacheConfig) -> DefaultIdGenerator {
        let mut generator = DefaultIdGenerator::new();
        generator.initialize(config).unwrap();
        generator
    }

    #[test]
    fn test_id_includes_elements_and_method() {
        let generator = generator(&weather_config());
        let mut req = CacheRequest::new(Method::GET, "/weather")
            .with_parameter("city", "paris")
            .with_cookie("units", "metric");
        assert_eq!(
            generator.get_id(&mut req).as_deref(),
            Some("/weather:city=paris:units=metric:requestType=GET")
        );
    }

    #[test]
    fn test_missing_optional_element_is_skipped() {
        let generator = generator(&weather_config());
        let mut req = CacheRequest::new(Method::GET, "/weather").with_parameter("city", "oslo");
        assert_eq!(
            generator.get_id(&mut req).as_deref(),
            Some("/weather:city=oslo:requestType=GET")
        );
    }

    #[test]
    fn test_missing_required_element_means_no_cache() {
        let generator = generator(&weather_config());
        let mut req = CacheRequest::new(Method::GET, "/weather");
        assert!(generator.get_id(&mut req).is_none());
    }

    #[test]
    fn test_excluded_values() {
        let generator = generator(&weather_config());
        let mut req = CacheRequest::new(Method::GET, "/weather").with_parameter("city", "nowhere");
        assert!(generator.get_id(&mut req).is_none());

        let config = CacheConfig::new("p", ["/p"]).with_element(
            ConfigElement::new(ElementType::RequestParameter, "debug").exclude_all(true),
        );
        let generator = self::generator(&config);
        let mut req = CacheRequest::new(Method::GET, "/p").with_parameter("debug", "1");
        assert!(generator.get_id(&mut req).is_none());
        let mut req = CacheRequest::new(Method::GET, "/p");
        assert!(generator.get_id(&mut req).is_some());
    }

    #[test]
    fn test_ignore_get_post_drops_request_type() {
        let mut config = weather_config();
        config.ignore_get_post = true;
        let generator = generator(&config);
        let mut req = CacheRequest::new(Method::POST, "/weather").with_parameter("city", "rome");
        assert_eq!(generator.get_id(&mut req).as_deref(), Some("/weather:city=rome"));
    }

    #[test]
    fn test_attribute_method_selects_field() {
        let config = CacheConfig::new("cart", ["/cart"]).with_element(
            ConfigElement::new(ElementType::RequestAttribute, "user").with_method("tier"),
        );
        let generator = generator(&config);
        let mut req = CacheRequest::new(Method::GET, "/cart")
            .with_attribute("user", json!({"name": "alice", "tier": "gold"}));
        assert_eq!(
            generator.get_id(&mut req).as_deref(),
            Some("/cart:user=gold:requestType=GET")
        );
    }

    #[test]
    fn test_uninitialized_generator_does_not_cache() {
        let generator = DefaultIdGenerator::new();
        let mut req = CacheRequest::new(Method::GET, "/weather");
        assert!(generator.get_id(&mut req).is_none());
    }

    #[test]
    fn test_dependency_and_invalidation_ids() {
        let config = CacheConfig::new("weather", ["/weather"])
            .with_element(
                ConfigElement::new(ElementType::RequestParameter, "city")
                    .with_data_id("city")
                    .with_invalidate("city"),
            )
            .with_element(
                ConfigElement::new(ElementType::SessionParameter, "user")
                    .with_data_id("user")
                    .ignore_value(true),
            );
        let req = CacheRequest::new(Method::GET, "/weather")
            .with_parameter("city", "paris")
            .with_session_attribute("user", "alice");

        assert_eq!(dependency_ids(&config, &req), ["city:paris", "user"]);
        assert_eq!(invalidation_ids(&config, &req), ["city:paris"]);
    }

    #[test]
    fn test_metadata_generator_populates_fragment_info() {
        let mut config = weather_config();
        config.timeout = 120;
        config.priority = Some(4);
        config.external_cache = Some("edge".into());
        config.consume_subfragments = true;

        let mut generator = DefaultMetaDataGenerator::new();
        generator.initialize(&config).unwrap();

        let mut req = CacheRequest::new(Method::GET, "/weather").with_parameter("city", "paris");
        req.begin_fragment(FragmentInfo::new("/weather:city=paris"));
        generator.set_metadata(&mut req, &CacheResponse::new()).unwrap();

        let info = req.fragment_info().unwrap();
        assert_eq!(info.entry_info().time_limit(), Some(Duration::from_secs(120)));
        assert_eq!(info.entry_info().priority(), 4);
        assert_eq!(info.external_cache_group_id(), Some("edge"));
        assert!(info.was_external_cache_group_id_set());
        assert!(info.consume_subfragments());
        assert_eq!(info.entry_info().data_ids(), ["city:paris"]);
    }

    #[test]
    fn test_metadata_without_external_cache_leaves_group_unset() {
        let mut generator = DefaultMetaDataGenerator::new();
        generator.initialize(&weather_config()).unwrap();

        let mut req = CacheRequest::new(Method::GET, "/weather").with_parameter("city", "paris");
        req.begin_fragment(FragmentInfo::new("id"));
        generator.set_metadata(&mut req, &CacheResponse::new()).unwrap();
        assert!(!req.fragment_info().unwrap().was_external_cache_group_id_set());
    }

    #[test]
    fn test_registry_rejects_unknown_generator() {
        let registry = GeneratorRegistry::new();
        let mut config = weather_config();
        config.id_generator = "custom".into();
        let err = registry.id_generator_for(&config).err().unwrap();
        assert!(matches!(err, FragmentError::UnknownGenerator { ref name, .. } if name == "custom"));
    }

    #[test]
    fn test_registry_initializes_custom_generator() {
        struct Fixed;
        impl IdGenerator for Fixed {
            fn initialize(&mut self, _config: &CacheConfig) -> Result<()> {
                Ok(())
            }
            fn get_id(&self, _request: &mut CacheRequest) -> Option<String> {
                Some("fixed".into())
            }
        }

        let mut registry = GeneratorRegistry::new();
        registry.register_id_generator("fixed", || Box::new(Fixed));
        let mut config = weather_config();
        config.id_generator = "fixed".into();

        let generator = registry.id_generator_for(&config).unwrap();
        let mut req = CacheRequest::new(Method::GET, "/weather");
        assert_eq!(generator.get_id(&mut req).as_deref(), Some("fixed"));
    }
}
