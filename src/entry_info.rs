//! Generic cache entry metadata

use crate::cache_config::SharingPolicy;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Metadata common to every cache entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryInfo {
    id: Option<String>,
    priority: i32,
    priority_set: bool,
    time_limit: Option<Duration>,
    expiration_time: Option<SystemTime>,
    inactivity: Option<Duration>,
    sharing_policy: SharingPolicy,
    data_ids: Vec<String>,
    templates: Vec<String>,
}

impl Default for EntryInfo {
    fn default() -> Self {
        EntryInfo {
            id: None,
            priority: 0,
            priority_set: false,
            time_limit: None,
            expiration_time: None,
            inactivity: None,
            sharing_policy: SharingPolicy::NotShared,
            data_ids: Vec::new(),
            templates: Vec::new(),
        }
    }
}

impl EntryInfo {
    pub fn new(id: impl Into<String>) -> Self {
        EntryInfo {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = Some(id.into());
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
        self.priority_set = true;
    }

    /// Whether a priority was explicitly chosen (the store applies its default otherwise)
    pub fn was_priority_set(&self) -> bool {
        self.priority_set
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit
    }

    /// Set the time limit; the expiration time becomes now + limit
    ///
    /// A zero limit clears both.
    pub fn set_time_limit(&mut self, limit: Duration) {
        if limit.is_zero() {
            self.time_limit = None;
            self.expiration_time = None;
        } else {
            self.time_limit = Some(limit);
            self.expiration_time = Some(SystemTime::now() + limit);
        }
    }

    pub fn expiration_time(&self) -> Option<SystemTime> {
        self.expiration_time
    }

    pub fn set_expiration_time(&mut self, at: SystemTime) {
        self.expiration_time = Some(at);
        self.time_limit = at.duration_since(SystemTime::now()).ok();
    }

    pub fn inactivity(&self) -> Option<Duration> {
        self.inactivity
    }

    /// Set the inactivity timeout (zero clears it)
    pub fn set_inactivity(&mut self, inactivity: Duration) {
        self.inactivity = if inactivity.is_zero() {
            None
        } else {
            Some(inactivity)
        };
    }

    pub fn sharing_policy(&self) -> SharingPolicy {
        self.sharing_policy
    }

    pub fn set_sharing_policy(&mut self, policy: SharingPolicy) {
        self.sharing_policy = policy;
    }

    pub fn is_not_shared(&self) -> bool {
        self.sharing_policy == SharingPolicy::NotShared
    }

    pub fn data_ids(&self) -> &[String] {
        &self.data_ids
    }

    /// Add a dependency id; duplicates are ignored, insertion order is kept
    pub fn add_data_id(&mut self, data_id: impl Into<String>) {
        let data_id = data_id.into();
        if !self.data_ids.contains(&data_id) {
            self.data_ids.push(data_id);
        }
    }

    pub fn templates(&self) -> &[String] {
        &self.templates
    }

    pub fn add_template(&mut self, template: impl Into<String>) {
        let template = template.into();
        if !self.templates.contains(&template) {
            self.templates.push(template);
        }
    }

    /// Check whether the entry is past its expiration time
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        matches!(self.expiration_time, Some(at) if at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_set_flag() {
        let mut info = EntryInfo::new("/a");
        assert!(!info.was_priority_set());
        info.set_priority(0);
        assert!(info.was_priority_set());
        assert_eq!(info.priority(), 0);
    }

    #[test]
    fn test_time_limit_sets_expiration() {
        let mut info = EntryInfo::new("/a");
        let before = SystemTime::now();
        info.set_time_limit(Duration::from_secs(60));
        let at = info.expiration_time().unwrap();
        assert!(at >= before + Duration::from_secs(60));
        assert!(!info.is_expired_at(SystemTime::now()));
        assert!(info.is_expired_at(at));

        info.set_time_limit(Duration::ZERO);
        assert!(info.expiration_time().is_none());
        assert!(info.time_limit().is_none());
    }

    #[test]
    fn test_data_ids_are_deduplicated_in_order() {
        let mut info = EntryInfo::new("/a");
        info.add_data_id("city:paris");
        info.add_data_id("weather:today");
        info.add_data_id("city:paris");
        assert_eq!(info.data_ids(), ["city:paris", "weather:today"]);
    }
}
