//! Metadata of a fragment cache entry under construction
//!
//! A [`FragmentInfo`] is created by the coordinator for every build attempt,
//! filled in by the id and metadata generators while the fragment renders, and
//! frozen when the entry is committed to the store. Setters called after the
//! commit fail with [`FragmentError::FragmentCommitted`].

use crate::cache_config::SharingPolicy;
use crate::entry_info::EntryInfo;
use crate::error::{FragmentError, Result};
use std::time::{Duration, SystemTime};

/// Lifecycle of a fragment entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentState {
    /// Generators may still change the metadata
    Building,
    /// Stored; metadata is read-only
    Committed,
    /// Removed from the store
    Invalidated,
}

/// Fragment-specific cache entry metadata
#[derive(Debug, Clone)]
pub struct FragmentInfo {
    entry: EntryInfo,
    external_cache_group_id: Option<String>,
    external_cache_group_id_set: bool,
    store_attributes: bool,
    store_cookies: bool,
    consume_subfragments: bool,
    ignore_get_post: bool,
    instance_name: Option<String>,
    state: FragmentState,
}

impl FragmentInfo {
    /// Start building metadata for the entry with this cache id
    pub fn new(id: impl Into<String>) -> Self {
        FragmentInfo {
            entry: EntryInfo::new(id),
            external_cache_group_id: None,
            external_cache_group_id_set: false,
            store_attributes: false,
            store_cookies: false,
            consume_subfragments: false,
            ignore_get_post: false,
            instance_name: None,
            state: FragmentState::Building,
        }
    }

    fn ensure_building(&self) -> Result<()> {
        if self.state == FragmentState::Building {
            Ok(())
        } else {
            Err(FragmentError::FragmentCommitted {
                id: self.id().unwrap_or_default().to_string(),
            })
        }
    }

    pub fn entry_info(&self) -> &EntryInfo {
        &self.entry
    }

    pub fn id(&self) -> Option<&str> {
        self.entry.id()
    }

    pub fn state(&self) -> FragmentState {
        self.state
    }

    pub fn set_priority(&mut self, priority: i32) -> Result<()> {
        self.ensure_building()?;
        self.entry.set_priority(priority);
        Ok(())
    }

    pub fn set_time_limit(&mut self, limit: Duration) -> Result<()> {
        self.ensure_building()?;
        self.entry.set_time_limit(limit);
        Ok(())
    }

    pub fn set_expiration_time(&mut self, at: SystemTime) -> Result<()> {
        self.ensure_building()?;
        self.entry.set_expiration_time(at);
        Ok(())
    }

    pub fn set_inactivity(&mut self, inactivity: Duration) -> Result<()> {
        self.ensure_building()?;
        self.entry.set_inactivity(inactivity);
        Ok(())
    }

    pub fn set_sharing_policy(&mut self, policy: SharingPolicy) -> Result<()> {
        self.ensure_building()?;
        self.entry.set_sharing_policy(policy);
        Ok(())
    }

    pub fn add_data_id(&mut self, data_id: impl Into<String>) -> Result<()> {
        self.ensure_building()?;
        self.entry.add_data_id(data_id);
        Ok(())
    }

    pub fn add_template(&mut self, template: impl Into<String>) -> Result<()> {
        self.ensure_building()?;
        self.entry.add_template(template);
        Ok(())
    }

    pub fn external_cache_group_id(&self) -> Option<&str> {
        self.external_cache_group_id.as_deref()
    }

    /// Set (or clear, with `None`) the external cache group
    pub fn set_external_cache_group_id(&mut self, group: Option<String>) -> Result<()> {
        self.ensure_building()?;
        self.external_cache_group_id = group;
        self.external_cache_group_id_set = true;
        Ok(())
    }

    /// Whether the external cache group was explicitly set, even to `None`
    ///
    /// Only fragments that set a group are candidates for an external push.
    pub fn was_external_cache_group_id_set(&self) -> bool {
        self.external_cache_group_id_set
    }

    pub fn store_attributes(&self) -> bool {
        self.store_attributes
    }

    pub fn set_store_attributes(&mut self, store: bool) -> Result<()> {
        self.ensure_building()?;
        self.store_attributes = store;
        Ok(())
    }

    pub fn store_cookies(&self) -> bool {
        self.store_cookies
    }

    pub fn set_store_cookies(&mut self, store: bool) -> Result<()> {
        self.ensure_building()?;
        self.store_cookies = store;
        Ok(())
    }

    pub fn consume_subfragments(&self) -> bool {
        self.consume_subfragments
    }

    pub fn set_consume_subfragments(&mut self, consume: bool) -> Result<()> {
        self.ensure_building()?;
        self.consume_subfragments = consume;
        Ok(())
    }

    /// When true the request method is not part of the cache id
    pub fn ignore_get_post(&self) -> bool {
        self.ignore_get_post
    }

    pub fn set_ignore_get_post(&mut self, ignore: bool) -> Result<()> {
        self.ensure_building()?;
        self.ignore_get_post = ignore;
        Ok(())
    }

    pub fn instance_name(&self) -> Option<&str> {
        self.instance_name.as_deref()
    }

    pub fn set_instance_name(&mut self, name: impl Into<String>) -> Result<()> {
        self.ensure_building()?;
        self.instance_name = Some(name.into());
        Ok(())
    }

    /// Default the priority when no generator chose one
    pub(crate) fn apply_default_priority(&mut self, priority: i32) {
        if !self.entry.was_priority_set() {
            self.entry.set_priority(priority);
        }
    }

    /// Freeze the metadata; further setter calls fail
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_building()?;
        self.state = FragmentState::Committed;
        Ok(())
    }

    pub fn mark_invalidated(&mut self) {
        self.state = FragmentState::Invalidated;
    }
}
