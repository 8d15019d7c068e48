//! Profile search query and results

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{ProfileKey, Version};

/// Default page size requested from the server.
pub const DEFAULT_MAX_RESPONSE_RECORDS: u32 = 100;

/// Default cap on the total number of records the server keeps for paging.
pub const DEFAULT_MAX_TOTAL_RECORDS: u32 = 1000;

/// One search hit as reported by a profile server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileQueryInfo {
    pub key: ProfileKey,
    pub name: String,
    pub profile_type: String,
    pub version: Version,
    pub extra_data: String,
    pub thumbnail: Vec<u8>,
    pub latitude: i32,
    pub longitude: i32,
    /// Whether the profile is hosted by the server that answered
    pub is_hosted: bool,
    pub is_online: bool,
    /// Host of the profile's home server, when not hosted by the answering server
    pub home_host: Option<String>,
}

impl ProfileQueryInfo {
    pub fn new(key: ProfileKey, name: impl Into<String>) -> Self {
        Self {
            key,
            name: name.into(),
            profile_type: String::new(),
            version: Version::default(),
            extra_data: String::new(),
            thumbnail: Vec::new(),
            latitude: 0,
            longitude: 0,
            is_hosted: true,
            is_online: false,
            home_host: None,
        }
    }
}

/// Search parameters plus the paging cursor of a running search
///
/// The cursor (`last_record_index`, `last_record_count`) and the page cache
/// are updated as pages arrive so a follow-up request can continue where the
/// previous one stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Wildcard pattern on the profile name
    pub name: Option<String>,
    pub profile_type: Option<String>,
    pub extra_data: Option<String>,
    /// (latitude, longitude, radius in meters)
    pub location: Option<(i32, i32, u32)>,
    pub max_response_records: u32,
    pub max_total_records: u32,
    /// Only return profiles hosted by the queried server
    pub only_hosted: bool,
    pub include_thumbnails: bool,
    pub last_record_index: u32,
    pub last_record_count: u32,
    /// Pages received so far, keyed by their first record index
    pub cache: BTreeMap<u32, Vec<ProfileQueryInfo>>,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            name: None,
            profile_type: None,
            extra_data: None,
            location: None,
            max_response_records: DEFAULT_MAX_RESPONSE_RECORDS,
            max_total_records: DEFAULT_MAX_TOTAL_RECORDS,
            only_hosted: false,
            include_thumbnails: false,
            last_record_index: 0,
            last_record_count: 0,
            cache: BTreeMap::new(),
        }
    }
}

impl SearchQuery {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, profile_type: impl Into<String>) -> Self {
        self.profile_type = Some(profile_type.into());
        self
    }

    pub fn with_page_size(mut self, size: u32) -> Self {
        self.max_response_records = size;
        self
    }

    /// Record a received page and advance the cursor.
    pub fn record_page(&mut self, record_index: u32, record_count: u32, page: &[ProfileQueryInfo]) {
        self.last_record_index = record_index;
        self.last_record_count = record_count;
        self.cache.insert(record_index, page.to_vec());
    }

    /// Index of the first record the next subsequent request should ask for.
    pub fn next_record_index(&self) -> u32 {
        self.last_record_index.saturating_add(self.last_record_count)
    }

    /// Every cached hit in record order.
    pub fn cached_results(&self) -> Vec<ProfileQueryInfo> {
        self.cache.values().flatten().cloned().collect()
    }
}
