//! Profile Types
//!
//! `Profile` is a locally owned identity; `ProfileInfo` is what we know about
//! a remote identity (usually obtained from its profile server).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::{now_millis, PairStatus, ProfileKey};
use crate::config::LinkConfig;

/// Three-part profile version (major, minor, patch)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(pub u8, pub u8, pub u8);

impl Version {
    pub fn to_bytes(&self) -> [u8; 3] {
        [self.0, self.1, self.2]
    }

    /// Missing trailing bytes read as zero.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let at = |i: usize| bytes.get(i).copied().unwrap_or(0);
        Self(at(0), at(1), at(2))
    }
}

impl Default for Version {
    fn default() -> Self {
        Version(0, 0, 1)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// A locally owned identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Identity public key
    pub key: ProfileKey,
    /// Display name
    pub name: String,
    /// Free-form profile type (e.g., "person", "device")
    pub profile_type: String,
    pub version: Version,
    /// Profile image bytes (may be empty)
    pub image: Vec<u8>,
    pub latitude: i32,
    pub longitude: i32,
    /// Free-form extra data published with the profile
    pub extra_data: String,
    /// Names of the application services this profile answers calls for
    pub app_services: BTreeSet<String>,
}

impl Profile {
    pub fn new(key: ProfileKey, name: impl Into<String>, profile_type: impl Into<String>) -> Self {
        Self {
            key,
            name: name.into(),
            profile_type: profile_type.into(),
            version: Version::default(),
            image: Vec::new(),
            latitude: 0,
            longitude: 0,
            extra_data: String::new(),
            app_services: BTreeSet::new(),
        }
    }

    pub fn with_app_service(mut self, name: impl Into<String>) -> Self {
        self.app_services.insert(name.into());
        self
    }

    pub fn has_app_service(&self, name: &str) -> bool {
        self.app_services.contains(name)
    }

    /// Apply the mutable fields present in `update`.
    pub fn apply(&mut self, update: &ProfileUpdate) {
        if let Some(version) = update.version {
            self.version = version;
        }
        if let Some(name) = &update.name {
            self.name = name.clone();
        }
        if let Some(image) = &update.image {
            self.image = image.clone();
        }
        if let Some(latitude) = update.latitude {
            self.latitude = latitude;
        }
        if let Some(longitude) = update.longitude {
            self.longitude = longitude;
        }
        if let Some(extra_data) = &update.extra_data {
            self.extra_data = extra_data.clone();
        }
    }

    /// Image digest announced alongside the profile (BLAKE3, empty image -> None).
    pub fn image_hash(&self) -> Option<[u8; 32]> {
        if self.image.is_empty() {
            None
        } else {
            Some(*blake3::hash(&self.image).as_bytes())
        }
    }
}

/// Changes to a local profile's mutable fields
///
/// `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    pub version: Option<Version>,
    pub name: Option<String>,
    pub image: Option<Vec<u8>>,
    pub latitude: Option<i32>,
    pub longitude: Option<i32>,
    pub extra_data: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self == &ProfileUpdate::default()
    }
}

/// What we know about a remote identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileInfo {
    pub key: ProfileKey,
    pub name: String,
    pub profile_type: String,
    pub version: Version,
    pub image: Vec<u8>,
    pub thumbnail: Vec<u8>,
    pub latitude: i32,
    pub longitude: i32,
    pub extra_data: String,
    /// Whether the server reported the profile as connected
    pub is_online: bool,
    /// Application services the profile advertises
    pub app_services: BTreeSet<String>,
    /// Home server host of the profile, when known
    pub home_host: Option<String>,
    pub pair_status: PairStatus,
    /// Unix milliseconds of the last refresh from the network
    pub updated_at: i64,
}

impl ProfileInfo {
    /// Descriptor holding only the public key (nothing fetched yet).
    pub fn from_key(key: ProfileKey) -> Self {
        Self {
            key,
            name: String::new(),
            profile_type: String::new(),
            version: Version::default(),
            image: Vec::new(),
            thumbnail: Vec::new(),
            latitude: 0,
            longitude: 0,
            extra_data: String::new(),
            is_online: false,
            app_services: BTreeSet::new(),
            home_host: None,
            pair_status: PairStatus::NotPaired,
            updated_at: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_app_service(mut self, name: impl Into<String>) -> Self {
        self.app_services.insert(name.into());
        self
    }

    pub fn supports(&self, service: &str) -> bool {
        self.app_services.contains(service)
    }

    /// Copy the server-provided fields of `fetched` into this descriptor.
    ///
    /// Pairing state and home host are local knowledge and are kept.
    pub fn merge_remote(&mut self, fetched: &ProfileInfo) {
        self.image = fetched.image.clone();
        self.thumbnail = fetched.thumbnail.clone();
        self.latitude = fetched.latitude;
        self.longitude = fetched.longitude;
        self.extra_data = fetched.extra_data.clone();
        self.version = fetched.version;
        self.profile_type = fetched.profile_type.clone();
        self.name = fetched.name.clone();
        self.is_online = fetched.is_online;
        self.app_services.extend(fetched.app_services.iter().cloned());
        self.updated_at = now_millis();
    }
}

impl From<&Profile> for ProfileInfo {
    fn from(profile: &Profile) -> Self {
        Self {
            key: profile.key,
            name: profile.name.clone(),
            profile_type: profile.profile_type.clone(),
            version: profile.version,
            image: profile.image.clone(),
            thumbnail: Vec::new(),
            latitude: profile.latitude,
            longitude: profile.longitude,
            extra_data: profile.extra_data.clone(),
            is_online: true,
            app_services: profile.app_services.clone(),
            home_host: None,
            pair_status: PairStatus::NotPaired,
            updated_at: now_millis(),
        }
    }
}

/// Address and identity of a profile server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub host: String,
    pub client_port: u16,
    pub non_client_port: u16,
    pub app_service_port: u16,
    /// Server identity key, when known
    pub identity_key: Option<Vec<u8>>,
}

impl ServerEndpoint {
    pub fn new(host: impl Into<String>, client_port: u16, non_client_port: u16, app_service_port: u16) -> Self {
        Self {
            host: host.into(),
            client_port,
            non_client_port,
            app_service_port,
            identity_key: None,
        }
    }

    /// Endpoint for a server known only by host, using the configured ports.
    pub fn from_host(host: impl Into<String>, config: &LinkConfig) -> Self {
        Self::new(
            host,
            config.default_client_port,
            config.default_non_client_port,
            config.default_app_service_port,
        )
    }

    pub fn with_identity_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.identity_key = Some(key.into());
        self
    }
}

impl std::fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.client_port)
    }
}
