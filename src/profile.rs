//! Read-only user profile lookups.

use crate::config::ProfilesConfig;
use std::collections::HashMap;
use tracing::warn;

/// Keyed lookup of profile fields by numeric user id.
pub trait ProfileStore: Send + Sync {
    fn lookup_age(&self, user_id: u64) -> Option<u32>;
}

/// Profiles loaded from the `[profiles]` configuration table.
#[derive(Debug, Clone, Default)]
pub struct StaticProfiles {
    ages: HashMap<u64, u32>,
}

impl StaticProfiles {
    pub fn from_config(config: &ProfilesConfig) -> Self {
        let mut ages = HashMap::new();
        for (key, age) in &config.ages {
            match key.trim().parse::<u64>() {
                Ok(id) => {
                    ages.insert(id, *age);
                }
                Err(_) => warn!("Ignoring profile with non-numeric user id {:?}", key),
            }
        }
        Self { ages }
    }
}

impl ProfileStore for StaticProfiles {
    fn lookup_age(&self, user_id: u64) -> Option<u32> {
        self.ages.get(&user_id).copied()
    }
}
