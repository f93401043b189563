use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Separator between the parts of a physical key.
pub const PHYSICAL_KEY_SEPARATOR: &str = "|";

// ── Listing ───────────────────────────────────────────────────────────────────

/// One rental unit as scraped from a search-results page.
///
/// Building-scoped fields (`building_name`, `address`, `station_access`,
/// `age_floors`) are shared by every unit row of the same card.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Listing {
    pub listing_id: String,
    pub url: String,
    pub building_name: String,
    pub address: String,
    pub station_access: String,
    pub rent: String,
    pub layout: String,
    pub area: String,
    pub age_floors: String,
    pub unit_floor: String, // e.g. "3階"
}

impl Listing {
    /// Identity of the physical room, independent of which agency listed it.
    /// e.g. "東京都新宿区西新宿1|3階|1K|25.5m2"
    pub fn physical_key(&self) -> String {
        [
            self.address.as_str(),
            self.unit_floor.as_str(),
            self.layout.as_str(),
            self.area.as_str(),
        ]
        .join(PHYSICAL_KEY_SEPARATOR)
    }

    /// The physical key only means something once the floor is known.
    pub fn has_physical_key(&self) -> bool {
        !self.unit_floor.is_empty()
    }
}

// ── Persisted listing ─────────────────────────────────────────────────────────

/// A listing as stored in the `listings` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListingRecord {
    pub listing_id: String,
    pub url: String,
    pub building_name: String,
    pub address: String,
    pub station_access: String,
    pub rent: String,
    pub layout: String,
    pub area: String,
    pub age_floors: String,
    pub unit_floor: String,
    pub physical_key: String,
    pub first_seen_at: DateTime<Utc>,
    pub notified_at: Option<DateTime<Utc>>,
}

// ── Run log ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub id: i64,
    pub run_at: DateTime<Utc>,
    pub listings_found: i64,
    pub new_listings: i64,
    pub error: Option<String>,
}
