//! CSS selectors for the SUUMO rental search-results layout.
//!
//! The page structure is treated as a versioned external contract: when SUUMO
//! changes its markup, update `SUUMO_SELECTORS` and bump `LAYOUT_VERSION`.

use anyhow::{Result, anyhow};
use scraper::Selector;

pub const LAYOUT_VERSION: u32 = 1;

/// Field → selector mapping for one page layout.
#[derive(Debug, Clone, Copy)]
pub struct SelectorTable {
    pub listing_item: &'static str,
    pub building_name: &'static str,
    pub address: &'static str,
    pub station_access: &'static str,
    pub age_floors: &'static str,
    pub unit_rows: &'static str,
    pub unit_link: &'static str,
    pub unit_rent: &'static str,
    pub unit_layout: &'static str,
    pub unit_area: &'static str,
    pub next_page: &'static str,
}

pub const SUUMO_SELECTORS: SelectorTable = SelectorTable {
    listing_item: "div.cassetteitem",
    building_name: "div.cassetteitem_content-title",
    address: "li.cassetteitem_detail-col1",
    station_access: "li.cassetteitem_detail-col2",
    age_floors: "li.cassetteitem_detail-col3",
    unit_rows: "table.cassetteitem_other tbody tr",
    unit_link: "td.ui-text--bold a",
    unit_rent: "span.cassetteitem_other-emphasis",
    unit_layout: "span.cassetteitem_madori",
    unit_area: "span.cassetteitem_menseki",
    next_page: "div.pagination.pagination-parts a[href]",
};

/// `SelectorTable` parsed once, reused for every page.
#[derive(Debug, Clone)]
pub struct CompiledSelectors {
    pub listing_item: Selector,
    pub building_name: Selector,
    pub address: Selector,
    pub station_access: Selector,
    pub age_floors: Selector,
    pub unit_rows: Selector,
    pub unit_link: Selector,
    pub unit_rent: Selector,
    pub unit_layout: Selector,
    pub unit_area: Selector,
    pub next_page: Selector,
}

impl CompiledSelectors {
    pub fn compile(table: &SelectorTable) -> Result<Self> {
        Ok(Self {
            listing_item: parse(table.listing_item)?,
            building_name: parse(table.building_name)?,
            address: parse(table.address)?,
            station_access: parse(table.station_access)?,
            age_floors: parse(table.age_floors)?,
            unit_rows: parse(table.unit_rows)?,
            unit_link: parse(table.unit_link)?,
            unit_rent: parse(table.unit_rent)?,
            unit_layout: parse(table.unit_layout)?,
            unit_area: parse(table.unit_area)?,
            next_page: parse(table.next_page)?,
        })
    }
}

fn parse(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("selector {:?}: {:?}", css, e))
}
