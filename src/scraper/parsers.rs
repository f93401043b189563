use crate::models::Listing;
use anyhow::Result;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};
use url::Url;

use super::cleaner::{IdPatterns, spaced_text, squash_text};
use super::selectors::{CompiledSelectors, SelectorTable};

/// Listings found on one results page plus the link to the next one.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedPage {
    pub listings: Vec<Listing>,
    pub next_page: Option<String>,
}

/// Extracts listings from search-results HTML.
///
/// Never fails on page content: missing fields become "", rows without a
/// usable detail link are skipped, and a page without cards yields an empty
/// result with a warning.
#[derive(Debug, Clone)]
pub struct ListingParser {
    sel: CompiledSelectors,
    ids: IdPatterns,
    base: Url,
}

impl ListingParser {
    pub fn new(table: &SelectorTable, base_url: &str) -> Result<Self> {
        Ok(Self {
            sel: CompiledSelectors::compile(table)?,
            ids: IdPatterns::new()?,
            base: Url::parse(base_url)?,
        })
    }

    pub fn parse(&self, html: &str) -> ParsedPage {
        let doc = Html::parse_document(html);
        ParsedPage {
            listings: self.parse_listings(&doc),
            next_page: self.next_page_url(&doc),
        }
    }

    fn parse_listings(&self, doc: &Html) -> Vec<Listing> {
        let cards: Vec<ElementRef> = doc.select(&self.sel.listing_item).collect();
        if cards.is_empty() {
            warn!("No listing cards found; the page layout may have changed or the request was blocked");
            return vec![];
        }

        let mut listings = Vec::new();
        for card in cards {
            let building_name = text_of(card, &self.sel.building_name).unwrap_or_default();
            let address = text_of(card, &self.sel.address).unwrap_or_default();
            let station_access = text_of(card, &self.sel.station_access).unwrap_or_default();
            let age_floors = text_of(card, &self.sel.age_floors).unwrap_or_default();

            for row in card.select(&self.sel.unit_rows) {
                let Some(href) = row
                    .select(&self.sel.unit_link)
                    .next()
                    .and_then(|a| a.value().attr("href"))
                    .filter(|h| !h.trim().is_empty())
                else {
                    continue;
                };

                let Some(listing_id) = self.ids.listing_id(href, &self.base) else {
                    debug!("Skipping row without a listing id: {}", href);
                    continue;
                };

                let Ok(url) = self.base.join(href) else {
                    debug!("Skipping row with unresolvable link: {}", href);
                    continue;
                };

                listings.push(Listing {
                    listing_id,
                    url: url.to_string(),
                    building_name: building_name.clone(),
                    address: address.clone(),
                    station_access: station_access.clone(),
                    rent: text_of(row, &self.sel.unit_rent).unwrap_or_default(),
                    layout: text_of(row, &self.sel.unit_layout).unwrap_or_default(),
                    area: text_of(row, &self.sel.unit_area).unwrap_or_default(),
                    age_floors: age_floors.clone(),
                    unit_floor: self.ids.unit_floor(&spaced_text(row.text())),
                });
            }
        }

        listings
    }

    /// The "次へ" / ">" pagination link, absolute. `None` on the last page.
    fn next_page_url(&self, doc: &Html) -> Option<String> {
        doc.select(&self.sel.next_page).find_map(|a| {
            let label = squash_text(a.text());
            if !(label.contains("次へ") || label == ">") {
                return None;
            }
            let href = a.value().attr("href")?;
            self.base.join(href).ok().map(|u| u.to_string())
        })
    }
}

/// Text of the first match under `el`, or `None` when absent.
fn text_of(el: ElementRef, sel: &Selector) -> Option<String> {
    el.select(sel).next().map(|e| squash_text(e.text()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraper::selectors::SUUMO_SELECTORS;

    fn parser() -> ListingParser {
        ListingParser::new(&SUUMO_SELECTORS, "https://suumo.jp").unwrap()
    }

    fn unit_row(href: &str, floor: &str, rent: &str) -> String {
        format!(
            r#"<tr class="js-cassette_link">
                <td class="cassetteitem_other-checkbox"><input type="checkbox"></td>
                <td>{floor}</td>
                <td><ul><li><span class="cassetteitem_price--rent"><span class="cassetteitem_other-emphasis ui-text--bold">{rent}</span></span></li></ul></td>
                <td><ul><li><span class="cassetteitem_madori">1K</span></li>
                        <li><span class="cassetteitem_menseki">25.5m<sup>2</sup></span></li></ul></td>
                <td class="ui-text--midium ui-text--bold"><a href="{href}" class="js-cassette_link_href">詳細を見る</a></td>
            </tr>"#
        )
    }

    fn card(name: &str, address: &str, rows: &[String]) -> String {
        format!(
            r#"<div class="cassetteitem">
                <div class="cassetteitem-detail">
                    <div class="cassetteitem_content-title">{name}</div>
                    <ul class="cassetteitem_detail">
                        <li class="cassetteitem_detail-col1">{address}</li>
                        <li class="cassetteitem_detail-col2"><div>JR山手線/新宿駅 歩5分</div></li>
                        <li class="cassetteitem_detail-col3"><div>築5年</div><div>10階建</div></li>
                    </ul>
                </div>
                <table class="cassetteitem_other"><tbody>{}</tbody></table>
            </div>"#,
            rows.concat()
        )
    }

    fn page(cards: &[String], pagination: &str) -> String {
        format!(
            "<html><body><div id=\"js-bukkenList\">{}</div>{}</body></html>",
            cards.concat(),
            pagination
        )
    }

    const NEXT_LINK: &str = r#"<div class="pagination pagination-parts">
        <a href="/jj/chintai/ichiran/FR301FC001/?ar=030&amp;page=1">1</a>
        <a href="/jj/chintai/ichiran/FR301FC001/?ar=030&amp;page=2">次へ</a>
    </div>"#;

    #[test]
    fn test_parse_two_cards_three_units() {
        let html = page(
            &[
                card("パークハイツ新宿", "東京都新宿区西新宿1", &[unit_row("/chintai/jnc_1/?bc=1", "3階", "10万円")]),
                card(
                    "メゾン中野",
                    "東京都中野区中野2",
                    &[
                        unit_row("/chintai/jnc_2/?bc=2", "", "8万円"),
                        unit_row("/chintai/jnc_3/?bc=3", "-", "8.5万円"),
                    ],
                ),
            ],
            NEXT_LINK,
        );

        let parsed = parser().parse(&html);

        let ids: Vec<&str> = parsed.listings.iter().map(|l| l.listing_id.as_str()).collect();
        assert_eq!(ids, vec!["jnc_1", "jnc_2", "jnc_3"]);
        let floors: Vec<&str> = parsed.listings.iter().map(|l| l.unit_floor.as_str()).collect();
        assert_eq!(floors, vec!["3階", "", ""]);
        assert_eq!(parsed.listings[0].rent, "10万円");
        assert_eq!(
            parsed.next_page.as_deref(),
            Some("https://suumo.jp/jj/chintai/ichiran/FR301FC001/?ar=030&page=2")
        );
    }

    #[test]
    fn test_building_fields_shared_across_rows() {
        let html = page(
            &[card(
                "メゾン中野",
                "東京都中野区中野2",
                &[
                    unit_row("/chintai/jnc_2/", "2階", "8万円"),
                    unit_row("/chintai/jnc_3/", "4階", "9万円"),
                ],
            )],
            "",
        );

        let parsed = parser().parse(&html);
        assert_eq!(parsed.listings.len(), 2);
        for l in &parsed.listings {
            assert_eq!(l.building_name, "メゾン中野");
            assert_eq!(l.address, "東京都中野区中野2");
            assert_eq!(l.station_access, "JR山手線/新宿駅 歩5分");
            assert_eq!(l.age_floors, "築5年10階建");
            assert_eq!(l.layout, "1K");
            assert_eq!(l.area, "25.5m2");
        }
        assert_eq!(parsed.listings[0].url, "https://suumo.jp/chintai/jnc_2/");
        assert_eq!(parsed.next_page, None);
    }

    #[test]
    fn test_empty_document() {
        let parsed = parser().parse("<html><body><p>メンテナンス中</p></body></html>");
        assert!(parsed.listings.is_empty());
        assert_eq!(parsed.next_page, None);

        let parsed = parser().parse("");
        assert_eq!(parsed, ParsedPage::default());
    }

    #[test]
    fn test_rows_without_usable_link_are_skipped() {
        let no_link = r#"<tr><td>3階</td><td><span class="cassetteitem_other-emphasis">7万円</span></td></tr>"#;
        let html = page(
            &[card(
                "サンプル",
                "東京都渋谷区",
                &[
                    no_link.to_string(),
                    unit_row("", "1階", "6万円"),
                    unit_row("/chintai/promo/?utm=ad", "1階", "6万円"),
                    unit_row("/chintai/jnc_9/", "1階", "6万円"),
                ],
            )],
            "",
        );

        let parsed = parser().parse(&html);
        assert_eq!(parsed.listings.len(), 1);
        assert!(parsed.listings.iter().all(|l| !l.listing_id.is_empty()));
        assert_eq!(parsed.listings[0].listing_id, "jnc_9");
    }

    #[test]
    fn test_missing_fields_degrade_to_empty() {
        let html = page(
            &[r#"<div class="cassetteitem"><table class="cassetteitem_other"><tbody>
                <tr><td class="ui-text--bold"><a href="/chintai/detail/?bc=777">詳細</a></td></tr>
            </tbody></table></div>"#
                .to_string()],
            "",
        );

        let parsed = parser().parse(&html);
        assert_eq!(parsed.listings.len(), 1);
        let l = &parsed.listings[0];
        assert_eq!(l.listing_id, "bc_777");
        assert_eq!(l.building_name, "");
        assert_eq!(l.address, "");
        assert_eq!(l.rent, "");
        assert_eq!(l.unit_floor, "");
    }

    #[test]
    fn test_arrow_next_link() {
        let pagination = r#"<div class="pagination pagination-parts">
            <a href="?page=1">&lt;</a>
            <a href="/jj/chintai/ichiran/FR301FC001/?page=3">&gt;</a>
        </div>"#;
        let parsed = parser().parse(&page(&[], pagination));
        assert_eq!(
            parsed.next_page.as_deref(),
            Some("https://suumo.jp/jj/chintai/ichiran/FR301FC001/?page=3")
        );
    }

    #[test]
    fn test_last_page_has_no_next() {
        let pagination = r#"<div class="pagination pagination-parts">
            <a href="?page=4">前へ</a><a href="?page=4">4</a>
        </div>"#;
        let parsed = parser().parse(&page(&[], pagination));
        assert_eq!(parsed.next_page, None);
    }
}
