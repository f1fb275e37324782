use std::time::Duration;

use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{InvoiceConfig, Settings};
use crate::error::{ExtractError, ExtractResult, Phase, PhaseContext};
use crate::extract::download;
use crate::extract::navigator::Navigator;
use crate::extract::pacer::Pacer;
use crate::models::{InvoiceBatch, InvoiceRecord, NavigationTarget, RowFailure, ServiceType};
use crate::scrapers::{AttributeScan, ElementHandle, Locator, PageDriver, StrategyChain};

pub const TABLE_SELECTOR: &str = "table";
pub const TABLE_ROW_SELECTOR: &str = "tbody tr";
pub const CARD_SELECTOR: &str = ".invoice-card, .card, .list-group-item, [role='listitem']";

const CLICKABLE: &str = "button, [role='button'], a";
const SERVICE_HEADERS: &[&str] = &["service", "servicio", "suministro", "tipo", "type"];

/// Searches a property's invoices and downloads a bounded number per service type
pub struct InvoiceExtractor {
    navigator: Navigator,
    quotas: InvoiceConfig,
    network_idle: Duration,
    download_timeout: Duration,
    pacer: Pacer,
}

impl InvoiceExtractor {
    pub fn new(settings: &Settings, navigator: Navigator) -> Self {
        Self {
            navigator,
            quotas: settings.invoices.clone(),
            network_idle: settings.timing.network_idle_timeout(),
            download_timeout: settings.timing.download_timeout(),
            pacer: Pacer::new(settings.timing.step_wait()),
        }
    }

    /// Remaining acceptance limit for a service type; `None` means unbounded
    pub fn quota(&self, service_type: ServiceType) -> Option<usize> {
        match service_type {
            ServiceType::Electricity => Some(self.quotas.electricity_quota),
            ServiceType::Water => Some(self.quotas.water_quota),
            ServiceType::Unknown => None,
        }
    }

    pub async fn extract(
        &self,
        page: &dyn PageDriver,
        property: &str,
        clock: &dyn Clock,
    ) -> ExtractResult<InvoiceBatch> {
        self.navigator
            .go_to(page, NavigationTarget::Invoices)
            .await?;
        self.search(page, property).await?;

        let rows = self.result_rows(page).await?;
        info!("{} result row(s) for '{}'", rows.len(), property);

        let mut batch = InvoiceBatch::new(property);
        for (index, row) in rows.iter().enumerate() {
            let service_type = row.service_type;
            if let Some(limit) = self.quota(service_type) {
                if batch.count(service_type) >= limit {
                    debug!("Row {}: {} quota reached, skipping", index, service_type);
                    batch.skipped += 1;
                    continue;
                }
            }

            let control = download_control_chain(&row.element)
                .resolve(page)
                .await
                .in_phase(Phase::Invoices)?;
            let Some(control) = control else {
                debug!("Row {}: no download control, skipping", index);
                batch.skipped += 1;
                continue;
            };

            batch.attempted += 1;
            self.pacer.settle(&format!("before invoice row {}", index)).await;
            match download::capture(page, &control.element, clock, self.download_timeout).await {
                Ok(artifact) => {
                    batch.succeeded += 1;
                    batch
                        .records
                        .push(InvoiceRecord::from_artifact(property, service_type, artifact));
                }
                Err(e) => {
                    warn!("Row {} ({}) download failed: {}", index, service_type, e);
                    batch.failures.push(RowFailure {
                        property_name: property.to_string(),
                        row: index,
                        service_type,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            "'{}': {}/{} invoice(s) captured, {} skipped",
            property, batch.succeeded, batch.attempted, batch.skipped
        );
        Ok(batch)
    }

    async fn search(&self, page: &dyn PageDriver, property: &str) -> ExtractResult<()> {
        let input = search_input_chain()
            .resolve(page)
            .await
            .in_phase(Phase::Invoices)?
            .ok_or_else(|| ExtractError::NavigationTargetNotFound {
                target: "invoice search field".to_string(),
            })?;

        debug!("Searching '{}' via {}", property, input.strategy);
        page.fill(&input.element, property)
            .await
            .in_phase(Phase::Invoices)?;
        self.pacer.settle("after typing property").await;

        let button = search_button_chain()
            .resolve(page)
            .await
            .in_phase(Phase::Invoices)?;
        let submitted = match button {
            Some(button) => page.click(&button.element).await,
            None => {
                page.focus(&input.element).await.in_phase(Phase::Invoices)?;
                page.press_key("Enter").await
            }
        };
        submitted.in_phase(Phase::Invoices)?;

        page.wait_for_network_idle(self.network_idle)
            .await
            .in_phase(Phase::Invoices)?;
        self.pacer.settle("after invoice search").await;
        Ok(())
    }

    /// Table rows classified by the service column, or card items as unknown
    async fn result_rows(&self, page: &dyn PageDriver) -> ExtractResult<Vec<ResultRow>> {
        let table = page
            .locate(&Locator::css(TABLE_SELECTOR))
            .await
            .in_phase(Phase::Invoices)?;

        let Some(table) = table else {
            let cards = page
                .locate_all(&Locator::css(CARD_SELECTOR))
                .await
                .in_phase(Phase::Invoices)?;
            debug!("No results table, using {} card(s)", cards.len());
            return Ok(cards
                .into_iter()
                .map(|element| ResultRow {
                    element,
                    service_type: ServiceType::Unknown,
                })
                .collect());
        };

        let table_html = page.outer_html(&table).await.in_phase(Phase::Invoices)?;
        let column = service_column(&table_html);
        if column.is_none() {
            debug!("Results table has no service column");
        }

        let elements = page
            .locate_all(&Locator::within(&table, Locator::css(TABLE_ROW_SELECTOR)))
            .await
            .in_phase(Phase::Invoices)?;

        let mut rows = Vec::with_capacity(elements.len());
        for element in elements {
            let service_type = match column {
                Some(index) => {
                    let html = page.outer_html(&element).await.in_phase(Phase::Invoices)?;
                    row_cells(&html)
                        .get(index)
                        .map(|cell| ServiceType::classify(cell))
                        .unwrap_or(ServiceType::Unknown)
                }
                None => ServiceType::Unknown,
            };
            rows.push(ResultRow {
                element,
                service_type,
            });
        }
        Ok(rows)
    }
}

struct ResultRow {
    element: ElementHandle,
    service_type: ServiceType,
}

/// Index of the header cell naming the service type
pub fn service_column(table_html: &str) -> Option<usize> {
    let document = Html::parse_fragment(table_html);
    let header = Selector::parse("th").ok()?;
    document.select(&header).position(|cell| {
        let text = cell_text(cell).to_lowercase();
        SERVICE_HEADERS.iter().any(|name| text.contains(name))
    })
}

/// Cell texts of one `<tr>`
pub fn row_cells(row_html: &str) -> Vec<String> {
    // Bare <tr> fragments are dropped by the HTML parser outside a table
    let wrapped = format!("<table><tbody>{}</tbody></table>", row_html);
    let document = Html::parse_fragment(&wrapped);
    let Ok(cell) = Selector::parse("td, th") else {
        return Vec::new();
    };
    document.select(&cell).map(cell_text).collect()
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn search_input_chain() -> StrategyChain {
    StrategyChain::new("invoice search")
        .with(Locator::css("input[type='search']"))
        .with(Locator::css(
            "input[placeholder*='search' i], input[placeholder*='buscar' i]",
        ))
        .with(AttributeScan::new(
            "input",
            &["name", "id", "aria-label", "class"],
            &["search", "buscar", "filter"],
        ))
}

fn search_button_chain() -> StrategyChain {
    StrategyChain::new("search button")
        .with(Locator::role("button", "Search"))
        .with(Locator::pattern(CLICKABLE, r"^\s*(search|buscar)\s*$"))
}

fn download_control_chain(row: &ElementHandle) -> StrategyChain {
    StrategyChain::new("row download")
        .with(Locator::within(
            row,
            Locator::pattern(CLICKABLE, r"download|descargar|\bpdf\b"),
        ))
        .with(Locator::within(
            row,
            Locator::css("a[download], a[href$='.pdf' i], [title*='download' i], [title*='descargar' i]"),
        ))
}
