use std::time::Duration;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::Settings;
use crate::error::{ExtractError, ExtractResult, Phase, PhaseContext};
use crate::extract::pacer::Pacer;
use crate::models::DateRange;
use crate::scrapers::{ElementHandle, Locator, PageDriver, StrategyChain};

pub const RANGE_CONTROL_SELECTOR: &str = ".ng-select .ng-select-container";
pub const RANGE_LABEL_PATTERN: &str = r"last\s+\d+\s*months?|last\s+month";
pub const ARROW_SELECTOR: &str = ".ng-arrow-wrapper, .ng-arrow";
pub const LISTBOX_SELECTOR: &str = "[role='listbox'], .ng-dropdown-panel";
pub const OPTION_SELECTOR: &str = ".ng-dropdown-panel .ng-option, [role='option']";
pub const DATE_INPUT_SELECTOR: &str = "input[type='date'], input[type='datetime-local'], \
     input[placeholder*='date' i], input[placeholder*='fecha' i], input[name*='date' i]";
pub const GENERIC_INPUT_SELECTOR: &str = "input:not([type='checkbox']):not([type='radio'])\
     :not([type='submit']):not([type='button'])";

const CLICKABLE: &str = "button, [role='button'], a";
const APPLY_PATTERN: &str = r"^\s*(apply|aplicar)\s*$";
const CONFIRM_PATTERN: &str = r"^\s*(apply|aplicar|ok|done|confirm|confirmar|aceptar|search|buscar)\s*$";

/// What the configurator ended up selecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedRange {
    Preset(String),
    Dates {
        start: NaiveDate,
        end: NaiveDate,
        /// Filled through the first visible inputs rather than date fields
        generic: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenMethod {
    Click,
    Arrow,
    Keyboard,
    TrailingEdge,
}

const OPEN_METHODS: [OpenMethod; 4] = [
    OpenMethod::Click,
    OpenMethod::Arrow,
    OpenMethod::Keyboard,
    OpenMethod::TrailingEdge,
];

pub struct DateRangeConfigurator {
    dropdown_wait: Duration,
    network_idle: Duration,
    lookback_days: u32,
    pacer: Pacer,
}

impl DateRangeConfigurator {
    pub fn new(settings: &Settings) -> Self {
        Self {
            dropdown_wait: settings.timing.dropdown_wait(),
            network_idle: settings.timing.network_idle_timeout(),
            lookback_days: settings.report.lookback_days,
            pacer: Pacer::new(settings.timing.step_wait()),
        }
    }

    pub async fn apply(
        &self,
        page: &dyn PageDriver,
        range: &DateRange,
        clock: &dyn Clock,
    ) -> ExtractResult<AppliedRange> {
        let control = control_chain()
            .resolve(page)
            .await
            .in_phase(Phase::DateRange)?
            .ok_or_else(|| failure("date-range control not found"))?;
        debug!("Date-range control found via {}", control.strategy);
        self.pacer.settle("before opening date-range menu").await;

        let method = self.open(page, &control.element).await?;
        info!("Date-range menu opened via {:?}", method);
        self.pacer.settle("after opening date-range menu").await;

        if let Some(label) = range.preset_label() {
            if self.select_preset(page, label).await? {
                return Ok(AppliedRange::Preset(label.to_string()));
            }
            info!("Preset '{}' not offered, entering dates", label);
        }

        let (start, end) = range.bounds_or_lookback(clock.today(), self.lookback_days);
        self.enter_dates(page, start, end).await
    }

    /// Try each opening method until a listbox shows up
    async fn open(&self, page: &dyn PageDriver, control: &ElementHandle) -> ExtractResult<OpenMethod> {
        for method in OPEN_METHODS {
            match self.try_open(page, control, method).await {
                Ok(true) => {
                    tokio::time::sleep(self.dropdown_wait).await;
                    if self.listbox_open(page).await? {
                        return Ok(method);
                    }
                    debug!("{:?} did not open the list", method);
                }
                Ok(false) => debug!("{:?} not applicable", method),
                Err(e) => debug!("{:?} failed: {:#}", method, e),
            }
        }
        Err(failure("could not open the date-range dropdown"))
    }

    async fn try_open(
        &self,
        page: &dyn PageDriver,
        control: &ElementHandle,
        method: OpenMethod,
    ) -> anyhow::Result<bool> {
        match method {
            OpenMethod::Click => page.click(control).await?,
            OpenMethod::Arrow => {
                let arrow = Locator::within(control, Locator::css(ARROW_SELECTOR));
                let Some(arrow) = page.locate(&arrow).await? else {
                    return Ok(false);
                };
                page.click(&arrow).await?;
            }
            OpenMethod::Keyboard => {
                page.focus(control).await?;
                page.press_key("Enter").await?;
            }
            OpenMethod::TrailingEdge => {
                let Some(bbox) = page.bounding_box(control).await? else {
                    return Ok(false);
                };
                let (x, y) = bbox.trailing_edge();
                page.click_at(x, y).await?;
            }
        }
        Ok(true)
    }

    async fn listbox_open(&self, page: &dyn PageDriver) -> ExtractResult<bool> {
        Ok(page
            .locate(&Locator::css(LISTBOX_SELECTOR))
            .await
            .in_phase(Phase::DateRange)?
            .is_some())
    }

    async fn select_preset(&self, page: &dyn PageDriver, label: &str) -> ExtractResult<bool> {
        let options = page
            .locate_all(&Locator::css(OPTION_SELECTOR))
            .await
            .in_phase(Phase::DateRange)?;

        for option in options {
            let text = page.text(&option).await.in_phase(Phase::DateRange)?;
            if !preset_matches(&text, label) {
                continue;
            }
            self.pacer.settle(&format!("before selecting '{}'", text.trim())).await;
            page.click(&option).await.in_phase(Phase::DateRange)?;
            page.wait_for_network_idle(self.network_idle)
                .await
                .in_phase(Phase::DateRange)?;
            info!("Selected preset '{}'", text.trim());
            self.pacer.settle("after selecting preset").await;
            return Ok(true);
        }
        Ok(false)
    }

    async fn enter_dates(
        &self,
        page: &dyn PageDriver,
        start: NaiveDate,
        end: NaiveDate,
    ) -> ExtractResult<AppliedRange> {
        let date_inputs = page
            .locate_all(&Locator::css(DATE_INPUT_SELECTOR))
            .await
            .in_phase(Phase::DateRange)?;

        let (inputs, confirm, generic) = if date_inputs.len() >= 2 {
            (date_inputs, apply_chain(), false)
        } else {
            warn!(
                "Found {} date input(s), falling back to the first visible inputs",
                date_inputs.len()
            );
            let inputs = page
                .locate_all(&Locator::css(GENERIC_INPUT_SELECTOR))
                .await
                .in_phase(Phase::DateRange)?;
            if inputs.len() < 2 {
                return Err(failure(&format!(
                    "need two inputs for an explicit range, found {}",
                    inputs.len()
                )));
            }
            (inputs, confirm_chain(), true)
        };

        let (start_iso, end_iso) = (iso(start), iso(end));
        info!("Entering range {} .. {}", start_iso, end_iso);
        page.fill(&inputs[0], &start_iso)
            .await
            .in_phase(Phase::DateRange)?;
        page.fill(&inputs[1], &end_iso)
            .await
            .in_phase(Phase::DateRange)?;
        self.pacer.settle("after entering dates").await;

        match confirm.resolve(page).await.in_phase(Phase::DateRange)? {
            Some(button) => {
                debug!("Confirming range via {}", button.strategy);
                page.click(&button.element)
                    .await
                    .in_phase(Phase::DateRange)?;
            }
            None => debug!("No confirm control, relying on input change"),
        }
        page.wait_for_network_idle(self.network_idle)
            .await
            .in_phase(Phase::DateRange)?;
        self.pacer.settle("after applying range").await;

        Ok(AppliedRange::Dates {
            start,
            end,
            generic,
        })
    }
}

/// Case-insensitive, whitespace-normalized equality that tolerates a plural
pub fn preset_matches(option_text: &str, label: &str) -> bool {
    let option = normalize(option_text);
    let label = normalize(label);
    if option.is_empty() {
        return false;
    }
    option == label
        || option.strip_suffix('s') == Some(label.as_str())
        || label.strip_suffix('s') == Some(option.as_str())
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn iso(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn failure(reason: &str) -> ExtractError {
    ExtractError::DateRangeConfiguration {
        reason: reason.to_string(),
    }
}

fn control_chain() -> StrategyChain {
    StrategyChain::new("date-range control")
        .with(Locator::pattern(RANGE_CONTROL_SELECTOR, RANGE_LABEL_PATTERN))
        .with(Locator::css(RANGE_CONTROL_SELECTOR))
        .with(Locator::pattern("[role='combobox'], select", RANGE_LABEL_PATTERN))
        .with(Locator::pattern(CLICKABLE, r"date range|rango de fechas|period|periodo"))
}

fn apply_chain() -> StrategyChain {
    StrategyChain::new("apply range")
        .with(Locator::role("button", "Apply"))
        .with(Locator::pattern(CLICKABLE, APPLY_PATTERN))
}

fn confirm_chain() -> StrategyChain {
    StrategyChain::new("confirm range")
        .with(Locator::role("button", "Apply"))
        .with(Locator::pattern(CLICKABLE, CONFIRM_PATTERN))
}
