use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::scrapers::traits::{LocateStrategy, PageDriver};
use crate::scrapers::types::{ElementHandle, Locator};

/// Element found by a chain, with the strategy that found it
#[derive(Debug, Clone, PartialEq)]
pub struct Located {
    pub strategy: String,
    pub element: ElementHandle,
}

/// Ordered fallback list of strategies. The first strategy that yields a visible
/// element wins; later strategies are never consulted.
pub struct StrategyChain {
    label: String,
    strategies: Vec<Box<dyn LocateStrategy>>,
}

impl StrategyChain {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            strategies: Vec::new(),
        }
    }

    pub fn with(mut self, strategy: impl LocateStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// First match in order. Strategy errors surface only when every strategy errored.
    pub async fn resolve(&self, page: &dyn PageDriver) -> Result<Option<Located>> {
        let mut failed = None;
        let mut clean_miss = false;
        for strategy in &self.strategies {
            let name = strategy.name();
            match strategy.locate(page).await {
                Ok(Some(element)) => {
                    debug!("[{}] matched via {} -> {}", self.label, name, element);
                    return Ok(Some(Located {
                        strategy: name,
                        element,
                    }));
                }
                Ok(None) => {
                    debug!("[{}] no match via {}", self.label, name);
                    clean_miss = true;
                }
                Err(e) => {
                    warn!("[{}] strategy {} failed: {:#}", self.label, name, e);
                    failed = Some(e.context(format!("{} via {}", self.label, name)));
                }
            }
        }
        match failed {
            Some(e) if !clean_miss => Err(e),
            _ => Ok(None),
        }
    }
}

/// Scans every visible element under `selector` for an attribute value containing
/// one of `needles`
#[derive(Debug, Clone)]
pub struct AttributeScan {
    pub selector: String,
    pub attributes: Vec<String>,
    pub needles: Vec<String>,
}

impl AttributeScan {
    pub fn new(selector: &str, attributes: &[&str], needles: &[&str]) -> Self {
        Self {
            selector: selector.to_string(),
            attributes: attributes.iter().map(|s| s.to_string()).collect(),
            needles: needles.iter().map(|s| s.to_lowercase()).collect(),
        }
    }
}

#[async_trait]
impl LocateStrategy for AttributeScan {
    fn name(&self) -> String {
        format!("scan({} [{}])", self.selector, self.attributes.join(","))
    }

    async fn locate(&self, page: &dyn PageDriver) -> Result<Option<ElementHandle>> {
        let candidates = page.locate_all(&Locator::css(&self.selector)).await?;
        for element in candidates {
            for attribute in &self.attributes {
                let Some(value) = page.attribute(&element, attribute).await? else {
                    continue;
                };
                let value = value.to_lowercase();
                if self.needles.iter().any(|needle| value.contains(needle)) {
                    return Ok(Some(element));
                }
            }
        }
        Ok(None)
    }
}
