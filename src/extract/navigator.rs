use std::collections::HashMap;
use std::time::Duration;

use tracing::info;

use crate::error::{ExtractError, ExtractResult, Phase, PhaseContext};
use crate::extract::pacer::Pacer;
use crate::models::NavigationTarget;
use crate::scrapers::{Locator, PageDriver, StrategyChain};

const LINK_SELECTOR: &str = "a, [role='link']";
const SIDEBAR_SCOPE: &str = "[role='navigation'], nav";

/// Activates sidebar destinations
pub struct Navigator {
    chains: HashMap<NavigationTarget, StrategyChain>,
    network_idle: Duration,
    pacer: Pacer,
}

impl Navigator {
    pub fn new(network_idle: Duration, pacer: Pacer) -> Self {
        let chains = [NavigationTarget::Report, NavigationTarget::Invoices]
            .into_iter()
            .map(|target| (target, default_chain(target)))
            .collect();
        Self {
            chains,
            network_idle,
            pacer,
        }
    }

    /// Replace the strategies used for `target`
    pub fn with_chain(mut self, target: NavigationTarget, chain: StrategyChain) -> Self {
        self.chains.insert(target, chain);
        self
    }

    pub async fn go_to(&self, page: &dyn PageDriver, target: NavigationTarget) -> ExtractResult<()> {
        let not_found = || ExtractError::NavigationTargetNotFound {
            target: target.label().to_string(),
        };
        let chain = self.chains.get(&target).ok_or_else(not_found)?;

        let located = chain
            .resolve(page)
            .await
            .in_phase(Phase::Navigation)?
            .ok_or_else(not_found)?;

        info!("Opening {} via {}", target, located.strategy);
        page.click(&located.element)
            .await
            .in_phase(Phase::Navigation)?;
        page.wait_for_network_idle(self.network_idle)
            .await
            .in_phase(Phase::Navigation)?;
        self.pacer.settle(&format!("after opening {}", target)).await;
        Ok(())
    }
}

/// Exact link text, alias pattern, anchor containing the label, then anything
/// clickable inside the sidebar
pub fn default_chain(target: NavigationTarget) -> StrategyChain {
    let label = target.label();
    StrategyChain::new(format!("nav:{}", label))
        .with(Locator::role("link", label))
        .with(Locator::pattern(LINK_SELECTOR, alias_pattern(target)))
        .with(Locator::contains_text("a", label))
        .with(Locator::scoped(SIDEBAR_SCOPE, label))
}

fn alias_pattern(target: NavigationTarget) -> String {
    let alternatives: Vec<String> = target.aliases().iter().map(|a| regex::escape(a)).collect();
    format!(r"\b({})\b", alternatives.join("|"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_pattern_matches_labels_case_insensitively() {
        let re = regex::Regex::new(&format!("(?i){}", alias_pattern(NavigationTarget::Invoices)))
            .unwrap();
        assert!(re.is_match("  FACTURAS "));
        assert!(re.is_match("My invoices"));
        assert!(!re.is_match("Reports"));
    }

    #[test]
    fn test_default_chain_order() {
        let chain = default_chain(NavigationTarget::Report);
        assert_eq!(chain.len(), 4);
        assert_eq!(chain.label(), "nav:Report");
    }
}
