mod support;

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use polaroo_scout::extract::{Navigator, Pacer};
use polaroo_scout::models::NavigationTarget;
use polaroo_scout::scrapers::{ElementHandle, LocateStrategy, Locator, PageDriver, StrategyChain};
use polaroo_scout::{ExtractError, Phase};
use support::{FakePage, DASHBOARD_URL};

/// Strategy whose lookup always errors
struct Broken(&'static str);

#[async_trait]
impl LocateStrategy for Broken {
    fn name(&self) -> String {
        format!("broken({})", self.0)
    }

    async fn locate(&self, _page: &dyn PageDriver) -> Result<Option<ElementHandle>> {
        Err(anyhow!("{}", self.0))
    }
}

/// Strategy that runs cleanly and finds nothing
struct Missing;

#[async_trait]
impl LocateStrategy for Missing {
    fn name(&self) -> String {
        "missing".to_string()
    }

    async fn locate(&self, _page: &dyn PageDriver) -> Result<Option<ElementHandle>> {
        Ok(None)
    }
}

fn navigator() -> Navigator {
    Navigator::new(Duration::ZERO, Pacer::new(Duration::ZERO))
}

#[tokio::test]
async fn third_strategy_wins_without_touching_earlier_ones() {
    let page = FakePage::new(DASHBOARD_URL);
    page.on(
        |q| q.selector == "a" && q.contains.as_deref() == Some("Report"),
        &["report-link"],
    );
    // Would match the fourth strategy too, which must never be consulted
    page.on(|q| q.scope.is_some(), &["sidebar-item"]);

    navigator()
        .go_to(page.as_ref(), NavigationTarget::Report)
        .await
        .unwrap();

    assert_eq!(page.clicks(), vec!["report-link".to_string()]);
    let queries = page.queries();
    assert_eq!(queries.len(), 3);
    assert_eq!(queries[0].exact.as_deref(), Some("Report"));
    assert!(queries[1].pattern.as_deref().unwrap().contains("Informe"));
    assert!(queries.iter().all(|q| q.scope.is_none()));
}

#[tokio::test]
async fn exact_link_is_preferred() {
    let page = FakePage::new(DASHBOARD_URL);
    page.on(|q| q.exact.as_deref() == Some("Invoices"), &["exact"]);
    page.on(|q| q.pattern.is_some(), &["pattern"]);

    navigator()
        .go_to(page.as_ref(), NavigationTarget::Invoices)
        .await
        .unwrap();

    assert_eq!(page.clicks(), vec!["exact".to_string()]);
    assert_eq!(page.queries().len(), 1);
}

#[tokio::test]
async fn missing_target_is_reported_by_name() {
    let page = FakePage::new(DASHBOARD_URL);

    let err = navigator()
        .go_to(page.as_ref(), NavigationTarget::Invoices)
        .await
        .unwrap_err();

    match err {
        ExtractError::NavigationTargetNotFound { target } => assert_eq!(target, "Invoices"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(page.queries().len(), 4);
    assert!(page.clicks().is_empty());
}

#[tokio::test]
async fn custom_chain_replaces_defaults() {
    let page = FakePage::new(DASHBOARD_URL);
    page.on(|q| q.selector == "#menu-report", &["menu"]);

    let navigator = navigator().with_chain(
        NavigationTarget::Report,
        StrategyChain::new("custom").with(Locator::css("#menu-report")),
    );
    navigator
        .go_to(page.as_ref(), NavigationTarget::Report)
        .await
        .unwrap();

    assert_eq!(page.clicks(), vec!["menu".to_string()]);
}

#[tokio::test]
async fn chain_surfaces_the_error_when_every_strategy_fails() {
    let page = FakePage::new(DASHBOARD_URL);
    let chain = StrategyChain::new("export menu")
        .with(Broken("selector rejected"))
        .with(Broken("execution context destroyed"));

    let err = chain.resolve(page.as_ref()).await.unwrap_err();
    let message = format!("{:#}", err);
    assert!(message.contains("export menu via broken(execution context destroyed)"), "{message}");
    assert!(message.contains("execution context destroyed"), "{message}");
}

#[tokio::test]
async fn chain_miss_stays_a_miss_when_a_strategy_ran_cleanly() {
    let page = FakePage::new(DASHBOARD_URL);
    let chain = StrategyChain::new("export menu")
        .with(Broken("selector rejected"))
        .with(Missing);

    assert_eq!(chain.resolve(page.as_ref()).await.unwrap(), None);
    assert_eq!(StrategyChain::new("empty").resolve(page.as_ref()).await.unwrap(), None);
}

#[tokio::test]
async fn broken_strategy_does_not_hide_a_later_match() {
    let page = FakePage::new(DASHBOARD_URL);
    page.on(|q| q.selector == "#menu-report", &["menu"]);
    let chain = StrategyChain::new("report link")
        .with(Broken("selector rejected"))
        .with(Locator::css("#menu-report"));

    let found = chain.resolve(page.as_ref()).await.unwrap().unwrap();
    assert_eq!(found.element.id(), "menu");
    assert_eq!(found.strategy, Locator::css("#menu-report").to_string());
}

#[tokio::test]
async fn crashed_page_is_a_browser_error_not_a_missing_target() {
    let page = FakePage::new(DASHBOARD_URL);
    page.crash("target closed");

    let err = navigator()
        .go_to(page.as_ref(), NavigationTarget::Invoices)
        .await
        .unwrap_err();

    match &err {
        ExtractError::Browser { phase, .. } => assert_eq!(*phase, Phase::Navigation),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("target closed"));
    assert!(page.clicks().is_empty());
}
