//! End-to-end harness runs against the simulated browser.

use partcheck::logger::init_test_logger;
use partcheck::sim::SimulatedBrowser;
use partcheck::{
    CacheHarness, Collaborators, ExpectationTable, FailureKind, HarnessConfig, HarnessState,
    PartitionContext, Policy, RecordingAssertion, RunReport, Scenario, ScenarioSet,
    DEFAULT_POLICY_KEY,
};
use std::sync::Arc;
use tokio_test::assert_ok;

fn fast_config() -> HarnessConfig {
    HarnessConfig {
        load_timeout_ms: 50,
        snapshot_timeout_ms: 100,
        ..HarnessConfig::default()
    }
}

fn collaborators(browser: &SimulatedBrowser) -> Collaborators {
    let browser = Arc::new(browser.clone());
    Collaborators {
        navigator: browser.clone(),
        cache: browser.clone(),
        hooks: browser.clone(),
        policies: browser,
    }
}

async fn run_with(config: HarnessConfig, browser: &SimulatedBrowser) -> RunReport {
    init_test_logger();
    let harness = assert_ok!(CacheHarness::new(config, collaborators(browser)));
    assert_ok!(harness.run().await)
}

fn assert_cleaned_up(browser: &SimulatedBrowser) {
    assert_eq!(browser.open_tabs(), 0, "tabs left open");
    assert_eq!(browser.active_hooks(), 0, "hooks left registered");
    assert_eq!(browser.stray_unregisters(), 0, "hook unregistered twice");
    assert_eq!(browser.cache_len(), 0, "cache not cleared");
}

#[tokio::test]
async fn default_run_passes_for_both_policies() {
    let config = fast_config();
    let browser = SimulatedBrowser::from_config(&config);
    let report = run_with(config, &browser).await;

    assert!(report.passed(), "{:#?}", report.all_failures().collect::<Vec<_>>());
    assert_eq!(report.iterations.len(), 2);

    let isolated = report.iteration(Policy::Isolated).unwrap();
    assert_eq!(isolated.outcomes.len(), 17);
    assert_eq!(isolated.tabs_opened, 8);
    assert!(isolated.reconciled);
    assert_eq!(isolated.channels_audited, 8 * 18);
    assert_eq!(
        isolated.states,
        vec![
            HarnessState::Idle,
            HarnessState::PolicySet,
            HarnessState::ChannelsObserved,
            HarnessState::ScenariosRunning,
            HarnessState::SnapshotCollected,
            HarnessState::Reconciled,
            HarnessState::TornDown,
            HarnessState::Idle,
        ]
    );

    let shared = report.iteration(Policy::NotIsolated).unwrap();
    assert!(!shared.states.contains(&HarnessState::ChannelsObserved));
    assert_eq!(shared.channels_audited, 0);

    assert_eq!(browser.tabs_closed(), 16);
    assert_cleaned_up(&browser);
}

#[tokio::test]
async fn isolation_multiplies_entries_per_first_party() {
    let config = fast_config();
    let browser = SimulatedBrowser::from_config(&config);
    let report = run_with(config, &browser).await;

    let isolated = report.iteration(Policy::Isolated).unwrap();
    let img = isolated.outcome("img.png").unwrap();
    assert_eq!((img.expected, img.observed), (2, 2));
    let fetch = isolated.outcome("worker.fetch.html").unwrap();
    assert_eq!((fetch.expected, fetch.observed), (2, 2));

    let shared = report.iteration(Policy::NotIsolated).unwrap();
    let img = shared.outcome("img.png").unwrap();
    assert_eq!((img.expected, img.observed), (1, 1));
    assert_eq!(shared.entries_captured, 17);
    assert_eq!(isolated.entries_captured, 34);
}

#[tokio::test]
async fn original_policy_is_restored() {
    let config = fast_config();
    let browser = SimulatedBrowser::from_config(&config);
    browser.set_pref(DEFAULT_POLICY_KEY, 1);

    let report = run_with(config, &browser).await;

    assert_eq!(report.original_policy, 1);
    assert_eq!(browser.pref(DEFAULT_POLICY_KEY), Some(1));
    assert_cleaned_up(&browser);
}

#[tokio::test]
async fn stale_entries_do_not_leak_into_the_run() {
    let config = fast_config();
    let browser = SimulatedBrowser::from_config(&config);
    browser.seed_entry(
        PartitionContext::DEFAULT,
        "http://example.net/browser/netwerk/test/browser/thirdPartyChild.img.png",
        Some("example.edu"),
    );

    let report = run_with(config, &browser).await;

    assert!(report.passed());
    assert_cleaned_up(&browser);
}

#[tokio::test]
async fn load_timeout_is_reported_and_tabs_still_closed() {
    let config = fast_config();
    let browser = SimulatedBrowser::from_config(&config).hang_loads_containing("test2.example.org");
    let report = run_with(config, &browser).await;

    assert!(!report.passed());
    for iteration in &report.iterations {
        let timeouts: Vec<_> = iteration
            .failures
            .iter()
            .filter(|f| f.kind == FailureKind::Timeout)
            .collect();
        assert_eq!(timeouts.len(), 2, "{:?}", iteration.failures);
        assert!(timeouts.iter().all(|f| f.stage == HarnessState::ScenariosRunning));
        assert!(timeouts.iter().all(|f| f.message.contains("test2.example.org")));

        // the other pages still populated every kind for both first parties
        assert!(iteration.reconciled);
        assert!(iteration.outcomes.iter().all(|o| o.pass));
        assert_eq!(iteration.tabs_opened, 8);
    }

    assert_eq!(browser.tabs_closed(), 16);
    assert_cleaned_up(&browser);
}

#[tokio::test]
async fn stalled_snapshot_skips_reconciliation() {
    let config = fast_config();
    let browser = SimulatedBrowser::from_config(&config).stall_visits(PartitionContext::PRIVATE);
    let report = run_with(config, &browser).await;

    assert!(!report.passed());
    for iteration in &report.iterations {
        assert!(!iteration.reconciled);
        assert!(iteration.outcomes.is_empty());
        assert_eq!(iteration.failures.len(), 1);

        let failure = &iteration.failures[0];
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert_eq!(failure.stage, HarnessState::SnapshotCollected);
        assert!(failure.message.contains("p,"));
        assert!(iteration.states.contains(&HarnessState::TornDown));
    }
    assert_cleaned_up(&browser);
}

#[tokio::test]
async fn uncached_media_only_fails_when_isolated() {
    let config = fast_config();
    let browser = SimulatedBrowser::from_config(&config).skip_media_caching();
    browser.set_pref(DEFAULT_POLICY_KEY, 1);
    let report = run_with(config, &browser).await;

    let shared = report.iteration(Policy::NotIsolated).unwrap();
    assert!(shared.passed());
    assert_eq!(shared.outcome("audio.ogg").unwrap().observed, 0);

    let isolated = report.iteration(Policy::Isolated).unwrap();
    let mismatched: Vec<_> = isolated
        .failures
        .iter()
        .filter(|f| f.kind == FailureKind::PopulationMismatch)
        .collect();
    assert_eq!(mismatched.len(), 2);
    assert!(!isolated.outcome("video.ogv").unwrap().pass);
    assert!(isolated.outcome("img.png").unwrap().pass);

    // a failing run still writes the original value back
    assert!(!report.passed());
    assert_eq!(browser.pref(DEFAULT_POLICY_KEY), Some(1));
    assert_cleaned_up(&browser);
}

#[tokio::test]
async fn rejected_policy_write_skips_the_iteration_and_restores() {
    let config = fast_config();
    let browser = SimulatedBrowser::from_config(&config).reject_policy_value(2);
    browser.set_pref(DEFAULT_POLICY_KEY, 1);
    let report = run_with(config, &browser).await;

    let isolated = report.iteration(Policy::Isolated).unwrap();
    assert_eq!(
        isolated.states,
        vec![
            HarnessState::Idle,
            HarnessState::PolicySet,
            HarnessState::TornDown,
            HarnessState::Idle,
        ]
    );
    assert_eq!(isolated.failures.len(), 1);
    assert_eq!(isolated.failures[0].kind, FailureKind::Store);
    assert_eq!(isolated.failures[0].stage, HarnessState::PolicySet);
    assert_eq!(isolated.tabs_opened, 0);
    assert!(!isolated.reconciled);

    assert!(report.iteration(Policy::NotIsolated).unwrap().passed());
    assert!(report.failures.is_empty());
    assert_eq!(browser.pref(DEFAULT_POLICY_KEY), Some(1));
    assert_eq!(browser.tabs_closed(), 8);
    assert_cleaned_up(&browser);
}

#[tokio::test]
async fn misattributed_first_party_is_reported() {
    let config = fast_config();
    let browser = SimulatedBrowser::from_config(&config).misattribute_first_party("example.edu");
    let report = run_with(config, &browser).await;

    let isolated = report.iteration(Policy::Isolated).unwrap();
    let unexpected: Vec<_> = isolated
        .failures
        .iter()
        .filter(|f| f.kind == FailureKind::UnexpectedFirstParty)
        .collect();
    assert_eq!(unexpected.len(), 8 * 18);
    assert!(unexpected[0].message.contains("is example.edu"));
    assert!(unexpected.iter().all(|f| f.stage == HarnessState::ChannelsObserved));

    // nothing audits channels when isolation is off
    assert!(report.iteration(Policy::NotIsolated).unwrap().passed());
    assert_cleaned_up(&browser);
}

#[tokio::test]
async fn failing_tab_close_does_not_stop_teardown() {
    let config = fast_config();
    let browser = SimulatedBrowser::from_config(&config).fail_closes();
    let report = run_with(config, &browser).await;

    for iteration in &report.iterations {
        let close_failures = iteration
            .failures
            .iter()
            .filter(|f| f.stage == HarnessState::TornDown)
            .count();
        assert_eq!(close_failures, 8);
        assert!(iteration.outcomes.iter().all(|o| o.pass));
    }
    assert_cleaned_up(&browser);
}

#[tokio::test]
async fn explicit_scenarios_and_table() {
    let config = fast_config();
    let browser = SimulatedBrowser::new(
        "example.net",
        "thirdPartyChild.",
        ["img.png".to_string(), "link.css".to_string()],
    );
    let scenarios = ScenarioSet::new(vec![
        Scenario::new("a.example.com", "example.net", "/parent.html"),
        Scenario::new("b.example.org", "example.net", "/parent.html"),
        Scenario::new("c.example.edu", "example.net", "/parent.html"),
    ]);
    let table = ExpectationTable::new("thirdPartyChild.")
        .with_kind("img.png", Default::default())
        .with_kind("link.css", Default::default());

    init_test_logger();
    let harness = CacheHarness::new(config, collaborators(&browser))
        .unwrap()
        .with_scenarios(scenarios)
        .unwrap()
        .with_expectations(table);
    let report = harness.run().await.unwrap();

    assert!(report.passed());
    let isolated = report.iteration(Policy::Isolated).unwrap();
    assert_eq!(isolated.outcome("img.png").unwrap().expected, 3);
    assert_eq!(isolated.outcome("link.css").unwrap().observed, 3);
    assert_eq!(isolated.outcomes.len(), 2);
}

#[tokio::test]
async fn explicit_scenarios_set_the_target_host() {
    let config = fast_config();
    let browser = SimulatedBrowser::new(
        "cdn.test",
        "thirdPartyChild.",
        ["img.png".to_string()],
    );
    let scenarios = ScenarioSet::new(vec![
        Scenario::new("a.example.com", "cdn.test", "/parent.html"),
        Scenario::new("b.example.org", "cdn.test", "/parent.html"),
    ]);
    let table = ExpectationTable::new("thirdPartyChild.").with_kind("img.png", Default::default());

    init_test_logger();
    let harness = CacheHarness::new(config, collaborators(&browser))
        .unwrap()
        .with_scenarios(scenarios)
        .unwrap()
        .with_expectations(table);
    assert_eq!(harness.target_host(), "cdn.test");
    let report = harness.run().await.unwrap();

    assert!(report.passed(), "{:#?}", report.all_failures().collect::<Vec<_>>());
    let isolated = report.iteration(Policy::Isolated).unwrap();
    assert!(isolated.channels_audited > 0);
    let img = isolated.outcome("img.png").unwrap();
    assert_eq!((img.expected, img.observed), (2, 2));
    assert_cleaned_up(&browser);
}

#[tokio::test]
async fn scenarios_with_mixed_hosts_are_rejected() {
    let config = fast_config();
    let browser = SimulatedBrowser::from_config(&config);
    let mixed = ScenarioSet::new(vec![
        Scenario::new("a.example.com", "example.net", "/parent.html"),
        Scenario::new("b.example.org", "cdn.test", "/parent.html"),
    ]);

    let harness = CacheHarness::new(config.clone(), collaborators(&browser)).unwrap();
    let err = harness.with_scenarios(mixed).unwrap_err();
    assert_eq!(err.kind(), FailureKind::Config);
    assert!(err.to_string().contains("cdn.test"));

    let harness = CacheHarness::new(config, collaborators(&browser)).unwrap();
    let err = harness.with_scenarios(ScenarioSet::new(Vec::new())).unwrap_err();
    assert_eq!(err.kind(), FailureKind::Config);
}

#[tokio::test]
async fn renavigating_a_first_party_reuses_its_entries() {
    let config = fast_config();
    let browser = SimulatedBrowser::from_config(&config);
    let scenarios = ScenarioSet::new(
        ["test1", "test2", "test3", "test1"]
            .iter()
            .map(|label| {
                Scenario::new(
                    format!("{label}.example.com"),
                    "example.net",
                    "/browser/netwerk/test/browser/firstPartyParent.html",
                )
            })
            .collect(),
    );

    init_test_logger();
    let harness = CacheHarness::new(config, collaborators(&browser))
        .unwrap()
        .with_scenarios(scenarios)
        .unwrap();
    let report = harness.run().await.unwrap();

    assert!(report.passed());
    let isolated = report.iteration(Policy::Isolated).unwrap();
    assert_eq!(isolated.tabs_opened, 4);
    let img = isolated.outcome("img.png").unwrap();
    assert_eq!((img.expected, img.observed), (1, 1));
}

#[tokio::test]
async fn report_is_emitted_through_assertions() {
    let config = fast_config();
    let browser = SimulatedBrowser::from_config(&config).skip_media_caching();
    let report = run_with(config, &browser).await;

    let recorder = RecordingAssertion::new();
    report.report_to(&recorder);

    assert_eq!(recorder.checks().len(), 2 * 17);
    assert_eq!(
        recorder.failures(),
        vec![
            "[isolated] Cache entries expected for audio.ogg: 2 (observed 0)".to_string(),
            "[isolated] Cache entries expected for video.ogv: 2 (observed 0)".to_string(),
        ]
    );

    let json = report.to_json().unwrap();
    assert!(json.contains("\"population_mismatch\""));
}
