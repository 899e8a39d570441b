//! The shipped sample configuration must load and build every strategy it names.

use ai_app_gateway::{
    core::config::{AppConfig, RouterKind},
    routing::try_build_strategy,
};
use serial_test::serial;

#[test]
#[serial]
fn test_sample_config_builds_all_strategies() {
    std::env::set_var("EASTUS_API_KEY", "east-key");
    let config = AppConfig::load(concat!(env!("CARGO_MANIFEST_DIR"), "/config.yaml")).unwrap();
    std::env::remove_var("EASTUS_API_KEY");

    assert_eq!(config.applications.len(), 3);
    let support = config.application("support-bot").unwrap();
    assert_eq!(support.routing.strategy, RouterKind::WeightedDynamic);
    assert_eq!(support.endpoints[0].api_key, "east-key");
    assert!(support.memory_enabled && support.cache_enabled);
    assert_eq!(support.memory_settings.msg_count, Some(20));
    assert!(support.cache_settings.entry_ttl().is_some());

    for application in &config.applications {
        let strategy = try_build_strategy(&application.routing, &application.endpoints)
            .unwrap_or_else(|e| panic!("{}: {}", application.app_id, e));
        assert_eq!(strategy.kind(), application.routing.strategy);
    }
}
