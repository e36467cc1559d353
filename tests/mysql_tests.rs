//! Runs the built-in scenarios against a live MySQL server.
//!
//! Ignored by default. Point `ISOSCOPE_HOST`, `ISOSCOPE_USER`,
//! `ISOSCOPE_PASSWORD` and `ISOSCOPE_DATABASE` at a scratch database and run
//! `cargo test --test mysql_tests -- --ignored`.

#![cfg(feature = "mysql")]

use std::sync::Arc;

use isoscope::prelude::*;

fn live_harness() -> Harness {
    let config = HarnessConfig::load(None).unwrap();
    Harness::new(Arc::new(MySqlConnector::from_config(&config)), config.scheduler())
        .with_fixture(config.fixture())
        .with_serialization_failure(config.engine.serialization_failure)
}

#[test]
#[ignore]
fn test_mysql_builtin_scenarios() {
    let harness = live_harness();
    for kind in ScenarioKind::ALL {
        let scenario = harness.scenario(kind, None).unwrap();
        let verdict = harness.run(&scenario).unwrap();
        println!("{}", verdict);
        assert!(verdict.passed(), "{}", verdict);
    }
}

#[test]
#[ignore]
fn test_mysql_session_round_trip() {
    let config = HarnessConfig::load(None).unwrap();
    let connector = MySqlConnector::from_config(&config);
    let harness = live_harness();
    // Creates the table and the fixture row.
    let scenario = harness.scenario(ScenarioKind::ReadCommitted, None).unwrap();
    harness.run(&scenario).unwrap();

    let mut session = SessionHandle::open(
        &connector,
        ParticipantId::from("probe"),
        config.scheduler().statement_timeout,
    )
    .unwrap();
    session.begin(TransactionIsolation::ReadCommitted).unwrap();
    let rows = session
        .execute(sql::SELECT_BALANCE, &[Value::from(config.fixture.subject.as_str())])
        .unwrap();
    assert_eq!(rows.columns, vec!["balance".to_string()]);
    let balance = rows.first_value().unwrap();
    assert!(matches!(balance, Value::Decimal(_)), "{:?}", balance);
    assert!(balance.matches(&Value::from(config.fixture.initial_balance)));

    let missing = session
        .execute(sql::SELECT_BALANCE, &[Value::from("nobody")])
        .unwrap();
    assert!(missing.is_empty());
    assert_eq!(session.fetch().unwrap(), None);

    session.commit().unwrap();
    assert_eq!(session.status(), TxnStatus::Committed);
    session.close().unwrap();
}
