use super::*;

#[test]
fn untouched_family_is_idle() {
    let ledger = CommandLedger::new();
    for family in OperationFamily::ALL {
        assert_eq!(ledger.slot(family).phase(), CommandPhase::Idle);
        assert!(!ledger.is_loading(family));
        assert!(ledger.last_error(family).is_none());
    }
}

#[test]
fn failure_is_recorded_until_next_attempt_starts() {
    let mut ledger = CommandLedger::new();
    let ticket = ledger.begin(OperationFamily::Start);
    assert!(ledger.is_loading(OperationFamily::Start));
    assert_eq!(ledger.slot(OperationFamily::Start).phase(), CommandPhase::Pending);

    ledger.settle(ticket, Err("Failed to start procedure".to_string()));
    assert!(!ledger.is_loading(OperationFamily::Start));
    assert_eq!(ledger.slot(OperationFamily::Start).phase(), CommandPhase::Failed);
    assert_eq!(
        ledger.last_error(OperationFamily::Start),
        Some("Failed to start procedure")
    );

    ledger.begin(OperationFamily::Start);
    assert!(ledger.last_error(OperationFamily::Start).is_none());
}

#[test]
fn families_do_not_share_slots() {
    let mut ledger = CommandLedger::new();
    let stop = ledger.begin(OperationFamily::Stop);
    ledger.settle(stop, Err("boom".to_string()));
    ledger.begin(OperationFamily::ListPorts);

    assert_eq!(ledger.last_error(OperationFamily::Stop), Some("boom"));
    assert!(ledger.is_loading(OperationFamily::ListPorts));
    assert!(!ledger.is_loading(OperationFamily::Stop));
    assert!(ledger.any_loading());
}

#[test]
fn success_clears_error_and_settles() {
    let mut ledger = CommandLedger::new();
    let ticket = ledger.begin(OperationFamily::Create);
    assert_eq!(ledger.settle(ticket, Ok(())), Settlement::Current);
    assert_eq!(ledger.slot(OperationFamily::Create).phase(), CommandPhase::Succeeded);
    assert!(ledger.last_error(OperationFamily::Create).is_none());
}

#[test]
fn superseded_failure_does_not_touch_newer_attempt() {
    let mut ledger = CommandLedger::new();
    let first = ledger.begin(OperationFamily::Update);
    let second = ledger.begin(OperationFamily::Update);
    assert_eq!(ledger.slot(OperationFamily::Update).in_flight(), 2);

    assert_eq!(
        ledger.settle(first, Err("stale".to_string())),
        Settlement::Superseded
    );
    assert!(ledger.is_loading(OperationFamily::Update));
    assert!(ledger.last_error(OperationFamily::Update).is_none());

    assert_eq!(ledger.settle(second, Ok(())), Settlement::Current);
    assert!(!ledger.is_loading(OperationFamily::Update));
    assert_eq!(ledger.slot(OperationFamily::Update).phase(), CommandPhase::Succeeded);
}

#[test]
fn late_superseded_success_keeps_newer_error() {
    let mut ledger = CommandLedger::new();
    let first = ledger.begin(OperationFamily::Delete);
    let second = ledger.begin(OperationFamily::Delete);

    ledger.settle(second, Err("Procedure not found".to_string()));
    ledger.settle(first, Ok(()));

    assert_eq!(
        ledger.last_error(OperationFamily::Delete),
        Some("Procedure not found")
    );
    assert_eq!(ledger.slot(OperationFamily::Delete).phase(), CommandPhase::Failed);
}
