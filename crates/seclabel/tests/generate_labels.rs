//! Integration tests for label generation across stacked drivers.

mod common;

use common::{Behavior, FakeDriver, confined, guest, manager, stack, unconfined};
use seclabel::domain::{DomainDef, LabelType, SecurityLabelDef};
use seclabel::security::SecurityManager;
use seclabel_common::SeclabelError;

const NAMES: [&str; 3] = ["alpha", "beta", "gamma"];

fn models(def: &DomainDef) -> Vec<&str> {
    def.seclabels
        .iter()
        .filter_map(|l| l.model.as_deref())
        .collect()
}

#[test]
fn single_unconfined_dac_gets_implicit_none_entry() {
    let mgr = SecurityManager::new_dac("qemu", 107, 107, unconfined(), true).unwrap();
    let mut def = guest();

    mgr.generate_labels(&mut def).unwrap();

    assert_eq!(def.seclabels.len(), 1);
    let seclabel = &def.seclabels[0];
    assert_eq!(seclabel.model.as_deref(), Some("dac"));
    assert_eq!(seclabel.label_type, LabelType::None);
    assert!(seclabel.implicit);
    assert!(seclabel.norelabel);
}

#[test]
fn single_unconfined_backend_still_invoked() {
    let driver = FakeDriver::new("alpha");
    let calls = driver.calls();
    let mgr = manager(driver, unconfined());
    let mut def = guest();

    mgr.generate_labels(&mut def).unwrap();

    assert_eq!(calls.generated(), 1);
    assert_eq!(def.seclabels[0].label_type, LabelType::None);
}

#[test]
fn default_confined_backend_gets_dynamic_label() {
    let mgr = manager(FakeDriver::new("alpha"), confined());
    let mut def = guest();

    mgr.generate_labels(&mut def).unwrap();

    let seclabel = def.find_seclabel("alpha").unwrap();
    assert_eq!(seclabel.label_type, LabelType::Dynamic);
    assert_eq!(seclabel.label.as_deref(), Some("alpha-label"));
    assert!(seclabel.implicit);
    assert!(!seclabel.norelabel);
}

#[test]
fn explicit_default_entry_is_resolved() {
    let mgr = manager(FakeDriver::new("alpha"), confined());
    let mut def = guest();
    def.push_seclabel(SecurityLabelDef::new("alpha", LabelType::Default));

    mgr.generate_labels(&mut def).unwrap();

    assert_eq!(def.seclabels.len(), 1);
    let seclabel = &def.seclabels[0];
    assert_eq!(seclabel.label_type, LabelType::Dynamic);
    assert!(!seclabel.implicit);
}

#[test]
fn required_confinement_stops_before_next_backend() {
    let first = FakeDriver::new("alpha");
    let second = FakeDriver::new("beta");
    let (first_calls, second_calls) = (first.calls(), second.calls());
    let mgr = stack(vec![
        (first, unconfined().with_require_confined(true)),
        (second, confined()),
    ]);
    let mut def = guest();

    let err = mgr.generate_labels(&mut def).unwrap_err();

    assert!(matches!(err, SeclabelError::ConfigUnsupported { .. }));
    assert!(def.seclabels.is_empty());
    assert_eq!(first_calls.generated(), 0);
    assert_eq!(second_calls.generated(), 0);
}

#[test]
fn explicit_none_rejected_when_confinement_required() {
    let mgr = manager(
        FakeDriver::new("alpha"),
        confined().with_require_confined(true),
    );
    let mut def = guest();
    def.push_seclabel(SecurityLabelDef::new("alpha", LabelType::None));
    let before = def.clone();

    let err = mgr.generate_labels(&mut def).unwrap_err();

    assert!(matches!(err, SeclabelError::ConfigUnsupported { .. }));
    assert_eq!(def, before);
}

#[test]
fn implicit_none_skipped_once_domain_has_entries() {
    let second = FakeDriver::new("beta");
    let second_calls = second.calls();
    let mgr = stack(vec![(FakeDriver::new("alpha"), confined()), (second, unconfined())]);
    let mut def = guest();

    mgr.generate_labels(&mut def).unwrap();

    assert_eq!(models(&def), ["alpha"]);
    assert_eq!(second_calls.generated(), 0);
}

#[test]
fn existing_implicit_entry_is_still_generated() {
    let driver = FakeDriver::new("alpha");
    let calls = driver.calls();
    let mgr = manager(driver, unconfined());
    let mut def = guest();
    def.push_seclabel(SecurityLabelDef::implicit("alpha"));

    mgr.generate_labels(&mut def).unwrap();

    assert_eq!(calls.generated(), 1);
    assert_eq!(def.seclabels.len(), 1);
    let seclabel = &def.seclabels[0];
    assert_eq!(seclabel.label_type, LabelType::None);
    assert!(seclabel.norelabel);
}

#[test]
fn reloaded_definition_is_generated_again() {
    let driver = FakeDriver::new("alpha");
    let calls = driver.calls();
    let mgr = manager(driver, unconfined());
    let mut def = guest();

    mgr.generate_labels(&mut def).unwrap();
    let mut reloaded = DomainDef::from_json(&def.to_json().unwrap()).unwrap();
    assert!(reloaded.seclabels[0].implicit);
    mgr.generate_labels(&mut reloaded).unwrap();

    assert_eq!(calls.generated(), 2);
    assert_eq!(reloaded, def);
}

#[test]
fn generation_is_idempotent() {
    let mgr = stack(
        NAMES
            .into_iter()
            .map(|name| (FakeDriver::new(name), confined()))
            .collect(),
    );
    let mut def = guest();
    for name in NAMES {
        def.push_seclabel(SecurityLabelDef::new(name, LabelType::Dynamic));
    }

    mgr.generate_labels(&mut def).unwrap();
    let generated = def.clone();
    mgr.generate_labels(&mut def).unwrap();

    assert_eq!(def, generated);
    assert_eq!(def.seclabels.len(), NAMES.len());
    assert!(def.seclabels.iter().all(|l| !l.implicit));
}

#[test]
fn unknown_model_leaves_domain_untouched() {
    let driver = FakeDriver::new("alpha");
    let calls = driver.calls();
    let mgr = stack(vec![(driver, confined())]);
    let mut def = guest();
    def.push_seclabel(SecurityLabelDef::new("ghost", LabelType::Dynamic));
    let before = def.clone();

    let err = mgr.generate_labels(&mut def).unwrap_err();

    assert!(matches!(err, SeclabelError::ConfigUnsupported { .. }));
    assert_eq!(def, before);
    assert_eq!(calls.generated(), 0);
}

#[test]
fn entries_without_model_are_not_validated() {
    let mgr = manager(FakeDriver::new("alpha"), confined());
    let mut def = guest();
    def.push_seclabel(SecurityLabelDef::default());

    mgr.generate_labels(&mut def).unwrap();

    assert_eq!(def.seclabels.len(), 2);
    assert!(def.find_seclabel("alpha").is_some());
}

#[test]
fn failure_at_each_position_keeps_only_earlier_entries() {
    for failing in 0..NAMES.len() {
        let mgr = stack(
            NAMES
                .into_iter()
                .enumerate()
                .map(|(i, name)| {
                    let behavior = if i == failing {
                        Behavior::Fail
                    } else {
                        Behavior::Succeed
                    };
                    (FakeDriver::new(name).with_generate(behavior), confined())
                })
                .collect(),
        );
        let mut def = guest();

        let err = mgr.generate_labels(&mut def).unwrap_err();

        assert!(matches!(err, SeclabelError::Driver { .. }), "position {failing}");
        assert_eq!(models(&def), NAMES[..failing], "position {failing}");
        for seclabel in &def.seclabels {
            assert_ne!(seclabel.label.as_deref(), Some("partial"));
        }
    }
}

#[test]
fn failing_explicit_entry_is_restored() {
    let mgr = stack(vec![
        (FakeDriver::new("alpha"), confined()),
        (FakeDriver::new("beta").with_generate(Behavior::Fail), confined()),
    ]);
    let mut def = guest();
    def.push_seclabel(SecurityLabelDef::new("beta", LabelType::Default));

    mgr.generate_labels(&mut def).unwrap_err();

    let beta = def.find_seclabel("beta").unwrap();
    assert_eq!(beta.label_type, LabelType::Default);
    assert!(beta.label.is_none());
    assert_eq!(models(&def), ["beta", "alpha"]);
}

#[test]
fn unsupported_generation_appends_nothing() {
    let mgr = manager(FakeDriver::bare("alpha"), confined());
    let mut def = guest();

    let err = mgr.generate_labels(&mut def).unwrap_err();

    assert!(matches!(err, SeclabelError::NotSupported { ref driver, .. } if driver == "alpha"));
    assert!(def.seclabels.is_empty());
}

#[test_log::test]
fn stacked_real_drivers_generate_together() {
    let primary = SecurityManager::new(
        &seclabel::security::BuiltinRegistry::new(),
        Some("none"),
        "qemu",
        confined(),
    )
    .unwrap();
    let mgr = SecurityManager::new_stack(primary).unwrap();
    mgr.stack_add_nested(SecurityManager::new_dac("qemu", 107, 108, confined(), true).unwrap())
        .unwrap();
    let mut def = guest();

    mgr.generate_labels(&mut def).unwrap();

    // The none manager is unconfined, so its implicit entry is committed
    // first and dac follows with a dynamic owner.
    let dac = def.find_seclabel("dac").unwrap();
    assert_eq!(dac.label_type, LabelType::Dynamic);
    assert_eq!(dac.label.as_deref(), Some("+107:+108"));
    assert_eq!(models(&def), ["none", "dac"]);
}
