//! Fake security drivers shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use seclabel::domain::{DomainDef, LabelType};
use seclabel::security::{DriverRegistry, SecurityDriver, SecurityManager, SecurityManagerFlags};
use seclabel_common::{DomainName, SeclabelError, SeclabelResult};

/// How a fake capability behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Succeeds.
    Succeed,
    /// Mutates what it can, then fails.
    Fail,
    /// Not implemented by the driver.
    Unsupported,
}

/// Calls observed by fake drivers.
#[derive(Debug, Default)]
pub struct Calls {
    pub open: AtomicUsize,
    pub close: AtomicUsize,
    pub generate: AtomicUsize,
    pub verify: AtomicUsize,
    /// Fork hooks in call order, as `pre:<name>` / `post:<name>`.
    pub forks: Mutex<Vec<String>>,
}

impl Calls {
    pub fn opened(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.close.load(Ordering::SeqCst)
    }

    pub fn generated(&self) -> usize {
        self.generate.load(Ordering::SeqCst)
    }

    pub fn verified(&self) -> usize {
        self.verify.load(Ordering::SeqCst)
    }

    pub fn forks(&self) -> Vec<String> {
        self.forks.lock().clone()
    }
}

/// Configurable in-memory driver.
///
/// Generation gives `Dynamic` entries the label `<name>-label` unless they
/// already carry one.
#[derive(Debug)]
pub struct FakeDriver {
    name: &'static str,
    generate: Behavior,
    verify: Behavior,
    open: Behavior,
    pre_fork: Behavior,
    probe: bool,
    calls: Arc<Calls>,
}

impl FakeDriver {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            generate: Behavior::Succeed,
            verify: Behavior::Succeed,
            open: Behavior::Succeed,
            pre_fork: Behavior::Succeed,
            probe: true,
            calls: Arc::new(Calls::default()),
        }
    }

    /// A driver implementing nothing beyond the lifecycle hooks.
    pub fn bare(name: &'static str) -> Self {
        Self::new(name)
            .with_generate(Behavior::Unsupported)
            .with_verify(Behavior::Unsupported)
    }

    pub fn with_generate(mut self, behavior: Behavior) -> Self {
        self.generate = behavior;
        self
    }

    pub fn with_verify(mut self, behavior: Behavior) -> Self {
        self.verify = behavior;
        self
    }

    pub fn with_open(mut self, behavior: Behavior) -> Self {
        self.open = behavior;
        self
    }

    pub fn with_pre_fork(mut self, behavior: Behavior) -> Self {
        self.pre_fork = behavior;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.probe = false;
        self
    }

    /// Record calls into a log shared with other drivers.
    pub fn with_calls(mut self, calls: Arc<Calls>) -> Self {
        self.calls = calls;
        self
    }

    pub fn calls(&self) -> Arc<Calls> {
        Arc::clone(&self.calls)
    }

    fn fail(&self, operation: &str) -> SeclabelError {
        SeclabelError::driver(self.name, format!("{operation} failed"))
    }
}

impl SecurityDriver for FakeDriver {
    fn name(&self) -> &'static str {
        self.name
    }

    fn probe(&self, _virt_driver: &str) -> bool {
        self.probe
    }

    fn open(&self, _mgr: &SecurityManager) -> SeclabelResult<()> {
        self.calls.open.fetch_add(1, Ordering::SeqCst);
        match self.open {
            Behavior::Fail => Err(self.fail("open")),
            _ => Ok(()),
        }
    }

    fn close(&self, _mgr: &SecurityManager) {
        self.calls.close.fetch_add(1, Ordering::SeqCst);
    }

    fn pre_fork(&self, _mgr: &SecurityManager) -> SeclabelResult<()> {
        if self.pre_fork == Behavior::Fail {
            return Err(self.fail("pre_fork"));
        }
        self.calls.forks.lock().push(format!("pre:{}", self.name));
        Ok(())
    }

    fn post_fork(&self, _mgr: &SecurityManager) {
        self.calls.forks.lock().push(format!("post:{}", self.name));
    }

    fn get_model(&self, _mgr: &SecurityManager) -> SeclabelResult<String> {
        match self.generate {
            Behavior::Unsupported => Err(SeclabelError::not_supported(self.name, "get_model")),
            _ => Ok(self.name.to_string()),
        }
    }

    fn get_doi(&self, _mgr: &SecurityManager) -> SeclabelResult<String> {
        match self.generate {
            Behavior::Unsupported => Err(SeclabelError::not_supported(self.name, "get_doi")),
            _ => Ok("0".to_string()),
        }
    }

    fn generate_label(&self, _mgr: &SecurityManager, def: &mut DomainDef) -> SeclabelResult<()> {
        if self.generate == Behavior::Unsupported {
            return Err(SeclabelError::not_supported(self.name, "generate_label"));
        }
        self.calls.generate.fetch_add(1, Ordering::SeqCst);

        let name = self.name;
        let Some(seclabel) = def.find_seclabel_mut(name) else {
            return Ok(());
        };

        if self.generate == Behavior::Fail {
            seclabel.label = Some("partial".to_string());
            return Err(self.fail("generate_label"));
        }

        if seclabel.label_type == LabelType::Dynamic && seclabel.label.is_none() {
            seclabel.label = Some(format!("{name}-label"));
        }
        Ok(())
    }

    fn verify(&self, _mgr: &SecurityManager, _def: &DomainDef) -> SeclabelResult<()> {
        if self.verify == Behavior::Unsupported {
            return Err(SeclabelError::not_supported(self.name, "verify"));
        }
        self.calls.verify.fetch_add(1, Ordering::SeqCst);
        match self.verify {
            Behavior::Fail => Err(self.fail("verify")),
            _ => Ok(()),
        }
    }
}

/// Registry serving a fixed set of drivers.
#[derive(Debug, Default)]
pub struct TestRegistry {
    drivers: Vec<Arc<dyn SecurityDriver>>,
}

impl TestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, driver: impl SecurityDriver + 'static) -> Self {
        self.drivers.push(Arc::new(driver));
        self
    }

    pub fn with_arc(mut self, driver: Arc<dyn SecurityDriver>) -> Self {
        self.drivers.push(driver);
        self
    }
}

impl DriverRegistry for TestRegistry {
    fn drivers(&self) -> Vec<Arc<dyn SecurityDriver>> {
        self.drivers.clone()
    }
}

pub fn manager(driver: FakeDriver, flags: SecurityManagerFlags) -> Arc<SecurityManager> {
    SecurityManager::new_from_driver(Arc::new(driver), "qemu", flags).unwrap()
}

/// A stack over `backends`, each with its own flags.
pub fn stack(backends: Vec<(FakeDriver, SecurityManagerFlags)>) -> Arc<SecurityManager> {
    let mut managers = backends
        .into_iter()
        .map(|(driver, flags)| manager(driver, flags));
    let stack = SecurityManager::new_stack(managers.next().unwrap()).unwrap();
    for nested in managers {
        stack.stack_add_nested(nested).unwrap();
    }
    stack
}

pub fn confined() -> SecurityManagerFlags {
    SecurityManagerFlags::default().with_default_confined(true)
}

pub fn unconfined() -> SecurityManagerFlags {
    SecurityManagerFlags::default()
}

pub fn guest() -> DomainDef {
    DomainDef::new(DomainName::new("guest1").unwrap())
}
