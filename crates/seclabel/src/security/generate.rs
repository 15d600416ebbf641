//! Label generation across every nested manager of a domain.
//!
//! Each nested manager ends up with at most one label entry in the
//! domain. Managers are processed in stack order and generation stops at
//! the first failure. Entries committed by earlier managers stay in the
//! domain; only the entry of the failing manager is rolled back.

use std::sync::Arc;

use seclabel_common::{SeclabelError, SeclabelResult};

use super::SecurityManager;
use crate::domain::{DomainDef, LabelType, SecurityLabelDef};

impl SecurityManager {
    /// Create or complete the label entry of every nested manager.
    ///
    /// An entry synthesized by this call is removed again if its manager
    /// fails. An entry the domain already had is restored to its previous
    /// value, including a `Default` type resolved during the call.
    ///
    /// # Errors
    ///
    /// - [`SeclabelError::ConfigUnsupported`] if an entry names a model no
    ///   nested manager provides (the domain is left untouched), or a
    ///   manager that requires confinement would leave the domain unconfined.
    /// - Whatever the failing driver reports, including
    ///   [`SeclabelError::NotSupported`] for drivers that cannot generate.
    pub fn generate_labels(self: &Arc<Self>, def: &mut DomainDef) -> SeclabelResult<()> {
        let backends = self.get_nested()?;

        for seclabel in &def.seclabels {
            let Some(model) = seclabel.model.as_deref() else {
                continue;
            };

            if !backends.iter().any(|b| b.driver_name() == model) {
                return Err(SeclabelError::config_unsupported(format!(
                    "Unable to find security driver for model {model}"
                )));
            }
        }

        for backend in &backends {
            generate_one(backend, def)?;
        }

        Ok(())
    }
}

fn generate_one(backend: &SecurityManager, def: &mut DomainDef) -> SeclabelResult<()> {
    let model = backend.driver_name();
    let existing = def
        .seclabels
        .iter()
        .position(|l| l.model.as_deref() == Some(model));

    let mut seclabel = existing.map_or_else(
        || SecurityLabelDef::implicit(model),
        |i| def.seclabels[i].clone(),
    );

    if seclabel.label_type == LabelType::Default {
        if backend.default_confined() {
            seclabel.label_type = LabelType::Dynamic;
        } else {
            seclabel.label_type = LabelType::None;
            seclabel.norelabel = true;
        }
    }

    if seclabel.label_type == LabelType::None {
        if backend.require_confined() {
            return Err(SeclabelError::config_unsupported(
                "Unconfined guests are not allowed on this host",
            ));
        }

        if existing.is_none() && def.seclabel_count() > 0 {
            tracing::debug!(
                domain = %def.name,
                model,
                "Skipping implicit unconfined label, domain already has labels"
            );
            return Ok(());
        }
    }

    let label_type = seclabel.label_type;

    match existing {
        Some(i) => {
            let original = std::mem::replace(&mut def.seclabels[i], seclabel);
            if let Err(e) = backend.generate_label(def) {
                if let Some(slot) = def.seclabels.get_mut(i) {
                    *slot = original;
                }
                return Err(e);
            }
        }
        None => {
            def.push_seclabel(seclabel);
            if let Err(e) = backend.generate_label(def) {
                def.pop_seclabel();
                return Err(e);
            }
        }
    }

    tracing::info!(
        domain = %def.name,
        model,
        %label_type,
        implicit = existing.is_none(),
        "Generated security label"
    );

    Ok(())
}
