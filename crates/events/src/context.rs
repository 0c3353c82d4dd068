//! Execution context a command runs under.

use uuid::Uuid;

use clinicflow_core::{ClinicId, CorrelationId, TenantId, UserId};

use crate::envelope::{EventEnvelope, JsonMap};

/// Scoping and tracing metadata stamped onto every event a command records.
///
/// A fresh context starts a new business operation (new correlation id).
/// Reactions to an existing event should use [`EventContext::caused_by`] so
/// the whole chain shares one correlation id and each link points at the
/// event that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    tenant_id: TenantId,
    clinic_id: Option<ClinicId>,
    correlation_id: CorrelationId,
    causation_id: Option<Uuid>,
    user_id: Option<UserId>,
    metadata: Option<JsonMap>,
}

impl EventContext {
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            clinic_id: None,
            correlation_id: CorrelationId::new(),
            causation_id: None,
            user_id: None,
            metadata: None,
        }
    }

    /// Context for events emitted in reaction to `event`.
    ///
    /// Tenant, clinic and correlation are inherited; the causation id is the
    /// originating event id. The acting user is not inherited.
    pub fn caused_by<E>(event: &EventEnvelope<E>) -> Self {
        Self {
            tenant_id: event.tenant_id(),
            clinic_id: event.clinic_id(),
            correlation_id: event.correlation_id(),
            causation_id: Some(event.event_id()),
            user_id: None,
            metadata: None,
        }
    }

    pub fn with_clinic(mut self, clinic_id: ClinicId) -> Self {
        self.clinic_id = Some(clinic_id);
        self
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_causation(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_metadata(mut self, metadata: JsonMap) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn clinic_id(&self) -> Option<ClinicId> {
        self.clinic_id
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn causation_id(&self) -> Option<Uuid> {
        self.causation_id
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn metadata(&self) -> Option<&JsonMap> {
        self.metadata.as_ref()
    }
}
