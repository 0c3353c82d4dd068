use serde::{Deserialize, Serialize};

use clinicflow_core::{Aggregate, AggregateId, AggregateRoot, DomainError, DomainResult};
use clinicflow_events::{Event, EventContext, EventLog, EventSourced};

/// Patient identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatientId(pub AggregateId);

impl PatientId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for PatientId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// How the patient first reached the clinic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionSource {
    WalkIn,
    Referral,
    Website,
    Whatsapp,
    Phone,
    Other,
}

/// Command input: RegisterPatient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPatient {
    pub full_name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub source: AcquisitionSource,
}

/// Event: PatientRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientRegistered {
    pub patient_id: PatientId,
    pub full_name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub source: AcquisitionSource,
}

/// Event: PatientContactUpdated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientContactUpdated {
    pub patient_id: PatientId,
    pub phone: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "event_data")]
pub enum PatientEvent {
    PatientRegistered(PatientRegistered),
    PatientContactUpdated(PatientContactUpdated),
}

impl Event for PatientEvent {
    const EVENT_TYPES: &'static [&'static str] = &["PatientRegistered", "PatientContactUpdated"];

    fn event_type(&self) -> &'static str {
        match self {
            PatientEvent::PatientRegistered(_) => "PatientRegistered",
            PatientEvent::PatientContactUpdated(_) => "PatientContactUpdated",
        }
    }
}

/// Aggregate root: Patient.
#[derive(Debug, Clone)]
pub struct Patient {
    id: PatientId,
    full_name: String,
    phone: Option<String>,
    email: Option<String>,
    source: Option<AcquisitionSource>,
    registered: bool,
    log: EventLog<PatientEvent>,
}

impl Patient {
    /// Create an empty, not-yet-registered aggregate instance for rehydration.
    pub fn empty(id: PatientId) -> Self {
        Self {
            id,
            full_name: String::new(),
            phone: None,
            email: None,
            source: None,
            registered: false,
            log: EventLog::new(),
        }
    }

    pub fn register(ctx: &EventContext, id: PatientId, cmd: RegisterPatient) -> DomainResult<Self> {
        let full_name = cmd.full_name.trim().to_string();
        if full_name.is_empty() {
            return Err(DomainError::validation("full_name cannot be empty"));
        }
        let phone = normalize(cmd.phone);
        let email = normalize(cmd.email);
        validate_email(email.as_deref())?;

        let mut patient = Self::empty(id);
        patient.record(
            ctx,
            PatientEvent::PatientRegistered(PatientRegistered {
                patient_id: id,
                full_name,
                phone,
                email,
                source: cmd.source,
            }),
        );
        Ok(patient)
    }

    /// Replace phone and email. Returns `false` (and records nothing) when
    /// both are unchanged.
    pub fn update_contact(
        &mut self,
        ctx: &EventContext,
        phone: Option<String>,
        email: Option<String>,
    ) -> DomainResult<bool> {
        if !self.registered {
            return Err(DomainError::not_found());
        }
        let phone = normalize(phone);
        let email = normalize(email);
        validate_email(email.as_deref())?;

        if phone == self.phone && email == self.email {
            return Ok(false);
        }

        self.record(
            ctx,
            PatientEvent::PatientContactUpdated(PatientContactUpdated {
                patient_id: self.id,
                phone,
                email,
            }),
        );
        Ok(true)
    }

    pub fn id_typed(&self) -> PatientId {
        self.id
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn phone(&self) -> Option<&str> {
        self.phone.as_deref()
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn source(&self) -> Option<AcquisitionSource> {
        self.source
    }
}

fn normalize(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn validate_email(email: Option<&str>) -> DomainResult<()> {
    match email {
        Some(e) if !e.contains('@') => Err(DomainError::validation("email must contain '@'")),
        _ => Ok(()),
    }
}

impl AggregateRoot for Patient {
    type Id = PatientId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.log.version()
    }
}

impl Aggregate for Patient {
    const AGGREGATE_TYPE: &'static str = "Patient";
    type Event = PatientEvent;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PatientEvent::PatientRegistered(e) => {
                self.full_name = e.full_name.clone();
                self.phone = e.phone.clone();
                self.email = e.email.clone();
                self.source = Some(e.source);
                self.registered = true;
            }
            PatientEvent::PatientContactUpdated(e) => {
                self.phone = e.phone.clone();
                self.email = e.email.clone();
            }
        }
    }
}

impl EventSourced for Patient {
    fn aggregate_id(&self) -> AggregateId {
        self.id.0
    }

    fn event_log(&self) -> &EventLog<PatientEvent> {
        &self.log
    }

    fn event_log_mut(&mut self) -> &mut EventLog<PatientEvent> {
        &mut self.log
    }
}
