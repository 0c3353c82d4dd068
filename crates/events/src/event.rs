use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

/// A typed domain event payload.
///
/// Each aggregate owns one enum implementing this trait. The enum is
/// serialized adjacently tagged so the variant name becomes the wire
/// `event_type` and the variant body becomes `event_data`:
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// #[serde(tag = "event_type", content = "event_data")]
/// pub enum AppointmentEvent {
///     AppointmentScheduled(AppointmentScheduled),
///     AppointmentConfirmed(AppointmentConfirmed),
/// }
/// ```
///
/// Events are immutable facts, so implementors should only ever gain variants.
pub trait Event: Clone + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Every `event_type` tag this enum understands.
    ///
    /// Tags outside this list are treated as events from a newer schema and
    /// skipped during replay.
    const EVENT_TYPES: &'static [&'static str];

    /// Stable event name (e.g. `"AppointmentScheduled"`).
    fn event_type(&self) -> &'static str;
}

/// Serialize a typed event into its `event_data` object.
pub fn encode_event_data<E: Event>(event: &E) -> Result<JsonValue, serde_json::Error> {
    let mut tagged = serde_json::to_value(event)?;
    Ok(tagged
        .get_mut("event_data")
        .map(JsonValue::take)
        .unwrap_or(JsonValue::Null))
}

/// Rebuild a typed event from its wire tag and `event_data`.
///
/// Returns `Ok(None)` for tags the enum does not know.
pub fn decode_event_data<E: Event>(
    event_type: &str,
    event_data: &JsonValue,
) -> Result<Option<E>, serde_json::Error> {
    if !E::EVENT_TYPES.contains(&event_type) {
        return Ok(None);
    }

    let tagged = serde_json::json!({
        "event_type": event_type,
        "event_data": event_data,
    });
    serde_json::from_value(tagged).map(Some)
}
