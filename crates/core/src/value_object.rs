//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects have no identity; two instances with the same attributes are
/// the same value (e.g. a risk factor `{ name, weight, score }`). They are
/// immutable: "changing" one means building a new one.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
