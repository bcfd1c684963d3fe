//! MQTT v5.0 properties carried on stored messages
//!
//! The core stores properties opaquely and forwards them with each PUBLISH.
//! Only the properties valid on an application message are represented;
//! encoding and decoding belong to the packet codec, not to this crate.

use bytes::Bytes;

/// A single MQTT property value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    PayloadFormatIndicator(u8),
    MessageExpiryInterval(u32),
    ContentType(String),
    ResponseTopic(String),
    CorrelationData(Bytes),
    SubscriptionIdentifier(u32),
    UserProperty(String, String),
}

/// An ordered list of properties
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties(Vec<Property>);

impl Properties {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn push(&mut self, property: Property) {
        self.0.push(property);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.0.iter()
    }

    /// Message expiry interval in seconds, if present
    pub fn message_expiry_interval(&self) -> Option<u32> {
        self.0.iter().find_map(|p| match p {
            Property::MessageExpiryInterval(v) => Some(*v),
            _ => None,
        })
    }

    /// Subscription identifier, if present
    pub fn subscription_identifier(&self) -> Option<u32> {
        self.0.iter().find_map(|p| match p {
            Property::SubscriptionIdentifier(v) => Some(*v),
            _ => None,
        })
    }
}

impl FromIterator<Property> for Properties {
    fn from_iter<T: IntoIterator<Item = Property>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors() {
        let mut props = Properties::new();
        assert!(props.is_empty());
        assert_eq!(props.message_expiry_interval(), None);

        props.push(Property::MessageExpiryInterval(300));
        props.push(Property::SubscriptionIdentifier(7));
        props.push(Property::UserProperty("key".into(), "value".into()));

        assert_eq!(props.len(), 3);
        assert_eq!(props.message_expiry_interval(), Some(300));
        assert_eq!(props.subscription_identifier(), Some(7));
    }
}
