use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Boxed error returned by connector implementations.
///
/// The `source()` chain of this error becomes the cause list of the
/// persisted failure information.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A value handed to or produced by a connector
///
/// Thin wrapper around a JSON value; connector inputs and outputs are always
/// JSON so they can be persisted alongside the process variables.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct DataPacket {
    /// The inner JSON value
    pub value: serde_json::Value,
}

impl DataPacket {
    /// Create a new data packet from a JSON value
    #[inline]
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }

    /// Create a null data packet
    #[inline]
    pub fn null() -> Self {
        Self {
            value: serde_json::Value::Null,
        }
    }

    /// Get the inner JSON value
    #[inline]
    pub fn as_value(&self) -> &serde_json::Value {
        &self.value
    }

    /// Take ownership of the inner JSON value
    #[inline]
    pub fn into_value(self) -> serde_json::Value {
        self.value
    }

    /// Check if the data packet is null
    #[inline]
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    /// Try to view the data packet as a string
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }

    /// Try to view the data packet as a number
    #[inline]
    pub fn as_i64(&self) -> Option<i64> {
        self.value.as_i64()
    }

    /// Try to convert the data packet to a specific type
    pub fn to<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_value(self.value.clone())
    }

    /// Create a data packet from a serializable value
    pub fn from<T>(value: &T) -> Result<Self, serde_json::Error>
    where
        T: Serialize,
    {
        Ok(Self::new(serde_json::to_value(value)?))
    }

    /// Create a data packet from a string
    #[inline]
    pub fn from_string(s: &str) -> Self {
        Self::new(serde_json::Value::String(s.to_string()))
    }
}

impl From<serde_json::Value> for DataPacket {
    fn from(value: serde_json::Value) -> Self {
        Self::new(value)
    }
}

/// Log level used by connectors through the runtime API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_data_packet_is_transparent_json() {
        let packet = DataPacket::new(json!({"name": "test"}));
        let encoded = serde_json::to_value(&packet).unwrap();
        assert_eq!(encoded, json!({"name": "test"}));
    }

    #[test]
    fn test_data_packet_typed_conversion() {
        #[derive(Deserialize, Serialize, PartialEq, Debug)]
        struct Order {
            id: u32,
        }

        let packet = DataPacket::from(&Order { id: 7 }).unwrap();
        assert_eq!(packet.to::<Order>().unwrap(), Order { id: 7 });
        assert!(packet.to::<String>().is_err());
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(tracing::Level::from(LogLevel::Warn), tracing::Level::WARN);
        assert_eq!(tracing::Level::from(LogLevel::Trace), tracing::Level::TRACE);
    }
}
