/// Text a fresh room starts with, matching the editor's initial content.
pub const DEFAULT_DOCUMENT: &str = "// Start coding...";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum members per room
    pub max_members_per_room: usize,
    /// Outbound frames buffered per connection before deliveries are dropped
    pub outbound_capacity: usize,
    /// Largest inbound frame accepted, in bytes
    pub max_message_bytes: usize,
    /// Document text of a newly created room
    pub default_document: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5000".to_string(),
            max_members_per_room: 100,
            outbound_capacity: 256,
            max_message_bytes: 1024 * 1024,
            default_document: DEFAULT_DOCUMENT.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:5000");
        assert_eq!(config.max_members_per_room, 100);
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.max_message_bytes, 1_048_576);
        assert_eq!(config.default_document, "// Start coding...");
    }
}
