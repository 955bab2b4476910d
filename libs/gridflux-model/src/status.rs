//! Worker status snapshot

use serde::{Deserialize, Serialize};

/// Live status of one acquisition worker; transient, never persisted
///
/// Observers get a cheap copy; writers publish the latest state and no
/// history is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    /// The acquisition task is running
    pub working: bool,
    /// The transport is open and traffic is flowing
    pub linking: bool,
    /// Current acquisition delay in milliseconds
    pub current_delay_ms: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub points_total_read: u64,
    pub points_error_read: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_field_names() {
        let status = WorkerStatus {
            working: true,
            linking: true,
            current_delay_ms: 12,
            bytes_sent: 3,
            bytes_received: 4,
            points_total_read: 5,
            points_error_read: 1,
        };
        let value = serde_json::to_value(status).unwrap();
        assert_eq!(value["working"], true);
        assert_eq!(value["current_delay_ms"], 12);
        assert_eq!(value["points_error_read"], 1);
    }
}
