use std::collections::HashMap;
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for managers, subscriptions, etc.
pub type Id = Uuid;

/// Generic metadata container
pub type Metadata = HashMap<String, Value>;

/// Correlation ID for tracking related operations
pub type CorrelationId = Uuid;
