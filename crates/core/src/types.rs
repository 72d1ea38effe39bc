/// Server-assigned job identifiers are opaque strings.
pub type JobId = String;

/// Client-generated identifiers (local tasks, interactions) are UUID strings.
pub type LocalId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
